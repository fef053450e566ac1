//! Parsed response head and body-text helpers shared by both session twins.

use crate::http::headers::HeaderMap;
use crate::http::types::{header_value_has_token, Version};

/// Status line and header section of a response, before any body handling.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub(crate) version: Version,
    pub(crate) status: u16,
    pub(crate) reason: String,
    pub(crate) headers: HeaderMap,
}

impl ResponseHead {
    /// Whether the connection must be closed instead of returned to the
    /// pool: explicit `Connection: close`, or HTTP/1.0 without an explicit
    /// `keep-alive`.
    pub(crate) fn wants_close(&self) -> bool {
        if let Some(value) = self.headers.get("connection") {
            if header_value_has_token(value, "close") {
                return true;
            }
            if header_value_has_token(value, "keep-alive") {
                return false;
            }
        }
        !self.version.keep_alive_default()
    }

    /// `Content-Encoding` value, if any.
    pub(crate) fn content_encoding(&self) -> Option<&str> {
        self.headers.get("content-encoding")
    }

    /// Charset parameter of `Content-Type`, unquoted.
    pub(crate) fn charset(&self) -> Option<String> {
        charset_of(&self.headers)
    }
}

/// Charset parameter of a `Content-Type` header, unquoted.
pub(crate) fn charset_of(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get("content-type")?;

    for param in content_type.split(';').skip(1) {
        let param = param.trim();
        if let Some(value) = strip_prefix_ignore_case(param, "charset=") {
            return Some(value.trim_matches('"').to_owned());
        }
    }
    None
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

/// Decodes body bytes to text using the response charset.
///
/// UTF-8 (the default) takes the SIMD-validated fast path and degrades to
/// lossy replacement on invalid sequences; Latin-1 is mapped directly;
/// any other charset is treated as UTF-8 best-effort.
pub(crate) fn decode_text(bytes: &[u8], charset: Option<&str>) -> String {
    if let Some(charset) = charset {
        if charset.eq_ignore_ascii_case("iso-8859-1")
            || charset.eq_ignore_ascii_case("latin-1")
            || charset.eq_ignore_ascii_case("latin1")
        {
            return bytes.iter().map(|&b| b as char).collect();
        }
    }

    match simdutf8::basic::from_utf8(bytes) {
        Ok(valid) => valid.to_owned(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

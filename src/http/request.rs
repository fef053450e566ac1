//! Request-head serialization.
//!
//! Builds the `METHOD SP request-target SP HTTP/1.1 CRLF` line plus header
//! section from composed [`RequestParts`], injecting the standard defaults
//! the caller did not set and validating that caller-supplied framing
//! headers agree with the body shape.

use crate::errors::{Error, ErrorKind, Result};
use crate::http::headers::HeaderMap;
use crate::http::types::{header_value_has_token, slice_to_usize, Method};
use crate::http::url::Url;

/// Default `User-Agent` product token.
pub(crate) const USER_AGENT: &str = concat!("maker_client/", env!("CARGO_PKG_VERSION"));

/// The hook-visible request triple: everything that determines the wire
/// head. Pre-request hooks receive and return this.
#[derive(Debug, Clone)]
pub struct RequestParts {
    /// Request method.
    pub method: Method,
    /// Absolute request URL.
    pub url: Url,
    /// Composed header map (session defaults already merged).
    pub headers: HeaderMap,
}

/// What the serializer needs to know about the body: nothing, a known byte
/// count, or a stream of unknown length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyShape {
    Empty,
    Sized(usize),
    Streamed,
}

/// Serializes the request head into `out`.
///
/// Injected unless the caller provided them: `Host`, `User-Agent`,
/// `Accept`, `Accept-Encoding` (suppressed when `accept_compressed` is
/// off) and `Connection: keep-alive`. The framing header matching `shape`
/// is written last.
pub(crate) fn write_head(
    parts: &RequestParts,
    shape: BodyShape,
    accept_compressed: bool,
    out: &mut Vec<u8>,
) -> Result<()> {
    let mut headers = parts.headers.clone();
    validate_framing(&headers, shape)?;

    if !headers.contains("host") {
        headers.add("Host", parts.url.host_header())?;
    }
    if !headers.contains("user-agent") {
        headers.add("User-Agent", USER_AGENT)?;
    }
    if !headers.contains("accept") {
        headers.add("Accept", "*/*")?;
    }
    if accept_compressed && !headers.contains("accept-encoding") {
        headers.add("Accept-Encoding", "gzip, deflate")?;
    }
    if !headers.contains("connection") {
        headers.add("Connection", "keep-alive")?;
    }

    match shape {
        BodyShape::Sized(len) => {
            if !headers.contains("content-length") {
                headers.add("Content-Length", len.to_string())?;
            }
        }
        BodyShape::Streamed => {
            if !headers.contains("transfer-encoding") {
                headers.add("Transfer-Encoding", "chunked")?;
            }
        }
        BodyShape::Empty => {
            // Methods that conventionally carry a payload state the absence
            // explicitly; the rest stay silent.
            if matches!(parts.method, Method::Post | Method::Put | Method::Patch)
                && !headers.contains("content-length")
            {
                headers.add("Content-Length", "0")?;
            }
        }
    }

    out.extend_from_slice(parts.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(parts.url.request_target().as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    headers.write_to(out);
    out.extend_from_slice(b"\r\n");

    Ok(())
}

/// Caller-supplied `Content-Length` / `Transfer-Encoding` are respected
/// only when they agree with the actual body; anything else is refused
/// before a single byte is written.
fn validate_framing(headers: &HeaderMap, shape: BodyShape) -> Result<()> {
    let fail = |detail: &str| Error::new(ErrorKind::InvalidRequest).with_detail(detail.to_owned());

    let user_length = headers.get("content-length");
    let user_encoding = headers.get("transfer-encoding");

    if user_length.is_some() && user_encoding.is_some() {
        return Err(fail(
            "Content-Length and Transfer-Encoding are mutually exclusive",
        ));
    }

    if let Some(te) = user_encoding {
        if !header_value_has_token(te, "chunked") {
            return Err(fail("only chunked Transfer-Encoding is supported"));
        }
        if shape != BodyShape::Streamed {
            return Err(fail("chunked Transfer-Encoding requires a streamed body"));
        }
    }

    if let Some(cl) = user_length {
        let declared = slice_to_usize(cl.as_bytes())
            .ok_or_else(|| fail("malformed Content-Length"))?;
        let actual = match shape {
            BodyShape::Empty => 0,
            BodyShape::Sized(len) => len,
            BodyShape::Streamed => {
                return Err(fail("Content-Length cannot frame a streamed body"));
            }
        };
        if declared != actual {
            return Err(fail("Content-Length disagrees with body size"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod serialize_tests {
    use super::*;

    fn parts(method: Method, url: &str) -> RequestParts {
        RequestParts {
            method,
            url: Url::parse(url).unwrap(),
            headers: HeaderMap::new(),
        }
    }

    fn head_string(parts: &RequestParts, shape: BodyShape) -> String {
        let mut out = Vec::new();
        write_head(parts, shape, true, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn defaults_injected() {
        let head = head_string(&parts(Method::Get, "http://example.com/x?q=1"), BodyShape::Empty);

        assert!(head.starts_with("GET /x?q=1 HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.com\r\n"));
        assert!(head.contains(&format!("User-Agent: {USER_AGENT}\r\n")));
        assert!(head.contains("Accept: */*\r\n"));
        assert!(head.contains("Accept-Encoding: gzip, deflate\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert!(!head.contains("Content-Length"));
    }

    #[test]
    fn caller_headers_win() {
        let mut p = parts(Method::Get, "http://example.com/");
        p.headers.set("User-Agent", "custom/1.0").unwrap();
        p.headers.set("Host", "other.example").unwrap();

        let head = head_string(&p, BodyShape::Empty);
        assert!(head.contains("User-Agent: custom/1.0\r\n"));
        assert!(head.contains("Host: other.example\r\n"));
        assert!(!head.contains(USER_AGENT));
        assert_eq!(head.matches("Host:").count(), 1);
    }

    #[test]
    fn host_carries_non_default_port() {
        let head = head_string(&parts(Method::Get, "http://example.com:8080/"), BodyShape::Empty);
        assert!(head.contains("Host: example.com:8080\r\n"));
    }

    #[test]
    fn no_accept_encoding_when_opted_out() {
        let mut out = Vec::new();
        write_head(
            &parts(Method::Get, "http://example.com/"),
            BodyShape::Empty,
            false,
            &mut out,
        )
        .unwrap();
        assert!(!String::from_utf8(out).unwrap().contains("Accept-Encoding"));
    }

    #[test]
    fn framing_headers() {
        let head = head_string(&parts(Method::Post, "http://example.com/u"), BodyShape::Sized(3));
        assert!(head.contains("Content-Length: 3\r\n"));

        let head = head_string(&parts(Method::Post, "http://example.com/u"), BodyShape::Streamed);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!head.contains("Content-Length"));

        let head = head_string(&parts(Method::Post, "http://example.com/u"), BodyShape::Empty);
        assert!(head.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn inconsistent_framing_rejected() {
        let mut with_both = parts(Method::Post, "http://example.com/");
        with_both.headers.set("Content-Length", "3").unwrap();
        with_both
            .headers
            .set("Transfer-Encoding", "chunked")
            .unwrap();

        let mut wrong_length = parts(Method::Post, "http://example.com/");
        wrong_length.headers.set("Content-Length", "99").unwrap();

        let mut chunked_sized = parts(Method::Post, "http://example.com/");
        chunked_sized
            .headers
            .set("Transfer-Encoding", "chunked")
            .unwrap();

        let cases = [
            (with_both, BodyShape::Sized(3)),
            (wrong_length, BodyShape::Sized(3)),
            (chunked_sized, BodyShape::Sized(3)),
        ];

        for (p, shape) in cases {
            let mut out = Vec::new();
            let err = write_head(&p, shape, true, &mut out).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidRequest);
            assert!(out.is_empty());
        }
    }

    #[test]
    fn consistent_framing_respected() {
        let mut p = parts(Method::Post, "http://example.com/");
        p.headers.set("Content-Length", "3").unwrap();

        let head = head_string(&p, BodyShape::Sized(3));
        assert_eq!(head.matches("Content-Length:").count(), 1);
    }
}

//! Case-insensitive, insertion-ordered header multi-map.
//!
//! Names compare ASCII case-insensitively while the casing of the most
//! recent insertion is preserved for serialization. Duplicate names are
//! first-class - `Set-Cookie` arrives and leaves as multiple fields.
//!
//! Every insertion path validates the RFC 7230 token grammar for names and
//! rejects CR/LF/NUL in values, so a header map can always be serialized
//! without re-checking (header-injection defense).

use crate::errors::{Error, ErrorKind, Result};
use crate::http::types::is_token_byte;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    name: String,
    value: String,
}

/// Ordered multi-map of header fields.
///
/// # Examples
///
/// ```
/// use maker_client::HeaderMap;
///
/// let mut headers = HeaderMap::new();
/// headers.set("Content-Type", "application/json").unwrap();
/// headers.add("Accept", "text/html").unwrap();
/// headers.add("ACCEPT", "application/json").unwrap();
///
/// assert_eq!(headers.get("content-type"), Some("application/json"));
/// assert_eq!(headers.get("accept"), Some("application/json"));
/// assert_eq!(headers.get_all("Accept").len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    headers: Vec<Header>,
}

impl HeaderMap {
    /// Creates an empty map.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fields, duplicates counted.
    #[inline]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// True when no field is present.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Replaces every occurrence of `name` with a single field, keeping the
    /// position of the first occurrence (or appending).
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let header = validated(name.into(), value.into())?;

        let first = self
            .headers
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(&header.name));

        self.headers
            .retain(|h| !h.name.eq_ignore_ascii_case(&header.name));

        match first {
            Some(index) => self.headers.insert(index, header),
            None => self.headers.push(header),
        }
        Ok(())
    }

    /// Appends a field, keeping any existing occurrences of `name`.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let header = validated(name.into(), value.into())?;
        self.headers.push(header);
        Ok(())
    }

    /// Appends a field that was already validated by the response parser.
    #[inline]
    pub(crate) fn append_parsed(&mut self, name: String, value: String) {
        self.headers.push(Header { name, value });
    }

    /// Last value for `name`, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    /// Whether any field named `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|h| h.name.eq_ignore_ascii_case(name))
    }

    /// Removes every occurrence of `name`, returning the removed values.
    pub fn remove(&mut self, name: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.headers.retain(|h| {
            if h.name.eq_ignore_ascii_case(name) {
                removed.push(h.value.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Iterates `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|h| (h.name.as_str(), h.value.as_str()))
    }

    /// Copies every field of `defaults` whose name is absent here.
    ///
    /// This is the request-composition merge: request-level fields win over
    /// session-level ones by simply already being present.
    pub(crate) fn merge_absent(&mut self, defaults: &HeaderMap) {
        for header in &defaults.headers {
            if !self.contains(&header.name) {
                self.headers.push(header.clone());
            }
        }
    }

    /// Serializes every field as `Name: value\r\n`, insertion order, one
    /// line per value.
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        for header in &self.headers {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(header.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

fn validated(name: String, value: String) -> Result<Header> {
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(Error::new(ErrorKind::InvalidHeader)
            .with_detail(format!("name {name:?} is not a valid token")));
    }

    if value.bytes().any(|b| matches!(b, b'\r' | b'\n' | 0x00)) {
        return Err(Error::new(ErrorKind::InvalidHeader)
            .with_detail(format!("value for {name:?} contains CR, LF or NUL")));
    }

    // RFC 7230 surrounding OWS is never significant.
    let trimmed = value.trim_matches([' ', '\t']);
    let value = if trimmed.len() == value.len() {
        value
    } else {
        trimmed.to_owned()
    };

    Ok(Header { name, value })
}


#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn injection_rejected() {
        let mut h = HeaderMap::new();

        let bad_values = ["a\r\nX-Evil: 1", "a\rb", "a\nb", "a\0b"];
        for value in bad_values {
            let err = h.set("X-Test", value).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidHeader, "{value:?}");
        }
        assert!(h.is_empty());
    }

    #[test]
    fn bad_names_rejected() {
        let mut h = HeaderMap::new();

        let bad_names = ["", "Bad Name", "Bad:Name", "Bad\r", "héader"];
        for name in bad_names {
            let err = h.set(name, "v").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidHeader, "{name:?}");
        }
    }

    #[test]
    fn values_are_trimmed() {
        let mut h = HeaderMap::new();
        h.set("X-Test", "  padded\t").unwrap();
        assert_eq!(h.get("x-test"), Some("padded"));
    }
}

#[cfg(test)]
mod wire_tests {
    use super::*;

    #[test]
    fn serialization_order_and_duplicates() {
        let mut h = HeaderMap::new();
        h.add("Host", "example.com").unwrap();
        h.add("Set-Cookie", "a=1").unwrap();
        h.add("Accept", "*/*").unwrap();
        h.add("Set-Cookie", "b=2").unwrap();

        let mut out = Vec::new();
        h.write_to(&mut out);

        assert_eq!(
            out,
            b"Host: example.com\r\nSet-Cookie: a=1\r\nAccept: */*\r\nSet-Cookie: b=2\r\n"
        );
    }

    #[test]
    fn merge_absent_respects_overrides() {
        let mut defaults = HeaderMap::new();
        defaults.set("User-Agent", "session-ua").unwrap();
        defaults.set("X-Extra", "kept").unwrap();

        let mut request = HeaderMap::new();
        request.set("User-Agent", "request-ua").unwrap();
        request.merge_absent(&defaults);

        assert_eq!(request.get("user-agent"), Some("request-ua"));
        assert_eq!(request.get("x-extra"), Some("kept"));
    }
}

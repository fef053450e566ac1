//! Client error taxonomy.
//!
//! Every fallible operation in this crate surfaces the same [`Error`] type:
//! a structural [`ErrorKind`] plus the request URL (when one was in play),
//! the traversed redirect chain (for redirect failures) and the underlying
//! OS/TLS error. Consumers match on [`Error::kind`], not on type identity.

use std::{error, fmt, io};

use thiserror::Error as ThisError;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

type Source = Box<dyn error::Error + Send + Sync + 'static>;

/// One hop of a redirect chain, kept when a redirect error surfaces.
///
/// Full [`Response`](crate::Response) history is available on success paths;
/// errors carry the lighter `(url, status)` summary of each hop so that one
/// error type can serve both the async and the blocking session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    /// Absolute URL the hop was fetched from.
    pub url: String,
    /// Status code the hop answered with.
    pub status: u16,
}

/// Structural classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ThisError)]
#[non_exhaustive]
pub enum ErrorKind {
    /// URL failed to parse or is not usable for the attempted operation.
    #[error("invalid URL")]
    InvalidUrl,
    /// Header name violates the token grammar, or a value carries CR/LF/NUL.
    #[error("invalid header")]
    InvalidHeader,
    /// Caller-side validation failure (inconsistent framing headers,
    /// unreplayable body, bad scheme for the operation).
    #[error("invalid request")]
    InvalidRequest,

    /// TCP connection could not be established.
    #[error("could not establish connection")]
    Connection,
    /// TCP/TLS setup exceeded the connect budget.
    #[error("connect timed out")]
    ConnectTimeout,
    /// A read exceeded the read budget or the remaining total budget.
    #[error("read timed out")]
    ReadTimeout,
    /// Certificate, hostname or TLS handshake failure.
    #[error("TLS failure")]
    Tls,
    /// Socket-layer failure outside connect/read windows.
    #[error("network failure")]
    Network,
    /// Total timeout expired outside a specific read/connect window.
    #[error("total timeout expired")]
    Timeout,

    /// Malformed status line, header section or body framing.
    #[error("malformed response")]
    InvalidResponse,
    /// A configured protocol limit was exceeded (header size, field count,
    /// body size, chunk grammar).
    #[error("protocol limit exceeded")]
    Protocol,

    /// Redirect chain exceeded `max_redirects`.
    #[error("too many redirects")]
    TooManyRedirects,
    /// The same absolute URL appeared twice along a redirect chain.
    #[error("redirect loop detected")]
    RedirectLoop,

    /// Handshake failure, invalid or oversize frame, unexpected close.
    #[error("websocket failure")]
    WebSocket,
}

/// The error type returned by every fallible operation in this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    url: Option<String>,
    hops: Vec<Hop>,
    detail: Option<String>,
    source: Option<Source>,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            url: None,
            hops: Vec::new(),
            detail: None,
            source: None,
        }
    }

    #[inline]
    pub(crate) fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[inline]
    pub(crate) fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[inline]
    pub(crate) fn with_hops(mut self, hops: Vec<Hop>) -> Self {
        self.hops = hops;
        self
    }

    #[inline]
    pub(crate) fn with_source(mut self, source: impl Into<Source>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Maps an I/O error from a read/write path onto the taxonomy.
    ///
    /// `TimedOut`/`WouldBlock` carry deadline semantics; anything else on an
    /// established connection is a network-layer failure.
    pub(crate) fn io(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::ReadTimeout,
            _ => ErrorKind::Network,
        };
        Error::new(kind).with_source(err)
    }

    /// Structural kind of the failure.
    #[inline]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// URL of the request that failed, when one was in play.
    #[inline]
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Redirect hops traversed before the failure. Empty for
    /// non-redirect errors.
    #[inline]
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// True for any deadline overrun (connect, read or total).
    #[inline]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ConnectTimeout | ErrorKind::ReadTimeout | ErrorKind::Timeout
        )
    }

    /// True when the failure happened before a single response byte
    /// arrived (connection setup).
    #[inline]
    pub const fn is_connect(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Connection | ErrorKind::ConnectTimeout | ErrorKind::Tls
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        if let Some(url) = &self.url {
            write!(f, " (url: {url})")?;
        }
        Ok(())
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

#[cfg(test)]
mod display_tests {
    use super::*;

    #[test]
    fn message_and_url() {
        let cases = [
            (
                Error::new(ErrorKind::Connection),
                "could not establish connection",
            ),
            (
                Error::new(ErrorKind::ReadTimeout).with_url("http://example.com/"),
                "read timed out (url: http://example.com/)",
            ),
            (
                Error::new(ErrorKind::Protocol).with_detail("header section exceeds 65536 bytes"),
                "protocol limit exceeded: header section exceeds 65536 bytes",
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }

    #[test]
    fn classification() {
        assert!(Error::new(ErrorKind::ConnectTimeout).is_timeout());
        assert!(Error::new(ErrorKind::ReadTimeout).is_timeout());
        assert!(Error::new(ErrorKind::Timeout).is_timeout());
        assert!(!Error::new(ErrorKind::Network).is_timeout());

        assert!(Error::new(ErrorKind::Tls).is_connect());
        assert!(!Error::new(ErrorKind::ReadTimeout).is_connect());
    }

    #[test]
    fn io_mapping() {
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "t");
        assert_eq!(Error::io(timed_out).kind(), ErrorKind::ReadTimeout);

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "r");
        assert_eq!(Error::io(reset).kind(), ErrorKind::Network);
    }

    #[test]
    fn hops_round_trip() {
        let err = Error::new(ErrorKind::RedirectLoop).with_hops(vec![Hop {
            url: "http://a/x".into(),
            status: 302,
        }]);

        assert_eq!(err.hops().len(), 1);
        assert_eq!(err.hops()[0].status, 302);
    }
}

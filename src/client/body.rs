//! Request body variants for the async session.

use std::fmt;
use std::io;
use std::pin::Pin;

use futures_util::Stream;

use crate::http::request::BodyShape;

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send + 'static>>;

pub(crate) enum BodyInner {
    Empty,
    Bytes(Vec<u8>),
    Stream(ByteStream),
}

/// A request body: nothing, buffered bytes, or a stream sent with chunked
/// transfer coding.
///
/// Buffered bodies replay across 307/308 redirects; a stream can be sent
/// only once, so a redirect that must resend it fails instead of silently
/// sending nothing.
pub struct Body {
    pub(crate) inner: BodyInner,
}

impl Body {
    /// No body at all.
    pub fn empty() -> Self {
        Body {
            inner: BodyInner::Empty,
        }
    }

    /// A buffered byte body, framed with `Content-Length`.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Body {
            inner: BodyInner::Bytes(bytes.into()),
        }
    }

    /// A text body (UTF-8 bytes of `text`).
    pub fn text(text: impl Into<String>) -> Self {
        Body {
            inner: BodyInner::Bytes(text.into().into_bytes()),
        }
    }

    /// A streamed body, framed with `Transfer-Encoding: chunked`. Each
    /// stream item becomes one chunk; the stream ending writes the
    /// terminating zero chunk.
    pub fn from_stream(
        stream: impl Stream<Item = io::Result<Vec<u8>>> + Send + 'static,
    ) -> Self {
        Body {
            inner: BodyInner::Stream(Box::pin(stream)),
        }
    }

    /// A streamed body from a blocking-free iterator of byte chunks.
    pub fn from_iter<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: Send + 'static,
    {
        Body::from_stream(futures_util::stream::iter(
            chunks.into_iter().map(Ok::<_, io::Error>),
        ))
    }

    /// What the serializer needs to know for framing.
    pub(crate) fn shape(&self) -> BodyShape {
        match &self.inner {
            BodyInner::Empty => BodyShape::Empty,
            BodyInner::Bytes(bytes) => BodyShape::Sized(bytes.len()),
            BodyInner::Stream(_) => BodyShape::Streamed,
        }
    }

    /// A copy for the next redirect hop, if this body can be replayed.
    pub(crate) fn replay(&self) -> Option<Body> {
        match &self.inner {
            BodyInner::Empty => Some(Body::empty()),
            BodyInner::Bytes(bytes) => Some(Body::bytes(bytes.clone())),
            BodyInner::Stream(_) => None,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            BodyInner::Empty => f.write_str("Body::Empty"),
            BodyInner::Bytes(bytes) => write!(f, "Body::Bytes({} bytes)", bytes.len()),
            BodyInner::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::bytes(bytes)
    }
}

impl From<&[u8]> for Body {
    fn from(bytes: &[u8]) -> Self {
        Body::bytes(bytes.to_vec())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::text(text)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::text(text.to_owned())
    }
}

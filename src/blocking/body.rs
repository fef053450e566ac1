//! Request body variants for the blocking session.

use std::fmt;
use std::io::{self, Read};

use crate::http::request::BodyShape;

const STREAM_CHUNK: usize = 16 * 1024;

pub(crate) enum BodyInner {
    Empty,
    Bytes(Vec<u8>),
    Reader(Box<dyn Read + Send>),
    Iter(Box<dyn Iterator<Item = io::Result<Vec<u8>>> + Send>),
}

/// A request body: nothing, buffered bytes, a `Read` source, or an
/// iterator of chunks. `Read` sources and iterators are sent with chunked
/// transfer coding and can only be sent once.
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

    /// A file-like body, read in chunks and sent with chunked coding.
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Body {
            inner: BodyInner::Reader(Box::new(reader)),
        }
    }

    /// A body from an iterator of byte chunks, one chunk per wire chunk.
    pub fn from_iter<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: Send + 'static,
    {
        Body {
            inner: BodyInner::Iter(Box::new(chunks.into_iter().map(Ok))),
        }
    }

    pub(crate) fn shape(&self) -> BodyShape {
        match &self.inner {
            BodyInner::Empty => BodyShape::Empty,
            BodyInner::Bytes(bytes) => BodyShape::Sized(bytes.len()),
            BodyInner::Reader(_) | BodyInner::Iter(_) => BodyShape::Streamed,
        }
    }

    pub(crate) fn replay(&self) -> Option<Body> {
        match &self.inner {
            BodyInner::Empty => Some(Body::empty()),
            BodyInner::Bytes(bytes) => Some(Body::bytes(bytes.clone())),
            BodyInner::Reader(_) | BodyInner::Iter(_) => None,
        }
    }

    /// Pulls the next chunk of a streamed body; `None` when exhausted.
    pub(crate) fn next_stream_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        match &mut self.inner {
            BodyInner::Reader(reader) => {
                let mut chunk = vec![0u8; STREAM_CHUNK];
                let n = reader.read(&mut chunk)?;
                if n == 0 {
                    return Ok(None);
                }
                chunk.truncate(n);
                Ok(Some(chunk))
            }
            BodyInner::Iter(iter) => iter.next().transpose(),
            _ => Ok(None),
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
            BodyInner::Reader(_) => f.write_str("Body::Reader"),
            BodyInner::Iter(_) => f.write_str("Body::Iter"),
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

#[cfg(test)]
mod shape_tests {
    use super::*;

    #[test]
    fn shapes_and_replay() {
        assert_eq!(Body::empty().shape(), BodyShape::Empty);
        assert_eq!(Body::bytes(b"abc".to_vec()).shape(), BodyShape::Sized(3));
        assert_eq!(
            Body::from_reader(std::io::Cursor::new(b"x".to_vec())).shape(),
            BodyShape::Streamed
        );
        assert_eq!(
            Body::from_iter(vec![vec![1u8]]).shape(),
            BodyShape::Streamed
        );

        assert!(Body::bytes(b"x".to_vec()).replay().is_some());
        assert!(Body::from_iter(vec![vec![1u8]]).replay().is_none());
    }

    #[test]
    fn reader_chunks() {
        let mut body = Body::from_reader(std::io::Cursor::new(b"abc".to_vec()));
        assert_eq!(body.next_stream_chunk().unwrap(), Some(b"abc".to_vec()));
        assert_eq!(body.next_stream_chunk().unwrap(), None);
    }
}

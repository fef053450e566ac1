//! Parsed response for the blocking session, with iterator-based
//! streaming.

use serde::de::DeserializeOwned;
use tracing::trace;

use crate::blocking::pool::Checkout;
use crate::errors::{Error, ErrorKind, Result};
use crate::http::codec::{BodyFraming, ChunkedDecoder, Decompressor};
use crate::http::headers::HeaderMap;
use crate::http::response::{charset_of, decode_text, ResponseHead};
use crate::http::types::Version;
use crate::http::url::Url;
use crate::limits::ProtocolLimits;
use crate::timing::Deadline;

enum Progress {
    Length { remaining: usize },
    Chunked(ChunkedDecoder),
    Close,
    Done,
}

/// Blocking twin of the async body reader; see that type for the
/// ownership rules (drain returns the connection, drop closes it).
pub(crate) struct BodyReader {
    checkout: Option<Checkout>,
    progress: Progress,
    decomp: Decompressor,
    reusable_after_drain: bool,
    deadline: Deadline,
}

impl BodyReader {
    pub(crate) fn new(
        checkout: Checkout,
        head: &ResponseHead,
        framing: BodyFraming,
        decompress: bool,
        limits: &ProtocolLimits,
        deadline: Deadline,
    ) -> Self {
        let decomp = if decompress {
            Decompressor::new(head.content_encoding())
        } else {
            Decompressor::new(None)
        };

        let progress = match framing {
            BodyFraming::None | BodyFraming::Length(0) => Progress::Done,
            BodyFraming::Length(n) => Progress::Length { remaining: n },
            BodyFraming::Chunked => Progress::Chunked(ChunkedDecoder::new(limits)),
            BodyFraming::Close => Progress::Close,
        };

        let reusable_after_drain =
            !head.wants_close() && !matches!(framing, BodyFraming::Close);

        let mut reader = BodyReader {
            checkout: Some(checkout),
            progress,
            decomp,
            reusable_after_drain,
            deadline,
        };
        if matches!(reader.progress, Progress::Done) {
            reader.finish();
        }
        reader
    }

    fn finish(&mut self) {
        if let Some(checkout) = self.checkout.take() {
            checkout.release(self.reusable_after_drain);
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        self.progress = Progress::Done;
        if let Some(mut checkout) = self.checkout.take() {
            checkout.conn().poison();
        }
        err
    }

    pub(crate) fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match &mut self.progress {
                Progress::Done => return Ok(None),

                Progress::Length { remaining } => {
                    let want = *remaining;
                    let raw = match self.read_raw(want, true) {
                        Ok(bytes) => bytes,
                        Err(e) => return Err(self.fail(e)),
                    };

                    let finished = {
                        let Progress::Length { remaining } = &mut self.progress else {
                            unreachable!()
                        };
                        *remaining -= raw.len();
                        *remaining == 0
                    };

                    match self.emit(&raw, finished)? {
                        Some(out) => return Ok(Some(out)),
                        None if finished => return Ok(None),
                        None => continue,
                    }
                }

                Progress::Chunked(decoder) => {
                    if decoder.is_done() {
                        match self.emit(&[], true)? {
                            Some(out) => return Ok(Some(out)),
                            None => return Ok(None),
                        }
                    }

                    let input = match self.read_raw(usize::MAX, true) {
                        Ok(bytes) => bytes,
                        Err(e) => return Err(self.fail(e)),
                    };

                    let (decoded, finished) = {
                        let Progress::Chunked(decoder) = &mut self.progress else {
                            unreachable!()
                        };
                        let mut decoded = Vec::new();
                        let consumed = match decoder.decode(&input, &mut decoded) {
                            Ok(n) => n,
                            Err(e) => return Err(self.fail(e)),
                        };
                        if consumed < input.len() {
                            if let Some(checkout) = self.checkout.as_mut() {
                                checkout.conn().untake(input[consumed..].to_vec());
                            }
                        }
                        (decoded, decoder.is_done())
                    };

                    match self.emit(&decoded, finished)? {
                        Some(out) => return Ok(Some(out)),
                        None if finished => return Ok(None),
                        None => continue,
                    }
                }

                Progress::Close => {
                    let raw = match self.read_raw(usize::MAX, false) {
                        Ok(bytes) => bytes,
                        Err(e) => return Err(self.fail(e)),
                    };
                    let finished = raw.is_empty();

                    match self.emit(&raw, finished)? {
                        Some(out) => return Ok(Some(out)),
                        None if finished => return Ok(None),
                        None => continue,
                    }
                }
            }
        }
    }

    fn read_raw(&mut self, max: usize, eof_is_error: bool) -> Result<Vec<u8>> {
        let deadline = self.deadline;
        let checkout = self
            .checkout
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Network).with_detail("body connection gone"))?;
        let conn = checkout.conn();

        if !conn.has_buffered() {
            let n = conn.fill(&deadline)?;
            if n == 0 {
                if eof_is_error {
                    return Err(Error::new(ErrorKind::InvalidResponse)
                        .with_detail("connection closed mid-body"));
                }
                return Ok(Vec::new());
            }
        }

        Ok(conn.take_buffered(max))
    }

    fn emit(&mut self, raw: &[u8], finished: bool) -> Result<Option<Vec<u8>>> {
        let mut out = match self.decomp.push(raw) {
            Ok(out) => out,
            Err(e) => return Err(self.fail(e)),
        };

        if finished {
            match self.decomp.finish() {
                Ok(tail) => out.extend(tail),
                Err(e) => return Err(self.fail(e)),
            }
            self.progress = Progress::Done;
            self.finish();
            trace!("body drained, connection returned");
        }

        Ok((!out.is_empty()).then_some(out))
    }

    pub(crate) fn read_to_end(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk()? {
            if out.len() + chunk.len() > max {
                return Err(self.fail(
                    Error::new(ErrorKind::Protocol)
                        .with_detail(format!("body exceeds {max} bytes")),
                ));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

enum BodyState {
    Full(Vec<u8>),
    Streaming(BodyReader),
}

/// A parsed HTTP response from the blocking session.
pub struct Response {
    pub(crate) status: u16,
    pub(crate) reason: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) url: Url,
    pub(crate) history: Vec<Response>,
    pub(crate) max_body_size: usize,
    body: BodyState,
}

impl Response {
    pub(crate) fn streaming(
        head: ResponseHead,
        url: Url,
        reader: BodyReader,
        max_body_size: usize,
    ) -> Self {
        Response {
            status: head.status,
            reason: head.reason,
            version: head.version,
            headers: head.headers,
            url,
            history: Vec::new(),
            max_body_size,
            body: BodyState::Streaming(reader),
        }
    }

    pub(crate) fn buffered(
        head: ResponseHead,
        url: Url,
        bytes: Vec<u8>,
        max_body_size: usize,
    ) -> Self {
        Response {
            status: head.status,
            reason: head.reason,
            version: head.version,
            headers: head.headers,
            url,
            history: Vec::new(),
            max_body_size,
            body: BodyState::Full(bytes),
        }
    }

    pub(crate) fn set_history(&mut self, history: Vec<Response>) {
        self.history = history;
    }

    /// Status code (100–599).
    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Reason phrase; may be empty.
    #[inline]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Protocol version the server answered with.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Response headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Last value of one header, case-insensitively.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Declared `Content-Length`, when present and well-formed.
    pub fn content_length(&self) -> Option<usize> {
        crate::http::types::slice_to_usize(self.headers.get("content-length")?.as_bytes())
    }

    /// Final URL after redirects.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Prior responses of the redirect chain, oldest first.
    #[inline]
    pub fn history(&self) -> &[Response] {
        &self.history
    }

    /// True for `2xx` statuses.
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Buffers the whole body (bounded by `max_body_size`) and returns it.
    pub fn body(&mut self) -> Result<&[u8]> {
        self.buffer_body()?;
        match &self.body {
            BodyState::Full(bytes) => Ok(bytes),
            BodyState::Streaming(_) => unreachable!("body buffered above"),
        }
    }

    /// Body decoded as text, charset taken from `Content-Type`.
    pub fn text(&mut self) -> Result<String> {
        let charset = charset_of(&self.headers);
        let bytes = self.body()?;
        Ok(decode_text(bytes, charset.as_deref()))
    }

    /// Body parsed as JSON.
    pub fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.body()?;
        serde_json::from_slice(bytes).map_err(|e| {
            Error::new(ErrorKind::InvalidResponse)
                .with_detail("JSON decode failed")
                .with_source(e)
        })
    }

    /// Iterates the body as chunks of exactly `chunk_size` bytes (the
    /// last may be shorter).
    pub fn iter_content(self, chunk_size: usize) -> IterContent {
        IterContent {
            source: ChunkSource::from(self.body),
            pending: Vec::new(),
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }

    /// Iterates the body line by line (LF-split, trailing CR stripped,
    /// final unterminated line yielded).
    pub fn iter_lines(self) -> IterLines {
        IterLines {
            source: ChunkSource::from(self.body),
            pending: Vec::new(),
            done: false,
        }
    }

    fn buffer_body(&mut self) -> Result<()> {
        if let BodyState::Streaming(reader) = &mut self.body {
            let bytes = reader.read_to_end(self.max_body_size)?;
            self.body = BodyState::Full(bytes);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.to_string())
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

enum ChunkSource {
    Full(Option<Vec<u8>>),
    Streaming(BodyReader),
}

impl From<BodyState> for ChunkSource {
    fn from(body: BodyState) -> Self {
        match body {
            BodyState::Full(bytes) => ChunkSource::Full(Some(bytes)),
            BodyState::Streaming(reader) => ChunkSource::Streaming(reader),
        }
    }
}

impl ChunkSource {
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            ChunkSource::Full(bytes) => Ok(bytes.take().filter(|b| !b.is_empty())),
            ChunkSource::Streaming(reader) => reader.next_chunk(),
        }
    }
}

/// Iterator over fixed-size body chunks; see
/// [`Response::iter_content`].
pub struct IterContent {
    source: ChunkSource,
    pending: Vec<u8>,
    chunk_size: usize,
    done: bool,
}

impl Iterator for IterContent {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pending.len() >= self.chunk_size {
                let rest = self.pending.split_off(self.chunk_size);
                return Some(Ok(std::mem::replace(&mut self.pending, rest)));
            }
            if self.done {
                if self.pending.is_empty() {
                    return None;
                }
                return Some(Ok(std::mem::take(&mut self.pending)));
            }

            match self.source.next_chunk() {
                Ok(Some(chunk)) => self.pending.extend_from_slice(&chunk),
                Ok(None) => self.done = true,
                Err(e) => {
                    self.done = true;
                    self.pending.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Iterator over body lines; see [`Response::iter_lines`].
pub struct IterLines {
    source: ChunkSource,
    pending: Vec<u8>,
    done: bool,
}

impl Iterator for IterLines {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pos) = memchr::memchr(b'\n', &self.pending) {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Some(Ok(line));
            }
            if self.done {
                if self.pending.is_empty() {
                    return None;
                }
                return Some(Ok(std::mem::take(&mut self.pending)));
            }

            match self.source.next_chunk() {
                Ok(Some(chunk)) => self.pending.extend_from_slice(&chunk),
                Ok(None) => self.done = true,
                Err(e) => {
                    self.done = true;
                    self.pending.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

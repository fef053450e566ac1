//! Parsed response for the async session: head, redirect history, and a
//! body that is either buffered or still streaming off its connection.

use futures_util::Stream;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::client::pool::Checkout;
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

/// Streams body bytes off a checked-out connection according to the
/// response framing.
///
/// The connection returns to the pool the moment the body is fully drained
/// (unless close semantics forbid reuse); dropping the reader early closes
/// the connection instead - a half-read socket can never be reused, but it
/// must never leak either.
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

        // Bodiless responses finish on the spot so the connection goes
        // straight back to the pool.
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

    /// Marks the body failed: the connection is closed, never pooled.
    fn fail(&mut self, err: Error) -> Error {
        self.progress = Progress::Done;
        if let Some(mut checkout) = self.checkout.take() {
            checkout.conn().poison();
            // Dropping the checkout closes the socket.
        }
        err
    }

    /// Next decoded chunk of body bytes; `None` when the body is complete.
    pub(crate) async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match &mut self.progress {
                Progress::Done => return Ok(None),

                Progress::Length { remaining } => {
                    let want = *remaining;
                    let raw = match self.read_raw(want, true).await {
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

                    let input = match self.read_raw(usize::MAX, true).await {
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
                            // Bytes past the terminator belong to the
                            // connection, not the body.
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
                    let raw = match self.read_raw(usize::MAX, false).await {
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

    /// Pulls up to `max` raw bytes: buffered leftovers first, then the
    /// socket. With `eof_is_error`, a peer close mid-body is a truncation.
    async fn read_raw(&mut self, max: usize, eof_is_error: bool) -> Result<Vec<u8>> {
        let deadline = self.deadline;
        let checkout = self
            .checkout
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Network).with_detail("body connection gone"))?;
        let conn = checkout.conn();

        if !conn.has_buffered() {
            let n = conn.fill(&deadline).await?;
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

    /// Runs raw bytes through the decompressor; on `finished`, flushes the
    /// decoder and hands the connection back.
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

    /// Drains the remainder into one buffer, bounded by `max`.
    pub(crate) async fn read_to_end(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            if out.len() + chunk.len() > max {
                return Err(self.fail(Error::new(ErrorKind::Protocol).with_detail(format!(
                    "body exceeds {max} bytes"
                ))));
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

/// A parsed HTTP response.
///
/// The head is always complete; the body may still be streaming off the
/// connection. Buffering accessors ([`body`](Response::body),
/// [`text`](Response::text), [`json`](Response::json)) drain it on first
/// use; [`chunk`](Response::chunk) and the `iter_*` adapters consume it
/// incrementally.
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
    /// A response whose body is still streaming off its connection.
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

    /// A fully-drained response (redirect history entries are always
    /// buffered before the next hop is fetched).
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
    pub async fn body(&mut self) -> Result<&[u8]> {
        self.buffer_body().await?;
        match &self.body {
            BodyState::Full(bytes) => Ok(bytes),
            BodyState::Streaming(_) => unreachable!("body buffered above"),
        }
    }

    /// Body decoded as text, charset taken from `Content-Type`
    /// (UTF-8 default, best-effort fallback).
    pub async fn text(&mut self) -> Result<String> {
        let charset = charset_of(&self.headers);
        let bytes = self.body().await?;
        Ok(decode_text(bytes, charset.as_deref()))
    }

    /// Body parsed as JSON.
    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.body().await?;
        serde_json::from_slice(bytes).map_err(|e| {
            Error::new(ErrorKind::InvalidResponse)
                .with_detail("JSON decode failed")
                .with_source(e)
        })
    }

    /// Next chunk of the body as it arrives; `None` once complete.
    pub async fn chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match &mut self.body {
            BodyState::Full(bytes) => {
                if bytes.is_empty() {
                    return Ok(None);
                }
                Ok(Some(std::mem::take(bytes)))
            }
            BodyState::Streaming(reader) => reader.next_chunk().await,
        }
    }

    /// Streams the body as chunks of exactly `chunk_size` bytes (the last
    /// may be shorter).
    pub fn iter_content(self, chunk_size: usize) -> impl Stream<Item = Result<Vec<u8>>> + Send {
        let chunk_size = chunk_size.max(1);

        futures_util::stream::unfold(
            (self, Vec::new(), false),
            move |(mut resp, mut pending, mut done)| async move {
                loop {
                    if pending.len() >= chunk_size {
                        let rest = pending.split_off(chunk_size);
                        let piece = std::mem::replace(&mut pending, rest);
                        return Some((Ok(piece), (resp, pending, done)));
                    }
                    if done {
                        if pending.is_empty() {
                            return None;
                        }
                        let piece = std::mem::take(&mut pending);
                        return Some((Ok(piece), (resp, pending, true)));
                    }

                    match resp.chunk().await {
                        Ok(Some(chunk)) => pending.extend_from_slice(&chunk),
                        Ok(None) => done = true,
                        Err(e) => return Some((Err(e), (resp, Vec::new(), true))),
                    }
                }
            },
        )
    }

    /// Streams the body line by line. Lines split on LF; a trailing CR is
    /// stripped; a final unterminated line is yielded.
    pub fn iter_lines(self) -> impl Stream<Item = Result<Vec<u8>>> + Send {
        futures_util::stream::unfold(
            (self, Vec::new(), false),
            move |(mut resp, mut pending, mut done)| async move {
                loop {
                    if let Some(pos) = memchr::memchr(b'\n', &pending) {
                        let mut line: Vec<u8> = pending.drain(..=pos).collect();
                        line.pop();
                        if line.last() == Some(&b'\r') {
                            line.pop();
                        }
                        return Some((Ok(line), (resp, pending, done)));
                    }
                    if done {
                        if pending.is_empty() {
                            return None;
                        }
                        let line = std::mem::take(&mut pending);
                        return Some((Ok(line), (resp, pending, true)));
                    }

                    match resp.chunk().await {
                        Ok(Some(chunk)) => pending.extend_from_slice(&chunk),
                        Ok(None) => done = true,
                        Err(e) => return Some((Err(e), (resp, Vec::new(), true))),
                    }
                }
            },
        )
    }

    async fn buffer_body(&mut self) -> Result<()> {
        if let BodyState::Streaming(reader) = &mut self.body {
            let bytes = reader.read_to_end(self.max_body_size).await?;
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

//! HTTP/1.1 wire codec: response-head parsing, body framing, chunked
//! transfer coding and content decompression.
//!
//! Everything here is pure - bytes in, bytes out - and shared verbatim by
//! the async and the blocking connection drivers. Limits are enforced while
//! data arrives, before anything is buffered past its bound.

use memchr::memchr;
use memchr::memmem;

use crate::errors::{Error, ErrorKind, Result};
use crate::http::headers::HeaderMap;
use crate::http::response::ResponseHead;
use crate::http::types::{
    header_value_has_token, hex_to_usize, is_token_byte, slice_to_usize, trim_ascii, Method,
    Version,
};
use crate::limits::ProtocolLimits;

// RESPONSE HEAD

/// Attempts to parse a complete response head from the front of `buf`.
///
/// Returns `Ok(None)` while the terminating empty line has not arrived yet;
/// on success returns the head and the number of bytes it occupied. The
/// caller keeps appending reads to `buf` and retries.
pub(crate) fn parse_head(
    buf: &[u8],
    limits: &ProtocolLimits,
) -> Result<Option<(ResponseHead, usize)>> {
    let Some(end) = memmem::find(buf, b"\r\n\r\n") else {
        if buf.len() > limits.max_header_size {
            return Err(header_size_error(limits));
        }
        return Ok(None);
    };

    let head_len = end + 4;
    if head_len > limits.max_header_size {
        return Err(header_size_error(limits));
    }

    let mut lines = buf[..end].split(|&b| b == b'\n');
    let status_line = lines.next().unwrap_or(b"");
    let (version, status, reason) = parse_status_line(strip_cr(status_line))?;

    let mut headers = HeaderMap::new();
    let mut field_count = 0usize;

    for line in lines {
        let line = strip_cr(line);
        field_count += 1;
        if field_count > limits.max_field_count {
            return Err(Error::new(ErrorKind::Protocol).with_detail(format!(
                "more than {} header fields",
                limits.max_field_count
            )));
        }

        let (name, value) = parse_header_line(line)?;
        headers.append_parsed(name, value);
    }

    Ok(Some((
        ResponseHead {
            version,
            status,
            reason,
            headers,
        },
        head_len,
    )))
}

fn header_size_error(limits: &ProtocolLimits) -> Error {
    Error::new(ErrorKind::Protocol).with_detail(format!(
        "header section exceeds {} bytes",
        limits.max_header_size
    ))
}

#[inline]
fn strip_cr(line: &[u8]) -> &[u8] {
    match line {
        [head @ .., b'\r'] => head,
        other => other,
    }
}

fn parse_status_line(line: &[u8]) -> Result<(Version, u16, String)> {
    let fail = |detail: &str| {
        Error::new(ErrorKind::InvalidResponse).with_detail(format!(
            "bad status line: {detail}"
        ))
    };

    // "HTTP/1.x NNN[ reason]" - 12 bytes minimum.
    if line.len() < 12 {
        return Err(fail("too short"));
    }

    let version = Version::from_bytes(&line[..8]).ok_or_else(|| fail("unknown protocol"))?;

    if line[8] != b' ' {
        return Err(fail("missing space after protocol"));
    }

    let status = slice_to_usize(&line[9..12]).ok_or_else(|| fail("non-numeric status"))?;
    if !(100..=599).contains(&status) {
        return Err(fail("status out of range"));
    }

    let reason = match line.get(12) {
        None => String::new(),
        Some(b' ') => String::from_utf8_lossy(&line[13..]).into_owned(),
        Some(_) => return Err(fail("junk after status code")),
    };

    Ok((version, status as u16, reason))
}

fn parse_header_line(line: &[u8]) -> Result<(String, String)> {
    let fail = |detail: &str| {
        Error::new(ErrorKind::InvalidResponse).with_detail(format!("bad header line: {detail}"))
    };

    let colon = memchr(b':', line).ok_or_else(|| fail("missing colon"))?;
    let name = &line[..colon];

    if name.is_empty() || !name.iter().all(|&b| is_token_byte(b)) {
        return Err(fail("name is not a token"));
    }

    let value = trim_ascii(&line[colon + 1..]);

    Ok((
        String::from_utf8_lossy(name).into_owned(),
        String::from_utf8_lossy(value).into_owned(),
    ))
}

// BODY FRAMING

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body at all (1xx, 204, 304, or a HEAD response).
    None,
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// `Content-Length` byte count.
    Length(usize),
    /// Read until the peer closes; the connection cannot be reused.
    Close,
}

impl BodyFraming {
    /// Resolves the framing for a response, in the priority order mandated
    /// by RFC 7230 §3.3.3.
    pub(crate) fn resolve(method: Method, head: &ResponseHead) -> Result<Self> {
        if method.suppresses_body()
            || (100..200).contains(&head.status)
            || head.status == 204
            || head.status == 304
        {
            return Ok(BodyFraming::None);
        }

        if let Some(te) = head.headers.get("transfer-encoding") {
            if header_value_has_token(te, "chunked") {
                return Ok(BodyFraming::Chunked);
            }
        }

        if let Some(cl) = head.headers.get("content-length") {
            let all = head.headers.get_all("content-length");
            if !all.iter().all(|v| *v == cl) {
                return Err(Error::new(ErrorKind::InvalidResponse)
                    .with_detail("conflicting Content-Length values"));
            }
            let length = slice_to_usize(cl.as_bytes()).ok_or_else(|| {
                Error::new(ErrorKind::InvalidResponse)
                    .with_detail(format!("malformed Content-Length {cl:?}"))
            })?;
            return Ok(BodyFraming::Length(length));
        }

        Ok(BodyFraming::Close)
    }
}

// CHUNKED DECODER

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: usize },
    DataCrlf,
    Trailer,
    Done,
}

/// Incremental decoder for the chunked transfer coding.
///
/// Feed arbitrary slices of wire bytes with [`decode`](Self::decode);
/// decoded payload is appended to the output and the number of consumed
/// input bytes is returned. Trailer fields are parsed and discarded, still
/// bounded by `max_header_size`.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkState,
    trailer_bytes: usize,
    max_trailer: usize,
}

impl ChunkedDecoder {
    pub(crate) fn new(limits: &ProtocolLimits) -> Self {
        ChunkedDecoder {
            state: ChunkState::Size,
            trailer_bytes: 0,
            max_trailer: limits.max_header_size,
        }
    }

    /// All chunks and the trailer section have been consumed.
    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Consumes as much of `input` as possible, appending decoded payload
    /// bytes to `out`. Returns the number of input bytes consumed; zero
    /// means "need more data".
    pub(crate) fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let mut pos = 0;

        loop {
            let rest = &input[pos..];
            match self.state {
                ChunkState::Size => {
                    let Some(eol) = memchr(b'\n', rest) else {
                        // A size line is at most 16 hex digits plus a
                        // bounded extension; anything longer is hostile.
                        if rest.len() > 1024 {
                            return Err(chunk_error("oversize chunk-size line"));
                        }
                        return Ok(pos);
                    };
                    let line = strip_cr(&rest[..eol]);
                    let size = hex_to_usize(line)
                        .ok_or_else(|| chunk_error("malformed chunk size"))?;
                    pos += eol + 1;
                    self.state = match size {
                        0 => ChunkState::Trailer,
                        n => ChunkState::Data { remaining: n },
                    };
                }
                ChunkState::Data { remaining } => {
                    if rest.is_empty() {
                        return Ok(pos);
                    }
                    let take = remaining.min(rest.len());
                    out.extend_from_slice(&rest[..take]);
                    pos += take;
                    self.state = match remaining - take {
                        0 => ChunkState::DataCrlf,
                        left => ChunkState::Data { remaining: left },
                    };
                }
                ChunkState::DataCrlf => {
                    if rest.len() < 2 {
                        return Ok(pos);
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(chunk_error("missing CRLF after chunk data"));
                    }
                    pos += 2;
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(eol) = memchr(b'\n', rest) else {
                        self.check_trailer_budget(rest.len())?;
                        return Ok(pos);
                    };
                    let line = strip_cr(&rest[..eol]);
                    self.check_trailer_budget(eol + 1)?;
                    self.trailer_bytes += eol + 1;
                    pos += eol + 1;

                    if line.is_empty() {
                        self.state = ChunkState::Done;
                    } else if memchr(b':', line).is_none() {
                        return Err(chunk_error("malformed trailer field"));
                    }
                }
                ChunkState::Done => return Ok(pos),
            }
        }
    }

    fn check_trailer_budget(&self, incoming: usize) -> Result<()> {
        if self.trailer_bytes + incoming > self.max_trailer {
            return Err(Error::new(ErrorKind::Protocol)
                .with_detail("trailer section exceeds header size limit"));
        }
        Ok(())
    }
}

fn chunk_error(detail: &str) -> Error {
    Error::new(ErrorKind::InvalidResponse).with_detail(detail.to_owned())
}

// CHUNKED ENCODER

/// Writes one chunk: `SIZE_HEX CRLF DATA CRLF`. Empty slices are skipped -
/// a zero-sized chunk is the terminator and only `encode_final` writes it.
pub(crate) fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Writes the terminating `0 CRLF CRLF`.
pub(crate) fn encode_final(out: &mut Vec<u8>) {
    out.extend_from_slice(b"0\r\n\r\n");
}

// CONTENT DECOMPRESSION

use flate2::write::{DeflateDecoder, GzDecoder, ZlibDecoder};
use std::io::Write;

enum DecompressorInner {
    Identity,
    Gzip(Option<GzDecoder<Vec<u8>>>),
    /// First byte decides zlib-wrapped vs raw deflate (some servers send
    /// raw streams despite RFC 7230 naming the zlib format).
    DeflatePending,
    Zlib(Option<ZlibDecoder<Vec<u8>>>),
    RawDeflate(Option<DeflateDecoder<Vec<u8>>>),
}

/// Push-decoder for `Content-Encoding: gzip | deflate`.
///
/// Unknown encodings pass bytes through untouched.
pub(crate) struct Decompressor {
    inner: DecompressorInner,
}

impl Decompressor {
    pub(crate) fn new(encoding: Option<&str>) -> Self {
        let inner = match encoding {
            Some(enc) if enc.eq_ignore_ascii_case("gzip") || enc.eq_ignore_ascii_case("x-gzip") => {
                DecompressorInner::Gzip(Some(GzDecoder::new(Vec::new())))
            }
            Some(enc) if enc.eq_ignore_ascii_case("deflate") => DecompressorInner::DeflatePending,
            _ => DecompressorInner::Identity,
        };
        Decompressor { inner }
    }

    /// Whether this decoder passes bytes through unchanged.
    pub(crate) fn is_identity(&self) -> bool {
        matches!(self.inner, DecompressorInner::Identity)
    }

    /// Feeds compressed bytes, returning whatever decompressed output they
    /// produced.
    pub(crate) fn push(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        if let DecompressorInner::DeflatePending = self.inner {
            // zlib CMF byte: low nibble 8 = deflate method.
            self.inner = if data[0] & 0x0F == 8 {
                DecompressorInner::Zlib(Some(ZlibDecoder::new(Vec::new())))
            } else {
                DecompressorInner::RawDeflate(Some(DeflateDecoder::new(Vec::new())))
            };
        }

        match &mut self.inner {
            DecompressorInner::Identity => Ok(data.to_vec()),
            DecompressorInner::Gzip(decoder) => push_through(decoder.as_mut(), data),
            DecompressorInner::Zlib(decoder) => push_through(decoder.as_mut(), data),
            DecompressorInner::RawDeflate(decoder) => push_through(decoder.as_mut(), data),
            DecompressorInner::DeflatePending => unreachable!("resolved above"),
        }
    }

    /// Flushes the stream and returns any final decompressed bytes.
    pub(crate) fn finish(&mut self) -> Result<Vec<u8>> {
        match &mut self.inner {
            DecompressorInner::Identity | DecompressorInner::DeflatePending => Ok(Vec::new()),
            DecompressorInner::Gzip(decoder) => finish_decoder(decoder.take(), |d| d.finish()),
            DecompressorInner::Zlib(decoder) => finish_decoder(decoder.take(), |d| d.finish()),
            DecompressorInner::RawDeflate(decoder) => {
                finish_decoder(decoder.take(), |d| d.finish())
            }
        }
    }
}

fn push_through<W: Write>(decoder: Option<&mut W>, data: &[u8]) -> Result<Vec<u8>>
where
    W: TakeOutput,
{
    let decoder = decoder.ok_or_else(decode_error)?;
    decoder.write_all(data).map_err(|_| decode_error())?;
    decoder.flush().map_err(|_| decode_error())?;
    Ok(decoder.take_output())
}

fn finish_decoder<D>(
    decoder: Option<D>,
    finish: impl FnOnce(D) -> std::io::Result<Vec<u8>>,
) -> Result<Vec<u8>> {
    match decoder {
        Some(decoder) => finish(decoder).map_err(|_| decode_error()),
        // finish() after finish(): nothing left.
        None => Ok(Vec::new()),
    }
}

fn decode_error() -> Error {
    Error::new(ErrorKind::InvalidResponse).with_detail("content decoding failed")
}

/// Lets the shared push path drain the decompressed sink regardless of the
/// concrete flate2 decoder type.
trait TakeOutput {
    fn take_output(&mut self) -> Vec<u8>;
}

impl TakeOutput for GzDecoder<Vec<u8>> {
    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.get_mut())
    }
}

impl TakeOutput for ZlibDecoder<Vec<u8>> {
    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.get_mut())
    }
}

impl TakeOutput for DeflateDecoder<Vec<u8>> {
    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.get_mut())
    }
}

#[cfg(test)]
mod head_tests {
    use super::*;

    fn parse(raw: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
        parse_head(raw, &ProtocolLimits::default())
    }

    #[test]
    fn basic() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let (head, consumed) = parse(raw).unwrap().unwrap();

        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.headers.get("content-length"), Some("5"));
        assert_eq!(consumed, raw.len() - 5);
    }

    #[test]
    fn incomplete_returns_none() {
        let cases: [&[u8]; 3] = [
            b"",
            b"HTTP/1.1 200 OK\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n",
        ];

        for raw in cases {
            assert!(parse(raw).unwrap().is_none(), "{raw:?}");
        }
    }

    #[test]
    fn reason_may_be_empty() {
        let raw = b"HTTP/1.1 404\r\n\r\n";
        let (head, _) = parse(raw).unwrap().unwrap();
        assert_eq!(head.status, 404);
        assert_eq!(head.reason, "");

        let raw = b"HTTP/1.0 301 \r\n\r\n";
        let (head, _) = parse(raw).unwrap().unwrap();
        assert_eq!(head.version, Version::Http10);
        assert_eq!(head.reason, "");
    }

    #[test]
    fn multi_word_reason() {
        let raw = b"HTTP/1.1 301 Moved Permanently\r\n\r\n";
        let (head, _) = parse(raw).unwrap().unwrap();
        assert_eq!(head.reason, "Moved Permanently");
    }

    #[test]
    fn duplicate_headers_preserved() {
        let raw = b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n";
        let (head, _) = parse(raw).unwrap().unwrap();
        assert_eq!(head.headers.get_all("set-cookie"), vec!["a=1", "b=2"]);
    }

    #[test]
    fn value_whitespace_trimmed() {
        let raw = b"HTTP/1.1 200 OK\r\nX-Test:   padded \t\r\n\r\n";
        let (head, _) = parse(raw).unwrap().unwrap();
        assert_eq!(head.headers.get("x-test"), Some("padded"));
    }

    #[test]
    fn malformed_rejected() {
        let cases: [&[u8]; 6] = [
            b"HTTP/2.0 200 OK\r\n\r\n",
            b"HTTP/1.1 20 OK\r\n\r\n",
            b"HTTP/1.1 abc OK\r\n\r\n",
            b"HTTP/1.1 099 Low\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nNoColonHere\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nBad Name: x\r\n\r\n",
        ];

        for raw in cases {
            let err = parse(raw).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidResponse, "{raw:?}");
        }
    }

    #[test]
    fn header_limits_enforced() {
        let mut limits = ProtocolLimits::default();
        limits.max_field_count = 2;

        let raw = b"HTTP/1.1 200 OK\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n";
        let err = parse_head(raw, &limits).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let mut limits = ProtocolLimits::default();
        limits.max_header_size = 32;

        // No terminator in sight and already past the byte budget.
        let raw = vec![b'x'; 64];
        let err = parse_head(&raw, &limits).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}

#[cfg(test)]
mod framing_tests {
    use super::*;

    fn head(status: u16, pairs: &[(&str, &str)]) -> ResponseHead {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append_parsed((*name).to_owned(), (*value).to_owned());
        }
        ResponseHead {
            version: Version::Http11,
            status,
            reason: String::new(),
            headers,
        }
    }

    #[test]
    fn priority_order() {
        #[rustfmt::skip]
        let cases = [
            (Method::Get,  204, vec![("Content-Length", "5")],        BodyFraming::None),
            (Method::Get,  304, vec![],                               BodyFraming::None),
            (Method::Get,  100, vec![],                               BodyFraming::None),
            (Method::Head, 200, vec![("Content-Length", "5")],        BodyFraming::None),
            (Method::Get,  200, vec![("Transfer-Encoding", "chunked")], BodyFraming::Chunked),
            (
                Method::Get, 200,
                vec![("Transfer-Encoding", "gzip, chunked"), ("Content-Length", "5")],
                BodyFraming::Chunked,
            ),
            (Method::Get,  200, vec![("Content-Length", "5")],        BodyFraming::Length(5)),
            (Method::Get,  200, vec![("Content-Length", "0")],        BodyFraming::Length(0)),
            (Method::Get,  200, vec![],                               BodyFraming::Close),
        ];

        for (method, status, pairs, expected) in cases {
            let head = head(status, &pairs);
            assert_eq!(
                BodyFraming::resolve(method, &head).unwrap(),
                expected,
                "{status} {pairs:?}"
            );
        }
    }

    #[test]
    fn bad_content_length() {
        let bad = head(200, &[("Content-Length", "5x")]);
        assert!(BodyFraming::resolve(Method::Get, &bad).is_err());

        let conflicting = head(200, &[("Content-Length", "5"), ("Content-Length", "6")]);
        assert!(BodyFraming::resolve(Method::Get, &conflicting).is_err());

        let agreeing = head(200, &[("Content-Length", "5"), ("Content-Length", "5")]);
        assert_eq!(
            BodyFraming::resolve(Method::Get, &agreeing).unwrap(),
            BodyFraming::Length(5)
        );
    }
}


#[cfg(test)]
mod decompress_tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn gzip_round_trip() {
        let compressed = gzip(b"hello gzip world");

        let mut decomp = Decompressor::new(Some("gzip"));
        let mut out = decomp.push(&compressed).unwrap();
        out.extend(decomp.finish().unwrap());

        assert_eq!(out, b"hello gzip world");
    }

    #[test]
    fn gzip_incremental() {
        let compressed = gzip(&vec![7u8; 10_000]);

        let mut decomp = Decompressor::new(Some("gzip"));
        let mut out = Vec::new();
        for piece in compressed.chunks(3) {
            out.extend(decomp.push(piece).unwrap());
        }
        out.extend(decomp.finish().unwrap());

        assert_eq!(out, vec![7u8; 10_000]);
    }

    #[test]
    fn zlib_deflate() {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"zlib framed").unwrap();
        let compressed = enc.finish().unwrap();

        let mut decomp = Decompressor::new(Some("deflate"));
        let mut out = decomp.push(&compressed).unwrap();
        out.extend(decomp.finish().unwrap());

        assert_eq!(out, b"zlib framed");
    }

    #[test]
    fn raw_deflate_fallback() {
        let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"raw deflate stream").unwrap();
        let compressed = enc.finish().unwrap();

        let mut decomp = Decompressor::new(Some("deflate"));
        let mut out = decomp.push(&compressed).unwrap();
        out.extend(decomp.finish().unwrap());

        assert_eq!(out, b"raw deflate stream");
    }

    #[test]
    fn unknown_encoding_passes_through() {
        let mut decomp = Decompressor::new(Some("br"));
        assert!(decomp.is_identity());
        assert_eq!(decomp.push(b"opaque").unwrap(), b"opaque");
        assert_eq!(decomp.finish().unwrap(), b"");

        let mut decomp = Decompressor::new(None);
        assert!(decomp.is_identity());
    }

    #[test]
    fn corrupt_stream_fails() {
        let mut decomp = Decompressor::new(Some("gzip"));
        let mut failed = decomp.push(b"this is not gzip at all").is_err();
        failed |= decomp.finish().is_err();
        assert!(failed);
    }
}

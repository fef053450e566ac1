//! WebSocket client over the HTTP transport (RFC 6455).
//!
//! A [`WebSocket`] is created through [`Session::websocket`]: the opening
//! handshake runs over a connection acquired from the session's pool and
//! the socket is then detached - frames, not HTTP, flow on it from that
//! point on. Control frames are handled inside [`recv`](WebSocket::recv):
//! pings are answered automatically, a peer CLOSE is echoed and ends the
//! stream cleanly.
//!
//! [`Session::websocket`]: crate::Session::websocket

pub(crate) mod frame;
pub(crate) mod proto;

use std::time::Duration;

use tracing::{debug, warn};

use crate::client::conn::Connection;
use crate::client::pool::Pool;
use crate::client::session::Session;
use crate::errors::{Error, ErrorKind, Result};
use crate::http::headers::HeaderMap;
use crate::http::url::Url;
use crate::limits::{ProtocolLimits, WsLimits};
use crate::timing::{Deadline, Timeout};

use frame::{
    close_payload, encode_frame, parse_close_payload, parse_frame, Frame, FrameError, Opcode,
    CLOSE_NORMAL, CLOSE_TOO_BIG,
};
use proto::{build_handshake, handshake_key, verify_upgrade};

/// An application-level WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A text message (UTF-8 validated).
    Text(String),
    /// A binary message.
    Binary(Vec<u8>),
    /// An unsolicited PONG, delivered only when
    /// [`deliver_pongs`](crate::limits::WsLimits::deliver_pongs) is set.
    Pong(Vec<u8>),
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    /// Handshake in progress.
    Connecting,
    /// Frames may flow both ways.
    Open,
    /// A CLOSE has been sent, awaiting the echo.
    Closing,
    /// The connection is gone.
    Closed,
}

/// Configures and opens a WebSocket. Created by
/// [`Session::websocket`](crate::Session::websocket).
pub struct WebSocketBuilder<'a> {
    session: &'a Session,
    url: String,
    headers: HeaderMap,
    subprotocols: Vec<String>,
    limits: WsLimits,
    timeout: Option<Timeout>,
    error: Option<Error>,
}

impl<'a> WebSocketBuilder<'a> {
    pub(crate) fn new(session: &'a Session, url: String) -> Self {
        WebSocketBuilder {
            session,
            url,
            headers: HeaderMap::new(),
            subprotocols: Vec::new(),
            limits: WsLimits::default(),
            timeout: None,
            error: None,
        }
    }

    /// Adds a handshake header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.headers.add(name, value) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Offers subprotocols, most preferred first.
    pub fn subprotocols(mut self, protocols: &[&str]) -> Self {
        self.subprotocols
            .extend(protocols.iter().map(|p| (*p).to_owned()));
        self
    }

    /// Caps the payload size of a single inbound frame.
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.limits.max_frame_size = max;
        self
    }

    /// Re-handshakes automatically after an unexpected transport loss.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.limits.auto_reconnect = enabled;
        self
    }

    /// Bound on reconnect attempts per loss.
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.limits.max_reconnect_attempts = attempts;
        self
    }

    /// Base reconnect delay (attempt `n` waits `delay * 2^n`).
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.limits.reconnect_delay = delay;
        self
    }

    /// Delivers unsolicited PONGs as [`Message::Pong`].
    pub fn deliver_pongs(mut self, enabled: bool) -> Self {
        self.limits.deliver_pongs = enabled;
        self
    }

    /// Time budget for the handshake and for each read. The default keeps
    /// the session's connect budget and leaves reads unbounded (a quiet
    /// socket is normal for WebSockets).
    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Performs the opening handshake.
    pub async fn connect(mut self) -> Result<WebSocket> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }

        let url = self.session.resolve_request_url(&self.url)?;
        if !url.scheme().is_websocket() {
            return Err(Error::new(ErrorKind::InvalidRequest)
                .with_detail("WebSocket URLs use the ws or wss scheme")
                .with_url(url.to_string()));
        }

        let timeout = self.timeout.unwrap_or(Timeout {
            connect: self.session.default_timeout().connect,
            read: None,
            total: None,
        });

        let mut ws = WebSocket {
            pool: self.session.pool().clone(),
            protocol_limits: self.session.protocol_limits().clone(),
            url,
            headers: self.headers,
            subprotocols: self.subprotocols,
            limits: self.limits,
            timeout,
            conn: None,
            state: WsState::Connecting,
            protocol: None,
            fragments: None,
        };
        ws.handshake().await?;
        Ok(ws)
    }
}

/// A connected WebSocket client.
#[derive(Debug)]
pub struct WebSocket {
    pool: Pool,
    protocol_limits: ProtocolLimits,
    url: Url,
    headers: HeaderMap,
    subprotocols: Vec<String>,
    limits: WsLimits,
    timeout: Timeout,
    conn: Option<Connection>,
    state: WsState,
    protocol: Option<String>,
    fragments: Option<(Opcode, Vec<u8>)>,
}

impl WebSocket {
    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> WsState {
        self.state
    }

    /// Subprotocol the server selected, if any.
    #[inline]
    pub fn subprotocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Opens a connection (through the pool, then detached from it) and
    /// runs the upgrade handshake.
    async fn handshake(&mut self) -> Result<()> {
        let deadline = Deadline::start(self.timeout);
        let origin = self.url.origin();

        let checkout = self.pool.acquire(&origin, &deadline).await?;
        let mut conn = checkout.detach();

        let key = handshake_key();
        let request = build_handshake(&self.url, &self.headers, &key, &self.subprotocols)?;
        conn.write_all(&request, &deadline).await?;

        let head = conn
            .read_single_head(&self.protocol_limits, &deadline)
            .await?;
        self.protocol = verify_upgrade(&head, &key, &self.subprotocols)
            .map_err(|e| e.with_url(self.url.to_string()))?;

        debug!(url = %self.url, protocol = ?self.protocol, "websocket open");
        self.conn = Some(conn);
        self.state = WsState::Open;
        self.fragments = None;
        Ok(())
    }

    /// Sends a text message.
    pub async fn send_text(&mut self, text: impl AsRef<str>) -> Result<()> {
        self.send_data(Opcode::Text, text.as_ref().as_bytes()).await
    }

    /// Sends a binary message.
    pub async fn send_binary(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        self.send_data(Opcode::Binary, data.as_ref()).await
    }

    /// Sends a [`Message`].
    pub async fn send(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Text(text) => self.send_text(text).await,
            Message::Binary(data) => self.send_binary(data).await,
            Message::Pong(data) => self.write_frame(true, Opcode::Pong, &data).await,
        }
    }

    /// Sends a PING with up to 125 bytes of payload.
    pub async fn ping(&mut self, data: Option<&[u8]>) -> Result<()> {
        let payload = data.unwrap_or_default();
        if payload.len() > 125 {
            return Err(Error::new(ErrorKind::WebSocket)
                .with_detail("control frame payload exceeds 125 bytes"));
        }
        self.ensure_open()?;
        self.write_frame(true, Opcode::Ping, payload).await
    }

    /// Receives the next application message. `Ok(None)` means the peer
    /// closed cleanly (or the close we initiated completed).
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if self.state == WsState::Closed {
                return Ok(None);
            }

            let frame = match self.read_frame().await {
                Ok(frame) => frame,
                Err(e) if is_transport_loss(&e) => {
                    if self.state == WsState::Closing {
                        // The peer dropped instead of echoing our CLOSE.
                        self.teardown();
                        return Ok(None);
                    }
                    if self.limits.auto_reconnect && self.state == WsState::Open {
                        warn!(url = %self.url, "websocket transport lost, reconnecting");
                        self.reconnect().await?;
                        continue;
                    }
                    self.teardown();
                    return Err(Error::new(ErrorKind::WebSocket)
                        .with_detail("connection lost unexpectedly")
                        .with_source(e));
                }
                Err(e) => return Err(e),
            };

            match frame.opcode {
                Opcode::Text | Opcode::Binary => {
                    if self.fragments.is_some() {
                        self.teardown();
                        return Err(Error::new(ErrorKind::WebSocket)
                            .with_detail("new data frame inside a fragmented message"));
                    }
                    if frame.fin {
                        return Ok(Some(into_message(frame.opcode, frame.payload)?));
                    }
                    self.fragments = Some((frame.opcode, frame.payload));
                }

                Opcode::Continuation => {
                    let Some((opcode, mut buf)) = self.fragments.take() else {
                        self.teardown();
                        return Err(Error::new(ErrorKind::WebSocket)
                            .with_detail("continuation frame without a message in progress"));
                    };
                    buf.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return Ok(Some(into_message(opcode, buf)?));
                    }
                    self.fragments = Some((opcode, buf));
                }

                Opcode::Ping => {
                    // Auto-reply with the same payload.
                    self.write_frame(true, Opcode::Pong, &frame.payload).await?;
                }

                Opcode::Pong => {
                    if self.limits.deliver_pongs {
                        return Ok(Some(Message::Pong(frame.payload)));
                    }
                }

                Opcode::Close => {
                    let (code, reason) = parse_close_payload(&frame.payload);
                    debug!(code, reason = %reason, "peer close");

                    if self.state != WsState::Closing {
                        // Echo before tearing down.
                        self.state = WsState::Closing;
                        let _ = self.write_frame(true, Opcode::Close, &frame.payload).await;
                    }
                    self.teardown();
                    return Ok(None);
                }
            }
        }
    }

    /// Initiates a clean close and waits for the peer's echo.
    pub async fn close(&mut self, code: Option<u16>, reason: Option<&str>) -> Result<()> {
        if self.state != WsState::Open {
            return Ok(());
        }

        self.state = WsState::Closing;
        let payload = close_payload(code.unwrap_or(CLOSE_NORMAL), reason.unwrap_or(""));
        self.write_frame(true, Opcode::Close, &payload).await?;

        // Drain until the echo (or the peer just hangs up).
        loop {
            match self.read_frame().await {
                Ok(frame) if frame.opcode == Opcode::Close => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        self.teardown();
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            WsState::Open => Ok(()),
            state => Err(Error::new(ErrorKind::WebSocket)
                .with_detail(format!("socket is {state:?}, not Open"))),
        }
    }

    async fn send_data(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;

        // A message larger than the frame cap goes out fragmented.
        let max = self.limits.max_frame_size.max(1);
        if payload.len() <= max {
            return self.write_frame(true, opcode, payload).await;
        }

        let mut pieces = payload.chunks(max).peekable();
        let mut first = true;
        while let Some(piece) = pieces.next() {
            let fin = pieces.peek().is_none();
            let op = if first { opcode } else { Opcode::Continuation };
            self.write_frame(fin, op, piece).await?;
            first = false;
        }
        Ok(())
    }

    async fn write_frame(&mut self, fin: bool, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let deadline = Deadline::start(self.timeout);
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::WebSocket).with_detail("socket is gone"))?;

        let key: [u8; 4] = rand::random();
        let mut wire = Vec::with_capacity(payload.len() + 14);
        encode_frame(fin, opcode, payload, key, &mut wire);
        conn.write_all(&wire, &deadline).await
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        let deadline = Deadline::start(self.timeout);

        loop {
            let parsed = {
                let conn = self.conn.as_mut().ok_or_else(|| {
                    Error::new(ErrorKind::WebSocket).with_detail("socket is gone")
                })?;
                match parse_frame(conn.buffered(), self.limits.max_frame_size) {
                    Ok(Some((frame, consumed))) => {
                        conn.consume(consumed);
                        Some(frame)
                    }
                    Ok(None) => None,
                    Err(err) => {
                        if matches!(err, FrameError::Oversize(_)) {
                            let payload = close_payload(CLOSE_TOO_BIG, "frame too big");
                            let _ = self.write_frame(true, Opcode::Close, &payload).await;
                        }
                        self.teardown();
                        return Err(err.into());
                    }
                }
            };

            if let Some(frame) = parsed {
                return Ok(frame);
            }

            let conn = self
                .conn
                .as_mut()
                .ok_or_else(|| Error::new(ErrorKind::WebSocket).with_detail("socket is gone"))?;
            match conn.fill(&deadline).await {
                Ok(0) => {
                    return Err(Error::new(ErrorKind::Network)
                        .with_detail("peer closed without a CLOSE frame"));
                }
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-handshakes with exponential backoff. Only called after an
    /// unexpected transport loss while `auto_reconnect` is on.
    async fn reconnect(&mut self) -> Result<()> {
        self.teardown();

        let mut last_err: Option<Error> = None;
        for attempt in 0..self.limits.max_reconnect_attempts {
            let delay = self.limits.reconnect_delay * 2u32.saturating_pow(attempt.min(16));
            debug!(attempt, ?delay, url = %self.url, "websocket reconnect");
            tokio::time::sleep(delay).await;

            match self.handshake().await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }

        let err = Error::new(ErrorKind::WebSocket)
            .with_detail(format!(
                "reconnect gave up after {} attempts",
                self.limits.max_reconnect_attempts
            ))
            .with_url(self.url.to_string());
        Err(match last_err {
            Some(source) => err.with_source(source),
            None => err,
        })
    }

    fn teardown(&mut self) {
        self.conn = None;
        self.fragments = None;
        self.state = WsState::Closed;
    }
}

fn is_transport_loss(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Network | ErrorKind::ReadTimeout | ErrorKind::Connection
    )
}

fn into_message(opcode: Opcode, payload: Vec<u8>) -> Result<Message> {
    match opcode {
        Opcode::Text => match simdutf8::basic::from_utf8(&payload) {
            Ok(_) => Ok(Message::Text(String::from_utf8_lossy(&payload).into_owned())),
            Err(_) => Err(Error::new(ErrorKind::WebSocket)
                .with_detail("text message is not valid UTF-8")),
        },
        _ => Ok(Message::Binary(payload)),
    }
}

#[cfg(test)]
mod ws_tests {
    use super::*;
    use frame::apply_mask;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, format!("ws://127.0.0.1:{port}/ws"))
    }

    /// Server side of the handshake: read the request head, answer 101.
    async fn ws_accept(listener: &TcpListener) -> TcpStream {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut tmp = [0u8; 2048];
        let head = loop {
            let n = sock.read(&mut tmp).await.unwrap();
            assert!(n > 0);
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = memchr::memmem::find(&buf, b"\r\n\r\n") {
                break String::from_utf8_lossy(&buf[..pos + 4]).into_owned();
            }
        };

        assert!(head.starts_with("GET /ws HTTP/1.1\r\n"), "{head}");
        assert!(head.contains("Upgrade: websocket\r\n"), "{head}");
        assert!(head.contains("Sec-WebSocket-Version: 13\r\n"), "{head}");

        let key = head
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap()
            .trim()
            .to_owned();

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            proto::accept_for(&key)
        );
        sock.write_all(response.as_bytes()).await.unwrap();
        sock
    }

    /// Reads one masked client frame: `(first_byte, payload)`.
    async fn read_client_frame(sock: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 2];
        sock.read_exact(&mut header).await.unwrap();
        assert_eq!(header[1] & 0x80, 0x80, "client frames must be masked");

        let len = (header[1] & 0x7F) as usize;
        assert!(len < 126, "test frames stay small");

        let mut key = [0u8; 4];
        sock.read_exact(&mut key).await.unwrap();
        let mut payload = vec![0u8; len];
        sock.read_exact(&mut payload).await.unwrap();
        apply_mask(&mut payload, key);
        (header[0], payload)
    }

    async fn send_server_frame(sock: &mut TcpStream, first: u8, payload: &[u8]) {
        let mut wire = vec![first, payload.len() as u8];
        wire.extend_from_slice(payload);
        sock.write_all(&wire).await.unwrap();
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let (listener, url) = bind().await;

        let server = tokio::spawn(async move {
            let mut sock = ws_accept(&listener).await;

            let (first, payload) = read_client_frame(&mut sock).await;
            assert_eq!(first, 0x81, "FIN + text opcode");
            assert_eq!(payload, b"hi");

            send_server_frame(&mut sock, 0x81, b"hi").await;
            sock
        });

        let session = Session::new();
        let mut ws = session.websocket(url).connect().await.unwrap();
        assert_eq!(ws.state(), WsState::Open);

        ws.send_text("hi").await.unwrap();
        assert_eq!(ws.recv().await.unwrap(), Some(Message::Text("hi".into())));

        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn ping_answered_with_pong() {
        let (listener, url) = bind().await;

        let server = tokio::spawn(async move {
            let mut sock = ws_accept(&listener).await;

            send_server_frame(&mut sock, 0x89, b"py").await; // ping
            send_server_frame(&mut sock, 0x81, b"done").await; // text

            let (first, payload) = read_client_frame(&mut sock).await;
            assert_eq!(first, 0x8A, "FIN + pong opcode");
            assert_eq!(payload, b"py");
            sock
        });

        let session = Session::new();
        let mut ws = session.websocket(url).connect().await.unwrap();

        // The ping is consumed and answered inside recv().
        assert_eq!(ws.recv().await.unwrap(), Some(Message::Text("done".into())));

        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn fragmented_message_reassembled() {
        let (listener, url) = bind().await;

        let server = tokio::spawn(async move {
            let mut sock = ws_accept(&listener).await;
            send_server_frame(&mut sock, 0x01, b"he").await; // text, FIN=0
            send_server_frame(&mut sock, 0x00, b"ll").await; // continuation
            send_server_frame(&mut sock, 0x80, b"o").await; // final continuation
            sock
        });

        let session = Session::new();
        let mut ws = session.websocket(url).connect().await.unwrap();
        assert_eq!(ws.recv().await.unwrap(), Some(Message::Text("hello".into())));

        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn clean_close_never_reconnects() {
        let (listener, url) = bind().await;

        let server = tokio::spawn(async move {
            let mut sock = ws_accept(&listener).await;
            send_server_frame(&mut sock, 0x88, &[0x03, 0xE8]).await; // close 1000

            // Expect the echo back.
            let (first, payload) = read_client_frame(&mut sock).await;
            assert_eq!(first, 0x88);
            assert_eq!(payload, [0x03, 0xE8]);
            sock
        });

        let session = Session::new();
        let mut ws = session
            .websocket(url)
            .auto_reconnect(true)
            .reconnect_delay(Duration::from_millis(5))
            .connect()
            .await
            .unwrap();

        assert_eq!(ws.recv().await.unwrap(), None);
        assert_eq!(ws.state(), WsState::Closed);

        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn reconnect_after_transport_loss() {
        let (listener, url) = bind().await;

        let server = tokio::spawn(async move {
            // First connection dies right after the handshake.
            let sock = ws_accept(&listener).await;
            drop(sock);

            // Second connection delivers a message.
            let mut sock = ws_accept(&listener).await;
            send_server_frame(&mut sock, 0x81, b"back").await;
            sock
        });

        let session = Session::new();
        let mut ws = session
            .websocket(url)
            .auto_reconnect(true)
            .reconnect_delay(Duration::from_millis(5))
            .connect()
            .await
            .unwrap();

        assert_eq!(ws.recv().await.unwrap(), Some(Message::Text("back".into())));

        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn handshake_refusal() {
        let (listener, url) = bind().await;

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let session = Session::new();
        let err = session.websocket(url).connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WebSocket);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn oversize_inbound_frame_closes_1009() {
        let (listener, url) = bind().await;

        let server = tokio::spawn(async move {
            let mut sock = ws_accept(&listener).await;
            send_server_frame(&mut sock, 0x81, b"way too long").await;

            let (first, payload) = read_client_frame(&mut sock).await;
            assert_eq!(first, 0x88, "close frame");
            assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1009);
            sock
        });

        let session = Session::new();
        let mut ws = session
            .websocket(url)
            .max_frame_size(4)
            .connect()
            .await
            .unwrap();

        let err = ws.recv().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WebSocket);
        assert_eq!(ws.state(), WsState::Closed);

        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn http_url_rejected() {
        let session = Session::new();
        let err = session
            .websocket("http://example.com/ws")
            .connect()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }
}

//! Blocking WebSocket client - thread-per-call twin of
//! [`ws::WebSocket`](crate::ws::WebSocket), sharing the frame codec,
//! handshake logic, [`Message`] and [`WsState`] types.

use std::time::Duration;

use tracing::{debug, warn};

use crate::blocking::conn::Connection;
use crate::blocking::pool::Pool;
use crate::blocking::session::Session;
use crate::errors::{Error, ErrorKind, Result};
use crate::http::headers::HeaderMap;
use crate::http::url::Url;
use crate::limits::{ProtocolLimits, WsLimits};
use crate::timing::{Deadline, Timeout};
use crate::ws::frame::{
    close_payload, encode_frame, parse_close_payload, parse_frame, Frame, FrameError, Opcode,
    CLOSE_NORMAL, CLOSE_TOO_BIG,
};
use crate::ws::proto::{build_handshake, handshake_key, verify_upgrade};
use crate::ws::{Message, WsState};

/// Configures and opens a blocking WebSocket. Created by
/// [`Session::websocket`](crate::blocking::Session::websocket).
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

    /// Time budget for the handshake and for each read.
    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Performs the opening handshake.
    pub fn connect(mut self) -> Result<WebSocket> {
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
        ws.handshake()?;
        Ok(ws)
    }
}

/// A connected blocking WebSocket client.
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

    fn handshake(&mut self) -> Result<()> {
        let deadline = Deadline::start(self.timeout);
        let origin = self.url.origin();

        let checkout = self.pool.acquire(&origin, &deadline)?;
        let mut conn = checkout.detach();

        let key = handshake_key();
        let request = build_handshake(&self.url, &self.headers, &key, &self.subprotocols)?;
        conn.write_all(&request, &deadline)?;

        let head = conn.read_single_head(&self.protocol_limits, &deadline)?;
        self.protocol = verify_upgrade(&head, &key, &self.subprotocols)
            .map_err(|e| e.with_url(self.url.to_string()))?;

        debug!(url = %self.url, protocol = ?self.protocol, "websocket open");
        self.conn = Some(conn);
        self.state = WsState::Open;
        self.fragments = None;
        Ok(())
    }

    /// Sends a text message.
    pub fn send_text(&mut self, text: impl AsRef<str>) -> Result<()> {
        self.send_data(Opcode::Text, text.as_ref().as_bytes())
    }

    /// Sends a binary message.
    pub fn send_binary(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        self.send_data(Opcode::Binary, data.as_ref())
    }

    /// Sends a [`Message`].
    pub fn send(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Text(text) => self.send_text(text),
            Message::Binary(data) => self.send_binary(data),
            Message::Pong(data) => self.write_frame(true, Opcode::Pong, &data),
        }
    }

    /// Sends a PING with up to 125 bytes of payload.
    pub fn ping(&mut self, data: Option<&[u8]>) -> Result<()> {
        let payload = data.unwrap_or_default();
        if payload.len() > 125 {
            return Err(Error::new(ErrorKind::WebSocket)
                .with_detail("control frame payload exceeds 125 bytes"));
        }
        self.ensure_open()?;
        self.write_frame(true, Opcode::Ping, payload)
    }

    /// Receives the next application message; `Ok(None)` on clean close.
    pub fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if self.state == WsState::Closed {
                return Ok(None);
            }

            let frame = match self.read_frame() {
                Ok(frame) => frame,
                Err(e) if is_transport_loss(&e) => {
                    if self.state == WsState::Closing {
                        self.teardown();
                        return Ok(None);
                    }
                    if self.limits.auto_reconnect && self.state == WsState::Open {
                        warn!(url = %self.url, "websocket transport lost, reconnecting");
                        self.reconnect()?;
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
                    self.write_frame(true, Opcode::Pong, &frame.payload)?;
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
                        self.state = WsState::Closing;
                        let _ = self.write_frame(true, Opcode::Close, &frame.payload);
                    }
                    self.teardown();
                    return Ok(None);
                }
            }
        }
    }

    /// Initiates a clean close and waits for the peer's echo.
    pub fn close(&mut self, code: Option<u16>, reason: Option<&str>) -> Result<()> {
        if self.state != WsState::Open {
            return Ok(());
        }

        self.state = WsState::Closing;
        let payload = close_payload(code.unwrap_or(CLOSE_NORMAL), reason.unwrap_or(""));
        self.write_frame(true, Opcode::Close, &payload)?;

        loop {
            match self.read_frame() {
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

    fn send_data(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;

        let max = self.limits.max_frame_size.max(1);
        if payload.len() <= max {
            return self.write_frame(true, opcode, payload);
        }

        let mut pieces = payload.chunks(max).peekable();
        let mut first = true;
        while let Some(piece) = pieces.next() {
            let fin = pieces.peek().is_none();
            let op = if first { opcode } else { Opcode::Continuation };
            self.write_frame(fin, op, piece)?;
            first = false;
        }
        Ok(())
    }

    fn write_frame(&mut self, fin: bool, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let deadline = Deadline::start(self.timeout);
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::WebSocket).with_detail("socket is gone"))?;

        let key: [u8; 4] = rand::random();
        let mut wire = Vec::with_capacity(payload.len() + 14);
        encode_frame(fin, opcode, payload, key, &mut wire);
        conn.write_all(&wire, &deadline)
    }

    fn read_frame(&mut self) -> Result<Frame> {
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
                            let _ = self.write_frame(true, Opcode::Close, &payload);
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
            match conn.fill(&deadline) {
                Ok(0) => {
                    return Err(Error::new(ErrorKind::Network)
                        .with_detail("peer closed without a CLOSE frame"));
                }
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn reconnect(&mut self) -> Result<()> {
        self.teardown();

        let mut last_err: Option<Error> = None;
        for attempt in 0..self.limits.max_reconnect_attempts {
            let delay = self.limits.reconnect_delay * 2u32.saturating_pow(attempt.min(16));
            debug!(attempt, ?delay, url = %self.url, "websocket reconnect");
            std::thread::sleep(delay);

            match self.handshake() {
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
mod blocking_ws_tests {
    use super::*;
    use crate::ws::frame::apply_mask;
    use crate::ws::proto::accept_for;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, format!("ws://127.0.0.1:{port}/ws"))
    }

    fn ws_accept(listener: &TcpListener) -> TcpStream {
        let (mut sock, _) = listener.accept().unwrap();
        let mut buf = Vec::new();
        let mut tmp = [0u8; 2048];
        let head = loop {
            let n = sock.read(&mut tmp).unwrap();
            assert!(n > 0);
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = memchr::memmem::find(&buf, b"\r\n\r\n") {
                break String::from_utf8_lossy(&buf[..pos + 4]).into_owned();
            }
        };

        let key = head
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap()
            .trim()
            .to_owned();

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_for(&key)
        );
        sock.write_all(response.as_bytes()).unwrap();
        sock
    }

    fn read_client_frame(sock: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 2];
        sock.read_exact(&mut header).unwrap();
        assert_eq!(header[1] & 0x80, 0x80, "client frames must be masked");

        let len = (header[1] & 0x7F) as usize;
        assert!(len < 126);

        let mut key = [0u8; 4];
        sock.read_exact(&mut key).unwrap();
        let mut payload = vec![0u8; len];
        sock.read_exact(&mut payload).unwrap();
        apply_mask(&mut payload, key);
        (header[0], payload)
    }

    fn send_server_frame(sock: &mut TcpStream, first: u8, payload: &[u8]) {
        let mut wire = vec![first, payload.len() as u8];
        wire.extend_from_slice(payload);
        sock.write_all(&wire).unwrap();
    }

    #[test]
    fn echo_round_trip() {
        let (listener, url) = bind();

        let server = std::thread::spawn(move || {
            let mut sock = ws_accept(&listener);

            let (first, payload) = read_client_frame(&mut sock);
            assert_eq!(first, 0x81);
            assert_eq!(payload, b"hi");

            send_server_frame(&mut sock, 0x81, b"hi");
            sock
        });

        let session = Session::new();
        let mut ws = session.websocket(url).connect().unwrap();
        assert_eq!(ws.state(), WsState::Open);

        ws.send_text("hi").unwrap();
        assert_eq!(ws.recv().unwrap(), Some(Message::Text("hi".into())));

        drop(server.join().unwrap());
    }

    #[test]
    fn ping_pong_and_close() {
        let (listener, url) = bind();

        let server = std::thread::spawn(move || {
            let mut sock = ws_accept(&listener);

            // Unsolicited ping, then a clean close.
            send_server_frame(&mut sock, 0x89, b"hb");
            send_server_frame(&mut sock, 0x88, &[0x03, 0xE8]);

            let (first, payload) = read_client_frame(&mut sock);
            assert_eq!(first, 0x8A);
            assert_eq!(payload, b"hb");

            let (first, payload) = read_client_frame(&mut sock);
            assert_eq!(first, 0x88);
            assert_eq!(payload, [0x03, 0xE8]);
            sock
        });

        let session = Session::new();
        let mut ws = session.websocket(url).connect().unwrap();

        assert_eq!(ws.recv().unwrap(), None);
        assert_eq!(ws.state(), WsState::Closed);

        drop(server.join().unwrap());
    }
}

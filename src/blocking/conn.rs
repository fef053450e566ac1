//! Blocking twin of the client connection: `std::net` socket, rustls
//! stream, per-call read timeouts derived from the request deadline.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Instant;

use rustls::{ClientConnection, StreamOwned};
use tracing::{debug, trace};

use crate::errors::{Error, ErrorKind, Result};
use crate::http::codec::parse_head;
use crate::http::response::ResponseHead;
use crate::http::url::Origin;
use crate::limits::ProtocolLimits;
use crate::timing::Deadline;
use crate::tls::{server_name, tls_config};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug)]
enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Transport {
    fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => &stream.sock,
        }
    }

    fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

/// An open blocking connection to one origin.
#[derive(Debug)]
pub(crate) struct Connection {
    origin: Origin,
    transport: Transport,
    buf: Vec<u8>,
    opened_at: Instant,
    last_used: Instant,
    reusable: bool,
}

impl Connection {
    /// Opens a TCP connection (TLS-wrapped for `https`/`wss`) bounded by
    /// the connect window of `deadline`.
    pub(crate) fn open(origin: &Origin, deadline: &Deadline) -> Result<Self> {
        let host = origin.host.trim_matches(['[', ']']).to_owned();
        let window = deadline.connect_window()?;

        let addrs: Vec<_> = (host.as_str(), origin.port)
            .to_socket_addrs()
            .map_err(|e| Error::new(ErrorKind::Connection).with_source(e))?
            .collect();

        let mut last_err: Option<std::io::Error> = None;
        let mut stream = None;
        for addr in addrs {
            let attempt = match window {
                Some(window) => TcpStream::connect_timeout(&addr, window),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(sock) => {
                    stream = Some(sock);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = stream.ok_or_else(|| {
            let err = Error::new(ErrorKind::Connection)
                .with_detail(format!("no reachable address for {origin}"));
            match last_err {
                Some(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                    Error::new(ErrorKind::ConnectTimeout).with_source(io)
                }
                Some(io) => err.with_source(io),
                None => err,
            }
        })?;

        let sock = socket2::SockRef::from(&stream);
        let _ = sock.set_tcp_nodelay(true);
        let _ = sock.set_keepalive(true);

        let transport = if origin.scheme.is_tls() {
            let name = server_name(&host)?;
            let mut tls = ClientConnection::new(tls_config(), name)
                .map_err(|e| Error::new(ErrorKind::Tls).with_source(e))?;

            // Drive the handshake eagerly so certificate failures surface
            // as TlsError, within the connect budget.
            stream
                .set_read_timeout(deadline.connect_window()?)
                .map_err(Error::io)?;
            let mut sock = stream;
            while tls.is_handshaking() {
                tls.complete_io(&mut sock).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock
                    {
                        Error::new(ErrorKind::ConnectTimeout).with_source(e)
                    } else {
                        Error::new(ErrorKind::Tls).with_source(e)
                    }
                })?;
            }
            Transport::Tls(Box::new(StreamOwned::new(tls, sock)))
        } else {
            Transport::Plain(stream)
        };

        debug!(%origin, tls = transport.is_tls(), "connection opened");

        let now = Instant::now();
        Ok(Connection {
            origin: origin.clone(),
            transport,
            buf: Vec::new(),
            opened_at: now,
            last_used: now,
            reusable: true,
        })
    }

    #[inline]
    pub(crate) fn origin(&self) -> &Origin {
        &self.origin
    }

    #[inline]
    pub(crate) fn idle_for(&self) -> std::time::Duration {
        self.last_used.elapsed()
    }

    #[inline]
    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    #[inline]
    pub(crate) fn poison(&mut self) {
        self.reusable = false;
    }

    #[inline]
    pub(crate) fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Fast non-blocking liveness probe; see the async twin for the TLS
    /// caveat (buffered records do not condemn a TLS connection).
    pub(crate) fn is_usable(&self) -> bool {
        if !self.reusable || !self.buf.is_empty() {
            return false;
        }

        let tcp = self.transport.tcp();
        if tcp.set_nonblocking(true).is_err() {
            return false;
        }

        let mut probe = [0u8; 1];
        let verdict = match tcp.peek(&mut probe) {
            Ok(0) => false,
            Ok(_) => self.transport.is_tls(),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        };

        if tcp.set_nonblocking(false).is_err() {
            return false;
        }
        verdict
    }

    /// Writes the whole buffer, bounded by the read window of `deadline`.
    pub(crate) fn write_all(&mut self, bytes: &[u8], deadline: &Deadline) -> Result<()> {
        let window = match deadline.read_window() {
            Ok(window) => window,
            Err(e) => {
                self.poison();
                return Err(e);
            }
        };
        if self.transport.tcp().set_write_timeout(window).is_err() {
            self.poison();
            return Err(Error::new(ErrorKind::Network).with_detail("socket configuration failed"));
        }

        let result = match &mut self.transport {
            Transport::Plain(stream) => stream.write_all(bytes),
            Transport::Tls(stream) => stream.write_all(bytes),
        };
        result.map_err(|e| {
            self.poison();
            Error::io(e)
        })
    }

    /// Reads more bytes into the internal buffer. Zero means peer close.
    pub(crate) fn fill(&mut self, deadline: &Deadline) -> Result<usize> {
        let window = match deadline.read_window() {
            Ok(window) => window,
            Err(e) => {
                self.poison();
                return Err(e);
            }
        };
        if self.transport.tcp().set_read_timeout(window).is_err() {
            self.poison();
            return Err(Error::new(ErrorKind::Network).with_detail("socket configuration failed"));
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = match &mut self.transport {
            Transport::Plain(stream) => stream.read(&mut chunk),
            Transport::Tls(stream) => stream.read(&mut chunk),
        };
        let n = n.map_err(|e| {
            self.poison();
            Error::io(e)
        })?;

        self.buf.extend_from_slice(&chunk[..n]);
        self.touch();
        trace!(origin = %self.origin, bytes = n, "read");
        Ok(n)
    }

    pub(crate) fn take_buffered(&mut self, max: usize) -> Vec<u8> {
        let take = max.min(self.buf.len());
        self.buf.drain(..take).collect()
    }

    #[inline]
    pub(crate) fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    pub(crate) fn untake(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.buf.splice(..0, bytes);
        }
    }

    #[inline]
    pub(crate) fn buffered(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub(crate) fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }

    /// Reads and parses a response head, skipping interim `1xx`
    /// responses (except `101`, which only the upgrade path may consume).
    pub(crate) fn read_head(
        &mut self,
        limits: &ProtocolLimits,
        deadline: &Deadline,
    ) -> Result<ResponseHead> {
        loop {
            let head = self.read_single_head(limits, deadline)?;
            match head.status {
                100 | 102..=199 => continue,
                101 => {
                    self.poison();
                    return Err(Error::new(ErrorKind::InvalidResponse)
                        .with_detail("unexpected 101 Switching Protocols"));
                }
                _ => return Ok(head),
            }
        }
    }

    pub(crate) fn read_single_head(
        &mut self,
        limits: &ProtocolLimits,
        deadline: &Deadline,
    ) -> Result<ResponseHead> {
        loop {
            match parse_head(&self.buf, limits) {
                Ok(Some((head, consumed))) => {
                    self.buf.drain(..consumed);
                    return Ok(head);
                }
                Ok(None) => {}
                Err(e) => {
                    self.poison();
                    return Err(e);
                }
            }

            if self.fill(deadline)? == 0 {
                self.poison();
                return Err(Error::new(ErrorKind::Network)
                    .with_detail("connection closed before a complete response head"));
            }
        }
    }
}

#[cfg(test)]
mod conn_tests {
    use super::*;
    use crate::http::url::Url;
    use crate::timing::Timeout;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::time::Duration;

    fn origin_of(listener: &TcpListener) -> Origin {
        let port = listener.local_addr().unwrap().port();
        Url::parse(&format!("http://127.0.0.1:{port}/"))
            .unwrap()
            .origin()
    }

    #[test]
    fn open_write_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let origin = origin_of(&listener);

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).unwrap();
            assert!(buf[..n].starts_with(b"ping"));
            sock.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
            sock
        });

        let deadline = Deadline::start(Timeout::default());
        let mut conn = Connection::open(&origin, &deadline).unwrap();
        conn.write_all(b"ping", &deadline).unwrap();

        let head = conn
            .read_head(&ProtocolLimits::default(), &deadline)
            .unwrap();
        assert_eq!(head.status, 204);

        drop(server.join().unwrap());
    }

    #[test]
    fn read_timeout_fires() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let origin = origin_of(&listener);

        let deadline = Deadline::start(Timeout {
            connect: Some(Duration::from_secs(5)),
            read: Some(Duration::from_millis(50)),
            total: None,
        });
        let mut conn = Connection::open(&origin, &deadline).unwrap();
        let (_sock, _) = listener.accept().unwrap();

        let err = conn
            .read_head(&ProtocolLimits::default(), &deadline)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadTimeout);
        assert!(!conn.is_reusable());
    }

    #[test]
    fn peer_close_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let origin = origin_of(&listener);

        let deadline = Deadline::start(Timeout::default());
        let conn = Connection::open(&origin, &deadline).unwrap();

        let (sock, _) = listener.accept().unwrap();
        drop(sock);
        std::thread::sleep(Duration::from_millis(50));

        assert!(!conn.is_usable());
    }
}

//! A single client connection: TCP socket, optional TLS, timed I/O.
//!
//! Reads go through an internal buffer so the head parser can retry on
//! partial data and body readers can consume exactly what framing allows;
//! whatever the parser did not claim stays buffered for the next step.

use std::io;
use std::time::Instant;

use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
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
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => stream.get_ref().0,
        }
    }

    fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

/// An open connection to one origin.
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
    /// the connect cutoff of `deadline`.
    pub(crate) async fn open(origin: &Origin, deadline: &Deadline) -> Result<Self> {
        let cutoff = deadline.connect_cutoff();
        let host = origin.host.trim_matches(['[', ']']).to_owned();
        let port = origin.port;

        let connect = async {
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| Error::new(ErrorKind::Connection).with_source(e))?;

            let sock = socket2::SockRef::from(&stream);
            // Latency first; keepalive so dead peers surface between requests.
            let _ = sock.set_tcp_nodelay(true);
            let _ = sock.set_keepalive(true);

            let transport = if origin.scheme.is_tls() {
                let name = server_name(&host)?;
                let tls = TlsConnector::from(tls_config())
                    .connect(name, stream)
                    .await
                    .map_err(|e| Error::new(ErrorKind::Tls).with_source(e))?;
                Transport::Tls(Box::new(tls))
            } else {
                Transport::Plain(stream)
            };

            Ok::<_, Error>(transport)
        };

        let transport = match cutoff {
            Some(cutoff) => {
                match tokio::time::timeout_at(tokio::time::Instant::from_std(cutoff), connect)
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(Error::new(ErrorKind::ConnectTimeout)
                            .with_detail(format!("connecting to {origin}")))
                    }
                }
            }
            None => connect.await?,
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
    pub(crate) fn age(&self) -> std::time::Duration {
        self.opened_at.elapsed()
    }

    /// Seconds since the last successful read, for idle expiry.
    #[inline]
    pub(crate) fn idle_for(&self) -> std::time::Duration {
        self.last_used.elapsed()
    }

    #[inline]
    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Marks the connection as never to be pooled again.
    #[inline]
    pub(crate) fn poison(&mut self) {
        self.reusable = false;
    }

    #[inline]
    pub(crate) fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Fast liveness probe: false when the peer already closed or the
    /// socket is in error.
    ///
    /// A plain connection with bytes pending before any request was written
    /// is broken; under TLS, buffered records (session tickets) are normal,
    /// so only EOF or a socket error condemns the connection there.
    pub(crate) fn is_usable(&self) -> bool {
        if !self.reusable || !self.buf.is_empty() {
            return false;
        }

        let mut probe = [0u8; 1];
        match self.transport.tcp().peek(&mut probe).now_or_never() {
            None => true,
            Some(Ok(0)) => false,
            Some(Ok(_)) => self.transport.is_tls(),
            Some(Err(_)) => false,
        }
    }

    /// Writes the whole buffer, bounded by the read cutoff of `deadline`.
    pub(crate) async fn write_all(&mut self, bytes: &[u8], deadline: &Deadline) -> Result<()> {
        let cutoff = deadline.read_cutoff();
        let result = match &mut self.transport {
            Transport::Plain(stream) => timed(cutoff, stream.write_all(bytes)).await,
            Transport::Tls(stream) => timed(cutoff, stream.write_all(bytes)).await,
        };
        if result.is_err() {
            self.poison();
        }
        result
    }

    /// Reads more bytes into the internal buffer. Returns the byte count;
    /// zero means the peer closed.
    pub(crate) async fn fill(&mut self, deadline: &Deadline) -> Result<usize> {
        let cutoff = deadline.read_cutoff();
        let mut chunk = [0u8; READ_CHUNK];

        let n = match &mut self.transport {
            Transport::Plain(stream) => timed(cutoff, stream.read(&mut chunk)).await,
            Transport::Tls(stream) => timed(cutoff, stream.read(&mut chunk)).await,
        };
        let n = match n {
            Ok(n) => n,
            Err(e) => {
                self.poison();
                return Err(e);
            }
        };

        self.buf.extend_from_slice(&chunk[..n]);
        self.touch();
        trace!(origin = %self.origin, bytes = n, "read");
        Ok(n)
    }

    /// Takes up to `max` bytes off the front of the internal buffer.
    pub(crate) fn take_buffered(&mut self, max: usize) -> Vec<u8> {
        let take = max.min(self.buf.len());
        self.buf.drain(..take).collect()
    }

    #[inline]
    pub(crate) fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Returns unconsumed bytes to the front of the buffer (a body decoder
    /// took more than its framing allowed it to claim).
    pub(crate) fn untake(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.buf.splice(..0, bytes);
        }
    }

    /// Buffered-but-unconsumed bytes, for parsers that peek before they
    /// claim (the WebSocket frame decoder).
    #[inline]
    pub(crate) fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes `n` bytes off the front of the buffer.
    #[inline]
    pub(crate) fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }

    /// Reads and parses a response head, skipping interim `1xx` responses
    /// (except `101`, which only the WebSocket handshake may consume).
    pub(crate) async fn read_head(
        &mut self,
        limits: &ProtocolLimits,
        deadline: &Deadline,
    ) -> Result<ResponseHead> {
        loop {
            let head = self.read_single_head(limits, deadline).await?;
            match head.status {
                100 | 102..=199 => {
                    trace!(origin = %self.origin, status = head.status, "interim response skipped");
                    continue;
                }
                101 => {
                    self.poison();
                    return Err(Error::new(ErrorKind::InvalidResponse)
                        .with_detail("unexpected 101 Switching Protocols"));
                }
                _ => return Ok(head),
            }
        }
    }

    /// Reads exactly one head, `1xx` included. The WebSocket handshake
    /// needs the raw `101`.
    pub(crate) async fn read_single_head(
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

            if self.fill(deadline).await? == 0 {
                self.poison();
                return Err(Error::new(ErrorKind::Network)
                    .with_detail("connection closed before a complete response head"));
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!(origin = %self.origin, age = ?self.age(), "connection closed");
    }
}

async fn timed<T>(
    cutoff: Option<Instant>,
    op: impl std::future::Future<Output = io::Result<T>>,
) -> Result<T> {
    match cutoff {
        Some(cutoff) => {
            match tokio::time::timeout_at(tokio::time::Instant::from_std(cutoff), op).await {
                Ok(result) => result.map_err(Error::io),
                Err(_) => Err(Error::new(ErrorKind::ReadTimeout)),
            }
        }
        None => op.await.map_err(Error::io),
    }
}

#[cfg(test)]
mod conn_tests {
    use super::*;
    use crate::http::url::Url;
    use crate::timing::Timeout;
    use tokio::net::TcpListener;

    async fn origin_of(listener: &TcpListener) -> Origin {
        let port = listener.local_addr().unwrap().port();
        Url::parse(&format!("http://127.0.0.1:{port}/"))
            .unwrap()
            .origin()
    }

    #[tokio::test]
    async fn open_write_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = origin_of(&listener).await;

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"ping"));
            sock.write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
        });

        let deadline = Deadline::start(Timeout::default());
        let mut conn = Connection::open(&origin, &deadline).await.unwrap();
        conn.write_all(b"ping", &deadline).await.unwrap();

        let head = conn
            .read_head(&ProtocolLimits::default(), &deadline)
            .await
            .unwrap();
        assert_eq!(head.status, 204);
        assert!(!conn.has_buffered());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn interim_responses_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = origin_of(&listener).await;

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let deadline = Deadline::start(Timeout::default());
        let mut conn = Connection::open(&origin, &deadline).await.unwrap();
        let head = conn
            .read_head(&ProtocolLimits::default(), &deadline)
            .await
            .unwrap();
        assert_eq!(head.status, 200);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn peer_close_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = origin_of(&listener).await;

        let deadline = Deadline::start(Timeout::default());
        let mut conn = Connection::open(&origin, &deadline).await.unwrap();

        let (sock, _) = listener.accept().await.unwrap();
        drop(sock);
        // Give the FIN a moment to arrive.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(!conn.is_usable());

        let err = conn
            .read_head(&ProtocolLimits::default(), &deadline)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn read_timeout_fires() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = origin_of(&listener).await;

        let deadline = Deadline::start(Timeout {
            connect: Some(std::time::Duration::from_secs(5)),
            read: Some(std::time::Duration::from_millis(50)),
            total: None,
        });
        let mut conn = Connection::open(&origin, &deadline).await.unwrap();
        let (_sock, _) = listener.accept().await.unwrap();

        let err = conn
            .read_head(&ProtocolLimits::default(), &deadline)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadTimeout);
    }

    #[tokio::test]
    async fn connect_refused() {
        // Bind then drop to get a port with (very likely) nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = origin_of(&listener).await;
        drop(listener);

        let deadline = Deadline::start(Timeout::default());
        let err = Connection::open(&origin, &deadline).await.unwrap_err();
        assert!(err.is_connect(), "{err}");
    }
}

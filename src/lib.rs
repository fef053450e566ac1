//! maker_client - High-performance HTTP/1.1 and WebSocket client for microservices
//!
//! A protocol-level HTTP client with its own wire parser, connection pool
//! and WebSocket engine. Designed for services that talk to many peers and
//! need fine-grained control over connections, limits and timeouts.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, chunked transfer coding in both
//!   directions, gzip/deflate response decoding
//! - **HTTP/1.0**: parsed and honored (close-by-default connections)
//! - **WebSocket (RFC 6455)**: handshake over the same transport, masking,
//!   fragmentation, control frames, optional auto-reconnect
//!
//! # Features
//!
//! ## 🔒 Security & Protection
//! - **Header-injection defense** - CR/LF/NUL can never reach the wire.
//! - **Fully configurable limits** for header sections, field counts,
//!   body sizes and WebSocket frames - enforced while bytes arrive.
//! - **TLS 1.2+** with SNI and full hostname verification, always.
//!
//! ## 🚀 Performance & Connections
//! - **Per-origin LIFO connection pool** - the most recently used socket
//!   is reused first, stale sockets are probed and evicted.
//! - **Permit-bounded concurrency** - per-origin and global connection
//!   bounds, never busy-waiting.
//!
//! ## 🌐 Sessions
//! - **Cookies, persistent headers, Basic/Bearer auth** composed into
//!   every request from a consistent snapshot.
//! - **Automatic redirects** with RFC-conformant method rewriting,
//!   cross-origin credential stripping and cycle detection.
//! - **Pre-request and post-response hooks**.
//!
//! ## 🧵 Two execution models
//! - [`Session`] - async, single-threaded cooperative, on tokio.
//! - [`blocking::Session`] - thread-per-call with the same semantics.
//!
//! # Quick Start
//!
//! ## 1. Installation
//!
//! ```bash
//! cargo add maker_client tokio --features tokio/full
//! ```
//!
//! ## 2. Usage example
//! ```no_run
//! use maker_client::Session;
//!
//! #[tokio::main]
//! async fn main() -> maker_client::Result<()> {
//!     let session = Session::new();
//!
//!     let mut response = session
//!         .get("https://httpbin.org/get")
//!         .query(&[("page", "1")])
//!         .send()
//!         .await?;
//!
//!     println!("{}: {}", response.status(), response.text().await?);
//!     session.close();
//!     Ok(())
//! }
//! ```
//!
//! WebSockets hang off a session the same way:
//! ```no_run
//! # use maker_client::{Session, Message};
//! # async fn run() -> maker_client::Result<()> {
//! let session = Session::new();
//! let mut ws = session.websocket("wss://echo.example/ws").connect().await?;
//! ws.send_text("hi").await?;
//! if let Some(Message::Text(reply)) = ws.recv().await? {
//!     println!("{reply}");
//! }
//! ws.close(None, None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Use Cases
//!
//! - **Service-to-service APIs** - pooled keep-alive connections
//! - **Resource-constrained environments** - every buffer is bounded
//! - **Streaming pipelines** - chunked uploads, incremental downloads
//! - **Event feeds** - WebSocket with reconnect policy

pub(crate) mod http {
    pub(crate) mod codec;
    pub(crate) mod headers;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
    pub(crate) mod url;
}
pub(crate) mod client {
    pub(crate) mod body;
    pub(crate) mod conn;
    pub(crate) mod cookies;
    pub(crate) mod hooks;
    pub(crate) mod pool;
    pub(crate) mod response;
    pub(crate) mod session;
}
pub mod blocking;
pub mod limits;
pub mod ws;
pub(crate) mod auth;
pub(crate) mod errors;
pub(crate) mod redirect;
pub(crate) mod timing;
pub(crate) mod tls;

pub use crate::{
    auth::Auth,
    client::{
        body::Body,
        cookies::CookieJar,
        response::Response,
        session::{RequestBuilder, Session, SessionBuilder},
    },
    errors::{Error, ErrorKind, Hop, Result},
    http::{
        headers::HeaderMap,
        request::RequestParts,
        types::{Method, Version},
        url::{Origin, Scheme, Url},
    },
    timing::Timeout,
    ws::{Message, WebSocket, WebSocketBuilder, WsState},
};

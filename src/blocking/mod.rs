//! Blocking (thread-per-call) twin of the async client.
//!
//! The codec, headers, URL, timing, redirect and pool-bookkeeping logic
//! are the same pure code the async client runs; only the socket
//! primitives and the permit-waiting mechanism differ. A blocking
//! [`Session`] must not be used inside an async runtime - it parks the
//! thread.

pub(crate) mod body;
pub(crate) mod conn;
pub(crate) mod pool;
pub(crate) mod response;
pub(crate) mod session;
pub(crate) mod ws;

pub use body::Body;
pub use response::{IterContent, IterLines, Response};
pub use session::{RequestBuilder, Session, SessionBuilder};
pub use ws::{WebSocket, WebSocketBuilder};

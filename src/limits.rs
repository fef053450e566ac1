//! Client configuration limits and timeouts.
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Unbounded memory growth from hostile or broken servers
//! - Header flooding and oversize header sections
//! - Connection hoarding against a single origin
//! - Frames large enough to stall a WebSocket reader
//!
//! Every limit is enforced while bytes are still arriving, never after the
//! fact.
//!
//! # Examples
//!
//! ```no_run
//! use maker_client::{Session, limits::{PoolLimits, ProtocolLimits}};
//!
//! let session = Session::builder()
//!     .pool_limits(PoolLimits {
//!         max_connections_per_host: 32, // Higher per-origin concurrency
//!         ..PoolLimits::default()
//!     })
//!     .protocol_limits(ProtocolLimits {
//!         max_body_size: 64 * 1024 * 1024, // Large downloads
//!         ..ProtocolLimits::default()
//!     })
//!     .build();
//! ```

use std::time::Duration;

/// Limits enforced by the HTTP/1.1 wire parser.
///
/// These bound what a single response may cost in memory before the caller
/// ever sees it. Streamed bodies are exempt from `max_body_size` (the caller
/// controls consumption); everything else applies to every response.
#[derive(Debug, Clone)]
pub struct ProtocolLimits {
    /// Maximum total size of the status line plus the entire header section,
    /// CRLFs included (default: `65536` bytes).
    ///
    /// Also bounds chunked-trailer sections. Exceeding it aborts the request
    /// with a protocol error and discards the connection.
    pub max_header_size: usize,

    /// Maximum number of header fields in a response (default: `100`).
    ///
    /// Duplicate names count once per occurrence, so a hostile peer cannot
    /// smuggle unbounded fields behind repeated names.
    pub max_field_count: usize,

    /// Maximum size of a fully-buffered response body (default: `10_000_000`
    /// bytes).
    ///
    /// Applies to `body()`/`text()`/`json()` reads and to the decompressed
    /// output when content decoding is active. Streaming reads are bounded
    /// by the caller instead.
    pub max_body_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            max_header_size: 65536,
            max_field_count: 100,
            max_body_size: 10_000_000,

            _priv: (),
        }
    }
}

/// Connection pool sizing and idle-expiry policy.
///
/// The pool keeps one LIFO stack of idle connections per origin
/// `(scheme, host, port)` and bounds concurrency with two permits: one per
/// origin and one global. Acquiring a connection means acquiring both.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    /// Maximum concurrent connections to a single origin (default: `10`).
    ///
    /// Counts both checked-out and idle connections, so the idle stack can
    /// never exceed this either.
    pub max_connections_per_host: usize,

    /// Maximum concurrent connections across all origins (default: `100`).
    pub max_total_connections: usize,

    /// Maximum time a connection may sit idle before it is closed instead of
    /// reused (default: `90` seconds).
    ///
    /// Expiry is checked opportunistically on acquisition and release; call
    /// [`prune`](crate::Session::prune) from periodic maintenance to sweep
    /// eagerly.
    pub max_idle_time: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_connections_per_host: 10,
            max_total_connections: 100,
            max_idle_time: Duration::from_secs(90),

            _priv: (),
        }
    }
}

/// WebSocket framing and reconnect policy.
#[derive(Debug, Clone)]
pub struct WsLimits {
    /// Maximum accepted payload length of a single inbound frame
    /// (default: `1_048_576` bytes).
    ///
    /// An oversize frame closes the connection with code `1009` and fails
    /// the read. Outbound messages larger than this are fragmented instead
    /// of rejected.
    pub max_frame_size: usize,

    /// Re-handshake automatically after an *unexpected* transport loss
    /// (default: `false`).
    ///
    /// A clean peer CLOSE frame never triggers reconnection.
    pub auto_reconnect: bool,

    /// Maximum reconnect attempts per loss (default: `5`).
    pub max_reconnect_attempts: u32,

    /// Base reconnect delay; attempt `n` waits `reconnect_delay * 2^n`
    /// (default: `500` ms).
    pub reconnect_delay: Duration,

    /// Deliver unsolicited PONG frames to the application instead of
    /// discarding them (default: `false`).
    pub deliver_pongs: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for WsLimits {
    fn default() -> Self {
        Self {
            max_frame_size: 1_048_576,
            auto_reconnect: false,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(500),
            deliver_pongs: false,

            _priv: (),
        }
    }
}

#[cfg(test)]
mod default_tests {
    use super::*;

    #[test]
    fn spec_values() {
        let protocol = ProtocolLimits::default();
        assert_eq!(protocol.max_header_size, 65536);
        assert_eq!(protocol.max_field_count, 100);
        assert_eq!(protocol.max_body_size, 10_000_000);

        let pool = PoolLimits::default();
        assert_eq!(pool.max_connections_per_host, 10);
        assert_eq!(pool.max_total_connections, 100);
        assert_eq!(pool.max_idle_time, Duration::from_secs(90));

        let ws = WsLimits::default();
        assert_eq!(ws.max_frame_size, 1_048_576);
        assert!(!ws.auto_reconnect);
    }
}

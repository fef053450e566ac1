//! Split connect/read/total deadlines.
//!
//! A [`Timeout`] is the caller-facing budget triple; a [`Deadline`] pins it
//! to a start instant and answers, for every socket operation, "how long may
//! this one step take". The `total` budget bounds wall-clock time from
//! connect through the final body byte and wins over the per-step budgets
//! whenever it is shorter.

use std::time::{Duration, Instant};

use crate::errors::{Error, ErrorKind, Result};

/// Request time budget: `{connect, read, total}`.
///
/// Each bound may be `None`, meaning "no individual limit". `read` applies
/// to every individual socket read; `total` to the whole exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    /// TCP + TLS establishment bound (default: `10` seconds).
    pub connect: Option<Duration>,
    /// Per-read bound, reset on every successful read (default: `30` seconds).
    pub read: Option<Duration>,
    /// Wall-clock bound over the whole exchange (default: none).
    pub total: Option<Duration>,
}

impl Default for Timeout {
    fn default() -> Self {
        Self {
            connect: Some(Duration::from_secs(10)),
            read: Some(Duration::from_secs(30)),
            total: None,
        }
    }
}

impl Timeout {
    /// A budget with no bounds at all. Useful for long-polling endpoints.
    pub const NONE: Timeout = Timeout {
        connect: None,
        read: None,
        total: None,
    };

    /// Uniform budget: every bound set to `value`.
    pub const fn all(value: Duration) -> Self {
        Timeout {
            connect: Some(value),
            read: Some(value),
            total: Some(value),
        }
    }
}

/// A [`Timeout`] pinned to the instant a request started.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    started: Instant,
    timeout: Timeout,
}

impl Deadline {
    #[inline]
    pub(crate) fn start(timeout: Timeout) -> Self {
        Deadline {
            started: Instant::now(),
            timeout,
        }
    }

    #[inline]
    fn total_end(&self) -> Option<Instant> {
        self.timeout.total.map(|t| self.started + t)
    }

    /// Absolute cutoff of the whole exchange, if a total budget exists.
    /// Permit waits are bounded by this and nothing else.
    #[inline]
    pub(crate) fn total_cutoff(&self) -> Option<Instant> {
        self.total_end()
    }

    /// Absolute cutoff for connection establishment: the connect budget
    /// clipped by whatever remains of the total budget.
    pub(crate) fn connect_cutoff(&self) -> Option<Instant> {
        let connect = self.timeout.connect.map(|t| Instant::now() + t);
        earlier(connect, self.total_end())
    }

    /// Absolute cutoff for the next single read, from now.
    pub(crate) fn read_cutoff(&self) -> Option<Instant> {
        let read = self.timeout.read.map(|t| Instant::now() + t);
        earlier(read, self.total_end())
    }

    /// Window for the next single read as a duration, for blocking sockets
    /// (`set_read_timeout` takes a `Duration`).
    ///
    /// Fails with `ReadTimeout` when the total budget is already gone: the
    /// overrun happened around a read, so it carries read semantics.
    pub(crate) fn read_window(&self) -> Result<Option<Duration>> {
        match self.read_cutoff() {
            Some(cutoff) => {
                let now = Instant::now();
                if cutoff <= now {
                    return Err(Error::new(ErrorKind::ReadTimeout));
                }
                Ok(Some(cutoff - now))
            }
            None => Ok(None),
        }
    }

    /// Same as [`read_window`](Self::read_window) for connect establishment.
    pub(crate) fn connect_window(&self) -> Result<Option<Duration>> {
        match self.connect_cutoff() {
            Some(cutoff) => {
                let now = Instant::now();
                if cutoff <= now {
                    return Err(Error::new(ErrorKind::ConnectTimeout));
                }
                Ok(Some(cutoff - now))
            }
            None => Ok(None),
        }
    }

    /// Errors with `Timeout` if the total budget expired. Called between
    /// protocol steps, outside any read/connect window.
    pub(crate) fn check_total(&self) -> Result<()> {
        match self.total_end() {
            Some(end) if end <= Instant::now() => Err(Error::new(ErrorKind::Timeout)),
            _ => Ok(()),
        }
    }
}

#[inline]
fn earlier(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod deadline_tests {
    use super::*;

    #[test]
    fn defaults() {
        let t = Timeout::default();
        assert_eq!(t.connect, Some(Duration::from_secs(10)));
        assert_eq!(t.read, Some(Duration::from_secs(30)));
        assert_eq!(t.total, None);
    }

    #[test]
    fn total_clips_read() {
        let deadline = Deadline::start(Timeout {
            connect: None,
            read: Some(Duration::from_secs(600)),
            total: Some(Duration::from_secs(1)),
        });

        let cutoff = deadline.read_cutoff().unwrap();
        assert!(cutoff <= deadline.started + Duration::from_secs(1));
    }

    #[test]
    fn unbounded() {
        let deadline = Deadline::start(Timeout::NONE);
        assert_eq!(deadline.read_cutoff(), None);
        assert_eq!(deadline.connect_cutoff(), None);
        assert!(deadline.check_total().is_ok());
        assert_eq!(deadline.read_window().unwrap(), None);
    }

    #[test]
    fn expired_total() {
        let deadline = Deadline {
            started: Instant::now() - Duration::from_secs(5),
            timeout: Timeout {
                connect: None,
                read: None,
                total: Some(Duration::from_secs(1)),
            },
        };

        assert_eq!(
            deadline.check_total().unwrap_err().kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            deadline.read_window().unwrap_err().kind(),
            ErrorKind::ReadTimeout
        );
        assert_eq!(
            deadline.connect_window().unwrap_err().kind(),
            ErrorKind::ConnectTimeout
        );
    }
}

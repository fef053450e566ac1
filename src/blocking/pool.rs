//! Blocking twin of the connection pool.
//!
//! Same shape as the async pool - per-origin LIFO shelves, a global and a
//! per-origin bound - but the permits are plain counters guarded by one
//! mutex, with a condvar for waiting. The global count covers checked-out
//! connections only; the per-origin count covers checked-out plus idle, so
//! `idle + checked_out <= max_connections_per_host` holds at all times.
//! The lock is never held across connect, probe or close.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::blocking::conn::Connection;
use crate::errors::{Error, ErrorKind, Result};
use crate::http::url::Origin;
use crate::limits::PoolLimits;
use crate::timing::Deadline;

#[derive(Default, Debug)]
struct Shelf {
    /// Checked-out + idle connections for this origin.
    count: usize,
    idle: Vec<Connection>,
}

#[derive(Default, Debug)]
struct PoolState {
    /// Checked-out connections across all origins.
    total_out: usize,
    shelves: HashMap<Origin, Shelf>,
}

#[derive(Debug)]
struct PoolShared {
    limits: PoolLimits,
    state: Mutex<PoolState>,
    freed: Condvar,
}

/// Shared handle to the blocking pool.
#[derive(Clone, Debug)]
pub(crate) struct Pool {
    inner: Arc<PoolShared>,
}

impl Pool {
    pub(crate) fn new(limits: PoolLimits) -> Self {
        Pool {
            inner: Arc::new(PoolShared {
                limits,
                state: Mutex::new(PoolState::default()),
                freed: Condvar::new(),
            }),
        }
    }

    /// Acquires a connection: global permit, per-origin permit, newest
    /// usable idle connection or a fresh one.
    pub(crate) fn acquire(&self, origin: &Origin, deadline: &Deadline) -> Result<Checkout> {
        let cutoff = deadline.total_cutoff();

        loop {
            // Permit phase, under the lock.
            let popped = {
                let mut state = self.inner.state.lock();

                loop {
                    let global_free = state.total_out < self.inner.limits.max_total_connections;
                    let shelf = state.shelves.entry(origin.clone()).or_default();
                    let host_free = shelf.count < self.inner.limits.max_connections_per_host;
                    let has_idle = !shelf.idle.is_empty();

                    if global_free && (has_idle || host_free) {
                        break;
                    }
                    self.wait(&mut state, cutoff)?;
                }

                state.total_out += 1;
                let shelf = state.shelves.get_mut(origin).expect("entry created above");
                match shelf.idle.pop() {
                    Some(conn) => Some(conn),
                    None => {
                        shelf.count += 1;
                        None
                    }
                }
            };

            // Probe / connect phase, outside the lock.
            match popped {
                Some(conn) => {
                    let stale = conn.idle_for() > self.inner.limits.max_idle_time
                        || !conn.is_usable();
                    if stale {
                        trace!(%origin, "idle connection discarded");
                        drop(conn);
                        self.forfeit(origin, true);
                        continue;
                    }

                    debug!(%origin, "reusing pooled connection");
                    return Ok(Checkout {
                        pool: self.inner.clone(),
                        origin: origin.clone(),
                        conn: Some(conn),
                    });
                }
                None => {
                    let conn = match Connection::open(origin, deadline) {
                        Ok(conn) => conn,
                        Err(e) => {
                            self.forfeit(origin, true);
                            return Err(e);
                        }
                    };
                    return Ok(Checkout {
                        pool: self.inner.clone(),
                        origin: origin.clone(),
                        conn: Some(conn),
                    });
                }
            }
        }
    }

    fn wait(&self, state: &mut parking_lot::MutexGuard<'_, PoolState>, cutoff: Option<Instant>) -> Result<()> {
        match cutoff {
            Some(cutoff) => {
                if self.inner.freed.wait_until(state, cutoff).timed_out() {
                    return Err(Error::new(ErrorKind::Timeout)
                        .with_detail("timed out waiting for a connection permit"));
                }
                Ok(())
            }
            None => {
                self.inner.freed.wait(state);
                Ok(())
            }
        }
    }

    /// Gives back permits after a failed acquire step: the global permit
    /// always, the per-origin one when `host` is set.
    fn forfeit(&self, origin: &Origin, host: bool) {
        let mut state = self.inner.state.lock();
        state.total_out -= 1;
        if host {
            if let Some(shelf) = state.shelves.get_mut(origin) {
                shelf.count -= 1;
            }
        }
        drop(state);
        self.inner.freed.notify_all();
    }

    /// Closes idle connections past their idle budget.
    pub(crate) fn prune(&self) {
        let max_idle = self.inner.limits.max_idle_time;
        let mut expired = Vec::new();

        {
            let mut state = self.inner.state.lock();
            for shelf in state.shelves.values_mut() {
                let mut kept = Vec::with_capacity(shelf.idle.len());
                for conn in shelf.idle.drain(..) {
                    if conn.idle_for() > max_idle {
                        shelf.count -= 1;
                        expired.push(conn);
                    } else {
                        kept.push(conn);
                    }
                }
                shelf.idle = kept;
            }
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "pruned expired idle connections");
            self.inner.freed.notify_all();
        }
        drop(expired);
    }

    /// Drains and closes every idle connection. Idempotent.
    pub(crate) fn close(&self) {
        let drained: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            let mut out = Vec::new();
            for shelf in state.shelves.values_mut() {
                shelf.count -= shelf.idle.len();
                out.append(&mut shelf.idle);
            }
            out
        };

        if !drained.is_empty() {
            debug!(count = drained.len(), "pool drained");
            self.inner.freed.notify_all();
        }
        drop(drained);
    }

    pub(crate) fn idle_count(&self, origin: &Origin) -> usize {
        let state = self.inner.state.lock();
        state.shelves.get(origin).map_or(0, |shelf| shelf.idle.len())
    }
}

/// A connection checked out of the blocking pool.
///
/// [`release`](Checkout::release) returns it per keep-alive semantics;
/// [`detach`](Checkout::detach) removes it from accounting (upgrade path);
/// dropping it closes the socket and frees both permits.
#[derive(Debug)]
pub(crate) struct Checkout {
    pool: Arc<PoolShared>,
    origin: Origin,
    conn: Option<Connection>,
}

impl Checkout {
    pub(crate) fn conn(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already released")
    }

    pub(crate) fn release(mut self, reusable: bool) {
        let conn = self.conn.take().expect("connection already released");
        let keep = reusable && conn.is_reusable();

        let discarded = {
            let mut state = self.pool.state.lock();
            state.total_out -= 1;
            let shelf = state.shelves.entry(self.origin.clone()).or_default();
            if keep {
                let mut conn = conn;
                conn.touch();
                shelf.idle.push(conn);
                trace!(origin = %self.origin, depth = shelf.idle.len(), "connection shelved");
                None
            } else {
                shelf.count -= 1;
                Some(conn)
            }
        };

        self.pool.freed.notify_all();
        if discarded.is_some() {
            debug!(origin = %self.origin, "connection discarded");
        }
        drop(discarded); // socket closes outside the lock
    }

    /// Removes the connection from pool accounting entirely.
    pub(crate) fn detach(mut self) -> Connection {
        let conn = self.conn.take().expect("connection already released");
        {
            let mut state = self.pool.state.lock();
            state.total_out -= 1;
            if let Some(shelf) = state.shelves.get_mut(&self.origin) {
                shelf.count -= 1;
            }
        }
        self.pool.freed.notify_all();
        conn
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            {
                let mut state = self.pool.state.lock();
                state.total_out -= 1;
                if let Some(shelf) = state.shelves.get_mut(&self.origin) {
                    shelf.count -= 1;
                }
            }
            self.pool.freed.notify_all();
            debug!(origin = %conn.origin(), "checked-out connection dropped");
        }
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;
    use crate::http::url::Url;
    use crate::timing::Timeout;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_server() -> (Origin, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let origin = Url::parse(&format!("http://127.0.0.1:{port}/"))
            .unwrap()
            .origin();

        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        std::thread::spawn(move || {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept() {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(sock);
            }
        });

        (origin, accepts)
    }

    #[test]
    fn lifo_reuse() {
        let (origin, accepts) = counting_server();
        let pool = Pool::new(PoolLimits::default());
        let deadline = Deadline::start(Timeout::default());

        let checkout = pool.acquire(&origin, &deadline).unwrap();
        checkout.release(true);
        assert_eq!(pool.idle_count(&origin), 1);

        let checkout = pool.acquire(&origin, &deadline).unwrap();
        assert_eq!(pool.idle_count(&origin), 0);
        checkout.release(true);

        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_host_permit_blocks_until_release() {
        let (origin, _) = counting_server();
        let pool = Pool::new(PoolLimits {
            max_connections_per_host: 1,
            ..PoolLimits::default()
        });

        let deadline = Deadline::start(Timeout::default());
        let first = pool.acquire(&origin, &deadline).unwrap();

        let bounded = Deadline::start(Timeout {
            connect: Some(Duration::from_secs(5)),
            read: None,
            total: Some(Duration::from_millis(100)),
        });
        let err = pool.acquire(&origin, &bounded).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        // A waiting thread gets the permit once the first is released.
        let waiter = {
            let pool = pool.clone();
            let origin = origin.clone();
            std::thread::spawn(move || {
                let deadline = Deadline::start(Timeout::default());
                let checkout = pool.acquire(&origin, &deadline).unwrap();
                checkout.release(true);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        first.release(true);
        waiter.join().unwrap();
    }

    #[test]
    fn drop_frees_permits() {
        let (origin, _) = counting_server();
        let pool = Pool::new(PoolLimits {
            max_connections_per_host: 1,
            ..PoolLimits::default()
        });

        let deadline = Deadline::start(Timeout::default());
        let checkout = pool.acquire(&origin, &deadline).unwrap();
        drop(checkout);

        let checkout = pool.acquire(&origin, &deadline).unwrap();
        checkout.release(false);
        assert_eq!(pool.idle_count(&origin), 0);
    }

    #[test]
    fn prune_and_close() {
        let (origin, _) = counting_server();
        let pool = Pool::new(PoolLimits {
            max_idle_time: Duration::from_millis(10),
            ..PoolLimits::default()
        });

        let deadline = Deadline::start(Timeout::default());
        let checkout = pool.acquire(&origin, &deadline).unwrap();
        checkout.release(true);

        std::thread::sleep(Duration::from_millis(30));
        pool.prune();
        assert_eq!(pool.idle_count(&origin), 0);

        let checkout = pool.acquire(&origin, &deadline).unwrap();
        checkout.release(true);
        pool.close();
        assert_eq!(pool.idle_count(&origin), 0);
        pool.close();
    }
}

//! Per-origin connection pool: LIFO reuse, permit-bounded concurrency.
//!
//! One shelf per origin holds idle connections as a stack - the most
//! recently returned socket is reused first, since it is the least likely
//! to have been closed by the peer. Two semaphores bound concurrency: a
//! global one sized `max_total_connections` and a per-origin one sized
//! `max_connections_per_host`.
//!
//! Permit accounting: an idle connection keeps its per-origin permit
//! (stored alongside it on the shelf) but releases the global one, so idle
//! sockets never starve other origins. The shelf mutex is only ever held
//! around stack and map mutation, never across I/O or an await.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::client::conn::Connection;
use crate::errors::{Error, ErrorKind, Result};
use crate::http::url::Origin;
use crate::limits::PoolLimits;
use crate::timing::Deadline;

#[derive(Debug)]
struct Idle {
    conn: Connection,
    permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
struct Shelf {
    permits: Arc<Semaphore>,
    idle: Vec<Idle>,
}

#[derive(Debug)]
struct PoolInner {
    limits: PoolLimits,
    global: Arc<Semaphore>,
    shelves: Mutex<HashMap<Origin, Shelf>>,
}

/// Shared handle to the pool; clones refer to the same shelves.
#[derive(Clone, Debug)]
pub(crate) struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub(crate) fn new(limits: PoolLimits) -> Self {
        Pool {
            inner: Arc::new(PoolInner {
                global: Arc::new(Semaphore::new(limits.max_total_connections)),
                shelves: Mutex::new(HashMap::new()),
                limits,
            }),
        }
    }

    /// Acquires a connection for `origin`: global permit, per-origin
    /// permit, then newest usable idle connection or a fresh one.
    pub(crate) async fn acquire(&self, origin: &Origin, deadline: &Deadline) -> Result<Checkout> {
        let cutoff = deadline.total_cutoff();
        let global = acquire_permit(self.inner.global.clone(), cutoff).await?;

        // Reuse path: pop one candidate at a time so the liveness probe
        // runs outside the lock.
        loop {
            let candidate = {
                let mut shelves = self.inner.shelves.lock();
                shelves.get_mut(origin).and_then(|shelf| shelf.idle.pop())
            };

            let Some(idle) = candidate else { break };

            if idle.conn.idle_for() > self.inner.limits.max_idle_time {
                trace!(%origin, "idle connection expired");
                continue; // dropping Idle closes the socket, frees the permit
            }
            if !idle.conn.is_usable() {
                trace!(%origin, "idle connection no longer usable");
                continue;
            }

            debug!(%origin, "reusing pooled connection");
            return Ok(Checkout {
                pool: self.inner.clone(),
                conn: Some(idle.conn),
                global: Some(global),
                host: Some(idle.permit),
            });
        }

        // Fresh path: per-origin permit, then connect outside all locks.
        let host_permits = {
            let mut shelves = self.inner.shelves.lock();
            self.shelf_entry(&mut shelves, origin).permits.clone()
        };
        let host = acquire_permit(host_permits, cutoff).await?;
        let conn = Connection::open(origin, deadline).await?;

        Ok(Checkout {
            pool: self.inner.clone(),
            conn: Some(conn),
            global: Some(global),
            host: Some(host),
        })
    }

    fn shelf_entry<'a>(
        &self,
        shelves: &'a mut HashMap<Origin, Shelf>,
        origin: &Origin,
    ) -> &'a mut Shelf {
        shelves.entry(origin.clone()).or_insert_with(|| Shelf {
            permits: Arc::new(Semaphore::new(self.limits().max_connections_per_host)),
            idle: Vec::new(),
        })
    }

    /// Closes every idle connection whose idle time exceeds the limit.
    pub(crate) fn prune(&self) {
        let mut expired = Vec::new();

        {
            let mut shelves = self.inner.shelves.lock();
            for shelf in shelves.values_mut() {
                let max_idle = self.inner.limits.max_idle_time;
                let mut kept = Vec::with_capacity(shelf.idle.len());
                for idle in shelf.idle.drain(..) {
                    if idle.conn.idle_for() > max_idle {
                        expired.push(idle);
                    } else {
                        kept.push(idle);
                    }
                }
                shelf.idle = kept;
            }
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "pruned expired idle connections");
        }
        drop(expired); // sockets close outside the lock
    }

    /// Drains and closes every idle connection. Idempotent; the pool stays
    /// usable afterwards.
    pub(crate) fn close(&self) {
        let drained: Vec<Idle> = {
            let mut shelves = self.inner.shelves.lock();
            shelves
                .values_mut()
                .flat_map(|shelf| shelf.idle.drain(..))
                .collect()
        };

        if !drained.is_empty() {
            debug!(count = drained.len(), "pool drained");
        }
        drop(drained);
    }

    /// Idle-stack depth for one origin. Test and introspection hook.
    pub(crate) fn idle_count(&self, origin: &Origin) -> usize {
        let shelves = self.inner.shelves.lock();
        shelves.get(origin).map_or(0, |shelf| shelf.idle.len())
    }

    #[inline]
    pub(crate) fn limits(&self) -> &PoolLimits {
        &self.inner.limits
    }
}

async fn acquire_permit(
    semaphore: Arc<Semaphore>,
    cutoff: Option<Instant>,
) -> Result<OwnedSemaphorePermit> {
    let closed = |_| Error::new(ErrorKind::Network).with_detail("connection pool shut down");

    match cutoff {
        Some(cutoff) => {
            let at = tokio::time::Instant::from_std(cutoff);
            match tokio::time::timeout_at(at, semaphore.acquire_owned()).await {
                Ok(permit) => permit.map_err(closed),
                Err(_) => Err(Error::new(ErrorKind::Timeout)
                    .with_detail("timed out waiting for a connection permit")),
            }
        }
        None => semaphore.acquire_owned().await.map_err(closed),
    }
}

/// A connection checked out of the pool, together with the two permits
/// that back it.
///
/// Exactly one of three things happens to a checkout: [`release`]
/// (success path, shelves or closes per keep-alive semantics),
/// [`detach`] (WebSocket upgrade takes the socket out of pool accounting)
/// or drop (failure path - socket closed, permits freed). The type makes a
/// double return unrepresentable.
///
/// [`release`]: Checkout::release
/// [`detach`]: Checkout::detach
#[derive(Debug)]
pub(crate) struct Checkout {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    global: Option<OwnedSemaphorePermit>,
    host: Option<OwnedSemaphorePermit>,
}

impl Checkout {
    /// The connection itself. Panics only if called after release, which
    /// the borrow checker already prevents.
    pub(crate) fn conn(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already released")
    }

    /// Returns the connection to the pool (or closes it when `reusable` is
    /// false or the connection poisoned itself).
    pub(crate) fn release(mut self, reusable: bool) {
        let conn = self.conn.take().expect("connection already released");
        let host = self.host.take();
        self.global.take(); // global permit frees immediately

        if !reusable || !conn.is_reusable() {
            debug!(origin = %conn.origin(), "connection discarded");
            return; // conn and host permit drop here
        }

        let Some(permit) = host else { return };
        let mut conn = conn;
        conn.touch();

        let origin = conn.origin().clone();
        let mut shelves = self.pool.shelves.lock();
        let shelf = shelves.entry(origin.clone()).or_insert_with(|| Shelf {
            permits: Arc::new(Semaphore::new(self.pool.limits.max_connections_per_host)),
            idle: Vec::new(),
        });
        shelf.idle.push(Idle { conn, permit });
        trace!(%origin, depth = shelf.idle.len(), "connection shelved");
    }

    /// Removes the connection from pool accounting entirely (WebSocket
    /// upgrade). Both permits free immediately.
    pub(crate) fn detach(mut self) -> Connection {
        self.global.take();
        self.host.take();
        self.conn.take().expect("connection already released")
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(origin = %conn.origin(), "checked-out connection dropped");
        }
        // Permits drop with the struct.
    }
}

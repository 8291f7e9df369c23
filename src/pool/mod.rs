//! Bounded connection pooling and circuit breaking
//!
//! This module provides:
//! - A bounded store of ready backend connections with cooperative checkout
//! - Heartbeat-based staleness verification on acquire
//! - Circuit breaker gating of new connection attempts
//! - An RAII guard that returns a connection to its pool exactly once

pub mod circuit;
pub mod connection;

pub use circuit::{CircuitBreaker, CircuitState, CircuitStats};
pub use connection::{Connection, ConnectionFactory, KvFactory, RelationalFactory};

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{BreakerSettings, PoolSettings};

/// Error types for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool name was never initialized (configuration error)
    #[error("pool `{0}` is not initialized")]
    NotInitialized(String),

    /// The pool was closed and not re-initialized (configuration error)
    #[error("pool `{0}` is closed")]
    Closed(String),

    /// The circuit breaker is open for the backing service; recoverable,
    /// the caller owns backoff
    #[error("service `{0}` is unavailable: circuit breaker is open")]
    ServiceUnavailable(String),

    /// The pool stayed exhausted for the whole wait window; recoverable and
    /// distinct from ServiceUnavailable so callers can tell "backend down"
    /// from "momentarily busy"
    #[error("timed out after {waited:?} waiting for a `{name}` connection")]
    AcquireTimeout { name: String, waited: Duration },
}

/// Statistics for a connection pool
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Configured capacity
    pub pool_size: usize,

    /// Connections sitting idle in the store right now
    pub connections_in_pool: usize,

    /// Connections checked out by tasks right now
    pub connections_in_use: usize,

    /// Connections created and not yet destroyed; below `pool_size` means
    /// the pool has shrunk (creation failures or invalid returns)
    pub live_connections: usize,

    /// Total connections created over the pool's lifetime
    pub total_created: u64,

    /// Total checkouts served from the store
    pub total_reused: u64,

    /// Total connections discarded (failed ping, invalid on return, close)
    pub total_discarded: u64,

    /// Total factory failures (init and stale replacement)
    pub create_failures: u64,

    pub breaker_enabled: bool,
    pub breaker_state: CircuitState,
}

/// One pooled connection plus its bookkeeping
struct Entry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

impl Entry {
    fn new(conn: Box<dyn Connection>) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
        }
    }
}

struct Shared {
    name: String,
    settings: PoolSettings,
    factory: Arc<dyn ConnectionFactory>,
    breaker: CircuitBreaker,

    /// One permit per connection currently available for checkout. Waiting
    /// on a permit is the acquire suspension point; only the calling task
    /// blocks, never the worker thread.
    semaphore: Arc<Semaphore>,

    /// Idle store, LIFO so recently-used connections stay warm
    idle: Mutex<Vec<Entry>>,

    closed: AtomicBool,

    live: AtomicUsize,
    in_use: AtomicUsize,
    total_created: AtomicU64,
    total_reused: AtomicU64,
    total_discarded: AtomicU64,
    create_failures: AtomicU64,
}

impl Shared {
    fn idle_lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A named, bounded pool of backend connections.
///
/// At most `settings.size` connections exist for the pool at any instant;
/// `connections_in_pool + connections_in_use` never exceeds it. Checkout
/// ownership moves exclusively through [`ConnectionPool::acquire`] and the
/// guard's drop. No other path hands out a pooled connection.
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    /// Create a pool and pre-populate its store.
    ///
    /// The factory is invoked `settings.size` times; each failure is logged
    /// and skipped, so the realized capacity may be below the configured
    /// size (degraded, not fatal).
    pub async fn new(
        name: impl Into<String>,
        settings: PoolSettings,
        breaker: BreakerSettings,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let name = name.into();
        let shared = Arc::new(Shared {
            breaker: CircuitBreaker::new(name.clone(), breaker),
            name,
            settings,
            factory,
            semaphore: Arc::new(Semaphore::new(0)),
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            live: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            total_created: AtomicU64::new(0),
            total_reused: AtomicU64::new(0),
            total_discarded: AtomicU64::new(0),
            create_failures: AtomicU64::new(0),
        });

        for _ in 0..shared.settings.size {
            match shared.factory.create().await {
                Ok(conn) => {
                    shared.total_created.fetch_add(1, Ordering::Relaxed);
                    shared.live.fetch_add(1, Ordering::Relaxed);
                    shared.idle_lock().push(Entry::new(conn));
                    shared.semaphore.add_permits(1);
                }
                Err(e) => {
                    shared.create_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        pool = %shared.name,
                        backend = %shared.factory.backend(),
                        error = %e,
                        "failed to open connection during init"
                    );
                }
            }
        }

        let realized = shared.idle_lock().len();
        info!(
            pool = %shared.name,
            size = realized,
            want = shared.settings.size,
            "pool initialized"
        );

        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Configured default wait for checkouts
    pub fn acquire_timeout(&self) -> Duration {
        self.shared.settings.acquire_timeout()
    }

    /// The breaker guarding this pool's backend. Exposed so the query layer
    /// can report request outcomes and operators can reset the circuit.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    /// Check out a connection, waiting cooperatively up to `wait`.
    ///
    /// Fails fast with [`PoolError::ServiceUnavailable`] when the breaker
    /// denies the service, and with [`PoolError::AcquireTimeout`] when the
    /// store stays empty for the whole window. A connection idle for at
    /// least the heartbeat interval is pinged first; on a failed ping it is
    /// discarded and a replacement is created synchronously, reporting the
    /// outcome to the breaker.
    pub async fn acquire(&self, wait: Duration) -> Result<PooledConn, PoolError> {
        let shared = &self.shared;
        let started = Instant::now();

        loop {
            if shared.closed.load(Ordering::Acquire) {
                return Err(PoolError::Closed(shared.name.clone()));
            }
            if !shared.breaker.is_available() {
                return Err(PoolError::ServiceUnavailable(shared.name.clone()));
            }

            let remaining = wait.saturating_sub(started.elapsed());
            let permit = match tokio::time::timeout(
                remaining,
                shared.semaphore.clone().acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                // The semaphore only closes when the pool does
                Ok(Err(_)) => return Err(PoolError::Closed(shared.name.clone())),
                Err(_) => {
                    debug!(pool = %shared.name, waited = ?wait, "acquire timed out");
                    return Err(PoolError::AcquireTimeout {
                        name: shared.name.clone(),
                        waited: wait,
                    });
                }
            };

            // Every permit pairs with one stored entry, except when close()
            // drained the store under us.
            let Some(mut entry) = shared.idle_lock().pop() else {
                permit.forget();
                return Err(PoolError::Closed(shared.name.clone()));
            };

            let mut reused = true;

            // Recently-used connections skip the liveness probe entirely
            if entry.last_used.elapsed() >= shared.settings.heartbeat() {
                if !entry.conn.ping().await {
                    debug!(
                        pool = %shared.name,
                        conn = entry.conn.id(),
                        idle = ?entry.last_used.elapsed(),
                        "stale connection failed ping, replacing"
                    );
                    shared.live.fetch_sub(1, Ordering::Relaxed);
                    shared.total_discarded.fetch_add(1, Ordering::Relaxed);
                    drop(entry);

                    match shared.factory.create().await {
                        Ok(conn) => {
                            shared.total_created.fetch_add(1, Ordering::Relaxed);
                            shared.live.fetch_add(1, Ordering::Relaxed);
                            entry = Entry::new(conn);
                            reused = false;
                        }
                        Err(e) => {
                            shared.create_failures.fetch_add(1, Ordering::Relaxed);
                            shared.breaker.record_failure();
                            warn!(
                                pool = %shared.name,
                                backend = %shared.factory.backend(),
                                error = %e,
                                "replacement connection failed, slot forfeited"
                            );
                            // The slot is gone; keep trying for another
                            // pooled connection within the deadline.
                            permit.forget();
                            continue;
                        }
                    }
                }
            }

            entry.last_used = Instant::now();
            shared.in_use.fetch_add(1, Ordering::Relaxed);
            if reused {
                shared.total_reused.fetch_add(1, Ordering::Relaxed);
            }
            shared.breaker.record_success();

            debug!(pool = %shared.name, conn = entry.conn.id(), "connection acquired");

            return Ok(PooledConn {
                entry: Some(entry),
                permit: Some(permit),
                shared: shared.clone(),
            });
        }
    }

    /// Acquire, run the callback, release. The connection goes back to the
    /// pool exactly once whether the callback returns normally or not, and
    /// when the task is cancelled mid-flight: release rides on the guard's drop.
    pub async fn with_conn<T, Fut, F>(&self, wait: Duration, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(PooledConn) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let conn = self.acquire(wait).await?;
        Ok(f(conn).await)
    }

    /// Drain and discard every idle connection and mark the pool closed.
    ///
    /// Connections still checked out are discarded when their guards drop.
    /// Subsequent operations fail with [`PoolError::Closed`] until the pool
    /// is re-initialized through the registry.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Wake waiters; their acquires fail with Closed
        shared.semaphore.close();

        let drained: Vec<Entry> = shared.idle_lock().drain(..).collect();
        shared.live.fetch_sub(drained.len(), Ordering::Relaxed);
        shared
            .total_discarded
            .fetch_add(drained.len() as u64, Ordering::Relaxed);

        info!(
            pool = %shared.name,
            drained = drained.len(),
            still_out = shared.in_use.load(Ordering::Relaxed),
            "pool closed"
        );
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        PoolStats {
            pool_size: shared.settings.size,
            connections_in_pool: shared.idle_lock().len(),
            connections_in_use: shared.in_use.load(Ordering::Relaxed),
            live_connections: shared.live.load(Ordering::Relaxed),
            total_created: shared.total_created.load(Ordering::Relaxed),
            total_reused: shared.total_reused.load(Ordering::Relaxed),
            total_discarded: shared.total_discarded.load(Ordering::Relaxed),
            create_failures: shared.create_failures.load(Ordering::Relaxed),
            breaker_enabled: shared.breaker.is_enabled(),
            breaker_state: shared.breaker.state(),
        }
    }
}

/// A connection checked out from a pool.
///
/// Dereferences to [`Connection`]. Dropping the guard returns the
/// connection to the pool exactly once; a connection that is dirty (or
/// whose pool has closed) is discarded instead, shrinking the pool until
/// re-initialization.
pub struct PooledConn {
    entry: Option<Entry>,
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("pool", &self.shared.name)
            .field("released", &self.entry.is_none())
            .finish()
    }
}

impl PooledConn {
    /// Id of the underlying connection
    pub fn id(&self) -> u64 {
        self.entry
            .as_ref()
            .expect("BUG: PooledConn used after release")
            .conn
            .id()
    }

    /// Name of the owning pool
    pub fn pool_name(&self) -> &str {
        &self.shared.name
    }

    /// Age of the underlying connection
    pub fn age(&self) -> Duration {
        self.entry
            .as_ref()
            .expect("BUG: PooledConn used after release")
            .created_at
            .elapsed()
    }

    /// Give the connection back before the end of scope. Equivalent to
    /// dropping the guard; provided so call sites can make the hand-back
    /// explicit.
    pub fn release(self) {}
}

impl Deref for PooledConn {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.entry
            .as_ref()
            .expect("BUG: PooledConn used after release")
            .conn
            .as_ref()
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.entry
            .as_mut()
            .expect("BUG: PooledConn used after release")
            .conn
            .as_mut()
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            release_entry(&self.shared, entry, self.permit.take());
        }
    }
}

/// Return a checked-out connection to the store, or discard it.
///
/// The permit is released only after the entry is pushed, so a waiter that
/// wins the permit always finds a stored connection. Discards forget the
/// permit instead: the capacity slot is gone until re-initialization.
fn release_entry(shared: &Arc<Shared>, mut entry: Entry, permit: Option<OwnedSemaphorePermit>) {
    let conn_id = entry.conn.id();
    shared.in_use.fetch_sub(1, Ordering::Relaxed);

    if shared.closed.load(Ordering::Acquire) {
        shared.live.fetch_sub(1, Ordering::Relaxed);
        shared.total_discarded.fetch_add(1, Ordering::Relaxed);
        if let Some(permit) = permit {
            permit.forget();
        }
        debug!(pool = %shared.name, conn = conn_id, "pool closed, discarding connection");
        return;
    }

    if entry.conn.is_returnable() {
        let mut idle = shared.idle_lock();
        if idle.len() < shared.settings.size {
            entry.last_used = Instant::now();
            idle.push(entry);
            drop(idle);
            drop(permit);
            debug!(pool = %shared.name, conn = conn_id, "connection released");
            return;
        }
    }

    // Invalid on return (or store unexpectedly full): discard without a
    // replacement. Effective capacity shrinks until re-initialization.
    shared.live.fetch_sub(1, Ordering::Relaxed);
    shared.total_discarded.fetch_add(1, Ordering::Relaxed);
    if let Some(permit) = permit {
        permit.forget();
    }
    warn!(
        pool = %shared.name,
        conn = conn_id,
        live = shared.live.load(Ordering::Relaxed),
        "connection not returnable, discarding"
    );
}

//! Per-task connection cache
//!
//! One `TaskConnections` value lives for the duration of one lightweight
//! task (one inbound request). Nested calls that ask for the same pool get
//! the connection the task already holds instead of acquiring a second one,
//! and everything held goes back to its pool exactly once when the value is
//! dropped, however the task ended.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::pool::{PoolError, PooledConn};
use crate::registry::PoolRegistry;

/// Caches at most one checked-out connection per pool for one task.
pub struct TaskConnections {
    registry: Arc<PoolRegistry>,
    held: HashMap<String, PooledConn>,
}

impl TaskConnections {
    /// Create the cache for a task. Construct one per request and let it
    /// drop when the request handler finishes.
    pub fn new(registry: Arc<PoolRegistry>) -> Self {
        Self {
            registry,
            held: HashMap::new(),
        }
    }

    /// Borrow the task's connection for `name`, acquiring on first use.
    ///
    /// Aliases resolve to their target pool first, so a task asking for
    /// "cache" and "default" backed by the same pool shares one connection.
    /// The wait on a first-use acquire is the pool's configured timeout.
    pub async fn get(&mut self, name: &str) -> Result<&mut PooledConn, PoolError> {
        let resolved = self.registry.resolve(name).await;
        let pool_name = resolved.clone();

        match self.held.entry(resolved) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(slot) => {
                let pool = self.registry.pool(&pool_name).await?;
                let conn = pool.acquire(pool.acquire_timeout()).await?;
                debug!(
                    pool = %pool_name,
                    conn = conn.id(),
                    "task checked out connection"
                );
                Ok(slot.insert(conn))
            }
        }
    }

    /// Give a connection back before the task ends. Returns whether the
    /// task actually held one for `name`.
    pub async fn release(&mut self, name: &str) -> bool {
        let resolved = self.registry.resolve(name).await;
        match self.held.remove(&resolved) {
            Some(conn) => {
                debug!(pool = %resolved, conn = conn.id(), "task released connection early");
                conn.release();
                true
            }
            None => false,
        }
    }

    /// Number of connections the task currently holds
    pub fn held(&self) -> usize {
        self.held.len()
    }
}

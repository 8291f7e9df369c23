//! Registry of named pools and their aliases
//!
//! The registry is the subsystem's only process-wide mutable state. It is an
//! explicitly constructed object with an `init`/`close` lifecycle, built once
//! per worker process and handed to consumers rather than kept as a global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{BreakerSettings, Config, PoolDef, PoolSettings};
use crate::pool::connection::{factory_for, ConnectionFactory};
use crate::pool::{ConnectionPool, PoolError, PoolStats, PooledConn};

/// Owns every named pool in one worker process.
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    aliases: RwLock<HashMap<String, String>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
        }
    }

    /// Build a registry from a validated config: initialize every pool, then
    /// register every alias.
    pub async fn from_config(config: &Config) -> Self {
        let registry = Self::new();
        for (name, def) in &config.pools {
            registry.init(name, def.clone()).await;
        }
        for (alias, target) in &config.aliases {
            registry.register_alias(alias, target).await;
        }
        registry
    }

    /// Initialize a named pool with the factory chosen by its backend kind.
    pub async fn init(&self, name: &str, def: PoolDef) {
        self.init_with_factory(name, def.pool, def.breaker, factory_for(&def.backend))
            .await;
    }

    /// Initialize a named pool with a caller-supplied factory.
    ///
    /// Idempotent: a second call for an open pool is a no-op. A pool that
    /// was closed is replaced with a freshly initialized one. Connection
    /// creation failures are logged by the pool and degrade capacity; this
    /// never fails.
    pub async fn init_with_factory(
        &self,
        name: &str,
        settings: PoolSettings,
        breaker: BreakerSettings,
        factory: Arc<dyn ConnectionFactory>,
    ) {
        let mut pools = self.pools.write().await;

        if let Some(existing) = pools.get(name) {
            if !existing.is_closed() {
                debug!(pool = name, "pool already initialized");
                return;
            }
            info!(pool = name, "re-initializing closed pool");
        }

        let pool = ConnectionPool::new(name, settings, breaker, factory).await;
        pools.insert(name.to_string(), Arc::new(pool));
    }

    /// Point `alias` at `target` so multiple logical consumers share one
    /// physical pool. The target must already be initialized; a missing
    /// target logs a warning and leaves the alias unregistered.
    pub async fn register_alias(&self, alias: &str, target: &str) {
        if !self.pools.read().await.contains_key(target) {
            warn!(
                alias,
                target, "alias target is not an initialized pool, alias not registered"
            );
            return;
        }

        self.aliases
            .write()
            .await
            .insert(alias.to_string(), target.to_string());
        info!(alias, target, "alias registered");
    }

    /// Resolve an alias to its target pool name; unknown names pass through.
    pub(crate) async fn resolve(&self, name: &str) -> String {
        self.aliases
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Whether `name` (alias or pool) refers to an open pool.
    pub async fn is_initialized(&self, name: &str) -> bool {
        let resolved = self.resolve(name).await;
        match self.pools.read().await.get(&resolved) {
            Some(pool) => !pool.is_closed(),
            None => false,
        }
    }

    /// Look up a pool by name or alias.
    pub async fn pool(&self, name: &str) -> Result<Arc<ConnectionPool>, PoolError> {
        let resolved = self.resolve(name).await;
        self.pools
            .read()
            .await
            .get(&resolved)
            .cloned()
            .ok_or_else(|| PoolError::NotInitialized(name.to_string()))
    }

    /// Check out a connection from a named pool.
    pub async fn acquire(&self, name: &str, wait: Duration) -> Result<PooledConn, PoolError> {
        self.pool(name).await?.acquire(wait).await
    }

    /// Acquire from a named pool, run the callback, release on drop.
    pub async fn with_conn<T, Fut, F>(
        &self,
        name: &str,
        wait: Duration,
        f: F,
    ) -> Result<T, PoolError>
    where
        F: FnOnce(PooledConn) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        self.pool(name).await?.with_conn(wait, f).await
    }

    /// Close every pool. Part of worker shutdown; pools stay registered so
    /// later operations report `Closed` rather than `NotInitialized`.
    pub async fn close(&self) {
        let pools = self.pools.read().await;
        for pool in pools.values() {
            pool.close();
        }
        info!(pools = pools.len(), "registry closed");
    }

    /// Per-pool statistics for the observability endpoint.
    pub async fn stats(&self) -> HashMap<String, PoolStats> {
        let pools = self.pools.read().await;
        pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

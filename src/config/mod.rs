use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Kind of backend a pool manages; selects the connection factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// SQL database session (transport-level; the query layer owns the dialect)
    Relational,

    /// Key-value store session (RESP-style inline commands)
    KeyValue,
}

/// Backend address and credentials for one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Which connection factory to use
    pub kind: BackendKind,

    /// Backend address as `host:port`
    pub address: String,

    /// Optional username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Optional password (sent as AUTH for key-value backends)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Optional database/schema name, carried for the query layer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Connect and liveness-probe timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    5
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Check the address parses as `host:port`. Runs at load time so a typo
    /// fails the worker at startup instead of at first acquire.
    pub fn validate(&self) -> Result<()> {
        let parsed = url::Url::parse(&format!("tcp://{}", self.address))
            .with_context(|| format!("invalid backend address: {}", self.address))?;

        if parsed.host_str().is_none() {
            anyhow::bail!("backend address {} has no host", self.address);
        }
        if parsed.port().is_none() {
            anyhow::bail!("backend address {} has no port", self.address);
        }

        Ok(())
    }
}

/// Sizing and checkout behavior for one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Bounded capacity: at most this many connections exist for the pool
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// Idle seconds after which a connection is re-verified on checkout;
    /// connections used more recently skip the probe entirely
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    /// Default seconds an acquire waits on an exhausted pool
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_pool_size() -> usize {
    8
}

fn default_heartbeat() -> u64 {
    30
}

fn default_acquire_timeout() -> u64 {
    5
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            heartbeat_secs: default_heartbeat(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

impl PoolSettings {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            anyhow::bail!("pool size must be at least 1");
        }
        Ok(())
    }
}

/// Circuit breaker thresholds for one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// When false, the breaker never blocks acquires
    #[serde(default = "default_breaker_enabled")]
    pub enabled: bool,

    /// Failures within the window that trip the circuit open
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Sliding window in seconds for counting failures
    #[serde(default = "default_failure_window")]
    pub failure_window_secs: u64,

    /// Seconds the circuit stays open before trial calls are admitted
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Trial calls admitted while half-open
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

fn default_breaker_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window() -> u64 {
    60
}

fn default_cooldown() -> u64 {
    30
}

fn default_half_open_max_probes() -> u32 {
    3
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: default_breaker_enabled(),
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window(),
            cooldown_secs: default_cooldown(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

impl BreakerSettings {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled {
            if self.failure_threshold == 0 {
                anyhow::bail!("breaker failure_threshold must be at least 1");
            }
            if self.failure_window_secs == 0 {
                anyhow::bail!("breaker failure_window_secs must be at least 1");
            }
            if self.half_open_max_probes == 0 {
                anyhow::bail!("breaker half_open_max_probes must be at least 1");
            }
        }
        Ok(())
    }
}

/// Everything needed to initialize one named pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDef {
    pub backend: BackendConfig,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub breaker: BreakerSettings,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Named pool definitions
    #[serde(default)]
    pub pools: HashMap<String, PoolDef>,

    /// Alias name -> target pool name
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self {
            pools: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Validate every pool definition and alias target
    pub fn validate(&self) -> Result<()> {
        for (name, def) in &self.pools {
            def.backend
                .validate()
                .with_context(|| format!("pool `{}`", name))?;
            def.pool
                .validate()
                .with_context(|| format!("pool `{}`", name))?;
            def.breaker
                .validate()
                .with_context(|| format!("pool `{}`", name))?;
        }

        for (alias, target) in &self.aliases {
            if !self.pools.contains_key(target) {
                anyhow::bail!("alias `{}` points at undefined pool `{}`", alias, target);
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Builds a single pool named "default". Supported variables:
/// - CONNPOOL_ADDR (required, `host:port`)
/// - CONNPOOL_KIND (relational | key_value, default relational)
/// - CONNPOOL_USER / DB_USER
/// - CONNPOOL_PASSWORD / DB_PASSWORD
/// - CONNPOOL_DATABASE / DB_NAME
/// - CONNPOOL_SIZE, CONNPOOL_HEARTBEAT, CONNPOOL_ACQUIRE_TIMEOUT
/// - CONNPOOL_BREAKER (set to "false" to disable)
/// - CONNPOOL_FAILURE_THRESHOLD, CONNPOOL_COOLDOWN
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    let address =
        std::env::var("CONNPOOL_ADDR").context("CONNPOOL_ADDR environment variable not set")?;

    let kind = match std::env::var("CONNPOOL_KIND").as_deref() {
        Ok("key_value") | Ok("kv") => BackendKind::KeyValue,
        Ok("relational") | Ok("sql") | Err(_) => BackendKind::Relational,
        Ok(other) => anyhow::bail!("unknown CONNPOOL_KIND: {}", other),
    };

    // Support both CONNPOOL_* and the legacy DB_* names
    let username = std::env::var("CONNPOOL_USER")
        .or_else(|_| std::env::var("DB_USER"))
        .ok();

    let password = std::env::var("CONNPOOL_PASSWORD")
        .or_else(|_| std::env::var("DB_PASSWORD"))
        .ok();

    let database = std::env::var("CONNPOOL_DATABASE")
        .or_else(|_| std::env::var("DB_NAME"))
        .ok();

    let backend = BackendConfig {
        kind,
        address,
        username,
        password,
        database,
        connect_timeout_secs: default_connect_timeout(),
    };

    let mut pool = PoolSettings::default();
    if let Ok(size) = std::env::var("CONNPOOL_SIZE") {
        if let Ok(val) = size.parse() {
            pool.size = val;
        }
    }
    if let Ok(heartbeat) = std::env::var("CONNPOOL_HEARTBEAT") {
        if let Ok(val) = heartbeat.parse() {
            pool.heartbeat_secs = val;
        }
    }
    if let Ok(timeout) = std::env::var("CONNPOOL_ACQUIRE_TIMEOUT") {
        if let Ok(val) = timeout.parse() {
            pool.acquire_timeout_secs = val;
        }
    }

    let mut breaker = BreakerSettings::default();
    if let Ok(enabled) = std::env::var("CONNPOOL_BREAKER") {
        breaker.enabled = enabled != "false" && enabled != "0";
    }
    if let Ok(threshold) = std::env::var("CONNPOOL_FAILURE_THRESHOLD") {
        if let Ok(val) = threshold.parse() {
            breaker.failure_threshold = val;
        }
    }
    if let Ok(cooldown) = std::env::var("CONNPOOL_COOLDOWN") {
        if let Ok(val) = cooldown.parse() {
            breaker.cooldown_secs = val;
        }
    }

    config.pools.insert(
        "default".to_string(),
        PoolDef {
            backend,
            pool,
            breaker,
        },
    );

    Ok(config)
}

/// Load configuration from file or environment
///
/// Tries the YAML file when a path is given, otherwise falls back to
/// environment variables. The result is validated either way.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = if let Some(path) = config_path {
        load_from_yaml(path)?
    } else {
        load_from_env()?
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_settings_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(settings.size, 8);
        assert_eq!(settings.heartbeat(), Duration::from_secs(30));
        assert_eq!(settings.acquire_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_breaker_settings_defaults() {
        let settings = BreakerSettings::default();
        assert!(settings.enabled);
        assert_eq!(settings.failure_threshold, 5);
        assert_eq!(settings.cooldown(), Duration::from_secs(30));
        assert_eq!(settings.half_open_max_probes, 3);
    }

    #[test]
    fn test_backend_address_validation() {
        let mut backend = BackendConfig {
            kind: BackendKind::Relational,
            address: "db.internal:5432".to_string(),
            username: None,
            password: None,
            database: None,
            connect_timeout_secs: 5,
        };
        assert!(backend.validate().is_ok());

        backend.address = "db.internal".to_string();
        assert!(backend.validate().is_err());
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let settings = PoolSettings {
            size: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_alias_target_must_exist() {
        let yaml = r#"
pools:
  default:
    backend:
      kind: relational
      address: db.internal:5432
aliases:
  cache: missing
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}

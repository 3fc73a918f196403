//! Server configuration with environment-variable overrides.

use std::time::Duration;

/// Configuration error raised for unparseable environment overrides.
#[derive(Debug, Clone)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Service configuration.
///
/// Defaults match a small production deployment; every knob can be overridden
/// through the environment via [`ServerConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener to
    pub bind_addr: String,
    /// Deadline for a new socket to complete authentication
    pub auth_timeout: Duration,
    /// Interval between server-initiated liveness probes
    pub heartbeat_interval: Duration,
    /// Grace window for the liveness response before forced termination
    pub heartbeat_grace: Duration,
    /// Concurrent connection cap per user across all documents
    pub max_connections_per_user: usize,
    /// Quiet period after the last merge before a durable save
    pub persist_debounce: Duration,
    /// Ceiling on the encoded document size the store will be handed
    pub max_document_size: usize,
    /// How long a document with zero connections stays loaded
    pub idle_unload: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_grace: Duration::from_secs(10),
            max_connections_per_user: 10,
            persist_debounce: Duration::from_millis(5000),
            max_document_size: 10 * 1024 * 1024,
            idle_unload: Duration::from_secs(5 * 60),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from the environment, falling back to defaults
    /// for unset variables. An unparseable integer is a startup error rather
    /// than a silent fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("COLLAB_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(secs) = env_u64("AUTH_TIMEOUT_SECS")? {
            config.auth_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("HEARTBEAT_GRACE_SECS")? {
            config.heartbeat_grace = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("MAX_CONNECTIONS_PER_USER")? {
            config.max_connections_per_user = n as usize;
        }
        if let Some(ms) = env_u64("PERSIST_INTERVAL_MS")? {
            config.persist_debounce = Duration::from_millis(ms);
        }
        if let Some(bytes) = env_u64("MAX_DOCUMENT_SIZE")? {
            config.max_document_size = bytes as usize;
        }
        if let Some(secs) = env_u64("IDLE_UNLOAD_SECS")? {
            config.idle_unload = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError(format!("environment variable {key} must be a valid integer"))),
        Err(_) => Ok(None),
    }
}

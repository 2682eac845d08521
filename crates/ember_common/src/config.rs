use serde::{Deserialize, Serialize};

/// Top-level server configuration, loaded from `ember.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmberConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

impl EmberConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// PG wire protocol listen address.
    pub pg_listen_addr: String,
    /// Max concurrent connections (0 = unlimited).
    pub max_connections: usize,
    /// Prometheus exporter listen address. Empty disables the exporter.
    pub metrics_addr: String,
    /// Statements admitted to run at the same time (0 = unlimited).
    pub max_active_statements: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pg_listen_addr: "127.0.0.1:5443".into(),
            max_connections: 256,
            metrics_addr: String::new(),
            max_active_statements: 0,
        }
    }
}

/// Per-session protocol behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Statement timeout in milliseconds (0 = no timeout).
    pub statement_timeout_ms: u64,
    /// Largest frontend message accepted, in bytes.
    pub max_message_len: usize,
    /// Route single-shard statements straight to their shard.
    pub enable_light_proxy: bool,
    /// Group batch bind-execute parameter sets by shard.
    pub enable_batch_fast_path: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            statement_timeout_ms: 0,
            max_message_len: 64 * 1024 * 1024,
            enable_light_proxy: true,
            enable_batch_fast_path: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Number of hash shards in the local cluster.
    pub shard_count: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { shard_count: 4 }
    }
}

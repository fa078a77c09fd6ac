//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - The first TOML file found among `roster.toml`,
//!   `/etc/roster/roster.toml` and `~/.config/roster/roster.toml`
//! - Environment variables (`ROSTER_PORT`, `ROSTER_STORE__URL`, ...)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const CONFIG_PATHS: [&str; 3] = [
    "roster.toml",
    "/etc/roster/roster.toml",
    "~/.config/roster/roster.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identifies this process in connection ids. Must be unique among
    /// processes sharing a store and stable across restarts for stale
    /// presence to be reclaimed. Required with the redis backend; when unset
    /// a per-process id is generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub channels: ChannelsConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Where presence lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process only. Presence is not shared with other processes.
    Memory,
    Redis,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis URL, used by the `redis` backend.
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix for every key and pub/sub channel.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on each store and broker call in milliseconds.
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

/// Lifecycle channel names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "default_user_channel")]
    pub user: String,

    #[serde(default = "default_performer_channel")]
    pub performer: String,
}

/// Credential verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for HS256 tokens.
    #[serde(default)]
    pub secret: String,

    /// Bound on credential verification in milliseconds.
    #[serde(default = "default_auth_timeout")]
    pub timeout_ms: u64,

    /// Allowed clock skew in seconds.
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound envelopes buffered per connection.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle time after which a connection is closed, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Node id of this process when none is configured: `{host}-{pid}-{suffix}`.
fn generated_node_id() -> &'static str {
    static NODE_ID: OnceLock<String> = OnceLock::new();
    NODE_ID.get_or_init(|| {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|host| !host.is_empty() && !host.contains('/'))
            .unwrap_or_else(|| "roster".to_string());
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        format!("{host}-{}-{suffix:08x}", std::process::id())
    })
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "roster:".to_string()
}

fn default_store_timeout() -> u64 {
    2_000
}

fn default_user_channel() -> String {
    "presence:user".to_string()
}

fn default_performer_channel() -> String {
    "presence:performer".to_string()
}

fn default_auth_timeout() -> u64 {
    5_000
}

fn default_leeway() -> u64 {
    5
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_outbound_queue() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            node_id: None,
            transport: TransportConfig::default(),
            store: StoreConfig::default(),
            channels: ChannelsConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout(),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            user: default_user_channel(),
            performer: default_performer_channel(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            timeout_ms: default_auth_timeout(),
            leeway_secs: default_leeway(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AuthConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from the default paths and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be parsed, an environment
    /// override has the wrong type, or the result fails validation.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        let mut builder = ::config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(::config::File::from(path.as_path()));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("ROSTER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        if let Some(path) = file {
            tracing::info!(path = %path.display(), "Loaded configuration file");
        }
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file, without environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.auth.secret.is_empty() {
            anyhow::bail!("auth.secret must be set (ROSTER_AUTH__SECRET)");
        }
        match self.node_id.as_deref() {
            Some(node) if node.is_empty() || node.contains('/') => {
                anyhow::bail!("node_id must be non-empty and must not contain '/'");
            }
            None if self.store.backend == StoreBackend::Redis => {
                anyhow::bail!("node_id must be set explicitly with the redis backend (ROSTER_NODE_ID)");
            }
            _ => {}
        }
        if self.heartbeat.timeout_ms == 0 {
            anyhow::bail!("heartbeat.timeout_ms must be positive");
        }
        Ok(())
    }

    /// Node id of this process: the configured one, or a generated id unique
    /// to this process.
    #[must_use]
    pub fn node(&self) -> &str {
        self.node_id.as_deref().unwrap_or_else(|| generated_node_id())
    }

    /// Whether the node id survives a restart, which is what makes
    /// reclaiming its stale presence meaningful.
    #[must_use]
    pub fn has_stable_node(&self) -> bool {
        self.node_id.is_some()
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Content store settings.
    #[serde(default)]
    pub content: ContentConfig,

    /// Change-log partitioning and consumer tunables.
    #[serde(default)]
    pub changelog: ChangeLogConfig,

    /// Token authentication for live connections.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Live connection limits and timers.
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Transport for the document status-update call.
    #[serde(default)]
    pub status_rpc: StatusRpcConfig,

    /// Operator endpoints.
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "signet_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Content store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentConfig {
    /// Root directory of the filesystem content store.
    #[serde(default = "default_content_dir")]
    pub dir: String,

    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,

    #[serde(default = "default_max_signature_bytes")]
    pub max_signature_bytes: usize,
}

/// Change-log configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeLogConfig {
    /// Number of partitions. Changing this on a populated log reorders
    /// nothing already written but routes new records differently.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Token authentication configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret. When unset an ephemeral secret is generated at
    /// startup, so tokens do not survive a restart.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Lifetime of issued tokens.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Enables `POST /auth/token`.
    #[serde(default)]
    pub allow_token_issuance: bool,
}

/// Operator endpoint configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminConfig {
    /// Enables `POST /broadcast/{entity_id}`, `POST /internal/resnapshot`
    /// and `POST /internal/consumers/{group}/rewind`. These routes carry no
    /// authentication of their own.
    #[serde(default)]
    pub enabled: bool,
}

/// Live connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Capacity of each connection's outbound queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// A connection with no inbound frame for this long is closed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Upper bound on a single outbound frame write.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

/// Which status-update transport the signature flow uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusRpcMode {
    /// Call the write coordinator in process.
    #[default]
    Local,
    /// Call `POST {base_url}/internal/documents/{id}/status`.
    Http,
}

/// Status-update transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusRpcConfig {
    #[serde(default)]
    pub mode: StatusRpcMode,

    /// Base URL of the document service when `mode = "http"`.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_status_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "signet.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_content_dir() -> String {
    "data/content".to_string()
}

fn default_max_content_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_signature_bytes() -> usize {
    1024 * 1024
}

fn default_partitions() -> u32 {
    4
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_backoff_initial_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_token_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_queue_capacity() -> usize {
    256
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_send_timeout_secs() -> u64 {
    10
}

fn default_status_timeout_ms() -> u64 {
    5_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            dir: default_content_dir(),
            max_content_bytes: default_max_content_bytes(),
            max_signature_bytes: default_max_signature_bytes(),
        }
    }
}

impl Default for ChangeLogConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_secs: default_token_ttl_secs(),
            allow_token_issuance: false,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            ping_interval_secs: default_ping_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

impl Default for StatusRpcConfig {
    fn default() -> Self {
        Self {
            mode: StatusRpcMode::default(),
            base_url: None,
            timeout_ms: default_status_timeout_ms(),
        }
    }
}

impl ChangeLogConfig {
    /// Builds the consumer tunables for `group`.
    pub fn consumer(&self, group: &str) -> signet_changelog::ConsumerConfig {
        let mut config = signet_changelog::ConsumerConfig::new(group, self.partitions);
        config.batch_size = self.batch_size.max(1);
        config.poll_interval = Duration::from_millis(self.poll_interval_ms.max(1));
        config.backoff_initial = Duration::from_millis(self.backoff_initial_ms.max(1));
        config.backoff_max = Duration::from_millis(self.backoff_max_ms.max(self.backoff_initial_ms));
        config
    }
}

/// Timers and limits applied to each live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub queue_capacity: usize,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub send_timeout: Duration,
}

impl From<&WebSocketConfig> for ConnectionSettings {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity.max(1),
            ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs.max(1)),
            send_timeout: Duration::from_secs(config.send_timeout_secs.max(1)),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&WebSocketConfig::default())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `SIGNET_HOST` overrides `server.host`
/// - `SIGNET_PORT` overrides `server.port`
/// - `SIGNET_DB_PATH` overrides `database.path`
/// - `SIGNET_LOG_LEVEL` overrides `logging.level`
/// - `SIGNET_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `SIGNET_CONTENT_DIR` overrides `content.dir`
/// - `SIGNET_PARTITIONS` overrides `changelog.partitions`
/// - `SIGNET_JWT_SECRET` overrides `auth.jwt_secret`
/// - `SIGNET_ADMIN_ENABLED` overrides `admin.enabled` (set to "true" to enable)
/// - `SIGNET_STATUS_RPC_URL` sets `status_rpc.base_url` and switches the
///   transport to HTTP
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting configuration is inconsistent.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("SIGNET_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("SIGNET_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("SIGNET_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("SIGNET_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("SIGNET_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(dir) = std::env::var("SIGNET_CONTENT_DIR") {
        config.content.dir = dir;
    }
    if let Ok(partitions) = std::env::var("SIGNET_PARTITIONS") {
        if let Ok(parsed) = partitions.parse() {
            config.changelog.partitions = parsed;
        }
    }
    if let Ok(secret) = std::env::var("SIGNET_JWT_SECRET") {
        if !secret.is_empty() {
            config.auth.jwt_secret = Some(secret);
        }
    }
    if let Ok(enabled) = std::env::var("SIGNET_ADMIN_ENABLED") {
        config.admin.enabled = enabled == "true" || enabled == "1";
    }
    if let Ok(url) = std::env::var("SIGNET_STATUS_RPC_URL") {
        if !url.trim().is_empty() {
            config.status_rpc.mode = StatusRpcMode::Http;
            config.status_rpc.base_url = Some(url);
        }
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.changelog.partitions == 0 {
        return Err(ConfigError::Invalid(
            "changelog.partitions must be at least 1".to_string(),
        ));
    }
    if config.status_rpc.mode == StatusRpcMode::Http && config.status_rpc.base_url.is_none() {
        return Err(ConfigError::Invalid(
            "status_rpc.base_url is required when status_rpc.mode = \"http\"".to_string(),
        ));
    }
    Ok(())
}

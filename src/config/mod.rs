use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Fullnode REST base URL, including the `/v1` suffix.
    #[serde(default = "default_node_url")]
    pub url: String,
    /// Explorer base used for transaction/account links.
    #[serde(default = "default_explorer_url")]
    pub explorer_url: String,
    /// Per-request timeout. Clamped to 10..=30s.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Relative jitter applied to each delay, sampled from [-jitter, jitter].
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Advisory only: fallback serves cached responses regardless of age.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Accounts whose event handles are discovered and polled.
    #[serde(default = "default_accounts")]
    pub accounts: Vec<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Max events requested per handle per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Max concurrent handle fetches within one cycle.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_cursor_path")]
    pub cursor_path: PathBuf,
    /// Cursor used when no cursor file exists yet.
    #[serde(default)]
    pub default_cursor: u64,
    #[serde(default = "default_idle_cycles")]
    pub idle_cycles_before_backoff: u32,
    #[serde(default = "default_error_retry_delay")]
    pub error_retry_delay_secs: u64,
    #[serde(default = "default_discovery_refresh")]
    pub discovery_refresh_secs: u64,
    #[serde(default = "default_history_interval")]
    pub version_history_interval_secs: u64,
    #[serde(default = "default_recent_events_cap")]
    pub recent_events_cap: usize,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

/// Allow-list used by the watchlist significance policy. Empty = everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub collections: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    RejectNew,
    DropOldest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_overflow")]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_sink_timeout")]
    pub sink_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_node_url() -> String {
    "https://fullnode.mainnet.aptoslabs.com/v1".to_string()
}
fn default_explorer_url() -> String {
    "https://explorer.aptoslabs.com".to_string()
}
fn default_request_timeout() -> u64 {
    15
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_jitter() -> f64 {
    0.1
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_accounts() -> Vec<String> {
    [
        "0x1",
        // Topaz marketplace
        "0x0108bc32f7de18a5f6e1e7d6ee7aff9f5fc858d0d87ac0da94dd8d2a5d267d6b",
        // BlueMove marketplace
        "0xc6b2c2483d1495084a13169f707fbe7271b4a78e4325e8c8d3d6068a354c7a92",
        // Souffl3 marketplace
        "0x8f396e4246b2ba87b51c0739ef5ea4f26480d2284be2e0b8876a7c9c8d08a2d4",
        // Pontem DEX
        "0x2c7bccf7b31baf770fdbcc768d9e9cb3d87805e255355df5db32ac9a669010a2",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_poll_interval() -> u64 {
    60
}
fn default_batch_size() -> u64 {
    25
}
fn default_fetch_concurrency() -> usize {
    4
}
fn default_cursor_path() -> PathBuf {
    PathBuf::from("last_version.txt")
}
fn default_idle_cycles() -> u32 {
    3
}
fn default_error_retry_delay() -> u64 {
    5
}
fn default_discovery_refresh() -> u64 {
    3_600
}
fn default_history_interval() -> u64 {
    60
}
fn default_recent_events_cap() -> usize {
    100
}
fn default_dedup_capacity() -> usize {
    1_000
}
fn default_queue_capacity() -> usize {
    256
}
fn default_overflow() -> OverflowPolicy {
    OverflowPolicy::DropOldest
}
fn default_sink_timeout() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            url: default_node_url(),
            explorer_url: default_explorer_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            accounts: default_accounts(),
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            fetch_concurrency: default_fetch_concurrency(),
            cursor_path: default_cursor_path(),
            default_cursor: 0,
            idle_cycles_before_backoff: default_idle_cycles(),
            error_retry_delay_secs: default_error_retry_delay(),
            discovery_refresh_secs: default_discovery_refresh(),
            version_history_interval_secs: default_history_interval(),
            recent_events_cap: default_recent_events_cap(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow: default_overflow(),
            sink_timeout_secs: default_sink_timeout(),
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

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            monitor: MonitorConfig::default(),
            filters: FilterConfig::default(),
            dispatch: DispatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.clamp(10, 30))
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn error_retry_delay(&self) -> Duration {
        Duration::from_secs(self.error_retry_delay_secs)
    }

    pub fn discovery_refresh(&self) -> Duration {
        Duration::from_secs(self.discovery_refresh_secs)
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load a default config with env overrides only (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("APTOS_NODE_URL") {
            self.node.url = url;
        }
        if let Ok(url) = std::env::var("APTOS_EXPLORER_URL") {
            self.node.explorer_url = url;
        }
        if let Some(secs) = std::env::var("POLLING_INTERVAL")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.monitor.poll_interval_secs = secs;
        }
        if let Ok(path) = std::env::var("CURSOR_PATH") {
            self.monitor.cursor_path = PathBuf::from(path);
        }
        if let Ok(list) = std::env::var("MONITOR_ACCOUNTS") {
            self.filters.accounts = split_list(&list);
        }
        if let Ok(list) = std::env::var("MONITOR_TOKENS") {
            self.filters.tokens = split_list(&list);
        }
        if let Ok(list) = std::env::var("MONITOR_COLLECTIONS") {
            self.filters.collections = split_list(&list);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.url.trim().is_empty() {
            return Err(ConfigError::Invalid("node.url is empty".into()));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter must be in [0, 1), got {}",
                self.retry.jitter
            )));
        }
        if self.monitor.batch_size == 0 {
            return Err(ConfigError::Invalid("monitor.batch_size must be > 0".into()));
        }
        if self.monitor.fetch_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "monitor.fetch_concurrency must be > 0".into(),
            ));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.queue_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

//! Configuration management for the daemon.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const ENV_LOG_LEVEL: &str = "OFFLINE_SYNC_LOG_LEVEL";
const ENV_BRIDGE_URL: &str = "OFFLINE_SYNC_BRIDGE_URL";
const ENV_AUTH_TOKEN: &str = "OFFLINE_SYNC_AUTH_TOKEN";
const ENV_REALTIME_URL: &str = "OFFLINE_SYNC_REALTIME_URL";

/// Main daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Platform bridge (HTTP API) settings.
    #[serde(default)]
    pub bridge: BridgeSettings,
    /// Realtime transport settings.
    #[serde(default)]
    pub realtime: RealtimeSettings,
    /// Connectivity probing settings.
    #[serde(default)]
    pub network: NetworkSettings,
    /// Outbound chat message queue settings.
    #[serde(default)]
    pub message_queue: MessageQueueSettings,
    /// Record sync queue settings.
    #[serde(default)]
    pub sync_queue: SyncQueueSettings,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

/// Platform bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Base URL of the platform API.
    pub base_url: String,
    /// Bearer token sent with every request, if any.
    pub auth_token: Option<String>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            auth_token: None,
            request_timeout_secs: 15,
        }
    }
}

/// Realtime transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Base reconnect delay in milliseconds.
    pub reconnect_base_delay_ms: u64,
    /// Maximum reconnect delay in milliseconds.
    pub reconnect_max_delay_ms: u64,
    /// Maximum reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Whether dropped connections reconnect automatically.
    pub auto_reconnect: bool,
    /// Maximum number of simultaneously open connections.
    pub max_connections: usize,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws".to_string(),
            heartbeat_interval_secs: 30,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            auto_reconnect: true,
            max_connections: 5,
        }
    }
}

/// Connectivity probing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Endpoints probed in parallel on every check.
    pub probe_urls: Vec<String>,
    /// Interval between periodic checks in seconds.
    pub check_interval_secs: u64,
    /// Per-probe timeout in milliseconds.
    pub probe_timeout_ms: u64,
    /// Average latency above which the network is considered slow.
    pub slow_threshold_ms: u64,
    /// Consecutive failing checks before the network is considered unstable.
    pub unstable_threshold: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            probe_urls: vec![
                "https://www.google.com/generate_204".to_string(),
                "https://cloudflare.com/cdn-cgi/trace".to_string(),
                "https://www.apple.com/library/test/success.html".to_string(),
            ],
            check_interval_secs: 30,
            probe_timeout_ms: 5_000,
            slow_threshold_ms: 2_000,
            unstable_threshold: 3,
        }
    }
}

/// Outbound message queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageQueueSettings {
    /// Interval between periodic drain passes in seconds.
    pub drain_interval_secs: u64,
    /// Retry bound used when the producer does not pass one.
    pub default_max_retries: u32,
    /// How long sent messages stay visible before purge, in seconds.
    pub retention_secs: u64,
}

impl Default for MessageQueueSettings {
    fn default() -> Self {
        Self {
            drain_interval_secs: 30,
            default_max_retries: 3,
            retention_secs: 300,
        }
    }
}

/// Record sync queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncQueueSettings {
    /// Interval between periodic processing passes in seconds.
    pub process_interval_secs: u64,
    /// Transport failures tolerated before an item is marked failed.
    pub max_retries: u32,
    /// Bookkeeping fields ignored when diffing local and remote copies.
    pub ignored_conflict_fields: Vec<String>,
}

impl Default for SyncQueueSettings {
    fn default() -> Self {
        Self {
            process_interval_secs: 60,
            max_retries: 5,
            ignored_conflict_fields: vec!["updated_at".to_string()],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            bridge: BridgeSettings::default(),
            realtime: RealtimeSettings::default(),
            network: NetworkSettings::default(),
            message_queue: MessageQueueSettings::default(),
            sync_queue: SyncQueueSettings::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from `<base>/config.json`, falling back to defaults,
    /// then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a key lookup. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(level) = get(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        if let Some(url) = get(ENV_BRIDGE_URL) {
            self.bridge.base_url = url;
        }
        if let Some(token) = get(ENV_AUTH_TOKEN) {
            self.bridge.auth_token = Some(token);
        }
        if let Some(url) = get(ENV_REALTIME_URL) {
            self.realtime.url = url;
        }
    }

    /// Reject settings the runtime cannot work with.
    pub fn validate(&self) -> CoreResult<()> {
        self.bridge_url()?;
        self.realtime_url()?;

        if self.network.probe_urls.is_empty() {
            return Err(CoreError::Config(
                "network.probe_urls must contain at least one endpoint".to_string(),
            ));
        }
        if self.realtime.max_connections == 0 {
            return Err(CoreError::Config(
                "realtime.max_connections must be greater than zero".to_string(),
            ));
        }
        if self.message_queue.default_max_retries == 0 || self.sync_queue.max_retries == 0 {
            return Err(CoreError::Config(
                "retry bounds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the bridge base URL as a parsed URL.
    pub fn bridge_url(&self) -> CoreResult<Url> {
        Url::parse(&self.bridge.base_url).map_err(CoreError::from)
    }

    /// Get the realtime endpoint as a parsed URL.
    pub fn realtime_url(&self) -> CoreResult<Url> {
        Url::parse(&self.realtime.url).map_err(CoreError::from)
    }
}

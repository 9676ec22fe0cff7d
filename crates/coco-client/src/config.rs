//! Client configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COCOSCHOOL_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use cocoschool_core::HubConfig;
use cocoschool_transport::{ManagerConfig, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where to connect.
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Local cache limits.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Live connection behaviour.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Durable request behaviour.
    #[serde(default)]
    pub requests: RequestConfig,

    /// Typing indicator timings.
    #[serde(default)]
    pub typing: TypingConfig,

    /// System notifications.
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Endpoints and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Live connection URL.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Base URL of the durable API.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Bearer token attached to every request.
    #[serde(default = "default_token")]
    pub token: Option<String>,

    /// Current user, used to ignore our own typing echoes.
    #[serde(default = "default_user_id")]
    pub user_id: Option<String>,
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Events kept per channel.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Maximum number of channels.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
}

/// Reconnect configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before reconnecting, in milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub delay_ms: u64,

    /// Backoff cap. Equal to `delay_ms` for a fixed delay.
    #[serde(default = "default_reconnect_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

/// Durable request configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Timeout for one durable request, in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_ms: u64,

    /// Messages fetched per history page.
    #[serde(default = "default_history_page")]
    pub history_page: u32,
}

/// Typing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Inactivity before `false` is sent.
    #[serde(default = "default_typing_idle")]
    pub idle_ms: u64,

    /// Interval at which `true` is re-sent while typing continues.
    #[serde(default = "default_typing_refresh")]
    pub refresh_ms: u64,

    /// Expiry of remote indicators without refresh.
    #[serde(default = "default_typing_ttl")]
    pub remote_ttl_ms: u64,
}

/// Notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Surface system alerts for incoming notifications.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_ws_url() -> String {
    std::env::var("COCOSCHOOL_WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string())
}

fn default_api_url() -> String {
    std::env::var("COCOSCHOOL_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8080/api".to_string())
}

fn default_token() -> Option<String> {
    std::env::var("COCOSCHOOL_TOKEN").ok().filter(|t| !t.is_empty())
}

fn default_user_id() -> Option<String> {
    std::env::var("COCOSCHOOL_USER_ID").ok().filter(|u| !u.is_empty())
}

fn default_true() -> bool {
    true
}

fn default_capacity() -> usize {
    50
}

fn default_max_channels() -> usize {
    1_000
}

fn default_reconnect_delay() -> u64 {
    3_000
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_send_timeout() -> u64 {
    5_000
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_history_page() -> u32 {
    50
}

fn default_typing_idle() -> u64 {
    1_000
}

fn default_typing_refresh() -> u64 {
    3_000
}

fn default_typing_ttl() -> u64 {
    6_000
}

fn default_app_name() -> String {
    "CoCoSchool".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_url: default_api_url(),
            token: default_token(),
            user_id: default_user_id(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            max_channels: default_max_channels(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_reconnect_delay(),
            max_delay_ms: default_reconnect_delay(),
            connect_timeout_ms: default_connect_timeout(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_request_timeout(),
            history_page: default_history_page(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            idle_ms: default_typing_idle(),
            refresh_ms: default_typing_refresh(),
            remote_ttl_ms: default_typing_ttl(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            enabled: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "cocoschool.toml",
            "/etc/cocoschool/cocoschool.toml",
            "~/.config/cocoschool/cocoschool.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Hub settings derived from the cache and typing sections.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            capacity: self.cache.capacity,
            max_channels: self.cache.max_channels,
            typing_ttl: Duration::from_millis(self.typing.remote_ttl_ms),
        }
    }

    /// Connection manager settings.
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            reconnect: ReconnectPolicy::exponential(
                Duration::from_millis(self.reconnect.delay_ms),
                Duration::from_millis(self.reconnect.max_delay_ms),
            ),
            connect_timeout: Duration::from_millis(self.reconnect.connect_timeout_ms),
            send_timeout: Duration::from_millis(self.reconnect.send_timeout_ms),
        }
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.requests.timeout_ms)
    }

    #[must_use]
    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing.idle_ms)
    }

    #[must_use]
    pub fn typing_refresh(&self) -> Duration {
        Duration::from_millis(self.typing.refresh_ms)
    }
}

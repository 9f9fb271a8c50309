//! Configuration loading

use anyhow::Result;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP server
    #[serde(default = "default_bind")]
    pub bind: String,
    /// SQLite connection string
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            database_url: default_database_url(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_url() -> String {
    "sqlite:./data/fleet.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Maximum silence before a device is considered offline
    #[serde(default = "default_staleness")]
    pub staleness_secs: u64,
    /// Reconciliation sweep period
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// How long a device may stay disconnected before operators are notified
    #[serde(default = "default_offline_alert")]
    pub offline_alert_after_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            staleness_secs: default_staleness(),
            sweep_interval_secs: default_sweep_interval(),
            offline_alert_after_secs: default_offline_alert(),
        }
    }
}

impl PresenceConfig {
    pub fn staleness(&self) -> Duration {
        secs(self.staleness_secs)
    }

    pub fn offline_alert_after(&self) -> Duration {
        secs(self.offline_alert_after_secs)
    }
}

fn default_staleness() -> u64 {
    120
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_offline_alert() -> u64 {
    900
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// A sent command with no acknowledgement after this long is failed
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,
    /// Re-push interval for unacknowledged commands on an open channel
    #[serde(default = "default_redelivery_interval")]
    pub redelivery_interval_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_secs: default_delivery_timeout(),
            redelivery_interval_secs: default_redelivery_interval(),
        }
    }
}

impl CommandConfig {
    pub fn delivery_timeout(&self) -> Duration {
        secs(self.delivery_timeout_secs)
    }

    pub fn redelivery_interval(&self) -> Duration {
        secs(self.redelivery_interval_secs)
    }
}

fn default_delivery_timeout() -> u64 {
    300
}

fn default_redelivery_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Automatic retries after a failed download before manual action is needed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_secs: u64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_secs: default_retry_base(),
            retry_max_secs: default_retry_max(),
        }
    }
}

/// One year; larger configured delays are clamped to it
pub const MAX_RETRY_DELAY_SECS: u64 = 365 * 24 * 3600;

impl ContentConfig {
    /// Exponential backoff before retry number `attempt + 1`, capped at
    /// `retry_max_secs` and never beyond `MAX_RETRY_DELAY_SECS`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self
            .retry_base_secs
            .saturating_mul(factor)
            .min(self.retry_max_secs)
            .min(MAX_RETRY_DELAY_SECS);
        secs(delay)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base() -> u64 {
    30
}

fn default_retry_max() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Resource samples kept per device
    #[serde(default = "default_sample_window")]
    pub sample_window: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sample_window: default_sample_window(),
        }
    }
}

fn default_sample_window() -> u32 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Reject admin requests without a known bearer token
    #[serde(default)]
    pub require_token: bool,
    #[serde(default)]
    pub tokens: Vec<ApiToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    pub token: String,
    /// Operator name recorded in the audit trail
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Offline alerts are POSTed here when set; otherwise only logged
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

/// Load configuration from file, falling back to defaults when it is absent
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.presence.staleness_secs, 120);
        assert_eq!(config.commands.delivery_timeout_secs, 300);
        assert_eq!(config.content.max_retries, 3);
        assert!(!config.auth.require_token);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [presence]
            staleness_secs = 60

            [auth]
            require_token = true
            tokens = [{ token = "s3cret", name = "ops" }]
            "#,
        )
        .unwrap();
        assert_eq!(config.presence.staleness_secs, 60);
        assert_eq!(config.presence.sweep_interval_secs, 30);
        assert_eq!(config.auth.tokens[0].name, "ops");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let content = ContentConfig {
            max_retries: 3,
            retry_base_secs: 30,
            retry_max_secs: 100,
        };
        assert_eq!(content.backoff(0), Duration::seconds(30));
        assert_eq!(content.backoff(1), Duration::seconds(60));
        assert_eq!(content.backoff(2), Duration::seconds(100));
        assert_eq!(content.backoff(70), Duration::seconds(100));
    }

    #[test]
    fn backoff_is_clamped_for_huge_limits() {
        let content = ContentConfig {
            max_retries: 3,
            retry_base_secs: u64::MAX,
            retry_max_secs: u64::MAX,
        };
        let ceiling = Duration::seconds(MAX_RETRY_DELAY_SECS as i64);
        assert_eq!(content.backoff(0), ceiling);
        assert_eq!(content.backoff(63), ceiling);
    }
}

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallEngineError, Result};

/// Call engine configuration
///
/// # Configuration Sections
///
/// - [`general`](CallEngineConfig::general): session ids and the wall-clock offset used
///   when evaluating time-of-day rule conditions
/// - [`directory`](CallEngineConfig::directory): extension allocation
/// - [`queues`](CallEngineConfig::queues): wait estimates, alert thresholds and drain cadence
/// - [`notifications`](CallEngineConfig::notifications): notification fan-out
/// - [`monitoring`](CallEngineConfig::monitoring): periodic health checks
/// - [`database`](CallEngineConfig::database): SQLite location, pool and write retries
/// - [`logging`](CallEngineConfig::logging): tracing subscriber setup
///
/// Every section has defaults, so a TOML file only needs the keys it overrides:
///
/// ```
/// use crm_call_engine::CallEngineConfig;
///
/// let config: CallEngineConfig = toml::from_str(r#"
///     [queues]
///     long_wait_threshold_secs = 120
/// "#).unwrap();
/// assert_eq!(config.queues.long_wait_threshold_secs, 120);
/// assert_eq!(config.queues.default_average_call_duration_secs, 180);
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallEngineConfig {
    pub general: GeneralConfig,
    pub directory: DirectoryConfig,
    pub queues: QueueConfig,
    pub notifications: NotificationConfig,
    pub monitoring: MonitoringConfig,
    pub database: DatabaseConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Name reported in logs and notification payloads.
    pub instance_name: String,

    /// Prefix for session ids the engine mints itself when the signaling
    /// layer does not supply one.
    pub session_id_prefix: String,

    /// Offset from UTC, in minutes, of the wall clock that rule time
    /// conditions are written against.
    pub utc_offset_minutes: i32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: "crm-call-engine".to_string(),
            session_id_prefix: "call-".to_string(),
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// First extension handed out on a server with no numeric extensions.
    pub extension_base: u32,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self { extension_base: 1000 }
    }
}

/// Queue behavior shared by every group
///
/// Per-group limits (`max_queue_size`, `queue_timeout`) live on the group
/// record itself; these values only drive estimates and alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Average talk time assumed when a group has no answered calls in the
    /// history window.
    pub default_average_call_duration_secs: u32,

    /// How far back answered calls are averaged for wait estimates.
    pub history_window_days: u32,

    /// Waiting longer than this raises a long-wait notification.
    pub long_wait_threshold_secs: u32,

    /// Fill ratio at which a queue-overflow notification is raised.
    pub overflow_alert_ratio: f64,

    /// How often the server drains every group's queue.
    pub drain_interval_ms: u64,

    /// Terminal queue entries older than this are purged.
    pub cleanup_retention_hours: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_average_call_duration_secs: 180,
            history_window_days: 7,
            long_wait_threshold_secs: 300,
            overflow_alert_ratio: 0.9,
            drain_interval_ms: 1000,
            cleanup_retention_hours: 24,
        }
    }
}

impl QueueConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,

    /// Capacity of the broadcast channel handed to subscribers.
    pub channel_capacity: usize,

    /// Minimum gap between two alerts of the same kind for the same group.
    pub alert_cooldown_secs: u64,

    /// Mirror every notification into the log.
    pub log_notifications: bool,

    /// Keep a copy of every dispatched notification in `notification_log`.
    pub persist: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: 256,
            alert_cooldown_secs: 300,
            log_notifications: true,
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub health_check_interval_secs: u64,

    /// Miss rate (percent) over the last day above which the health report
    /// flags the system as critical.
    pub miss_rate_alert_percent: f64,

    /// How often idle terminal queue entries and per-call locks are purged.
    pub maintenance_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 60,
            miss_rate_alert_percent: 30.0,
            maintenance_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx SQLite url, e.g. `sqlite://call_engine.db` or `sqlite::memory:`.
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_secs: u64,

    /// Attempts for writes on the inbound and status paths before a
    /// transient error is surfaced.
    pub write_retry_attempts: u32,
    pub write_retry_backoff_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://call_engine.db".to_string(),
            max_connections: 10,
            busy_timeout_secs: 5,
            write_retry_attempts: 3,
            write_retry_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
    pub file_info: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
        }
    }
}

impl CallEngineConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CallEngineError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| CallEngineError::configuration(format!("invalid {}: {e}", path.display())))?;
        config.validate().map_err(CallEngineError::Configuration)?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.general.session_id_prefix.is_empty() {
            return Err("session_id_prefix cannot be empty".to_string());
        }

        if self.general.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(format!(
                "utc_offset_minutes out of range: {}",
                self.general.utc_offset_minutes
            ));
        }

        if self.queues.default_average_call_duration_secs == 0 {
            return Err("default_average_call_duration_secs must be greater than 0".to_string());
        }

        if self.queues.history_window_days == 0 {
            return Err("history_window_days must be greater than 0".to_string());
        }

        if !(self.queues.overflow_alert_ratio > 0.0 && self.queues.overflow_alert_ratio <= 1.0) {
            return Err(format!(
                "overflow_alert_ratio must be in (0, 1], got {}",
                self.queues.overflow_alert_ratio
            ));
        }

        if self.queues.drain_interval_ms == 0 {
            return Err("drain_interval_ms must be greater than 0".to_string());
        }

        if self.notifications.channel_capacity == 0 {
            return Err("channel_capacity must be greater than 0".to_string());
        }

        if self.monitoring.health_check_interval_secs == 0 {
            return Err("health_check_interval_secs must be greater than 0".to_string());
        }

        if !(0.0..=100.0).contains(&self.monitoring.miss_rate_alert_percent) {
            return Err("miss_rate_alert_percent must be between 0 and 100".to_string());
        }

        if self.database.url.is_empty() {
            return Err("database url cannot be empty".to_string());
        }

        if self.database.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }

        if self.database.write_retry_attempts == 0 {
            return Err("write_retry_attempts must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CallEngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.directory.extension_base, 1000);
        assert_eq!(config.queues.long_wait_threshold_secs, 300);
        assert!((config.queues.overflow_alert_ratio - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let mut config = CallEngineConfig::default();
        config.queues.overflow_alert_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: CallEngineConfig = toml::from_str(
            r#"
            [database]
            url = "sqlite::memory:"

            [general]
            utc_offset_minutes = 120
            "#,
        )
        .unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.general.utc_offset_minutes, 120);
    }

    #[test]
    fn test_from_file_missing() {
        let err = CallEngineConfig::from_file("/nonexistent/call-engine.toml").unwrap_err();
        assert!(matches!(err, CallEngineError::Configuration(_)));
    }
}

use chrono::TimeDelta;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::core::Severity;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub trust: TrustConfig,
    pub database: DatabaseConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on any single store or history call made while evaluating.
    pub store_timeout_ms: u64,
    pub rule_refresh_seconds: u64,
    pub recovery_interval_hours: u64,
    /// Session history older than this is pruned from the SQLite store.
    pub history_retention_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrustConfig {
    pub info_penalty: i32,
    pub warning_penalty: i32,
    pub critical_penalty: i32,
    /// Scores strictly below this are flagged restricted.
    pub restrict_below: i32,
    /// Points restored to every user below 100 on each recovery tick.
    pub recovery_amount: i32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Deserialize, Clone)]
#[serde(default)]
pub struct NotificationConfig {
    pub desktop: bool,
    pub min_severity: Severity,
    pub cooldown_seconds: u64,
    pub webhook_url: Option<String>,
    pub webhook_user: Option<String>,
    pub webhook_password: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: 2_000,
            rule_refresh_seconds: 60,
            recovery_interval_hours: 24,
            history_retention_days: 30,
        }
    }
}

impl EngineConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms.max(1))
    }

    pub fn rule_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.rule_refresh_seconds.max(1))
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_hours.max(1).saturating_mul(3600))
    }

    /// How long recorded session events are kept, between one day and a century.
    pub fn history_retention(&self) -> TimeDelta {
        TimeDelta::try_days(self.history_retention_days.clamp(1, MAX_RETENTION_DAYS)).unwrap_or(TimeDelta::MAX)
    }
}

const MAX_RETENTION_DAYS: i64 = 36_500;

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            info_penalty: 1,
            warning_penalty: 5,
            critical_penalty: 15,
            restrict_below: 50,
            recovery_amount: 1,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/trustwatch.db".into(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            desktop: false,
            min_severity: Severity::Warning,
            cooldown_seconds: 30,
            webhook_url: None,
            webhook_user: None,
            webhook_password: None,
        }
    }
}

impl fmt::Debug for NotificationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationConfig")
            .field("desktop", &self.desktop)
            .field("min_severity", &self.min_severity)
            .field("cooldown_seconds", &self.cooldown_seconds)
            .field("webhook_url", &self.webhook_url)
            .field("webhook_user", &self.webhook_user)
            .field("webhook_password", &self.webhook_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Config loaded from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [trust]
            critical_penalty = 20

            [notifications]
            min_severity = "critical"
            webhook_url = "http://localhost:9000/hook"
            "#,
        )
        .unwrap();
        assert_eq!(config.trust.critical_penalty, 20);
        assert_eq!(config.trust.warning_penalty, 5);
        assert_eq!(config.notifications.min_severity, Severity::Critical);
        assert_eq!(config.engine.store_timeout(), Duration::from_secs(2));
        assert_eq!(config.database.path, "data/trustwatch.db");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/trustwatch.toml");
        assert_eq!(config.trust.restrict_below, 50);
        assert_eq!(config.engine.recovery_interval(), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn retention_is_clamped() {
        let mut engine = EngineConfig::default();
        assert_eq!(engine.history_retention(), TimeDelta::days(30));
        engine.history_retention_days = i64::MAX;
        assert_eq!(engine.history_retention(), TimeDelta::days(MAX_RETENTION_DAYS));
        engine.history_retention_days = -3;
        assert_eq!(engine.history_retention(), TimeDelta::days(1));
        engine.recovery_interval_hours = u64::MAX;
        assert_eq!(engine.recovery_interval(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn debug_hides_webhook_password() {
        let config = NotificationConfig {
            webhook_user: Some("ops".into()),
            webhook_password: Some("hunter2".into()),
            ..Default::default()
        };
        let printed = format!("{:?}", Config { notifications: config, ..Default::default() });
        assert!(!printed.contains("hunter2"), "{printed}");
        assert!(printed.contains("<redacted>"));
        assert!(printed.contains("ops"));
    }
}

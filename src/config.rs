//! Configuration types for the growbox core

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default retention window: 40 days
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(40 * 24 * 3600);

/// Longest accepted retention window: 100 years
pub const MAX_RETENTION: Duration = Duration::from_secs(36_500 * 24 * 3600);

/// Longest accepted history window: one leap year
pub const MAX_HISTORY_WINDOW: Duration = Duration::from_secs(366 * 24 * 3600);

/// Time-series store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite database file
    pub path: PathBuf,

    /// Rows older than `now - retention` are pruned
    pub retention: Duration,

    /// Minimum time between two prunes on the write path (zero = every write)
    pub prune_interval: Duration,

    /// How long a connection waits on a locked database before failing
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sensors.db"),
            retention: DEFAULT_RETENTION,
            prune_interval: Duration::from_secs(3600),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    /// Create a configuration for the given database file
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a configuration with a retention window in days
    pub fn with_retention_days(mut self, days: u64) -> Self {
        self.retention = Duration::from_secs(days.saturating_mul(24 * 3600));
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("database path"));
        }
        if self.retention.is_zero() {
            return Err(ConfigError::invalid(
                "retention",
                "retention window must be positive",
            ));
        }
        if self.retention > MAX_RETENTION {
            return Err(ConfigError::invalid(
                "retention",
                format!("at most {} days", MAX_RETENTION.as_secs() / 86_400),
            ));
        }
        Ok(())
    }
}

/// History downsampling configuration
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Number of windows a series is reduced to (output holds at most twice this)
    pub max_points: usize,

    /// How far back `/history` looks by default
    pub window: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_points: 500,
            window: Duration::from_secs(24 * 3600),
        }
    }
}

impl HistoryConfig {
    pub fn with_max_points(max_points: usize) -> Self {
        Self {
            max_points,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_points == 0 {
            return Err(ConfigError::invalid("max_points", "must be at least 1"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::invalid("history_window", "must be positive"));
        }
        if self.window > MAX_HISTORY_WINDOW {
            return Err(ConfigError::invalid(
                "history_window",
                format!("at most {} hours", MAX_HISTORY_WINDOW.as_secs() / 3600),
            ));
        }
        Ok(())
    }
}

/// Live buffer configuration
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Samples kept per sensor
    pub capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

impl LiveConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("live_capacity", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("sensors.db"));
        assert_eq!(config.retention, Duration::from_secs(40 * 86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_store_config_retention_days() {
        let config = StoreConfig::with_path("/tmp/x.db").with_retention_days(7);
        assert_eq!(config.retention, Duration::from_secs(7 * 86_400));

        let config = StoreConfig::with_path("/tmp/x.db").with_retention_days(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "retention", .. })
        ));
    }

    #[test]
    fn test_store_config_rejects_huge_retention() {
        let config = StoreConfig::with_path("/tmp/x.db").with_retention_days(36_500);
        assert!(config.validate().is_ok());

        for days in [36_501, 200_000_000, u64::MAX] {
            let config = StoreConfig::with_path("/tmp/x.db").with_retention_days(days);
            assert!(matches!(
                config.validate(),
                Err(ConfigError::Invalid { key: "retention", .. })
            ));
        }
    }

    #[test]
    fn test_history_config_bounds_window() {
        let config = HistoryConfig {
            window: MAX_HISTORY_WINDOW,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = HistoryConfig {
            window: MAX_HISTORY_WINDOW + Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "history_window", .. })
        ));
    }

    #[test]
    fn test_history_config_rejects_zero_cap() {
        assert!(HistoryConfig::default().validate().is_ok());
        assert!(HistoryConfig::with_max_points(0).validate().is_err());
    }

    #[test]
    fn test_live_config_default() {
        let config = LiveConfig::default();
        assert_eq!(config.capacity, 100);
        assert!(config.validate().is_ok());
    }
}

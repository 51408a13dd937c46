//! Error types for the growbox core
//!
//! Storage failures and configuration failures are kept apart because callers
//! treat them differently: a failed write drops one sample, a bad setting
//! stops the process at startup.

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised by the time-series store
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite reported an error (disk full, lock contention, corruption)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A connection mutex was poisoned by a panicking holder
    #[error("Store connection poisoned: {0}")]
    Poisoned(&'static str),

    /// The store was opened with settings it cannot honour
    #[error("Store configuration rejected: {0}")]
    Config(#[from] ConfigError),
}

/// Invalid or missing configuration, fatal at startup
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A setting is out of range or malformed
    #[error("Invalid setting '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },

    /// A required setting was not provided
    #[error("Missing required setting '{0}'")]
    Missing(&'static str),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`]
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::Poisoned("writer");
        let msg = format!("{}", err);
        assert!(msg.contains("poisoned"));
        assert!(msg.contains("writer"));
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let err: StorageError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StorageError::Sqlite(_)));
    }

    #[test]
    fn test_config_error_invalid() {
        let err = ConfigError::invalid("max_points", "must be at least 1");
        assert_eq!(
            err.to_string(),
            "Invalid setting 'max_points': must be at least 1"
        );
    }
}

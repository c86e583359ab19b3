//! Messenger configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MessagingError;

/// Default interval between handshake-start announcements.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Configuration for a window messenger.
///
/// Diagnostic output goes through `tracing`; with no subscriber installed
/// the messenger logs nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessengerConfig {
    /// Partition key. Envelopes from any other namespace are ignored.
    pub namespace: String,

    /// How often an unacknowledged handshake-start is re-broadcast.
    #[serde(with = "duration_ms_serde", default = "default_retry_interval")]
    pub retry_interval: Duration,
}

fn default_retry_interval() -> Duration {
    DEFAULT_RETRY_INTERVAL
}

impl MessengerConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn validate(&self) -> Result<(), MessagingError> {
        if self.namespace.trim().is_empty() {
            return Err(MessagingError::InvalidConfig(
                "namespace must not be empty".to_string(),
            ));
        }
        if self.retry_interval.is_zero() {
            return Err(MessagingError::InvalidConfig(
                "retry interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, MessagingError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, MessagingError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), MessagingError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_interval() {
        let config = MessengerConfig::new("demo");
        assert_eq!(config.namespace, "demo");
        assert_eq!(config.retry_interval, Duration::from_millis(1000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = MessengerConfig::from_json(r#"{"namespace": "ns"}"#).unwrap();
        assert_eq!(config.retry_interval, DEFAULT_RETRY_INTERVAL);

        let config =
            MessengerConfig::from_json(r#"{"namespace": "ns", "retryInterval": 250}"#).unwrap();
        assert_eq!(config.retry_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(matches!(
            MessengerConfig::new("  ").validate(),
            Err(MessagingError::InvalidConfig(_))
        ));
        assert!(matches!(
            MessengerConfig::new("ns")
                .with_retry_interval(Duration::ZERO)
                .validate(),
            Err(MessagingError::InvalidConfig(_))
        ));
        assert!(MessengerConfig::from_json(r#"{"retryInterval": 5}"#).is_err());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("messenger.json");

        let original = MessengerConfig::new("saved").with_retry_interval(Duration::from_millis(40));
        original.save_to_file(&path).unwrap();

        let loaded = MessengerConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = MessengerConfig::load_from_file(&dir.path().join("missing.json"));
        assert!(matches!(result, Err(MessagingError::Io(_))));
    }
}

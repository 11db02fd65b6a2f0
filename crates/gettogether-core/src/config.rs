//! Reconciler configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Default presence sweep period.
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 10_000;

/// Default silence after which a contact is considered offline.
const DEFAULT_PRESENCE_TIMEOUT_MS: u64 = 60_000;

/// Default window for batching persistence writes.
const DEFAULT_PERSIST_DEBOUNCE_MS: u64 = 250;

/// Default capacity of the per-account event queue.
const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// Tunables for the reconciler runtime.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use gettogether_core::ReconcilerConfig;
///
/// let config = ReconcilerConfig::from_json_str(r#"{ "presence_timeout_ms": 30000 }"#).unwrap();
/// assert_eq!(config.presence_timeout().as_secs(), 30);
/// assert_eq!(config.sweep_interval().as_secs(), 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// How often the presence sweep runs
    pub sweep_interval_ms: u64,
    /// Silence threshold before a contact goes offline
    pub presence_timeout_ms: u64,
    /// Debounce window for persistence writes
    pub persist_debounce_ms: u64,
    /// Bound on queued events/commands per account
    pub event_queue_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            presence_timeout_ms: DEFAULT_PRESENCE_TIMEOUT_MS,
            persist_debounce_ms: DEFAULT_PERSIST_DEBOUNCE_MS,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

impl ReconcilerConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject values that would stall the runtime
    pub fn validate(&self) -> SyncResult<()> {
        if self.sweep_interval_ms == 0 {
            return Err(SyncError::Config("sweep_interval_ms must be > 0".into()));
        }
        if self.presence_timeout_ms == 0 {
            return Err(SyncError::Config("presence_timeout_ms must be > 0".into()));
        }
        if self.event_queue_capacity == 0 {
            return Err(SyncError::Config("event_queue_capacity must be > 0".into()));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.sweep_interval(), Duration::from_secs(10));
        assert_eq!(config.presence_timeout(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ReconcilerConfig::from_json_str(r#"{"persist_debounce_ms": 5}"#).unwrap();
        assert_eq!(config.persist_debounce(), Duration::from_millis(5));
        assert_eq!(config.presence_timeout_ms, DEFAULT_PRESENCE_TIMEOUT_MS);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = ReconcilerConfig::from_json_str(r#"{"sweep_interval_ms": 0}"#).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"event_queue_capacity": 8}}"#).unwrap();

        let config = ReconcilerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.event_queue_capacity, 8);
    }
}

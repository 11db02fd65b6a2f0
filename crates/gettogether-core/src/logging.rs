//! Tracing subscriber setup.
//!
//! The library itself only emits `tracing` events. Host applications (and
//! integration tests) call [`LoggingBuilder`] once to route them somewhere.
//!
//! ```ignore
//! use gettogether_core::logging::LoggingBuilder;
//!
//! LoggingBuilder::new()
//!     .with_filter("gettogether_core=debug")
//!     .json()
//!     .init()?;
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{SyncError, SyncResult};

/// Filter used when neither the builder nor `RUST_LOG` specify one.
pub const DEFAULT_FILTER: &str = "gettogether_core=info";

/// Builder for the global tracing subscriber.
#[derive(Debug, Clone, Default)]
pub struct LoggingBuilder {
    env_filter: Option<String>,
    json: bool,
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the filter directive (e.g. "gettogether_core=debug").
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Emit one JSON object per line instead of human-readable text.
    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Resolve the filter: explicit directive, then `RUST_LOG`, then the default.
    pub fn build_filter(&self) -> SyncResult<EnvFilter> {
        match &self.env_filter {
            Some(directive) => EnvFilter::try_new(directive)
                .map_err(|e| SyncError::Config(format!("bad log filter {directive:?}: {e}"))),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
        }
    }

    /// Install the subscriber.
    ///
    /// Returns `Ok(false)` if a global subscriber was already installed, so
    /// repeated calls from tests are harmless.
    pub fn init(self) -> SyncResult<bool> {
        let filter = self.build_filter()?;
        let json_layer = self.json.then(|| tracing_subscriber::fmt::layer().json());
        let text_layer = (!self.json).then(tracing_subscriber::fmt::layer);

        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(json_layer)
            .with(text_layer)
            .try_init()
            .is_ok();
        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_filter_is_parsed() {
        let builder = LoggingBuilder::new().with_filter("gettogether_core=debug");
        assert!(builder.build_filter().is_ok());
    }

    #[test]
    fn test_bad_filter_is_config_error() {
        let builder = LoggingBuilder::new().with_filter("gettogether_core=notalevel");
        assert!(matches!(builder.build_filter(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let _ = LoggingBuilder::new().with_filter("warn").init().unwrap();
        let second = LoggingBuilder::new().json().with_filter("warn").init().unwrap();
        assert!(!second);
    }
}

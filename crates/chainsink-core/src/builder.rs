//! Fluent builder API for sink configuration.
//!
//! # Example
//!
//! ```rust
//! use chainsink_core::SinkBuilder;
//!
//! let config = SinkBuilder::new()
//!     .id("erc20-transfers")
//!     .cursor_path("./state")
//!     .topic("transfers")
//!     .topic("swaps")
//!     .default_topic("transfers")
//!     .build_config();
//! assert_eq!(config.destinations.len(), 2);
//! ```

use std::path::PathBuf;

use crate::config::SinkConfig;
use crate::publisher::DestinationConfig;

/// Fluent builder for `SinkConfig`.
#[derive(Default)]
pub struct SinkBuilder {
    config: SinkConfig,
}

impl SinkBuilder {
    pub fn new() -> Self {
        Self {
            config: SinkConfig::default(),
        }
    }

    /// Start from an existing config, e.g. one loaded from a file.
    pub fn from_config(config: SinkConfig) -> Self {
        Self { config }
    }

    /// Set the sink ID (used in log spans).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set where the cursor is stored.
    pub fn cursor_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cursor_path = path.into();
        self
    }

    /// Register an ordered destination. The first one becomes the default
    /// unless `default_topic` says otherwise.
    pub fn topic(self, name: impl Into<String>) -> Self {
        self.destination(DestinationConfig::ordered(name))
    }

    /// Register a destination with explicit settings.
    pub fn destination(mut self, destination: DestinationConfig) -> Self {
        if self.config.default_destination.is_empty() {
            self.config.default_destination = destination.name.clone();
        }
        self.config.destinations.retain(|d| d.name != destination.name);
        self.config.destinations.push(destination);
        self
    }

    /// Set the destination for messages without a topic.
    pub fn default_topic(mut self, name: impl Into<String>) -> Self {
        self.config.default_destination = name.into();
        self
    }

    /// Send undo markers to a dedicated destination.
    pub fn undo_topic(mut self, name: impl Into<String>) -> Self {
        self.config.undo_destination = Some(name.into());
        self
    }

    /// Set the shutdown grace period in milliseconds.
    pub fn shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.config.shutdown_timeout_ms = ms;
        self
    }

    /// Build the `SinkConfig`.
    pub fn build_config(self) -> SinkConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = SinkBuilder::new().build_config();
        assert_eq!(cfg.id, "default");
        assert_eq!(cfg.shutdown_timeout_ms, 10_000);
        assert!(cfg.destinations.is_empty());
    }

    #[test]
    fn builder_custom() {
        let cfg = SinkBuilder::new()
            .id("my-sink")
            .cursor_path("/var/lib/sink/cursor.json")
            .topic("transfers")
            .destination(DestinationConfig::unordered("audit"))
            .topic("transfers") // re-registering replaces
            .undo_topic("audit")
            .shutdown_timeout_ms(2_000)
            .build_config();

        assert_eq!(cfg.id, "my-sink");
        assert_eq!(cfg.default_destination, "transfers");
        assert_eq!(cfg.undo_destination.as_deref(), Some("audit"));
        assert_eq!(cfg.destinations.len(), 2);
        assert!(!cfg.destination("audit").unwrap().ordering_enabled);
        assert_eq!(cfg.shutdown_timeout_ms, 2_000);
    }
}

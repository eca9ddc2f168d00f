//! Sink configuration and state types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mapper::MessageMapper;
use crate::publisher::DestinationConfig;

/// Configuration for a sink instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Name for this sink (used in log spans).
    pub id: String,
    /// Directory holding `cursor.json`, or the cursor file itself.
    pub cursor_path: PathBuf,
    /// Destination for messages that do not name a topic.
    pub default_destination: String,
    /// Destination for undo markers; `None` = the default destination.
    pub undo_destination: Option<String>,
    /// Every destination the sink may publish to.
    pub destinations: Vec<DestinationConfig>,
    /// How long to wait for the stream to unwind after shutdown (milliseconds).
    pub shutdown_timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            cursor_path: PathBuf::from("./state"),
            default_destination: String::new(),
            undo_destination: None,
            destinations: Vec::new(),
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl SinkConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// The mapper matching the configured destinations.
    pub fn mapper(&self) -> MessageMapper {
        let mapper = MessageMapper::new(self.default_destination.clone());
        match &self.undo_destination {
            Some(undo) => mapper.with_undo_destination(undo.clone()),
            None => mapper,
        }
    }

    /// Returns the config of `name`, if registered.
    pub fn destination(&self, name: &str) -> Option<&DestinationConfig> {
        self.destinations.iter().find(|d| d.name == name)
    }
}

/// Runtime state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkState {
    /// Not yet started.
    Idle,
    /// Streaming and publishing.
    Running,
    /// Shutdown requested; waiting for the stream to unwind.
    Terminating,
    /// Done.
    Stopped,
}

impl std::fmt::Display for SinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Terminating => write!(f, "terminating"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: SinkConfig = serde_json::from_str(
            r#"{"default_destination":"transfers","destinations":[{"name":"transfers"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.id, "default");
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(10));
        assert!(cfg.destination("transfers").unwrap().ordering_enabled);
        assert!(cfg.destination("swaps").is_none());
    }

    #[test]
    fn undo_destination_falls_back_to_default() {
        let mut cfg = SinkConfig {
            default_destination: "transfers".into(),
            ..Default::default()
        };
        assert_eq!(cfg.mapper().undo_destination(), "transfers");

        cfg.undo_destination = Some("control".into());
        assert_eq!(cfg.mapper().undo_destination(), "control");
        assert_eq!(cfg.mapper().default_destination(), "transfers");
    }
}

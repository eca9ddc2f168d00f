//! `chainsink sink`: replay block events into file-backed topics.
//!
//! The endpoint is a JSON-lines replay file (see `chainsink_local::replay`).
//! Each topic is written to `<project>/<topic>.jsonl`; the cursor goes to
//! `--cursor-path`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;

use chainsink_core::{Controller, DestinationConfig, FileCursorStore, SinkBuilder, SinkConfig};
use chainsink_local::{BlockRange, FileBroker, ReplayStream};

#[derive(Args, Debug)]
pub struct SinkArgs {
    /// Replay file to stream from
    pub endpoint: PathBuf,

    /// Block range `start:stop` (stop exclusive), `start:`, `:stop` or `start`
    pub block_range: Option<String>,

    /// Output module whose payloads are published
    #[arg(long, env = "CHAINSINK_MODULE")]
    pub module: Option<String>,

    /// JSON file holding a full sink config; flags below override it
    #[arg(long, env = "CHAINSINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Sink name used in logs
    #[arg(long, env = "CHAINSINK_ID")]
    pub id: Option<String>,

    /// Ordered topic to publish to (repeatable; the first is the default)
    #[arg(long = "topic", env = "CHAINSINK_TOPICS", value_delimiter = ',')]
    pub topics: Vec<String>,

    /// Topic published without ordering keys (repeatable)
    #[arg(long = "unordered-topic", env = "CHAINSINK_UNORDERED_TOPICS", value_delimiter = ',')]
    pub unordered_topics: Vec<String>,

    /// Topic for messages that do not name one
    #[arg(long, env = "CHAINSINK_DEFAULT_TOPIC")]
    pub default_topic: Option<String>,

    /// Topic for undo markers (default: the default topic)
    #[arg(long, env = "CHAINSINK_UNDO_TOPIC")]
    pub undo_topic: Option<String>,

    /// Directory that receives one `<topic>.jsonl` per topic
    #[arg(long, env = "CHAINSINK_PROJECT", default_value = "./out")]
    pub project: PathBuf,

    /// Cursor directory or file
    #[arg(long, env = "CHAINSINK_CURSOR_PATH")]
    pub cursor_path: Option<PathBuf>,

    /// Grace period for the stream to stop after shutdown
    #[arg(long, env = "CHAINSINK_SHUTDOWN_TIMEOUT_MS")]
    pub shutdown_timeout_ms: Option<u64>,

    /// Pause between blocks, for watching a replay
    #[arg(long, env = "CHAINSINK_DELAY_MS")]
    pub delay_ms: Option<u64>,
}

impl SinkArgs {
    /// Config file (if any) with the flags applied on top.
    pub fn sink_config(&self) -> Result<SinkConfig> {
        let base = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => SinkConfig::default(),
        };

        let mut builder = SinkBuilder::from_config(base);
        if let Some(id) = &self.id {
            builder = builder.id(id);
        }
        if let Some(path) = &self.cursor_path {
            builder = builder.cursor_path(path);
        }
        for topic in &self.topics {
            builder = builder.topic(topic);
        }
        for topic in &self.unordered_topics {
            builder = builder.destination(DestinationConfig::unordered(topic));
        }
        if let Some(topic) = &self.default_topic {
            builder = builder.default_topic(topic);
        }
        if let Some(topic) = &self.undo_topic {
            builder = builder.undo_topic(topic);
        }
        if let Some(ms) = self.shutdown_timeout_ms {
            builder = builder.shutdown_timeout_ms(ms);
        }
        let config = builder.build_config();

        if config.destinations.is_empty() {
            bail!("no topics configured: pass --topic or set destinations in --config");
        }
        if config.destination(&config.default_destination).is_none() {
            bail!("default topic '{}' is not a configured topic", config.default_destination);
        }
        if let Some(undo) = &config.undo_destination {
            if config.destination(undo).is_none() {
                bail!("undo topic '{undo}' is not a configured topic");
            }
        }
        Ok(config)
    }

    pub fn range(&self) -> Result<BlockRange> {
        match &self.block_range {
            Some(raw) => raw
                .parse::<BlockRange>()
                .with_context(|| format!("invalid block range '{raw}'")),
            None => Ok(BlockRange::unbounded()),
        }
    }

    fn stream(&self) -> Result<ReplayStream> {
        let mut stream = ReplayStream::new(&self.endpoint).with_range(self.range()?);
        if let Some(module) = &self.module {
            stream = stream.with_module(module);
        }
        if let Some(ms) = self.delay_ms {
            stream = stream.with_delay(Duration::from_millis(ms));
        }
        Ok(stream)
    }
}

pub async fn run(args: SinkArgs) -> Result<()> {
    let config = args.sink_config()?;
    let stream = args.stream()?;

    let broker = FileBroker::open(&args.project)?;
    let resolver = broker.resolver(&config.destinations)?;
    let store = Arc::new(FileCursorStore::new(&config.cursor_path));
    tracing::info!(
        endpoint = %args.endpoint.display(),
        project = %broker.dir().display(),
        cursor = %store.path().display(),
        topics = config.destinations.len(),
        "Sink configured"
    );

    let mut controller = Controller::with_resolver(config, Arc::new(stream), resolver, store);
    let lifecycle = controller.lifecycle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            lifecycle.shutdown(None);
        }
    });

    match controller.run().await {
        Ok(summary) => {
            println!(
                "published {} messages over {} blocks ({} undos)",
                summary.messages, summary.blocks, summary.undos
            );
            if let Some(cursor) = summary.last_cursor {
                println!("cursor: {cursor}");
            }
            Ok(())
        }
        Err(e) => Err(e.root_cause().clone()).context("sink stopped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: SinkArgs,
    }

    fn parse(argv: &[&str]) -> SinkArgs {
        let mut full = vec!["sink"];
        full.extend_from_slice(argv);
        Wrapper::try_parse_from(full).unwrap().args
    }

    #[test]
    fn flags_build_config() {
        let args = parse(&[
            "blocks.jsonl",
            "--topic",
            "transfers,swaps",
            "--unordered-topic",
            "audit",
            "--undo-topic",
            "audit",
            "--cursor-path",
            "/tmp/cursor.json",
        ]);
        let cfg = args.sink_config().unwrap();
        assert_eq!(cfg.default_destination, "transfers");
        assert_eq!(cfg.undo_destination.as_deref(), Some("audit"));
        assert_eq!(cfg.destinations.len(), 3);
        assert!(!cfg.destination("audit").unwrap().ordering_enabled);
        assert_eq!(cfg.cursor_path, PathBuf::from("/tmp/cursor.json"));
    }

    #[test]
    fn config_file_is_overridden_by_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.json");
        std::fs::write(
            &path,
            r#"{"id":"from-file","default_destination":"a","destinations":[{"name":"a"},{"name":"b"}],"shutdown_timeout_ms":500}"#,
        )
        .unwrap();

        let args = parse(&[
            "blocks.jsonl",
            "--config",
            path.to_str().unwrap(),
            "--default-topic",
            "b",
        ]);
        let cfg = args.sink_config().unwrap();
        assert_eq!(cfg.id, "from-file");
        assert_eq!(cfg.default_destination, "b");
        assert_eq!(cfg.shutdown_timeout_ms, 500);
    }

    #[test]
    fn rejects_unknown_default_topic() {
        let args = parse(&["blocks.jsonl", "--topic", "a", "--default-topic", "z"]);
        assert!(args.sink_config().is_err());
        let args = parse(&["blocks.jsonl"]);
        assert!(args.sink_config().is_err());
    }

    #[test]
    fn range_argument() {
        assert_eq!(parse(&["f", "10:20"]).range().unwrap(), BlockRange::new(Some(10), Some(20)));
        assert_eq!(parse(&["f"]).range().unwrap(), BlockRange::unbounded());
        assert!(parse(&["f", "20:10"]).range().is_err());
    }
}

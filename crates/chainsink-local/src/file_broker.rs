//! A broker that appends published messages to JSON-lines files.
//!
//! Each destination gets `<dir>/<destination>.jsonl`, one record per
//! acknowledged message:
//!
//! ```json
//! {"message_id":"transfers-3","published_at":"2024-05-01T12:00:00Z","message":{...}}
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chainsink_core::{
    BrokerError, Destination, DestinationConfig, OutboundMessage, PublishResult, SinkError,
    StaticResolver,
};

/// One line of a destination file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedRecord {
    pub message_id: String,
    pub published_at: DateTime<Utc>,
    pub message: OutboundMessage,
}

/// Writes every destination to its own file under `dir`.
#[derive(Debug, Clone)]
pub struct FileBroker {
    dir: PathBuf,
}

impl FileBroker {
    /// Create `dir` if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| SinkError::io(format!("creating broker directory {}", dir.display()), e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_for(&self, destination: &str) -> PathBuf {
        self.dir.join(format!("{destination}.jsonl"))
    }

    /// Open the file for `name` in append mode.
    pub fn destination(&self, name: &str) -> Result<Arc<dyn Destination>, SinkError> {
        let path = self.file_for(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SinkError::io(format!("opening {}", path.display()), e))?;
        tracing::debug!(destination = name, path = %path.display(), "Opened destination file");
        Ok(Arc::new(FileTopic {
            name: name.to_string(),
            file: Mutex::new(file),
            next_id: AtomicU64::new(0),
        }))
    }

    /// A resolver with one file per configured destination.
    pub fn resolver(&self, destinations: &[DestinationConfig]) -> Result<StaticResolver, SinkError> {
        destinations.iter().try_fold(StaticResolver::new(), |resolver, config| {
            Ok(resolver.register(config.clone(), self.destination(&config.name)?))
        })
    }

    /// Read back every record written to `destination`.
    pub fn read(&self, destination: &str) -> Result<Vec<PublishedRecord>, SinkError> {
        let path = self.file_for(destination);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SinkError::io(format!("reading {}", path.display()), e)),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l).map_err(|e| {
                    SinkError::io(
                        format!("parsing {}", path.display()),
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                    )
                })
            })
            .collect()
    }
}

struct FileTopic {
    name: String,
    file: Mutex<File>,
    next_id: AtomicU64,
}

impl FileTopic {
    fn append(&self, message: OutboundMessage) -> Result<String, BrokerError> {
        let message_id = format!(
            "{}-{}",
            self.name,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let record = PublishedRecord {
            message_id: message_id.clone(),
            published_at: Utc::now(),
            message,
        };
        let mut line = serde_json::to_vec(&record).map_err(|e| BrokerError::new(e.to_string()))?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(&line)
            .and_then(|_| file.flush())
            .map_err(|e| BrokerError::new(format!("writing {}: {e}", self.name)))?;
        Ok(message_id)
    }
}

impl Destination for FileTopic {
    // Written at dispatch time so the file keeps dispatch order.
    fn publish(&self, message: OutboundMessage) -> PublishResult {
        PublishResult::ready(self.append(message))
    }
}

//! Cursor store: persists the sink's position for crash recovery.
//!
//! The store holds a single slot: the cursor of the last fully published
//! batch. On restart the stream resumes from it, so the batch that was in
//! flight at crash time is delivered again.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::cursor::Cursor;
use crate::error::SinkError;

/// File name used when `cursor_path` names a directory.
pub const CURSOR_FILE_NAME: &str = "cursor.json";

/// Trait for loading and saving the cursor.
///
/// Implementations include [`FileCursorStore`] and [`MemoryCursorStore`].
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Load the saved cursor. `None` means nothing was saved yet.
    async fn load(&self) -> Result<Option<Cursor>, SinkError>;

    /// Replace the saved cursor. Either the old or the new cursor is readable
    /// afterwards, never a partial write.
    async fn save(&self, cursor: &Cursor) -> Result<(), SinkError>;

    /// Forget the saved cursor (e.g. when resetting a sink).
    async fn clear(&self) -> Result<(), SinkError>;
}

// ─── File store ───────────────────────────────────────────────────────────────

/// Cursor persisted as a JSON string in a single file.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    /// Resolve `cursor_path` to the cursor file.
    ///
    /// An existing file, or a missing path with an extension, is used as-is.
    /// Anything else is treated as a directory holding `cursor.json`.
    pub fn new(cursor_path: impl AsRef<Path>) -> Self {
        let p = cursor_path.as_ref();
        let bare_file = if p.is_file() {
            true
        } else {
            !p.exists() && p.extension().is_some()
        };
        let path = if bare_file {
            p.to_path_buf()
        } else {
            p.join(CURSOR_FILE_NAME)
        };
        Self { path }
    }

    /// The resolved cursor file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| CURSOR_FILE_NAME.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Persist a rename by syncing the directory entry.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self) -> Result<Option<Cursor>, SinkError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SinkError::io(
                    format!("reading cursor file {}", self.path.display()),
                    e,
                ))
            }
        };

        let cursor: Cursor = serde_json::from_slice(&data).map_err(|e| {
            SinkError::io(
                format!("parsing cursor file {}", self.path.display()),
                std::io::Error::new(ErrorKind::InvalidData, e),
            )
        })?;
        Ok(Some(cursor))
    }

    async fn save(&self, cursor: &Cursor) -> Result<(), SinkError> {
        let context = |what: &str| format!("{what} {}", self.path.display());

        // Refuse to write what `load` could not read back.
        cursor.validate().map_err(|e| {
            SinkError::io(
                context("validating cursor for"),
                std::io::Error::new(ErrorKind::InvalidData, e),
            )
        })?;

        let parent = self.parent_dir();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| SinkError::io(context("creating parent directory of"), e))?;

        let bytes = serde_json::to_vec(cursor).map_err(|e| {
            SinkError::io(
                context("encoding cursor for"),
                std::io::Error::new(ErrorKind::InvalidData, e),
            )
        })?;

        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| SinkError::io(context("creating temporary file for"), e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| SinkError::io(context("writing temporary file for"), e))?;
        file.sync_all()
            .await
            .map_err(|e| SinkError::io(context("syncing temporary file for"), e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SinkError::io(context("renaming temporary file onto"), e))?;
        sync_dir(&parent)
            .await
            .map_err(|e| SinkError::io(context("syncing directory of"), e))?;

        tracing::trace!(path = %self.path.display(), cursor = %cursor, "Cursor saved");
        Ok(())
    }

    async fn clear(&self) -> Result<(), SinkError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SinkError::io(
                format!("removing cursor file {}", self.path.display()),
                e,
            )),
        }
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory cursor store for tests and ephemeral sinks.
#[derive(Default)]
pub struct MemoryCursorStore {
    slot: Mutex<Option<Cursor>>,
    saves: Mutex<u64>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `cursor`.
    pub fn with_cursor(cursor: Cursor) -> Self {
        Self {
            slot: Mutex::new(Some(cursor)),
            saves: Mutex::new(0),
        }
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> u64 {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self) -> Result<Option<Cursor>, SinkError> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, cursor: &Cursor) -> Result<(), SinkError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(cursor.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    async fn clear(&self) -> Result<(), SinkError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

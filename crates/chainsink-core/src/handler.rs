//! Stream-client boundary: the handler callbacks and the client trait.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cursor::Cursor;
use crate::error::SinkError;
use crate::types::{BlockEvent, BlockScopedData, BlockUndoSignal};

/// Callbacks invoked by a [`StreamClient`].
///
/// Taking `&mut self` means a client can never run two callbacks at once.
#[async_trait]
pub trait BlockHandlers: Send {
    /// Called for every block of output.
    async fn handle_block_scoped_data(&mut self, data: BlockScopedData) -> Result<(), SinkError>;

    /// Called when the stream rolls back.
    async fn handle_block_undo_signal(&mut self, signal: BlockUndoSignal) -> Result<(), SinkError>;

    /// Route an event to the matching callback.
    async fn handle_event(&mut self, event: BlockEvent) -> Result<(), SinkError> {
        match event {
            BlockEvent::Data(data) => self.handle_block_scoped_data(data).await,
            BlockEvent::Undo(signal) => self.handle_block_undo_signal(signal).await,
        }
    }
}

/// The upstream stream of block events.
///
/// # Contract
/// - `run` delivers events in order, starting after `start` (or at the
///   stream's configured start when `None`), and returns when the stream ends,
///   a handler fails, or `shutdown` was called.
/// - A handler error stops the stream and is returned from `run` unchanged.
/// - `shutdown` may be called from any task, any number of times.
#[async_trait]
pub trait StreamClient: Send + Sync {
    async fn run(
        &self,
        start: Option<Cursor>,
        handlers: &mut dyn BlockHandlers,
    ) -> Result<(), SinkError>;

    /// Ask `run` to return as soon as possible.
    fn shutdown(&self, cause: Option<Arc<SinkError>>);
}

//! chainsink-core: block-scoped publish pipeline with crash-safe cursors.
//!
//! # Architecture
//!
//! ```text
//! StreamClient ──events──▶ Controller
//!                              ├── MessageMapper   (payload → publish batch, undo markers)
//!                              ├── Publisher       (fan-out, wait for every ack)
//!                              ├── CursorStore     (save only after the batch is acked)
//!                              └── Lifecycle       (bidirectional shutdown with the stream)
//! ```

pub mod builder;
pub mod config;
pub mod controller;
pub mod cursor;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod mapper;
pub mod publisher;
pub mod store;
pub mod types;
pub mod wire;

pub use builder::SinkBuilder;
pub use config::{SinkConfig, SinkState};
pub use controller::{Controller, SinkSummary};
pub use cursor::{Cursor, CursorParseError, CursorStep};
pub use error::{BrokerError, PublishError, PublishFailure, SinkError};
pub use handler::{BlockHandlers, StreamClient};
pub use lifecycle::Lifecycle;
pub use mapper::MessageMapper;
pub use publisher::{
    Destination, DestinationConfig, DestinationResolver, FanoutPublisher, PublishReport,
    PublishResult, Publisher, ResolvedDestination, StaticResolver,
};
pub use store::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use types::{BlockEvent, BlockRef, BlockScopedData, BlockUndoSignal, OutboundMessage};

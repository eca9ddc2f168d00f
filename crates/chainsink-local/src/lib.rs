//! chainsink-local: collaborators for running a sink without a network.
//!
//! # What's here
//!
//! ```text
//! Streams                          Brokers
//!   ScriptedStream (Vec<BlockEvent>)   MemoryBroker (records, injects failures)
//!   ReplayStream   (JSONL file)        FileBroker   (<dir>/<topic>.jsonl)
//! ```

pub mod file_broker;
pub mod memory_broker;
pub mod range;
pub mod replay;
pub mod scripted;

pub use file_broker::{FileBroker, PublishedRecord};
pub use memory_broker::MemoryBroker;
pub use range::{BlockRange, RangeParseError};
pub use replay::{ReplayRecord, ReplayStream};
pub use scripted::{Resume, ScriptedStream};

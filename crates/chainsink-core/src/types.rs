//! Shared types for the publish pipeline.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;

// ─── BlockRef ─────────────────────────────────────────────────────────────────

/// A block number plus its id (hash).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub id: String,
}

impl BlockRef {
    pub fn new(number: u64, id: impl Into<String>) -> Self {
        Self {
            number,
            id: id.into(),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.id)
    }
}

// ─── Block events ────────────────────────────────────────────────────────────

/// Forward progress: the output of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockScopedData {
    /// The block this output belongs to.
    pub clock: BlockRef,
    /// Protobuf-encoded `PublishOperations`.
    pub payload: Bytes,
    /// Cursor to resume from once this block is fully handled.
    pub cursor: Cursor,
    /// Whether the stream is following the chain head; `None` if unknown.
    pub is_live: Option<bool>,
}

/// The stream is rolling back to `last_valid_block`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockUndoSignal {
    pub last_valid_block: BlockRef,
    /// Cursor to resume from once the undo is handled.
    pub cursor: Cursor,
}

/// An event delivered by the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockEvent {
    Data(BlockScopedData),
    Undo(BlockUndoSignal),
}

impl BlockEvent {
    /// The cursor carried by the event.
    pub fn cursor(&self) -> &Cursor {
        match self {
            Self::Data(d) => &d.cursor,
            Self::Undo(u) => &u.cursor,
        }
    }

    /// The block number the event refers to.
    pub fn block_number(&self) -> u64 {
        match self {
            Self::Data(d) => d.clock.number,
            Self::Undo(u) => u.last_valid_block.number,
        }
    }
}

// ─── OutboundMessage ──────────────────────────────────────────────────────────

/// A message ready to hand to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Destination (topic) name.
    pub destination: String,
    #[serde(with = "body_hex")]
    pub body: Bytes,
    /// Sorted so encoding is deterministic.
    pub attributes: BTreeMap<String, String>,
    /// `None` means the destination's default ordering applies.
    pub ordering_key: Option<String>,
}

impl OutboundMessage {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

mod body_hex {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map(Bytes::from).map_err(serde::de::Error::custom)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

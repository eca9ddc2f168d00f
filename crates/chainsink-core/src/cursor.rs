//! Stream cursor: the resumption token saved after every published batch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::BlockRef;

const CURSOR_VERSION: &str = "c1";
const UNDO_SUFFIX: &str = "undo";

/// Which kind of event emitted the cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CursorStep {
    /// Forward progress (a data event).
    #[default]
    New,
    /// A rollback to `block`.
    Undo,
}

/// The stream's position after a block event.
///
/// The cursor knows:
/// - Which block the event belongs to
/// - The last irreversible block at that point, used by the stream to resume
///   safely across reorgs
/// - Whether it was emitted by a data event or an undo signal, so an undo
///   back to block N never collides with the data event of block N
///
/// Its canonical string form is `c1:<number>:<id>:<final_number>:<final_id>`,
/// with a trailing `:undo` for undo cursors.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Cursor {
    /// Block the cursor points at.
    pub block: BlockRef,
    /// Last irreversible block known when the cursor was emitted.
    pub final_block: BlockRef,
    pub step: CursorStep,
}

impl Cursor {
    /// A data-event cursor. Use [`Cursor::try_new`] for untrusted input.
    pub fn new(block: BlockRef, final_block: BlockRef) -> Self {
        Self {
            block,
            final_block,
            step: CursorStep::New,
        }
    }

    /// An undo cursor for a rollback to `last_valid_block`.
    pub fn undo(last_valid_block: BlockRef, final_block: BlockRef) -> Self {
        Self {
            block: last_valid_block,
            final_block,
            step: CursorStep::Undo,
        }
    }

    /// A data-event cursor that is guaranteed to survive a string round trip.
    pub fn try_new(block: BlockRef, final_block: BlockRef) -> Result<Self, CursorParseError> {
        let cursor = Self::new(block, final_block);
        cursor.validate()?;
        Ok(cursor)
    }

    /// Check that the string form parses back to this cursor.
    pub fn validate(&self) -> Result<(), CursorParseError> {
        check_fields(&self.block, &self.final_block).map_err(|reason| CursorParseError {
            input: self.to_string(),
            reason,
        })
    }

    /// The block reference, for logging.
    pub fn block(&self) -> &BlockRef {
        &self.block
    }

    pub fn is_undo(&self) -> bool {
        self.step == CursorStep::Undo
    }

    /// Returns the next block the stream will deliver (cursor + 1).
    pub fn next_block(&self) -> u64 {
        self.block.number.saturating_add(1)
    }
}

fn check_fields(block: &BlockRef, final_block: &BlockRef) -> Result<(), &'static str> {
    if block.id.is_empty() || final_block.id.is_empty() {
        return Err("empty block id");
    }
    if block.id.contains(':') || final_block.id.contains(':') {
        return Err("block id contains ':'");
    }
    if block.id.trim() != block.id || final_block.id.trim() != final_block.id {
        return Err("block id has surrounding whitespace");
    }
    if final_block.number > block.number {
        return Err("final block is ahead of the cursor block");
    }
    Ok(())
}

/// Failure to parse or validate a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cursor '{input}': {reason}")]
pub struct CursorParseError {
    pub input: String,
    pub reason: &'static str,
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{CURSOR_VERSION}:{}:{}:{}:{}",
            self.block.number, self.block.id, self.final_block.number, self.final_block.id
        )?;
        if self.is_undo() {
            write!(f, ":{UNDO_SUFFIX}")?;
        }
        Ok(())
    }
}

impl FromStr for Cursor {
    type Err = CursorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| CursorParseError {
            input: s.to_string(),
            reason,
        };

        let parts: Vec<&str> = s.trim().split(':').collect();
        let (fields, step) = match parts.as_slice() {
            [fields @ .., last] if fields.len() == 5 && *last == UNDO_SUFFIX => {
                (fields, CursorStep::Undo)
            }
            fields => (fields, CursorStep::New),
        };
        let [version, number, id, final_number, final_id] = fields else {
            return Err(err("expected 5 ':'-separated fields"));
        };
        if *version != CURSOR_VERSION {
            return Err(err("unsupported cursor version"));
        }
        let number: u64 = number.parse().map_err(|_| err("block number is not a u64"))?;
        let final_number: u64 = final_number
            .parse()
            .map_err(|_| err("final block number is not a u64"))?;

        let block = BlockRef::new(number, *id);
        let final_block = BlockRef::new(final_number, *final_id);
        check_fields(&block, &final_block).map_err(err)?;
        Ok(Self {
            block,
            final_block,
            step,
        })
    }
}

impl From<Cursor> for String {
    fn from(c: Cursor) -> Self {
        c.to_string()
    }
}

impl TryFrom<String> for Cursor {
    type Error = CursorParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

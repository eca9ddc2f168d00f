//! Message mapper: turns block events into publish batches.
//!
//! Mapping is a pure function of its inputs: the same payload, cursor and
//! block number always produce the same batch, so a redelivered block maps
//! to exactly the messages that were (possibly) published before the crash.

use std::collections::BTreeMap;

use bytes::Bytes;
use prost::Message;

use crate::cursor::Cursor;
use crate::error::SinkError;
use crate::types::OutboundMessage;
use crate::wire::PublishOperations;

/// Attribute holding the cursor of the batch a message belongs to.
pub const CURSOR_ATTRIBUTE: &str = "cursor";
/// Attribute holding the undo target on control messages.
pub const LAST_VALID_BLOCK_ATTRIBUTE: &str = "LastValidBlock";
/// Attribute naming the control step.
pub const STEP_ATTRIBUTE: &str = "Step";
pub const STEP_UNDO: &str = "Undo";

/// Largest batch whose generated ordering keys still sort in emission order.
pub const MAX_MESSAGES_PER_BLOCK: usize = 100_000;

/// Highest block number whose generated keys sort across blocks. Past it the
/// block part outgrows its 9-digit pad, so keys only order within one block.
pub const MAX_CROSS_BLOCK_ORDERED: u64 = 999_999_999;

/// Ordering key for the `index`-th message of `block_number`.
pub fn ordering_key(block_number: u64, index: usize) -> String {
    format!("{block_number:09}_{index:05}")
}

/// Maps payloads and undo signals onto destinations.
#[derive(Debug, Clone)]
pub struct MessageMapper {
    default_destination: String,
    undo_destination: String,
}

impl MessageMapper {
    /// Messages without a topic, and undo markers, go to `default_destination`.
    pub fn new(default_destination: impl Into<String>) -> Self {
        let default_destination = default_destination.into();
        Self {
            undo_destination: default_destination.clone(),
            default_destination,
        }
    }

    /// Send undo markers somewhere other than the default destination.
    pub fn with_undo_destination(mut self, destination: impl Into<String>) -> Self {
        self.undo_destination = destination.into();
        self
    }

    pub fn default_destination(&self) -> &str {
        &self.default_destination
    }

    pub fn undo_destination(&self) -> &str {
        &self.undo_destination
    }

    /// Decode a block's payload into its publish batch.
    ///
    /// `cursor` is the cursor the stream will resume from once this block is
    /// handled; it is injected into every message.
    pub fn map_data_event(
        &self,
        payload: &[u8],
        cursor: &Cursor,
        block_number: u64,
    ) -> Result<Vec<OutboundMessage>, SinkError> {
        let ops = PublishOperations::decode(payload)
            .map_err(|e| SinkError::decode(block_number, format!("unmarshalling output: {e}")))?;

        if ops.messages.len() > MAX_MESSAGES_PER_BLOCK {
            return Err(SinkError::decode(
                block_number,
                format!(
                    "{} messages exceed the per-block limit of {MAX_MESSAGES_PER_BLOCK}",
                    ops.messages.len()
                ),
            ));
        }

        let cursor = cursor.to_string();
        let batch = ops
            .messages
            .into_iter()
            .enumerate()
            .map(|(index, m)| {
                let mut attributes: BTreeMap<String, String> =
                    m.attributes.into_iter().map(|a| (a.key, a.value)).collect();
                attributes.insert(CURSOR_ATTRIBUTE.to_string(), cursor.clone());

                let destination = if m.topic.is_empty() {
                    self.default_destination.clone()
                } else {
                    m.topic
                };
                let ordering_key = if m.ordering_key.is_empty() {
                    ordering_key(block_number, index)
                } else {
                    m.ordering_key
                };

                OutboundMessage {
                    destination,
                    body: Bytes::from(m.data),
                    attributes,
                    ordering_key: Some(ordering_key),
                }
            })
            .collect();
        Ok(batch)
    }

    /// The single control message marking a rollback to `last_valid_block`.
    pub fn map_undo_event(&self, last_valid_block: u64, cursor: &Cursor) -> Vec<OutboundMessage> {
        let attributes = BTreeMap::from([
            (LAST_VALID_BLOCK_ATTRIBUTE.to_string(), last_valid_block.to_string()),
            (STEP_ATTRIBUTE.to_string(), STEP_UNDO.to_string()),
            (CURSOR_ATTRIBUTE.to_string(), cursor.to_string()),
        ]);
        vec![OutboundMessage {
            destination: self.undo_destination.clone(),
            body: Bytes::new(),
            attributes,
            ordering_key: None,
        }]
    }
}

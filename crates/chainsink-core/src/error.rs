//! Error types for the publish pipeline.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors that stop the sink.
///
/// Every variant is fatal: the cursor is never advanced past a batch that
/// produced one of these, and the only recovery path is a restart from the
/// last saved cursor.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Decode error at block {block_number}: {reason}")]
    Decode { block_number: u64, reason: String },

    #[error("Destination '{destination}' not found (message {index})")]
    UnknownDestination { destination: String, index: usize },

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("Sink shut down{}", fmt_cause(.cause))]
    Shutdown { cause: Option<Arc<SinkError>> },

    #[error("Stream error: {0}")]
    Stream(String),
}

fn fmt_cause(cause: &Option<Arc<SinkError>>) -> String {
    match cause {
        Some(c) => format!(": {c}"),
        None => String::new(),
    }
}

impl SinkError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    pub fn decode(block_number: u64, reason: impl fmt::Display) -> Self {
        Self::Decode {
            block_number,
            reason: reason.to_string(),
        }
    }

    pub fn shutdown(cause: Option<Arc<SinkError>>) -> Self {
        Self::Shutdown { cause }
    }

    /// Returns `true` if the error is a shutdown, requested or propagated.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown { .. })
    }

    /// Unwraps shutdown causes down to the error that started it.
    pub fn root_cause(&self) -> &SinkError {
        match self {
            Self::Shutdown { cause: Some(c) } => c.root_cause(),
            other => other,
        }
    }
}

/// Failure reported by a broker for a single message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BrokerError(pub String);

impl BrokerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// One failed message inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishFailure {
    /// Position of the message in the batch.
    pub index: usize,
    pub destination: String,
    pub error: BrokerError,
}

/// Aggregate of every acknowledgment failure in one batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "{} of {attempted} messages failed to publish; last: {}",
    .failures.len(),
    last_failure(.failures)
)]
pub struct PublishError {
    /// Failures in dispatch order. Never empty.
    pub failures: Vec<PublishFailure>,
    /// Number of messages that were dispatched.
    pub attempted: usize,
}

fn last_failure(failures: &[PublishFailure]) -> String {
    failures
        .last()
        .map(|f| format!("message {} to '{}': {}", f.index, f.destination, f.error))
        .unwrap_or_default()
}

impl PublishError {
    /// The most recent failure, which is what single-cause callers log.
    pub fn last(&self) -> Option<&PublishFailure> {
        self.failures.last()
    }
}

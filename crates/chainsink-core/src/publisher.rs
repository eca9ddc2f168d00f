//! Fan-out publisher and the broker boundary.
//!
//! A batch is dispatched message by message (one broker call each), then all
//! acknowledgments are awaited together. The call only succeeds if every
//! message was acknowledged.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::error::{BrokerError, PublishError, PublishFailure, SinkError};
use crate::types::OutboundMessage;

// ─── Broker boundary ──────────────────────────────────────────────────────────

/// Pending acknowledgment for one published message.
///
/// Resolves to the broker-assigned message id.
pub struct PublishResult {
    inner: BoxFuture<'static, Result<String, BrokerError>>,
}

impl PublishResult {
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = Result<String, BrokerError>> + Send + 'static,
    {
        Self { inner: fut.boxed() }
    }

    /// An already-settled result.
    pub fn ready(result: Result<String, BrokerError>) -> Self {
        Self::new(futures::future::ready(result))
    }

    /// Wait for the broker's acknowledgment.
    pub async fn get(self) -> Result<String, BrokerError> {
        self.inner.await
    }
}

impl fmt::Debug for PublishResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishResult").finish_non_exhaustive()
    }
}

/// A broker-side handle for one destination (topic).
///
/// `publish` only dispatches; the returned [`PublishResult`] carries the
/// acknowledgment.
pub trait Destination: Send + Sync {
    fn publish(&self, message: OutboundMessage) -> PublishResult;
}

/// Static settings of a destination, fixed at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    /// Whether the broker delivers same-key messages in order. When disabled,
    /// ordering keys are stripped before dispatch.
    #[serde(default = "bool_true")]
    pub ordering_enabled: bool,
}

fn bool_true() -> bool {
    true
}

impl DestinationConfig {
    /// An ordered destination.
    pub fn ordered(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ordering_enabled: true,
        }
    }

    pub fn unordered(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ordering_enabled: false,
        }
    }
}

/// A destination handle together with its configuration.
#[derive(Clone)]
pub struct ResolvedDestination {
    pub config: DestinationConfig,
    pub handle: Arc<dyn Destination>,
}

impl fmt::Debug for ResolvedDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedDestination")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Maps destination names to handles.
pub trait DestinationResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<&ResolvedDestination>;
}

impl<R: DestinationResolver + ?Sized> DestinationResolver for Arc<R> {
    fn resolve(&self, name: &str) -> Option<&ResolvedDestination> {
        (**self).resolve(name)
    }
}

/// A fixed set of destinations registered at start-up.
///
/// One entry covers single-topic deployments; several cover multi-topic ones.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    destinations: HashMap<String, ResolvedDestination>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a destination; a later registration under the same name wins.
    pub fn register(mut self, config: DestinationConfig, handle: Arc<dyn Destination>) -> Self {
        self.destinations
            .insert(config.name.clone(), ResolvedDestination { config, handle });
        self
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.destinations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

impl DestinationResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Option<&ResolvedDestination> {
        self.destinations.get(name)
    }
}

// ─── Publisher ────────────────────────────────────────────────────────────────

/// Outcome of a fully acknowledged batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    /// Broker-assigned ids, in batch order.
    pub message_ids: Vec<String>,
}

/// Publishes one batch at a time.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish every message of `batch` and wait for all acknowledgments.
    ///
    /// Any error means the batch was not fully delivered.
    async fn publish(&self, batch: &[OutboundMessage]) -> Result<PublishReport, SinkError>;
}

/// Concurrent per-message publisher over a [`DestinationResolver`].
pub struct FanoutPublisher<R> {
    resolver: R,
    cancel: CancellationToken,
    span: Span,
}

impl<R: DestinationResolver> FanoutPublisher<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            cancel: CancellationToken::new(),
            span: Span::none(),
        }
    }

    /// Abandon outstanding acknowledgment waits once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Span every publish runs in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    async fn publish_batch(&self, batch: &[OutboundMessage]) -> Result<PublishReport, SinkError> {
        if self.cancel.is_cancelled() {
            return Err(SinkError::shutdown(None));
        }

        let mut pending = Vec::with_capacity(batch.len());
        let mut unknown = None;
        for (index, message) in batch.iter().enumerate() {
            let Some(dest) = self.resolver.resolve(&message.destination) else {
                unknown = Some(SinkError::UnknownDestination {
                    destination: message.destination.clone(),
                    index,
                });
                break;
            };

            let mut message = message.clone();
            if !dest.config.ordering_enabled {
                message.ordering_key = None;
            }
            tracing::debug!(
                destination = %message.destination,
                index,
                bytes = message.body.len(),
                ordering_key = message.ordering_key.as_deref().unwrap_or(""),
                "Publishing message"
            );
            let destination = message.destination.clone();
            pending.push((index, destination, dest.handle.publish(message)));
        }

        // Dispatched messages are awaited even when dispatch stopped early.
        let attempted = pending.len();
        let acks = join_all(
            pending
                .into_iter()
                .map(|(index, destination, result)| async move {
                    (index, destination, result.get().await)
                }),
        );
        let results = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::warn!(attempted, "Publish cancelled while waiting for acknowledgments");
                return Err(SinkError::shutdown(None));
            }
            results = acks => results,
        };

        if let Some(err) = unknown {
            tracing::error!(error = %err, dispatched = attempted, "Batch references an unknown destination");
            return Err(err);
        }

        let mut message_ids = Vec::with_capacity(attempted);
        let mut failures = Vec::new();
        for (index, destination, result) in results {
            match result {
                Ok(id) => message_ids.push(id),
                Err(error) => {
                    tracing::warn!(index, destination = %destination, error = %error, "Message not acknowledged");
                    failures.push(PublishFailure {
                        index,
                        destination,
                        error,
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(PublishError { failures, attempted }.into());
        }
        Ok(PublishReport {
            published: attempted,
            message_ids,
        })
    }
}

#[async_trait]
impl<R: DestinationResolver> Publisher for FanoutPublisher<R> {
    async fn publish(&self, batch: &[OutboundMessage]) -> Result<PublishReport, SinkError> {
        self.publish_batch(batch).instrument(self.span.clone()).await
    }
}

//! In-memory broker.
//!
//! Records every acknowledged message per destination in RAM and can be
//! told to fail a destination. Useful for tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chainsink_core::{
    BrokerError, Destination, DestinationConfig, OutboundMessage, PublishResult, StaticResolver,
};

#[derive(Debug, Clone)]
struct Failure {
    reason: String,
    once: bool,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<BTreeMap<String, Vec<OutboundMessage>>>,
    failures: Mutex<HashMap<String, Failure>>,
    next_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    /// Consume the failure configured for `destination`, if any.
    fn take_failure(&self, destination: &str) -> Option<String> {
        let mut failures = lock(&self.failures);
        let failure = failures.get(destination)?.clone();
        if failure.once {
            failures.remove(destination);
        }
        Some(failure.reason)
    }
}

/// A broker that keeps everything it acknowledges.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
    ack_delay: Option<Duration>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledge each message only after `delay`.
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = Some(delay);
        self
    }

    /// A publish handle for `name`.
    pub fn destination(&self, name: impl Into<String>) -> Arc<dyn Destination> {
        Arc::new(MemoryTopic {
            name: name.into(),
            inner: self.inner.clone(),
            ack_delay: self.ack_delay,
        })
    }

    /// A resolver holding a handle for every config in `destinations`.
    pub fn resolver(&self, destinations: &[DestinationConfig]) -> StaticResolver {
        destinations.iter().fold(StaticResolver::new(), |resolver, config| {
            resolver.register(config.clone(), self.destination(config.name.clone()))
        })
    }

    /// Reject every message sent to `destination` until [`heal`](Self::heal).
    pub fn fail(&self, destination: impl Into<String>, reason: impl Into<String>) {
        self.set_failure(destination.into(), reason.into(), false);
    }

    /// Reject only the next message sent to `destination`.
    pub fn fail_once(&self, destination: impl Into<String>, reason: impl Into<String>) {
        self.set_failure(destination.into(), reason.into(), true);
    }

    fn set_failure(&self, destination: String, reason: String, once: bool) {
        lock(&self.inner.failures).insert(destination, Failure { reason, once });
    }

    pub fn heal(&self, destination: &str) {
        lock(&self.inner.failures).remove(destination);
    }

    /// Messages acknowledged on `destination`, in dispatch order.
    pub fn published(&self, destination: &str) -> Vec<OutboundMessage> {
        lock(&self.inner.topics)
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_published(&self) -> usize {
        lock(&self.inner.topics).values().map(Vec::len).sum()
    }

    /// Destinations that received at least one message.
    pub fn destinations(&self) -> Vec<String> {
        lock(&self.inner.topics).keys().cloned().collect()
    }
}

struct MemoryTopic {
    name: String,
    inner: Arc<Inner>,
    ack_delay: Option<Duration>,
}

impl Destination for MemoryTopic {
    fn publish(&self, message: OutboundMessage) -> PublishResult {
        let result = match self.inner.take_failure(&self.name) {
            Some(reason) => {
                tracing::debug!(destination = %self.name, %reason, "Rejecting message");
                Err(BrokerError::new(reason))
            }
            None => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                lock(&self.inner.topics)
                    .entry(self.name.clone())
                    .or_default()
                    .push(message);
                Ok(format!("{}-{id}", self.name))
            }
        };

        match self.ack_delay {
            Some(delay) => PublishResult::new(async move {
                tokio::time::sleep(delay).await;
                result
            }),
            None => PublishResult::ready(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(dest: &str, body: &'static [u8]) -> OutboundMessage {
        OutboundMessage {
            destination: dest.into(),
            body: bytes::Bytes::from_static(body),
            attributes: BTreeMap::new(),
            ordering_key: None,
        }
    }

    #[tokio::test]
    async fn records_acknowledged_messages() {
        let broker = MemoryBroker::new();
        let topic = broker.destination("transfers");

        let id = topic.publish(msg("transfers", b"a")).get().await.unwrap();
        assert_eq!(id, "transfers-0");
        topic.publish(msg("transfers", b"b")).get().await.unwrap();

        assert_eq!(broker.published("transfers").len(), 2);
        assert_eq!(broker.total_published(), 2);
        assert!(broker.published("swaps").is_empty());
        assert_eq!(broker.destinations(), vec!["transfers".to_string()]);
    }

    #[tokio::test]
    async fn failures_reject_without_recording() {
        let broker = MemoryBroker::new();
        let topic = broker.destination("t");

        broker.fail_once("t", "quota exceeded");
        let err = topic.publish(msg("t", b"a")).get().await.unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
        topic.publish(msg("t", b"b")).get().await.unwrap();

        broker.fail("t", "down");
        assert!(topic.publish(msg("t", b"c")).get().await.is_err());
        assert!(topic.publish(msg("t", b"d")).get().await.is_err());
        broker.heal("t");
        topic.publish(msg("t", b"e")).get().await.unwrap();

        let bodies: Vec<_> = broker.published("t").into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![&b"b"[..], &b"e"[..]]);
    }

    #[tokio::test]
    async fn resolver_covers_configured_destinations() {
        use chainsink_core::DestinationResolver;

        let broker = MemoryBroker::new();
        let resolver = broker.resolver(&[
            DestinationConfig::ordered("a"),
            DestinationConfig::unordered("b"),
        ]);
        assert_eq!(resolver.names(), vec!["a", "b"]);
        assert!(!resolver.resolve("b").unwrap().config.ordering_enabled);
        assert!(resolver.resolve("c").is_none());
    }
}

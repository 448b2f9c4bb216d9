use super::{Acknowledger, Broker, Delivery, MessageId, Subscription};
use crate::{Attributes, BrokerError, OutboundMessage};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use core::time::Duration;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::mpsc;

/// How the broker treats negatively acknowledged messages.
#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    /// Deliveries per message before it is dead-lettered.
    pub max_delivery_attempts: u32,
    /// Delay before the first redelivery.
    pub min_backoff: Duration,
    /// Upper bound on the redelivery delay.
    pub max_backoff: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RedeliveryPolicy {
    /// Delay before redelivering a message whose `attempt`th delivery was
    /// nacked. Doubles per attempt, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.min_backoff
            .saturating_mul(1 << exp)
            .min(self.max_backoff)
    }
}

/// A message the broker gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub attributes: Attributes,
    pub attempts: u32,
}

/// Point-in-time counters of an [`InMemoryBroker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dead_lettered: u64,
}

/// An in-process broker with at-least-once, fan-out delivery.
///
/// Every subscription of a topic receives its own copy of each message.
/// Consumers that share a subscription compete for its messages. Nacked
/// messages are redelivered after [`RedeliveryPolicy::backoff`] until
/// [`RedeliveryPolicy::max_delivery_attempts`] is reached, at which point they
/// move to the dead-letter list.
///
/// Messages published while a topic has no subscription are accepted and
/// dropped, matching hosted pub/sub services.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Queued>>>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    policy: RedeliveryPolicy,
    max_message_bytes: usize,
    published: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Clone)]
struct Queued {
    message_id: MessageId,
    data: Bytes,
    attributes: Attributes,
    publish_time: DateTime<Utc>,
    attempt: u32,
}

impl InMemoryBroker {
    /// Default per-message size limit, payload plus attributes.
    pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

    pub fn new(policy: RedeliveryPolicy) -> Self {
        Self::with_message_limit(policy, Self::DEFAULT_MAX_MESSAGE_BYTES)
    }

    pub fn with_message_limit(policy: RedeliveryPolicy, max_message_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                dead_letters: Mutex::new(Vec::new()),
                policy,
                max_message_bytes,
                published: AtomicU64::new(0),
                acked: AtomicU64::new(0),
                nacked: AtomicU64::new(0),
                dead_lettered: AtomicU64::new(0),
            }),
        }
    }

    /// Creates `topic` if it does not exist yet.
    pub fn create_topic(&self, topic: &str) {
        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default();
    }

    /// Attaches a new subscription to `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TopicNotFound`] if the topic was never created.
    pub fn subscribe(&self, topic: &str) -> Result<Arc<MemorySubscription>, BrokerError> {
        let mut topics = self.inner.topics.lock();
        let subscribers = topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::TopicNotFound {
                topic: topic.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let requeue = tx.downgrade();
        subscribers.push(tx);

        Ok(Arc::new(MemorySubscription {
            rx: tokio::sync::Mutex::new(rx),
            requeue,
            inner: Arc::clone(&self.inner),
        }))
    }

    /// Deletes every topic. Subscriptions report
    /// [`BrokerError::SubscriptionClosed`] once drained.
    pub fn close(&self) {
        self.inner.topics.lock().clear();
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.inner.published.load(Ordering::Relaxed),
            acked: self.inner.acked.load(Ordering::Relaxed),
            nacked: self.inner.nacked.load(Ordering::Relaxed),
            dead_lettered: self.inner.dead_lettered.load(Ordering::Relaxed),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().clone()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(RedeliveryPolicy::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<MessageId, BrokerError> {
        let size = message.size();
        if size > self.inner.max_message_bytes {
            return Err(BrokerError::MessageTooLarge {
                size,
                limit: self.inner.max_message_bytes,
            });
        }

        let mut topics = self.inner.topics.lock();
        let subscribers = topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::TopicNotFound {
                topic: topic.to_string(),
            })?;

        let queued = Queued {
            message_id: MessageId::new(uuid::Uuid::new_v4().to_string()),
            data: message.data,
            attributes: message.attributes,
            publish_time: Utc::now(),
            attempt: 1,
        };

        // Forget subscriptions whose receiving side was dropped.
        subscribers.retain(|tx| tx.send(queued.clone()).is_ok());
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        Ok(queued.message_id)
    }
}

/// A subscription created by [`InMemoryBroker::subscribe`].
pub struct MemorySubscription {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>,
    requeue: mpsc::WeakUnboundedSender<Queued>,
    inner: Arc<Inner>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn pull(&self) -> Result<Delivery, BrokerError> {
        let queued = {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or(BrokerError::SubscriptionClosed)?
        };

        let acker = MemoryAcker {
            queued: queued.clone(),
            requeue: self.requeue.clone(),
            inner: Arc::clone(&self.inner),
        };

        Ok(Delivery::new(
            queued.message_id,
            queued.data,
            queued.attributes,
            queued.publish_time,
            queued.attempt,
            Box::new(acker),
        ))
    }
}

struct MemoryAcker {
    queued: Queued,
    requeue: mpsc::WeakUnboundedSender<Queued>,
    inner: Arc<Inner>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.inner.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self) -> Result<(), BrokerError> {
        self.inner.nacked.fetch_add(1, Ordering::Relaxed);

        let attempt = self.queued.attempt;
        if attempt >= self.inner.policy.max_delivery_attempts {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                message_id = %self.queued.message_id,
                attempt,
                "Dead-lettering message after final delivery attempt"
            );
            self.inner.dead_lettered.fetch_add(1, Ordering::Relaxed);
            self.inner.dead_letters.lock().push(DeadLetter {
                message_id: self.queued.message_id.clone(),
                attributes: self.queued.attributes.clone(),
                attempts: attempt,
            });
            return Ok(());
        }

        let delay = self.inner.policy.backoff(attempt);
        let requeue = self.requeue.clone();
        let mut next = self.queued.clone();
        next.attempt += 1;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The subscription may be gone by now; the message goes with it.
            if let Some(tx) = requeue.upgrade() {
                let _ = tx.send(next);
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Chunk;

    const TOPIC: &str = "chunks";

    fn fast_policy(max_delivery_attempts: u32) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_delivery_attempts,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    fn message(i: usize) -> OutboundMessage {
        OutboundMessage::encode(
            "job",
            &Chunk {
                sequence_index: i,
                text: format!("chunk {i}"),
                approx_token_count: 1,
            },
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RedeliveryPolicy {
            max_delivery_attempts: 10,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn publish_to_unknown_topic_fails() {
        let broker = InMemoryBroker::default();
        let err = broker.publish("nope", message(0)).await.unwrap_err();
        assert_eq!(
            err,
            BrokerError::TopicNotFound {
                topic: "nope".to_string()
            }
        );
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let broker = InMemoryBroker::with_message_limit(fast_policy(1), 8);
        broker.create_topic(TOPIC);
        let err = broker.publish(TOPIC, message(0)).await.unwrap_err();
        assert!(matches!(err, BrokerError::MessageTooLarge { limit: 8, .. }));
    }

    #[tokio::test]
    async fn every_subscription_gets_a_copy() {
        let broker = InMemoryBroker::default();
        broker.create_topic(TOPIC);
        let a = broker.subscribe(TOPIC).unwrap();
        let b = broker.subscribe(TOPIC).unwrap();

        let id = broker.publish(TOPIC, message(3)).await.unwrap();

        let da = a.pull().await.unwrap();
        let db = b.pull().await.unwrap();
        assert_eq!(da.message_id, id);
        assert_eq!(db.message_id, id);
        assert_eq!(da.attempt, 1);
        da.ack().await.unwrap();
        db.ack().await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.acked, 2);
    }

    #[tokio::test]
    async fn nack_redelivers_with_incremented_attempt() {
        let broker = InMemoryBroker::new(fast_policy(3));
        broker.create_topic(TOPIC);
        let sub = broker.subscribe(TOPIC).unwrap();
        let id = broker.publish(TOPIC, message(0)).await.unwrap();

        let first = sub.pull().await.unwrap();
        assert_eq!(first.attempt, 1);
        first.nack().await.unwrap();

        let second = sub.pull().await.unwrap();
        assert_eq!(second.message_id, id);
        assert_eq!(second.attempt, 2);
        second.ack().await.unwrap();

        assert_eq!(broker.stats().nacked, 1);
        assert!(broker.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn dead_letters_after_max_attempts() {
        let broker = InMemoryBroker::new(fast_policy(2));
        broker.create_topic(TOPIC);
        let sub = broker.subscribe(TOPIC).unwrap();
        let id = broker.publish(TOPIC, message(4)).await.unwrap();

        sub.pull().await.unwrap().nack().await.unwrap();
        let last = sub.pull().await.unwrap();
        assert_eq!(last.attempt, 2);
        last.nack().await.unwrap();

        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, id);
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(broker.stats().dead_lettered, 1);

        // Nothing is redelivered once dead-lettered.
        broker.close();
        assert_eq!(
            sub.pull().await.unwrap_err(),
            BrokerError::SubscriptionClosed
        );
    }

    #[tokio::test]
    async fn close_ends_subscriptions_after_draining() {
        let broker = InMemoryBroker::default();
        broker.create_topic(TOPIC);
        let sub = broker.subscribe(TOPIC).unwrap();
        broker.publish(TOPIC, message(0)).await.unwrap();
        broker.close();

        assert!(sub.pull().await.is_ok());
        assert_eq!(
            sub.pull().await.unwrap_err(),
            BrokerError::SubscriptionClosed
        );
    }
}

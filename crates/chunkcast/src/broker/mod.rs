//! Publish/subscribe broker interface.
//!
//! The pipeline depends on two narrow capabilities of a broker:
//!
//! - [`Broker::publish`]: submit a payload with attributes to a topic and get
//!   back the identifier the broker assigned once it has accepted the message.
//! - [`Subscription::pull`]: receive one [`Delivery`], which must later be
//!   settled with [`Delivery::ack`] or [`Delivery::nack`].
//!
//! Delivery is at-least-once and unordered. Provisioning topics and
//! subscriptions is left to the concrete broker; see [`InMemoryBroker`] for the
//! in-process implementation.

mod memory;

pub use memory::*;

use crate::{Attributes, BrokerError, OutboundMessage};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};

/// Opaque identifier a broker assigns to an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Topic-based publisher.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes one message and resolves once the broker acknowledged
    /// receipt.
    async fn publish(&self, topic: &str, message: OutboundMessage)
    -> Result<MessageId, BrokerError>;
}

/// Pull side of a subscription. Safe to share between concurrent consumers.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Waits for the next delivery.
    ///
    /// Returns [`BrokerError::SubscriptionClosed`] once no further deliveries
    /// can arrive.
    async fn pull(&self) -> Result<Delivery, BrokerError>;
}

/// Settles a single delivery with the broker that produced it.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// The message was handled; do not redeliver it.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// The message was not handled; redeliver it according to the broker's
    /// redelivery policy.
    async fn nack(&self) -> Result<(), BrokerError>;
}

/// One delivery attempt of a message.
///
/// Settling consumes the delivery, so a message can be acked or nacked at
/// most once per attempt.
pub struct Delivery {
    pub message_id: MessageId,
    pub data: Bytes,
    pub attributes: Attributes,
    pub publish_time: DateTime<Utc>,
    /// 1 for the first delivery, incremented on every redelivery.
    pub attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        message_id: MessageId,
        data: Bytes,
        attributes: Attributes,
        publish_time: DateTime<Utc>,
        attempt: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            message_id,
            data,
            attributes,
            publish_time,
            attempt,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self) -> Result<(), BrokerError> {
        self.acker.nack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("bytes", &self.data.len())
            .field("attributes", &self.attributes)
            .field("publish_time", &self.publish_time)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    struct NoopAcker;

    #[async_trait]
    impl Acknowledger for NoopAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn nack(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    /// A delivery that is not attached to any broker.
    pub(crate) fn detached_delivery(data: Bytes, attributes: Attributes) -> Delivery {
        Delivery::new(
            MessageId::new("detached"),
            data,
            attributes,
            Utc::now(),
            1,
            Box::new(NoopAcker),
        )
    }
}

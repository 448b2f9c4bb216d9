//! Publishes chunks to the broker topic.
//!
//! Each chunk becomes one independent message. Publishes run concurrently up
//! to [`DispatchConfig::max_inflight`], and message identifiers are returned in
//! chunk order regardless of which publish finished first.
//!
//! A publish attempt that fails with a transient [`BrokerError`] or exceeds
//! [`DispatchConfig::publish_timeout`] is retried with exponential backoff.
//! Once [`DispatchConfig::max_attempts`] is spent, the whole dispatch fails with
//! [`Error::PublishFailure`] naming the chunk. Chunks already accepted by the
//! broker stay published.

use crate::{Broker, BrokerError, Chunk, Error, MessageId, OutboundMessage, Result};
use core::time::Duration;
use futures::{StreamExt, TryStreamExt, stream};
use std::sync::Arc;

/// Retry, timeout and concurrency settings of a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Attempts per chunk, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_backoff: Duration,
    /// Upper bound on the delay between attempts.
    pub max_backoff: Duration,
    /// Deadline for a single publish attempt.
    pub publish_timeout: Duration,
    /// Publishes awaiting broker acknowledgement at any time.
    pub max_inflight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(10),
            max_inflight: 16,
        }
    }
}

impl DispatchConfig {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for zero attempts, zero
    /// in-flight publishes or a zero publish timeout.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfiguration {
                reason: "max_attempts must be greater than 0".to_string(),
            });
        }
        if self.max_inflight == 0 {
            return Err(Error::InvalidConfiguration {
                reason: "max_inflight must be greater than 0".to_string(),
            });
        }
        if self.publish_timeout.is_zero() {
            return Err(Error::InvalidConfiguration {
                reason: "publish_timeout must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Delay after the `attempt`th failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1 << exp)
            .min(self.max_backoff)
    }
}

/// Publishes a job's chunks to one topic.
#[derive(Clone)]
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    topic: String,
    config: DispatchConfig,
}

impl Dispatcher {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if `config` does not validate.
    pub fn new(
        broker: Arc<dyn Broker>,
        topic: impl Into<String>,
        config: DispatchConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            broker,
            topic: topic.into(),
            config,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes every chunk of `job_id` and returns one message identifier
    /// per chunk, in the order given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PublishFailure`] for the first chunk that could not be
    /// published. Publishes still in flight at that point are abandoned.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(job_id = %job_id, chunks = chunks.len())))]
    pub async fn publish(&self, job_id: &str, chunks: &[Chunk]) -> Result<Vec<MessageId>> {
        // Collected first: a mapping closure inside the stream makes the
        // callers' futures lose `Send`.
        let pending: Vec<_> = chunks
            .iter()
            .map(|chunk| self.publish_one(job_id, chunk))
            .collect();

        stream::iter(pending)
            .buffered(self.config.max_inflight)
            .try_collect()
            .await
    }

    async fn publish_one(&self, job_id: &str, chunk: &Chunk) -> Result<MessageId> {
        let message = OutboundMessage::encode(job_id, chunk);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = tokio::time::timeout(
                self.config.publish_timeout,
                self.broker.publish(&self.topic, message.clone()),
            )
            .await
            .unwrap_or_else(|_| Err(BrokerError::Unavailable("publish timed out".to_string())));

            match outcome {
                Ok(id) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(
                        sequence_index = chunk.sequence_index,
                        message_id = %id,
                        attempt,
                        "Chunk published"
                    );
                    return Ok(id);
                }
                Err(source) if source.is_transient() && attempt < self.config.max_attempts => {
                    let delay = self.config.backoff(attempt);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        sequence_index = chunk.sequence_index,
                        attempt,
                        ?delay,
                        "Publish rejected, retrying: {source}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        sequence_index = chunk.sequence_index,
                        attempt,
                        "Giving up on chunk: {source}"
                    );
                    return Err(Error::PublishFailure {
                        sequence_index: chunk.sequence_index,
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}

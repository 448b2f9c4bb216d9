//! Per-message chunk processing.
//!
//! A [`Worker`] is triggered once per delivered message. It rebuilds the chunk
//! from the wire contract, calls the completion service and decides how the
//! delivery is settled:
//!
//! | Outcome                                   | Settlement | Result            |
//! |-------------------------------------------|------------|-------------------|
//! | Completion succeeded                      | ack        | `Success`         |
//! | Retryable failure, attempts left          | nack       | none (redelivery) |
//! | Retryable failure, final attempt          | ack        | `Failure`         |
//! | Permanent failure or unreadable payload   | ack        | `Failure`         |
//! | Attributes missing, no slot to report to  | ack        | none              |
//!
//! Workers hold no mutable state; any number may run concurrently.

use crate::{
    CompletionError, CompletionRequest, CompletionService, Delivery, MessageEnvelope,
    ProcessedResult, Result, Routing, render_prompt,
};
use async_trait::async_trait;
use core::time::Duration;
use std::sync::Arc;

/// Receives the results Workers produce.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn submit(&self, job_id: &str, result: ProcessedResult) -> Result<()>;
}

/// Settings shared by every invocation of a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prompt template; `{chunk}` is replaced by the chunk text.
    pub prompt_template: String,
    /// Output bound passed to the completion service.
    pub max_output_tokens: u32,
    /// Deadline for a single completion call.
    pub completion_timeout: Duration,
    /// Must match the broker's redelivery bound: on this attempt a retryable
    /// failure is recorded instead of nacked.
    pub max_delivery_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            prompt_template: crate::PROMPT_PLACEHOLDER.to_string(),
            max_output_tokens: 512,
            completion_timeout: Duration::from_secs(60),
            max_delivery_attempts: 5,
        }
    }
}

/// Why processing a chunk failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingFailure {
    /// Worth another delivery (timeout, rate limit, unavailable service).
    Retryable(String),
    /// Will fail again (bad input, permanent API error).
    Permanent(String),
}

impl From<CompletionError> for ProcessingFailure {
    fn from(err: CompletionError) -> Self {
        if err.is_retryable() {
            Self::Retryable(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

/// How a delivery is settled and what, if anything, it reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge and report `result` for `job_id`.
    Ack {
        job_id: String,
        result: ProcessedResult,
    },
    /// Negatively acknowledge so the broker redelivers.
    Nack {
        job_id: String,
        sequence_index: usize,
        reason: String,
    },
    /// Acknowledge without a result: the message names no slot.
    Drop { reason: String },
}

/// Stateless chunk processor.
#[derive(Clone)]
pub struct Worker {
    completion: Arc<dyn CompletionService>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(completion: Arc<dyn CompletionService>, config: WorkerConfig) -> Self {
        Self { completion, config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Decides the disposition of one delivery without settling it.
    pub async fn handle(&self, delivery: &Delivery) -> Disposition {
        let routing = match Routing::from_attributes(&delivery.attributes) {
            Ok(routing) => routing,
            Err(e) => {
                return Disposition::Drop {
                    reason: e.to_string(),
                };
            }
        };

        let envelope = match MessageEnvelope::decode(delivery) {
            Ok((_, envelope)) => envelope,
            Err(e) => {
                return Disposition::Ack {
                    job_id: routing.job_id,
                    result: ProcessedResult::failure(routing.sequence_index, e.to_string()),
                };
            }
        };

        let sequence_index = envelope.chunk.sequence_index;
        match self.complete(&envelope.chunk.text).await {
            Ok(output) => Disposition::Ack {
                job_id: routing.job_id,
                result: ProcessedResult::success(sequence_index, output),
            },
            Err(ProcessingFailure::Retryable(reason))
                if delivery.attempt < self.config.max_delivery_attempts =>
            {
                Disposition::Nack {
                    job_id: routing.job_id,
                    sequence_index,
                    reason,
                }
            }
            Err(ProcessingFailure::Retryable(reason)) => Disposition::Ack {
                job_id: routing.job_id,
                result: ProcessedResult::failure(
                    sequence_index,
                    format!(
                        "retries exhausted after {} attempt(s): {reason}",
                        delivery.attempt
                    ),
                ),
            },
            Err(ProcessingFailure::Permanent(reason)) => Disposition::Ack {
                job_id: routing.job_id,
                result: ProcessedResult::failure(sequence_index, reason),
            },
        }
    }

    /// Handles one delivery end to end: reports the result to `sink`, then
    /// settles the delivery with the broker.
    ///
    /// The result is reported before acknowledging, so a crash between the two
    /// leads to a redelivery and an idempotent overwrite rather than a lost
    /// result.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(message_id = %delivery.message_id, attempt = delivery.attempt)))]
    pub async fn process(&self, delivery: Delivery, sink: &dyn ResultSink) -> Disposition {
        let disposition = self.handle(&delivery).await;

        let settled = match &disposition {
            Disposition::Ack { job_id, result } => {
                if let Err(_e) = sink.submit(job_id, result.clone()).await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(job_id = %job_id, "Result for chunk {} not recorded: {_e}", result.sequence_index);
                }
                delivery.ack().await
            }
            Disposition::Nack {
                sequence_index: _sequence_index,
                reason: _reason,
                ..
            } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Chunk {_sequence_index} will be redelivered: {_reason}");
                delivery.nack().await
            }
            Disposition::Drop { reason: _reason } => {
                #[cfg(feature = "tracing")]
                tracing::error!("Dropping unroutable message: {_reason}");
                delivery.ack().await
            }
        };

        if let Err(_e) = settled {
            #[cfg(feature = "tracing")]
            tracing::warn!("Failed to settle delivery: {_e}");
        }

        disposition
    }

    async fn complete(&self, text: &str) -> core::result::Result<String, ProcessingFailure> {
        let request = CompletionRequest {
            prompt: render_prompt(&self.config.prompt_template, text),
            max_output_tokens: self.config.max_output_tokens,
        };

        match tokio::time::timeout(
            self.config.completion_timeout,
            self.completion.complete(request),
        )
        .await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(CompletionError::Timeout.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Attributes, Chunk, InMemoryBroker, OutboundMessage, RedeliveryPolicy, Subscription,
        broker::tests::detached_delivery,
    };
    use bytes::Bytes;
    use parking_lot::Mutex;

    /// Returns scripted outcomes in order, then echoes the prompt.
    struct Scripted {
        outcomes: Mutex<Vec<core::result::Result<String, CompletionError>>>,
        prompts: Mutex<Vec<CompletionRequest>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<core::result::Result<String, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into_iter().rev().collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionService for Scripted {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> core::result::Result<String, CompletionError> {
            self.prompts.lock().push(request.clone());
            self.outcomes
                .lock()
                .pop()
                .unwrap_or_else(|| Ok(request.prompt.to_uppercase()))
        }
    }

    struct Hang;

    #[async_trait]
    impl CompletionService for Hang {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> core::result::Result<String, CompletionError> {
            futures::future::pending().await
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<(String, ProcessedResult)>>);

    #[async_trait]
    impl ResultSink for Collect {
        async fn submit(&self, job_id: &str, result: ProcessedResult) -> Result<()> {
            self.0.lock().push((job_id.to_string(), result));
            Ok(())
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            prompt_template: "Summarize: {chunk}".to_string(),
            max_output_tokens: 64,
            completion_timeout: Duration::from_millis(50),
            max_delivery_attempts: 3,
        }
    }

    fn delivery_for(index: usize, text: &str, attempt: u32) -> Delivery {
        let msg = OutboundMessage::encode(
            "job-9",
            &Chunk {
                sequence_index: index,
                text: text.to_string(),
                approx_token_count: 1,
            },
        );
        let mut delivery = detached_delivery(msg.data, msg.attributes);
        delivery.attempt = attempt;
        delivery
    }

    #[tokio::test]
    async fn success_is_acked_with_output() {
        let completion = Scripted::new(vec![Ok("short".into())]);
        let worker = Worker::new(completion.clone(), config());

        let disposition = worker.handle(&delivery_for(2, "long text", 1)).await;
        assert_eq!(
            disposition,
            Disposition::Ack {
                job_id: "job-9".into(),
                result: ProcessedResult::success(2, "short"),
            }
        );

        let prompts = completion.prompts.lock();
        assert_eq!(prompts[0].prompt, "Summarize: long text");
        assert_eq!(prompts[0].max_output_tokens, 64);
    }

    #[tokio::test]
    async fn retryable_failure_is_nacked() {
        let worker = Worker::new(Scripted::new(vec![Err(CompletionError::RateLimited)]), config());
        let disposition = worker.handle(&delivery_for(1, "x", 1)).await;
        assert!(matches!(
            disposition,
            Disposition::Nack { sequence_index: 1, .. }
        ));
    }

    #[tokio::test]
    async fn retryable_failure_on_last_attempt_becomes_failure() {
        let worker = Worker::new(Scripted::new(vec![Err(CompletionError::RateLimited)]), config());
        let Disposition::Ack { result, .. } = worker.handle(&delivery_for(1, "x", 3)).await else {
            panic!("expected ack");
        };
        assert_eq!(result.sequence_index, 1);
        assert_eq!(result.output_text, "");
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn permanent_failure_is_acked_as_failure() {
        let worker = Worker::new(
            Scripted::new(vec![Err(CompletionError::InvalidInput("too long".into()))]),
            config(),
        );
        let disposition = worker.handle(&delivery_for(0, "x", 1)).await;
        assert_eq!(
            disposition,
            Disposition::Ack {
                job_id: "job-9".into(),
                result: ProcessedResult::failure(0, "Invalid input: too long"),
            }
        );
    }

    #[tokio::test]
    async fn completion_timeout_is_retryable() {
        let worker = Worker::new(Arc::new(Hang), config());
        let disposition = worker.handle(&delivery_for(5, "x", 1)).await;
        assert!(matches!(
            disposition,
            Disposition::Nack { sequence_index: 5, ref reason, .. } if reason == "Completion timed out"
        ));
    }

    #[tokio::test]
    async fn unreadable_payload_fails_its_slot() {
        let msg = OutboundMessage::encode(
            "job-9",
            &Chunk {
                sequence_index: 4,
                text: String::new(),
                approx_token_count: 0,
            },
        );
        let delivery = detached_delivery(Bytes::from_static(&[0xc3, 0x28]), msg.attributes);
        let worker = Worker::new(Scripted::new(vec![]), config());

        let Disposition::Ack { result, .. } = worker.handle(&delivery).await else {
            panic!("expected ack");
        };
        assert_eq!(result, ProcessedResult::failure(4, "Payload is not valid UTF-8"));
    }

    #[tokio::test]
    async fn missing_attributes_are_dropped() {
        let delivery = detached_delivery(Bytes::from_static(b"text"), Attributes::new());
        let worker = Worker::new(Scripted::new(vec![]), config());
        assert!(matches!(
            worker.handle(&delivery).await,
            Disposition::Drop { .. }
        ));
    }

    #[tokio::test]
    async fn process_settles_with_the_broker() {
        let broker = InMemoryBroker::new(RedeliveryPolicy {
            max_delivery_attempts: 3,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        });
        broker.create_topic("t");
        let sub = broker.subscribe("t").unwrap();
        let chunk = Chunk {
            sequence_index: 0,
            text: "hello".into(),
            approx_token_count: 5,
        };
        crate::Broker::publish(&broker, "t", OutboundMessage::encode("job-9", &chunk))
            .await
            .unwrap();

        let worker = Worker::new(
            Scripted::new(vec![Err(CompletionError::Timeout)]),
            config(),
        );
        let sink = Collect::default();

        // First attempt times out and is redelivered, second succeeds.
        let first = worker.process(sub.pull().await.unwrap(), &sink).await;
        assert!(matches!(first, Disposition::Nack { .. }));
        let second = worker.process(sub.pull().await.unwrap(), &sink).await;
        assert!(matches!(second, Disposition::Ack { .. }));

        let collected = sink.0.lock();
        assert_eq!(
            *collected,
            [(
                "job-9".to_string(),
                ProcessedResult::success(0, "SUMMARIZE: HELLO")
            )]
        );
        let stats = broker.stats();
        assert_eq!((stats.acked, stats.nacked), (1, 1));
    }

    #[test]
    fn failure_classification() {
        assert_eq!(
            ProcessingFailure::from(CompletionError::Unavailable("502".into())),
            ProcessingFailure::Retryable("Completion service unavailable: 502".into())
        );
        assert_eq!(
            ProcessingFailure::from(CompletionError::Permanent("401".into())),
            ProcessingFailure::Permanent("Completion failed: 401".into())
        );
    }
}

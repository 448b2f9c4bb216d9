//! Chunk, open, publish: the producer side of a job.

use crate::{
    Aggregator, Broker, Chunker, DispatchConfig, Dispatcher, Error, Job, JobStatus, MessageId,
    Result,
};
use chrono::{TimeDelta, Utc};
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Settings of a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Token budget per chunk.
    pub max_tokens: usize,
    /// Time a job has to collect every result, counted from submission.
    pub job_deadline: Duration,
    pub dispatch: DispatchConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            job_deadline: Duration::from_secs(600),
            dispatch: DispatchConfig::default(),
        }
    }
}

/// A job that has been chunked and published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub job_id: String,
    pub total_chunks: usize,
    pub message_ids: Vec<MessageId>,
}

/// Entry point for new jobs.
///
/// Chunks the input, registers the job with the [`Aggregator`] and publishes
/// one message per chunk through a [`Dispatcher`]. Results come back through
/// whichever Workers consume the topic.
pub struct Pipeline {
    chunker: Chunker,
    dispatcher: Dispatcher,
    aggregator: Arc<Aggregator>,
    job_deadline: TimeDelta,
}

impl Pipeline {
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] for a zero token budget, an invalid
    /// dispatch configuration or a deadline chrono cannot represent.
    pub fn new(
        broker: Arc<dyn Broker>,
        topic: impl Into<String>,
        aggregator: Arc<Aggregator>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let job_deadline =
            TimeDelta::from_std(config.job_deadline).map_err(|e| Error::InvalidConfiguration {
                reason: format!("job_deadline: {e}"),
            })?;
        if job_deadline <= TimeDelta::zero() {
            return Err(Error::InvalidConfiguration {
                reason: "job_deadline must be greater than 0".to_string(),
            });
        }

        Ok(Self {
            chunker: Chunker::new(config.max_tokens)?,
            dispatcher: Dispatcher::new(broker, topic, config.dispatch)?,
            aggregator,
            job_deadline,
        })
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    /// Chunks and publishes `text` as a new job.
    ///
    /// Text without words produces a job that is complete immediately. If any
    /// chunk cannot be published the job is marked failed and the publish
    /// error returned.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(bytes = text.len())))]
    pub async fn submit(&self, text: &str) -> Result<Submission> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let chunks = self.chunker.chunk(text);
        let now = Utc::now();

        self.aggregator
            .open(Job::new(
                job_id.clone(),
                chunks.len(),
                now,
                now + self.job_deadline,
            ))
            .await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(job_id = %job_id, "Opened job with {} chunk(s)", chunks.len());

        let message_ids = match self.dispatcher.publish(&job_id, &chunks).await {
            Ok(ids) => ids,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(job_id = %job_id, "Dispatch failed: {e}");
                if let Err(_fail_err) = self.aggregator.fail(&job_id, e.to_string()).await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(job_id = %job_id, "Could not mark job failed: {_fail_err}");
                }
                return Err(e);
            }
        };

        Ok(Submission {
            job_id,
            total_chunks: chunks.len(),
            message_ids,
        })
    }

    /// Submits `text` and waits for the assembled output.
    ///
    /// # Errors
    ///
    /// Besides submission errors: [`Error::JobTimeout`] with the indices that
    /// never reported, [`Error::JobCancelled`] and [`Error::JobFailed`].
    pub async fn run(&self, text: &str) -> Result<String> {
        let submission = self.submit(text).await?;
        let job_id = submission.job_id;

        match self.aggregator.wait(&job_id).await? {
            JobStatus::Complete { output } => Ok(output),
            JobStatus::TimedOut { missing } => Err(Error::JobTimeout { job_id, missing }),
            JobStatus::Cancelled => Err(Error::JobCancelled { job_id }),
            JobStatus::Failed { reason } => Err(Error::JobFailed { job_id, reason }),
            JobStatus::InProgress { .. } => Err(Error::ChannelError {
                context: "wait resolved before the job finished".to_string(),
            }),
        }
    }
}

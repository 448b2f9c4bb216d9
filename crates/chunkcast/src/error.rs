//! Error types for the chunk-and-dispatch pipeline.
//!
//! This module defines the central [`Error`] enum, which captures every failure
//! that aborts a pipeline operation, along with the narrower error types of the
//! external collaborators ([`BrokerError`], [`CompletionError`]) and of the
//! wire codec ([`DecodeError`]).
//!
//! ## Propagation
//!
//! - Chunker and Dispatcher errors abort job creation and surface to the
//!   caller.
//! - Worker errors never surface as [`Error`]: they degrade into a per-chunk
//!   failure result or a negative acknowledgement (see [`crate::Disposition`]).
//! - Jobs that miss their deadline surface as [`Error::JobTimeout`] with the
//!   indices that never reported back.

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for pipeline operations.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A chunking or dispatch parameter was out of range.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// The broker rejected a chunk after every retry was spent.
    #[error("Failed to publish chunk {sequence_index} after {attempts} attempt(s): {source}")]
    PublishFailure {
        sequence_index: usize,
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    /// The job did not collect every result before its deadline.
    #[error("Job {job_id} timed out with {} missing chunk(s): {missing:?}", missing.len())]
    JobTimeout { job_id: String, missing: Vec<usize> },

    /// No job with this identifier is known to the store.
    #[error("Job {job_id} not found")]
    JobNotFound { job_id: String },

    /// A result named a slot outside `[0, total_chunks)`.
    #[error("Job {job_id} has {total_chunks} chunk(s), got a result for chunk {sequence_index}")]
    ResultOutOfRange {
        job_id: String,
        sequence_index: usize,
        total_chunks: usize,
    },

    /// A job with this identifier was already opened.
    #[error("Job {job_id} already exists")]
    JobAlreadyExists { job_id: String },

    /// The job was cancelled before it completed.
    #[error("Job {job_id} was cancelled")]
    JobCancelled { job_id: String },

    /// The job was abandoned, usually because dispatch failed.
    #[error("Job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    /// Internal channel send/receive failure between tasks.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The pipeline is shutting down and refuses new work.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

/// Failures reported by a [`crate::Broker`] implementation.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum BrokerError {
    /// The topic does not exist.
    #[error("Topic {topic} not found")]
    TopicNotFound { topic: String },

    /// The message exceeds what the broker accepts.
    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    /// Publish quota exhausted; retry later.
    #[error("Publish quota exceeded")]
    QuotaExceeded,

    /// The broker could not be reached or did not answer in time.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The subscription is closed and will yield no more deliveries.
    #[error("Subscription closed")]
    SubscriptionClosed,
}

impl BrokerError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::QuotaExceeded | Self::Unavailable(_))
    }
}

/// Typed failures of a [`crate::CompletionService`].
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum CompletionError {
    /// The service throttled the request.
    #[error("Rate limited")]
    RateLimited,

    /// The call did not finish within its deadline.
    #[error("Completion timed out")]
    Timeout,

    /// The service is temporarily failing (5xx, connection reset).
    #[error("Completion service unavailable: {0}")]
    Unavailable(String),

    /// The prompt was rejected as malformed or too large.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Any other error the service will keep returning for this input.
    #[error("Completion failed: {0}")]
    Permanent(String),
}

impl CompletionError {
    /// Whether redelivering the same chunk later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout | Self::Unavailable(_))
    }
}

/// Failures while turning a delivery back into a chunk.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Missing attribute `{0}`")]
    MissingAttribute(&'static str),

    #[error("Attribute `{name}` has invalid value {value:?}")]
    InvalidAttribute { name: &'static str, value: String },

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,
}

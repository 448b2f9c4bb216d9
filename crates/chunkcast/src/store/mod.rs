//! Job state and the store that persists it across Worker invocations.
//!
//! A [`Job`] tracks which slots of a chunked input have reported back. The
//! upsert-then-check-completeness step ([`Job::apply`]) is the pipeline's one
//! critical section: a [`JobStore`] must run it under mutual exclusion per job
//! so that exactly one caller observes the transition to complete.

mod memory;

pub use memory::*;

use crate::{ProcessedResult, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle of a [`Job`]. Every state but `InProgress` is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobState {
    InProgress,
    Complete,
    Cancelled,
    TimedOut,
    Failed(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// One chunk-and-dispatch run over one input text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub total_chunks: usize,
    pub results: BTreeMap<usize, ProcessedResult>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// What a single [`Job::apply`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Stored; the job still waits for other slots.
    Recorded { received: usize, total: usize },
    /// Stored, and this result completed the job.
    Completed(Job),
    /// The deadline had passed; the job is now timed out and the result was
    /// not stored.
    Expired(Job),
    /// The job was already finished; the result was not stored.
    Discarded(Job),
    /// The result names a slot the job does not have.
    OutOfRange { total: usize },
}

/// Result of a state change requested on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub job: Job,
    /// `false` when the job had already finished and was left untouched.
    pub changed: bool,
}

impl Job {
    /// A new job expecting `total_chunks` results. A job with no chunks is
    /// complete from the start.
    pub fn new(
        job_id: impl Into<String>,
        total_chunks: usize,
        created_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            total_chunks,
            results: BTreeMap::new(),
            state: if total_chunks == 0 {
                JobState::Complete
            } else {
                JobState::InProgress
            },
            created_at,
            deadline,
        }
    }

    pub fn received(&self) -> usize {
        self.results.len()
    }

    /// Whether every slot in `[0, total_chunks)` holds a result.
    pub fn has_all_results(&self) -> bool {
        self.results.len() == self.total_chunks
    }

    /// Slots still waiting for a result, ascending.
    pub fn missing(&self) -> Vec<usize> {
        (0..self.total_chunks)
            .filter(|i| !self.results.contains_key(i))
            .collect()
    }

    /// Upserts `result` (last write wins) and checks completeness.
    ///
    /// Must run under the job's lock.
    pub fn apply(&mut self, result: ProcessedResult, now: DateTime<Utc>) -> UpsertOutcome {
        if self.state.is_terminal() {
            return UpsertOutcome::Discarded(self.clone());
        }
        if result.sequence_index >= self.total_chunks {
            return UpsertOutcome::OutOfRange {
                total: self.total_chunks,
            };
        }
        if self.expire(now) {
            return UpsertOutcome::Expired(self.clone());
        }

        self.results.insert(result.sequence_index, result);

        if self.has_all_results() {
            self.state = JobState::Complete;
            UpsertOutcome::Completed(self.clone())
        } else {
            UpsertOutcome::Recorded {
                received: self.received(),
                total: self.total_chunks,
            }
        }
    }

    /// Times the job out if it is still running past its deadline.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == JobState::InProgress && now >= self.deadline {
            self.state = JobState::TimedOut;
            true
        } else {
            false
        }
    }

    /// Moves a running job to a terminal `state`.
    pub fn finish(&mut self, state: JobState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = state;
        true
    }
}

/// Persists [`Job`] state, possibly shared by processes.
///
/// Every method that mutates a job must do so atomically with respect to the
/// other mutating methods for the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// # Errors
    ///
    /// [`crate::Error::JobAlreadyExists`] if the identifier is taken.
    async fn create(&self, job: Job) -> Result<()>;

    /// # Errors
    ///
    /// [`crate::Error::JobNotFound`] for unknown jobs.
    async fn get(&self, job_id: &str) -> Result<Job>;

    /// Atomically applies [`Job::apply`].
    async fn upsert_result(
        &self,
        job_id: &str,
        result: ProcessedResult,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome>;

    /// Atomically applies [`Job::expire`].
    async fn expire(&self, job_id: &str, now: DateTime<Utc>) -> Result<Transition>;

    /// Atomically applies [`Job::finish`].
    async fn finish(&self, job_id: &str, state: JobState) -> Result<Transition>;

    async fn mark_cancelled(&self, job_id: &str) -> Result<Transition> {
        self.finish(job_id, JobState::Cancelled).await
    }

    /// Removes finished jobs created before `before`, returning their ids.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<Vec<String>>;
}

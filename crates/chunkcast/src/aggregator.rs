//! Collects per-chunk results and reassembles the final output.
//!
//! Results arrive in any order and possibly more than once. The [`Aggregator`]
//! hands each one to the [`JobStore`], which upserts it and checks
//! completeness under the job's lock. Only the caller that observes the
//! transition to complete logs and broadcasts it; later results for the same
//! job are discarded.
//!
//! Waiters are woken through a per-job [`watch`] channel. They also poll the
//! store at [`Aggregator::poll_interval`], so a store shared with other
//! processes is observed as well.

use crate::{
    Error, Job, JobState, JobStore, ProcessedResult, Result, ResultSink, ResultStatus,
    UpsertOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core::time::Duration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::watch;

/// Observable status of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    InProgress { received: usize, total: usize },
    Complete { output: String },
    TimedOut { missing: Vec<usize> },
    Cancelled,
    Failed { reason: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress { .. })
    }

    /// Renders the status of `job`, assembling its output if complete.
    pub fn of(job: &Job, assembly: &AssemblyConfig) -> Self {
        match &job.state {
            JobState::InProgress => Self::InProgress {
                received: job.received(),
                total: job.total_chunks,
            },
            JobState::Complete => Self::Complete {
                output: assembly.assemble(job),
            },
            JobState::TimedOut => Self::TimedOut {
                missing: job.missing(),
            },
            JobState::Cancelled => Self::Cancelled,
            JobState::Failed(reason) => Self::Failed {
                reason: reason.clone(),
            },
        }
    }
}

/// How chunk outputs are joined into the final text.
#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    /// Inserted between consecutive chunk outputs.
    pub separator: String,
    /// Stands in for a failed chunk. `{index}` and `{reason}` are substituted.
    pub failure_placeholder: String,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            separator: "\n".to_string(),
            failure_placeholder: "[chunk {index} failed: {reason}]".to_string(),
        }
    }
}

impl AssemblyConfig {
    /// Joins the outputs of `job` in ascending index order.
    pub fn assemble(&self, job: &Job) -> String {
        job.results
            .values()
            .map(|result| match &result.status {
                ResultStatus::Success => result.output_text.clone(),
                ResultStatus::Failure(reason) => self
                    .failure_placeholder
                    .replace("{index}", &result.sequence_index.to_string())
                    .replace("{reason}", reason),
            })
            .collect::<Vec<_>>()
            .join(&self.separator)
    }
}

/// Reassembles results of every job held in a [`JobStore`].
pub struct Aggregator {
    store: Arc<dyn JobStore>,
    assembly: AssemblyConfig,
    poll_interval: Duration,
    watchers: Mutex<HashMap<String, watch::Sender<JobStatus>>>,
}

impl Aggregator {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

    pub fn new(store: Arc<dyn JobStore>, assembly: AssemblyConfig) -> Self {
        Self {
            store,
            assembly,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Sets how often [`Aggregator::wait`] re-reads the store.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn assembly(&self) -> &AssemblyConfig {
        &self.assembly
    }

    /// Registers a new job.
    ///
    /// # Errors
    ///
    /// [`Error::JobAlreadyExists`] if the identifier is taken.
    pub async fn open(&self, job: Job) -> Result<JobStatus> {
        let status = JobStatus::of(&job, &self.assembly);
        self.store.create(job).await?;
        Ok(status)
    }

    /// Records one result and reports the job's status afterwards.
    ///
    /// Results for finished jobs are discarded; the finished status is
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// [`Error::JobNotFound`] for unknown jobs, [`Error::ResultOutOfRange`] if
    /// the index is not one of the job's slots.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(job_id = %job_id, sequence_index = result.sequence_index)))]
    pub async fn record(&self, job_id: &str, result: ProcessedResult) -> Result<JobStatus> {
        let sequence_index = result.sequence_index;
        match self.store.upsert_result(job_id, result, Utc::now()).await? {
            UpsertOutcome::Recorded { received, total } => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Recorded {received}/{total}");
                let status = JobStatus::InProgress { received, total };
                self.notify(job_id, &status);
                Ok(status)
            }
            UpsertOutcome::Completed(job) => {
                #[cfg(feature = "tracing")]
                tracing::info!("Job complete with {} chunk(s)", job.total_chunks);
                Ok(self.broadcast(&job))
            }
            UpsertOutcome::Expired(job) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Job timed out, missing {:?}", job.missing());
                Ok(self.broadcast(&job))
            }
            UpsertOutcome::Discarded(job) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Discarding result for finished job ({:?})", job.state);
                Ok(JobStatus::of(&job, &self.assembly))
            }
            UpsertOutcome::OutOfRange { total } => Err(Error::ResultOutOfRange {
                job_id: job_id.to_string(),
                sequence_index,
                total_chunks: total,
            }),
        }
    }

    /// Current status; a running job past its deadline is timed out first.
    pub async fn status(&self, job_id: &str) -> Result<JobStatus> {
        let job = self.store.get(job_id).await?;
        if job.state == JobState::InProgress && Utc::now() >= job.deadline {
            let transition = self.store.expire(job_id, Utc::now()).await?;
            if transition.changed {
                #[cfg(feature = "tracing")]
                tracing::warn!(job_id = %job_id, "Job timed out, missing {:?}", transition.job.missing());
                return Ok(self.broadcast(&transition.job));
            }
            return Ok(JobStatus::of(&transition.job, &self.assembly));
        }
        Ok(JobStatus::of(&job, &self.assembly))
    }

    /// Resolves once the job reaches a terminal status, timing it out at its
    /// deadline.
    pub async fn wait(&self, job_id: &str) -> Result<JobStatus> {
        let mut changes = self.subscribe(job_id).await?;
        loop {
            // Mark the current value seen before reading the store so a
            // broadcast racing with the read still wakes us.
            changes.borrow_and_update();

            let job = self.store.get(job_id).await?;
            let status = self.status(job_id).await?;
            if status.is_terminal() {
                return Ok(status);
            }

            let until_deadline = (job.deadline - Utc::now()).to_std().unwrap_or_default();
            let nap = self.poll_interval.min(until_deadline);
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(nap).await;
                    }
                }
                () = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Cancels a running job. Results that arrive later are discarded.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus> {
        self.finish(job_id, JobState::Cancelled).await
    }

    /// Abandons a running job, for instance after its dispatch failed.
    pub async fn fail(&self, job_id: &str, reason: impl Into<String>) -> Result<JobStatus> {
        self.finish(job_id, JobState::Failed(reason.into())).await
    }

    /// Forgets finished jobs created before `before`.
    pub async fn purge_finished(&self, before: DateTime<Utc>) -> Result<Vec<String>> {
        let purged = self.store.purge_finished(before).await?;
        let mut watchers = self.watchers.lock();
        for job_id in &purged {
            watchers.remove(job_id);
        }
        Ok(purged)
    }

    /// Receives every status change this aggregator observes for `job_id`.
    ///
    /// # Errors
    ///
    /// [`Error::JobNotFound`] for unknown jobs; no watcher is registered then.
    pub async fn subscribe(&self, job_id: &str) -> Result<watch::Receiver<JobStatus>> {
        let job = self.store.get(job_id).await?;
        let rx = self
            .watchers
            .lock()
            .entry(job_id.to_string())
            .or_insert_with(|| watch::channel(JobStatus::of(&job, &self.assembly)).0)
            .subscribe();
        Ok(rx)
    }

    async fn finish(&self, job_id: &str, state: JobState) -> Result<JobStatus> {
        let transition = self.store.finish(job_id, state).await?;
        if transition.changed {
            #[cfg(feature = "tracing")]
            tracing::info!(job_id = %job_id, "Job finished as {:?}", transition.job.state);
            return Ok(self.broadcast(&transition.job));
        }
        Ok(JobStatus::of(&transition.job, &self.assembly))
    }

    fn broadcast(&self, job: &Job) -> JobStatus {
        let status = JobStatus::of(job, &self.assembly);
        self.notify(&job.job_id, &status);
        status
    }

    fn notify(&self, job_id: &str, status: &JobStatus) {
        if let Some(tx) = self.watchers.lock().get(job_id) {
            // A progress update racing past the final transition must not
            // overwrite it.
            tx.send_if_modified(|current| {
                if current.is_terminal() {
                    return false;
                }
                *current = status.clone();
                true
            });
        }
    }
}

#[async_trait]
impl ResultSink for Aggregator {
    async fn submit(&self, job_id: &str, result: ProcessedResult) -> Result<()> {
        self.record(job_id, result).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryJobStore;
    use chrono::TimeDelta;

    fn aggregator() -> Arc<Aggregator> {
        Arc::new(
            Aggregator::new(Arc::new(InMemoryJobStore::new()), AssemblyConfig::default())
                .with_poll_interval(Duration::from_millis(10)),
        )
    }

    async fn open(agg: &Aggregator, id: &str, total: usize, deadline: TimeDelta) {
        let now = Utc::now();
        agg.open(Job::new(id, total, now, now + deadline))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn assembles_in_order_with_failure_placeholder() {
        let agg = aggregator();
        open(&agg, "j", 3, TimeDelta::seconds(60)).await;

        agg.record("j", ProcessedResult::success(2, "C")).await.unwrap();
        agg.record("j", ProcessedResult::failure(1, "invalid input"))
            .await
            .unwrap();
        let status = agg.record("j", ProcessedResult::success(0, "A")).await.unwrap();

        assert_eq!(
            status,
            JobStatus::Complete {
                output: "A\n[chunk 1 failed: invalid input]\nC".to_string()
            }
        );
    }

    #[tokio::test]
    async fn duplicate_does_not_advance() {
        let agg = aggregator();
        open(&agg, "j", 6, TimeDelta::seconds(60)).await;

        let first = agg.record("j", ProcessedResult::success(4, "x")).await.unwrap();
        let second = agg.record("j", ProcessedResult::success(4, "x")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second, JobStatus::InProgress { received: 1, total: 6 });
    }

    #[tokio::test]
    async fn out_of_range_and_unknown_job() {
        let agg = aggregator();
        open(&agg, "j", 2, TimeDelta::seconds(60)).await;

        assert_eq!(
            agg.record("j", ProcessedResult::success(7, "x")).await,
            Err(Error::ResultOutOfRange {
                job_id: "j".into(),
                sequence_index: 7,
                total_chunks: 2
            })
        );
        assert!(matches!(
            agg.record("nope", ProcessedResult::success(0, "x")).await,
            Err(Error::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn timeout_reports_missing_indices() {
        let agg = aggregator();
        open(&agg, "j", 4, TimeDelta::milliseconds(50)).await;
        agg.record("j", ProcessedResult::success(0, "a")).await.unwrap();
        agg.record("j", ProcessedResult::success(2, "c")).await.unwrap();

        let status = agg.wait("j").await.unwrap();
        assert_eq!(status, JobStatus::TimedOut { missing: vec![1, 3] });

        // Late results do not revive the job.
        let late = agg.record("j", ProcessedResult::success(1, "b")).await.unwrap();
        assert_eq!(late, status);
    }

    #[tokio::test]
    async fn cancel_discards_late_results() {
        let agg = aggregator();
        open(&agg, "j", 2, TimeDelta::seconds(60)).await;
        agg.record("j", ProcessedResult::success(0, "a")).await.unwrap();

        assert_eq!(agg.cancel("j").await.unwrap(), JobStatus::Cancelled);
        assert_eq!(
            agg.record("j", ProcessedResult::success(1, "b")).await.unwrap(),
            JobStatus::Cancelled
        );
        assert_eq!(agg.wait("j").await.unwrap(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_after_completion_keeps_output() {
        let agg = aggregator();
        open(&agg, "j", 1, TimeDelta::seconds(60)).await;
        agg.record("j", ProcessedResult::success(0, "done")).await.unwrap();

        assert_eq!(
            agg.cancel("j").await.unwrap(),
            JobStatus::Complete {
                output: "done".into()
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn wait_wakes_on_completion() {
        // A long poll interval: only the broadcast can wake the waiter in time.
        let agg = Arc::new(
            Aggregator::new(Arc::new(InMemoryJobStore::new()), AssemblyConfig::default())
                .with_poll_interval(Duration::from_secs(30)),
        );
        open(&agg, "j", 3, TimeDelta::seconds(60)).await;

        let waiter = tokio::spawn({
            let agg = Arc::clone(&agg);
            async move { agg.wait("j").await }
        });

        for i in (0..3).rev() {
            tokio::time::sleep(Duration::from_millis(5)).await;
            agg.record("j", ProcessedResult::success(i, i.to_string()))
                .await
                .unwrap();
        }

        let status = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            status,
            JobStatus::Complete {
                output: "0\n1\n2".into()
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_records_settle_on_complete() {
        let agg = aggregator();
        open(&agg, "j", 64, TimeDelta::seconds(60)).await;
        let mut changes = agg.subscribe("j").await.unwrap();

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let agg = Arc::clone(&agg);
                tokio::spawn(async move {
                    agg.record("j", ProcessedResult::success(i, "w")).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let status = changes.borrow_and_update().clone();
        assert_eq!(
            status,
            JobStatus::Complete {
                output: vec!["w"; 64].join("\n")
            }
        );
    }

    #[tokio::test]
    async fn purge_forgets_finished_jobs() {
        let agg = aggregator();
        open(&agg, "done", 0, TimeDelta::seconds(60)).await;
        open(&agg, "running", 1, TimeDelta::seconds(60)).await;

        let purged = agg
            .purge_finished(Utc::now() + TimeDelta::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, ["done"]);
        assert!(matches!(
            agg.status("done").await,
            Err(Error::JobNotFound { .. })
        ));
        assert!(agg.status("running").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_jobs_register_no_watchers() {
        let agg = aggregator();
        assert!(matches!(
            agg.subscribe("ghost").await,
            Err(Error::JobNotFound { .. })
        ));
        assert!(matches!(
            agg.wait("ghost").await,
            Err(Error::JobNotFound { .. })
        ));
        assert!(agg.watchers.lock().is_empty());

        open(&agg, "done", 0, TimeDelta::seconds(60)).await;
        let changes = agg.subscribe("done").await.unwrap();
        assert_eq!(
            *changes.borrow(),
            JobStatus::Complete {
                output: String::new()
            }
        );
        agg.purge_finished(Utc::now() + TimeDelta::seconds(1))
            .await
            .unwrap();
        assert!(agg.watchers.lock().is_empty());
    }

    #[test]
    fn status_json_shape() {
        let json = serde_json::to_value(JobStatus::TimedOut { missing: vec![1] }).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "timed_out", "missing": [1] }));
    }
}

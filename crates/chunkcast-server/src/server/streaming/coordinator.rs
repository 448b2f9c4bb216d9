use crate::server::telemetry::{
    decrement_jobs_inflight, increment_chunks_published, increment_job_errors,
    increment_jobs_finished, increment_jobs_inflight, increment_jobs_submitted,
    record_chunks_per_job, record_job_duration,
};
use chrono::{TimeDelta, Utc};
use chunkcast::{Aggregator, Error, JobStatus, Pipeline, Submission};
use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tracks jobs between submission and their terminal state.
///
/// Every accepted job gets a watcher task that waits for the job to finish
/// and records its outcome. The number of watchers still running is what the
/// shutdown sequence drains.
pub struct Coordinator {
    pipeline: Pipeline,
    accepting: AtomicBool,
    inflight: AtomicUsize,
}

impl Coordinator {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            accepting: AtomicBool::new(true),
            inflight: AtomicUsize::new(0),
        }
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        self.pipeline.aggregator()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    pub fn refuse_new_jobs(&self) {
        self.accepting.store(false, Ordering::Relaxed);
    }

    /// Jobs submitted through this coordinator that have not finished yet.
    pub fn jobs_inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Chunks and publishes `text`, then watches the job in the background.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceShutdown`] once shutdown began, otherwise whatever
    /// [`Pipeline::submit`] returns.
    pub async fn submit(self: &Arc<Self>, text: &str) -> Result<Submission, Error> {
        if !self.is_accepting() {
            increment_job_errors();
            return Err(Error::ServiceShutdown);
        }

        let start = std::time::Instant::now();
        let submission = match self.pipeline.submit(text).await {
            Ok(submission) => submission,
            Err(e) => {
                increment_job_errors();
                return Err(e);
            }
        };

        increment_jobs_submitted();
        record_chunks_per_job(submission.total_chunks as f64);
        increment_chunks_published(submission.message_ids.len() as u64);

        self.inflight.fetch_add(1, Ordering::Relaxed);
        increment_jobs_inflight();

        let coordinator = Arc::clone(self);
        let job_id = submission.job_id.clone();
        let fut = async move {
            let outcome = match coordinator.aggregator().wait(&job_id).await {
                Ok(status) => outcome_label(&status),
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Lost track of job: {_e}");
                    "lost"
                }
            };

            #[cfg(feature = "tracing")]
            tracing::info!("Job finished: {outcome}");

            increment_jobs_finished(outcome);
            record_job_duration(start.elapsed().as_millis() as f64);
            coordinator.inflight.fetch_sub(1, Ordering::Relaxed);
            decrement_jobs_inflight();
        };
        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            let span = tracing::info_span!("job", job_id = %submission.job_id);
            fut.instrument(span)
        };

        tokio::spawn(fut);

        Ok(submission)
    }

    /// Periodically forgets jobs that finished more than `retention` ago.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        retention: TimeDelta,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let period = retention
            .to_std()
            .unwrap_or_default()
            .clamp(Duration::from_secs(1), Duration::from_secs(60));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
                            continue;
                        };
                        match coordinator.aggregator().purge_finished(cutoff).await {
                            Ok(_purged) => {
                                #[cfg(feature = "tracing")]
                                tracing::trace!("Purged {} finished job(s)", _purged.len());
                            }
                            Err(_e) => {
                                #[cfg(feature = "tracing")]
                                tracing::warn!("Failed to purge finished jobs: {_e}");
                            }
                        }
                    }
                }
            }
        })
    }
}

fn outcome_label(status: &JobStatus) -> &'static str {
    match status {
        JobStatus::Complete { .. } => "complete",
        JobStatus::TimedOut { .. } => "timed_out",
        JobStatus::Cancelled => "cancelled",
        JobStatus::Failed { .. } => "failed",
        JobStatus::InProgress { .. } => "in_progress",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkcast::{AssemblyConfig, InMemoryBroker, InMemoryJobStore, PipelineConfig};

    fn coordinator(job_deadline: Duration) -> Arc<Coordinator> {
        let broker = InMemoryBroker::default();
        broker.create_topic("t");
        let aggregator = Arc::new(
            Aggregator::new(Arc::new(InMemoryJobStore::new()), AssemblyConfig::default())
                .with_poll_interval(Duration::from_millis(10)),
        );
        let pipeline = Pipeline::new(
            Arc::new(broker),
            "t",
            aggregator,
            PipelineConfig {
                max_tokens: 3,
                job_deadline,
                ..PipelineConfig::default()
            },
        )
        .unwrap();
        Arc::new(Coordinator::new(pipeline))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn tracks_jobs_until_they_finish() {
        let coordinator = coordinator(Duration::from_secs(30));
        let submission = coordinator.submit("a bb ccc").await.unwrap();
        assert_eq!(coordinator.jobs_inflight(), 1);

        coordinator
            .aggregator()
            .cancel(&submission.job_id)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.jobs_inflight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn refuses_jobs_after_shutdown_began() {
        let coordinator = coordinator(Duration::from_secs(30));
        coordinator.refuse_new_jobs();
        assert_eq!(
            coordinator.submit("a").await.unwrap_err(),
            Error::ServiceShutdown
        );
        assert_eq!(coordinator.jobs_inflight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn reaper_purges_finished_jobs() {
        let coordinator = coordinator(Duration::from_secs(30));
        let submission = coordinator.submit("a bb").await.unwrap();
        coordinator
            .aggregator()
            .cancel(&submission.job_id)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let reaper = coordinator.spawn_reaper(TimeDelta::zero(), shutdown.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator
                .aggregator()
                .status(&submission.job_id)
                .await
                .is_ok()
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        reaper.await.unwrap();
    }
}

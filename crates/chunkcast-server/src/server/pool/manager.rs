//! Pool of consumer tasks sharing one subscription.
//!
//! Deliveries are spread across the consumers by the subscription itself;
//! whichever task is idle pulls next. The pool owns the tasks' join handles
//! and the [`CancellationToken`] that stops them.

use super::worker::consumer_loop;
use crate::server::streaming::coordinator::Coordinator;
use chunkcast::{Aggregator, Error, Subscription, Worker};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// Time each consumer gets to stop once cancelled.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(3);

pub struct WorkerPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawns `num_workers` consumers of `subscription`.
    pub fn spawn(
        num_workers: usize,
        subscription: Arc<dyn Subscription>,
        worker: Worker,
        aggregator: Arc<Aggregator>,
        shutdown_token: CancellationToken,
        shutdown_timeout: Duration,
    ) -> Self {
        let handles = (0..num_workers)
            .map(|worker_id| {
                tokio::spawn(consumer_loop(
                    worker_id,
                    Arc::clone(&subscription),
                    worker.clone(),
                    Arc::clone(&aggregator),
                    shutdown_token.clone(),
                ))
            })
            .collect();

        Self {
            handles: Mutex::new(handles),
            shutdown_token,
            shutdown_timeout,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Gracefully shuts down the pool.
    ///
    /// - Refuses new jobs.
    /// - Waits up to `shutdown_timeout` for in-flight jobs to finish, with the
    ///   consumers still running so they can.
    /// - Cancels the consumers and waits up to 3 seconds for each to stop.
    pub async fn shutdown(&self, coordinator: &Coordinator) -> Result<(), Error> {
        // === Phase 0: Stop accepting new jobs ===
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new jobs");
        coordinator.refuse_new_jobs();

        // === Phase 1: Wait for in-flight jobs to drain ===
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Draining in-flight jobs ({} active)",
            coordinator.jobs_inflight()
        );
        let drain_result = timeout(self.shutdown_timeout, async {
            while coordinator.jobs_inflight() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("All in-flight jobs drained");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Graceful drain timed out ({} jobs still active)",
                    coordinator.jobs_inflight()
                );
            }
        }

        // === Phase 2: Cancel the consumers ===
        #[cfg(feature = "tracing")]
        tracing::debug!("Cancelling consumers via shutdown token");
        self.shutdown_token.cancel();

        // === Phase 3: Wait for the consumers to stop ===
        let handles = core::mem::take(&mut *self.handles.lock());
        let stops = handles
            .into_iter()
            .enumerate()
            .map(|(_i, handle)| async move {
                match timeout(WORKER_STOP_TIMEOUT, handle).await {
                    Ok(Ok(())) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!("Worker {_i} stopped");
                    }
                    Ok(Err(_e)) => {
                        #[cfg(feature = "tracing")]
                        tracing::error!("Worker {_i} panicked: {_e}");
                    }
                    Err(_) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Worker {_i} shutdown timed out");
                    }
                }
            });

        futures::future::join_all(stops).await;

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool shutdown complete");

        Ok(())
    }
}

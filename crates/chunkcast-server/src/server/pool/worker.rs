use crate::server::telemetry::{
    increment_dropped_messages, increment_processing_failures, increment_redeliveries,
    increment_results_recorded,
};
use chunkcast::{Aggregator, BrokerError, Disposition, Subscription, Worker};
use core::time::Duration;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Delay before pulling again after the subscription reported an error.
const PULL_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Consumer task pulling deliveries from a shared subscription.
///
/// Every delivery is handed to [`Worker::process`], which reports the result
/// to `aggregator` and settles the delivery. A delivery already being
/// processed is finished before the loop observes `shutdown`.
///
/// Runs until `shutdown` is cancelled or the subscription closes.
pub async fn consumer_loop(
    _worker_id: usize,
    subscription: Arc<dyn Subscription>,
    worker: Worker,
    aggregator: Arc<Aggregator>,
    shutdown: CancellationToken,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {_worker_id} started");

    loop {
        let delivery = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {_worker_id} received shutdown signal");
                break;
            }
            pulled = subscription.pull() => match pulled {
                Ok(delivery) => delivery,
                Err(BrokerError::SubscriptionClosed) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Worker {_worker_id} subscription closed");
                    break;
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {_worker_id} failed to pull: {_e}");
                    tokio::time::sleep(PULL_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        let disposition = worker.process(delivery, &*aggregator).await;
        record_disposition(&disposition);
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {_worker_id} stopped");
}

fn record_disposition(disposition: &Disposition) {
    match disposition {
        Disposition::Ack { result, .. } => {
            increment_results_recorded();
            if !result.is_success() {
                increment_processing_failures();
            }
        }
        Disposition::Nack { .. } => increment_redeliveries(),
        Disposition::Drop { .. } => increment_dropped_messages(),
    }
}

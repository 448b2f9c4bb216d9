//! HTTP API for submitting and tracking chunked jobs.
//!
//! This module defines [`ChunkService`], which wires the in-process broker,
//! the job store, the consumer pool and the [`Coordinator`] together and
//! serves them through an axum [`Router`].
//!
//! ## Routes
//!
//! - `POST /jobs` - Chunk and publish `{ "text": ... }`, answer `202`.
//! - `GET /jobs/{id}` - Current job status.
//! - `DELETE /jobs/{id}` - Cancel a job.
//! - `GET /healthz` - `ok`, or `503` once shutdown began.

use crate::server::{
    config::ServerConfig, pool::manager::WorkerPool, streaming::coordinator::Coordinator,
};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chunkcast::{
    Aggregator, AssemblyConfig, CompletionService, Error, InMemoryBroker, InMemoryJobStore,
    JobStatus, Pipeline, Submission, Worker,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Room for the JSON envelope around the submitted text.
const JSON_ENVELOPE_BYTES: usize = 64 * 1024;

/// Shared state behind every route.
#[derive(Clone)]
pub struct ChunkService {
    config: Arc<ServerConfig>,
    coordinator: Arc<Coordinator>,
    worker_pool: Arc<WorkerPool>,
}

impl ChunkService {
    /// Builds the pipeline and spawns the consumer pool and the job reaper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: ServerConfig,
        completion: Arc<dyn CompletionService>,
    ) -> anyhow::Result<Self> {
        let broker = InMemoryBroker::new(config.redelivery.clone());
        broker.create_topic(&config.topic);
        let subscription = broker.subscribe(&config.topic)?;

        let aggregator = Arc::new(Aggregator::new(
            Arc::new(InMemoryJobStore::new()),
            AssemblyConfig::default(),
        ));
        let pipeline = Pipeline::new(
            Arc::new(broker),
            config.topic.clone(),
            Arc::clone(&aggregator),
            config.pipeline.clone(),
        )?;
        let coordinator = Arc::new(Coordinator::new(pipeline));

        let shutdown_token = CancellationToken::new();
        let worker_pool = WorkerPool::spawn(
            config.num_workers,
            subscription,
            Worker::new(completion, config.worker.clone()),
            aggregator,
            shutdown_token.clone(),
            config.shutdown_timeout,
        );
        coordinator.spawn_reaper(config.job_retention, shutdown_token);

        Ok(Self {
            config: Arc::new(config),
            coordinator,
            worker_pool: Arc::new(worker_pool),
        })
    }

    /// Refuses new jobs, drains in-flight ones and stops the consumers.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.worker_pool.shutdown(&self.coordinator).await
    }

    pub fn router(self) -> Router {
        // Oversized text within the envelope still reaches the handler's 400.
        let body_limit = self
            .config
            .max_input_bytes
            .saturating_add(JSON_ENVELOPE_BYTES);
        Router::new()
            .route("/jobs", post(submit_job))
            .route("/jobs/{id}", get(job_status).delete(cancel_job))
            .route("/healthz", get(healthz))
            .layer(DefaultBodyLimit::max(body_limit))
            .with_state(self)
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: String,
    #[serde(flatten)]
    pub status: JobStatus,
}

/// Maps pipeline errors onto HTTP responses.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidConfiguration { .. } | Error::ResultOutOfRange { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::JobNotFound { .. } => StatusCode::NOT_FOUND,
            Error::JobAlreadyExists { .. } => StatusCode::CONFLICT,
            Error::PublishFailure { .. } => StatusCode::BAD_GATEWAY,
            Error::JobTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::JobCancelled { .. } | Error::JobFailed { .. } => StatusCode::CONFLICT,
            Error::ServiceShutdown => StatusCode::SERVICE_UNAVAILABLE,
            Error::ChannelError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

fn bad_request(reason: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": reason.into() })),
    )
        .into_response()
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
async fn submit_job(
    State(service): State<ChunkService>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    if request.text.trim().is_empty() {
        return bad_request("text must contain at least one word");
    }

    if request.text.len() > service.config.max_input_bytes {
        return bad_request(format!(
            "text of {} bytes exceeds the {} byte limit",
            request.text.len(),
            service.config.max_input_bytes
        ));
    }

    match service.coordinator.submit(&request.text).await {
        Ok(submission) => (StatusCode::ACCEPTED, Json::<Submission>(submission)).into_response(),
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Job rejected: {e}");
            ApiError(e).into_response()
        }
    }
}

async fn job_status(
    State(service): State<ChunkService>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let status = service.coordinator.aggregator().status(&job_id).await?;
    Ok(Json(JobView { job_id, status }))
}

async fn cancel_job(
    State(service): State<ChunkService>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let status = service.coordinator.aggregator().cancel(&job_id).await?;
    Ok(Json(JobView { job_id, status }))
}

async fn healthz(State(service): State<ChunkService>) -> (StatusCode, &'static str) {
    if service.coordinator.is_accepting() && !service.worker_pool.is_shutting_down() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    }
}

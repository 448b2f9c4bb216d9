//! Server-side components of the chunkcast service.
//!
//! - [`config`] - CLI/environment configuration.
//! - [`completion`] - Completion backends (OpenAI-compatible HTTP, echo).
//! - [`pool`] - Consumer tasks and their shutdown.
//! - [`service`] - HTTP API.
//! - [`streaming`] - Job tracking between submission and completion.
//! - [`telemetry`] - Logging, tracing and metrics initialization.

pub mod completion;
pub mod config;
pub mod pool;
pub mod service;
pub mod streaming;
pub mod telemetry;

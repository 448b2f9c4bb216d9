//! HTTP service implementation and pipeline wiring.
//!
//! - [`handler`] - `ChunkService`, its routes and the error mapping.

pub mod handler;

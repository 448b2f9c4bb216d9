//! Subscriber tasks that feed deliveries to the chunk [`chunkcast::Worker`].
//!
//! - [`manager`] - Spawns the consumer tasks and runs the phased shutdown.
//! - [`worker`] - The per-task pull loop.

pub mod manager;
pub mod worker;

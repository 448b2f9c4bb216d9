#![doc = include_str!("../README.md")]

mod aggregator;
mod broker;
mod chunk;
mod completion;
mod dispatcher;
mod envelope;
mod error;
mod pipeline;
mod result;
mod store;
mod worker;


pub use crate::aggregator::*;
pub use crate::broker::*;
pub use crate::chunk::*;
pub use crate::completion::*;
pub use crate::dispatcher::*;
pub use crate::envelope::*;
pub use crate::error::*;
pub use crate::pipeline::*;
pub use crate::result::*;
pub use crate::store::*;
pub use crate::worker::*;

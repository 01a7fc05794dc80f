//! Generation worker.
//!
//! - [`processor`] - runs one job and publishes its response events.
//! - [`listener`] - watches the job's control channel for `stop`.

pub mod listener;
pub mod processor;

pub use processor::{GenerationContext, JobOutcome, process_job};

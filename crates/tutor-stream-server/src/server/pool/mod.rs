//! Job queue.
//!
//! - [`manager`] - [`JobQueue`]: round-robin submission, status and shutdown.
//! - [`request`] - [`Job`] and the worker channel messages.
//! - [`status`] - lifecycle table backing status queries and revocation.
//! - [`worker`] - per-worker loop running jobs concurrently.

pub mod manager;
pub mod request;
pub mod status;
pub mod worker;

pub use manager::JobQueue;
pub use request::{GenerationRequest, Job};

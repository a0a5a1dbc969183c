//! Where jobs come from.
//!
//! Jobs are either pushed to an HTTP listener and buffered in a bounded queue
//! ([`queue`], [`http`]), or pulled from an external endpoint ([`poll`]).

use async_trait::async_trait;

use crate::job::Job;

pub mod http;
pub mod poll;
pub mod queue;

pub use queue::{bounded, Admission, QueueSource};

/// Supplies jobs to the worker, one at a time and in order.
#[async_trait]
pub trait JobSource: Send {
    /// Wait for the next job. `None` means no job will ever arrive again.
    async fn next_job(&mut self) -> Option<Job>;
}

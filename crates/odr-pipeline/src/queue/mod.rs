//! Work queue abstraction modelled on beanstalkd
//!
//! Producers `put` jobs on named tubes; consumers `watch` tubes and `reserve`
//! jobs. A reserved job is invisible to other consumers until it is deleted
//! or its time-to-run (TTR) elapses, at which point it becomes reservable
//! again. Age-out is the only automatic redelivery.
//!
//! Each [`Queue`] value is one client connection, so watch lists and job
//! ownership are per value.

pub mod beanstalk;
pub mod memory;

pub use beanstalk::BeanstalkQueue;
pub use memory::{MemoryBroker, MemoryQueue, QueuedJob};

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

// ============================================================================
// Queue Constants
// ============================================================================

/// Priority used when a caller has no preference (lower is more urgent)
pub const DEFAULT_PRIORITY: u32 = 1024;

/// Priority the Finisher uses when it re-queues itself
pub const FINISHER_PRIORITY: u32 = 1;

/// Seconds a reserved job may run before it is handed to another consumer
pub const DEFAULT_TTR_SECS: u64 = 120;

pub type JobId = u64;

/// A reserved job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Add `tube` to the tubes this connection reserves from
    async fn watch(&self, tube: &str) -> Result<()>;

    /// Select the default tube for subsequent puts
    async fn use_tube(&self, tube: &str) -> Result<()>;

    /// Enqueue `body` on `tube`; it becomes reservable after `delay`
    async fn put(&self, tube: &str, body: &[u8], priority: u32, delay: Duration) -> Result<JobId>;

    /// Take the most urgent ready job from a watched tube, waiting up to
    /// `timeout` (forever when `None`). `Ok(None)` means the wait timed out.
    async fn reserve(&self, timeout: Option<Duration>) -> Result<Option<Job>>;

    /// Remove a job reserved by this connection
    async fn delete(&self, id: JobId) -> Result<()>;

    /// Number of jobs ready to be reserved on `tube`
    async fn ready_count(&self, tube: &str) -> Result<u64>;
}

//! Producer-side progress record for one pipeline run
//!
//! The Analyzer creates a tracked job with an unknown total, raises the total
//! once fan-out is done, Builders bump `current` through worker progress
//! reports, and the Finisher polls until `current` reaches `total`.

use crate::de::{bool_as_int, bool_from_any, i64_from_any, string_or_number};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Tracked Job Constants
// ============================================================================

/// Placeholder total while the fan-out size is still unknown
pub const TOTAL_UNKNOWN: i64 = 99_999_999;

/// Default number of self-requeues before the Finisher gives up
pub const DEFAULT_MAX_POLLS: u32 = 10_000;

/// Default delay between Finisher polls
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default ceiling for the backed-off poll delay
pub const DEFAULT_MAX_POLL_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedJob {
    #[serde(default, deserialize_with = "i64_from_any")]
    pub id: i64,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub target_entity: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub additional_data: String,
    #[serde(default, deserialize_with = "i64_from_any")]
    pub total: i64,
    #[serde(default, deserialize_with = "i64_from_any")]
    pub current: i64,
    #[serde(default, deserialize_with = "bool_from_any", serialize_with = "bool_as_int")]
    pub completed: bool,
}

impl TrackedJob {
    /// A not-yet-created job (`id == 0`) with an unknown total
    pub fn new(
        job_type: impl Into<String>,
        target_entity: impl Into<String>,
        additional_data: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            job_type: job_type.into(),
            target_entity: target_entity.into(),
            additional_data: additional_data.into(),
            total: TOTAL_UNKNOWN,
            current: 0,
            completed: false,
        }
    }

    pub fn is_total_known(&self) -> bool {
        self.total != TOTAL_UNKNOWN
    }

    /// Every fanned-out builder has reported. Progress may overshoot the total
    /// when a builder job is redelivered, so this is not a strict equality.
    pub fn is_finished(&self) -> bool {
        self.is_total_known() && self.current >= self.total
    }
}

/// What the Finisher should do after one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinisherDecision {
    Finalize,
    Requeue { counter: u32, delay: Duration },
    /// Poll budget spent without the run finishing
    Exhausted,
}

/// Polling budget and backoff for the Finisher
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub max_polls: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            backoff_factor: 1.0,
            max_interval: Duration::from_secs(DEFAULT_MAX_POLL_INTERVAL_SECS),
            max_polls: DEFAULT_MAX_POLLS,
        }
    }
}

impl PollPolicy {
    /// Delay before the poll numbered `counter` (1-based)
    pub fn delay_for(&self, counter: u32) -> Duration {
        if self.backoff_factor <= 1.0 {
            return self.interval;
        }
        let exponent = counter.saturating_sub(1).min(64) as i32;
        let secs = self.interval.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_interval.as_secs_f64()))
    }

    /// Decide the next step for a Finisher job that has re-queued itself
    /// `counter` times and just observed `job`.
    pub fn decide(&self, job: &TrackedJob, counter: u32) -> FinisherDecision {
        if job.is_finished() {
            return FinisherDecision::Finalize;
        }

        let next = counter.saturating_add(1);
        if next > self.max_polls {
            return FinisherDecision::Exhausted;
        }

        FinisherDecision::Requeue {
            counter: next,
            delay: self.delay_for(next),
        }
    }
}

//! Durable delayed callbacks
//!
//! The services never own a timer. They hand a [`Job`] and a fire time to a
//! [`JobScheduler`] and get back an opaque [`JobHandle`]. Some runner (the
//! `gram-send` daemon, or a test) pulls due jobs from the matching
//! [`JobSource`] and routes them to the handlers through
//! [`crate::service::GramcastService::run_due_jobs`].
//!
//! Delivery is at-least-once: a job claimed by a runner that dies before
//! calling [`JobSource::complete`] is re-armed by
//! [`JobSource::recover_interrupted`] and fires again. Handlers guard
//! themselves with an atomic status transition so repeats are harmless.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryJobScheduler;
pub use sqlite::SqliteJobScheduler;

/// Callback payload, stored as tagged JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    ProcessQueueItem { queue_id: String },
    PublishScheduledPost { scheduled_post_id: String },
}

impl Job {
    /// Id of the entity this job acts on
    pub fn target_id(&self) -> &str {
        match self {
            Job::ProcessQueueItem { queue_id } => queue_id,
            Job::PublishScheduledPost { scheduled_post_id } => scheduled_post_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A job a runner has taken ownership of
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub handle: JobHandle,
    pub job: Job,
    pub fire_at: i64,
    /// Times this job has been claimed, including this one
    pub attempts: u32,
}

/// Producer side: register and cancel callbacks
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn schedule(&self, job: Job, fire_at: i64) -> Result<JobHandle>;

    /// Best effort. Returns false when the job already ran, is running or
    /// is unknown.
    async fn cancel(&self, handle: &JobHandle) -> Result<bool>;
}

/// Runner side: claim due jobs and settle them
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Atomically claim up to `limit` jobs with `fire_at <= now`, oldest first
    async fn claim_due(&self, now: i64, limit: usize) -> Result<Vec<ClaimedJob>>;

    async fn complete(&self, claimed: &ClaimedJob) -> Result<()>;

    /// Put a claimed job back to fire again at `retry_at`
    async fn release(&self, claimed: &ClaimedJob, retry_at: i64) -> Result<()>;

    /// Re-arm jobs left claimed by a runner that never settled them
    async fn recover_interrupted(&self) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_payload_is_tagged() {
        let job = Job::ProcessQueueItem {
            queue_id: "q-1".to_string(),
        };
        let json = serde_json::to_string(&job).unwrap();
        assert_eq!(json, r#"{"type":"process_queue_item","queue_id":"q-1"}"#);

        let parsed: Job =
            serde_json::from_str(r#"{"type":"publish_scheduled_post","scheduled_post_id":"s-1"}"#)
                .unwrap();
        assert_eq!(parsed.target_id(), "s-1");
    }
}

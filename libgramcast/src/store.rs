//! Persistence contracts consumed by the scheduler core
//!
//! The services only talk to these traits. [`crate::Database`] implements all
//! of them on SQLite. Implementations hold no business logic; the one
//! requirement beyond plain CRUD is that the `transition_*` methods are atomic
//! compare-and-set operations, since they are the guards that make duplicate
//! job deliveries harmless.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    Account, ActionType, MediaFile, Post, QueueItem, QueueStatus, RateLimitAction, ScheduledPost,
    ScheduledPostStatus,
};

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn create_queue_item(&self, item: QueueItem) -> Result<QueueItem>;

    async fn get_queue_item(&self, id: &str) -> Result<Option<QueueItem>>;

    /// Overwrite every mutable column of the item, but only while the stored
    /// status is still `expected`. Returns whether the row was written.
    async fn update_queue_item(&self, item: &QueueItem, expected: QueueStatus) -> Result<bool>;

    /// Store the handle of the callback currently registered for the item
    async fn set_queue_job_handle(&self, id: &str, handle: &str) -> Result<()>;

    async fn list_queue_by_account(&self, account_id: &str) -> Result<Vec<QueueItem>>;

    /// Pending items with `scheduled_at <= up_to`, oldest first
    async fn list_pending_queue(&self, up_to: i64) -> Result<Vec<QueueItem>>;

    /// Atomically move a Pending item to Processing and stamp the claim time.
    /// Returns whether this caller won the claim.
    async fn claim_queue_item(&self, id: &str, now: i64) -> Result<bool>;

    /// Processing items claimed at or before `claimed_before`, or with no
    /// claim time at all
    async fn list_stale_processing(&self, claimed_before: i64) -> Result<Vec<QueueItem>>;

    /// Move `id` from `from` to `to` only if it is currently in `from`.
    /// Returns whether the transition happened.
    async fn transition_queue_status(
        &self,
        id: &str,
        from: QueueStatus,
        to: QueueStatus,
    ) -> Result<bool>;
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn insert_action(&self, action: &RateLimitAction) -> Result<i64>;

    /// Inclusive on both ends
    async fn count_actions(
        &self,
        account_id: &str,
        action_type: ActionType,
        from: i64,
        to: i64,
    ) -> Result<u32>;

    async fn last_action(
        &self,
        account_id: &str,
        action_type: ActionType,
    ) -> Result<Option<RateLimitAction>>;

    /// Earliest action with `action_time >= since`
    async fn oldest_action_since(
        &self,
        account_id: &str,
        action_type: ActionType,
        since: i64,
    ) -> Result<Option<RateLimitAction>>;
}

#[async_trait]
pub trait ScheduledPostStore: Send + Sync {
    async fn create_scheduled_post(&self, post: &ScheduledPost) -> Result<()>;

    async fn get_scheduled_post(&self, id: &str) -> Result<Option<ScheduledPost>>;

    /// Conditional overwrite, as [`QueueStore::update_queue_item`]
    async fn update_scheduled_post(
        &self,
        post: &ScheduledPost,
        expected: ScheduledPostStatus,
    ) -> Result<bool>;

    async fn set_scheduled_job_handle(&self, id: &str, handle: &str) -> Result<()>;

    /// Posts on accounts owned by `owner_id`, optionally narrowed to one account
    async fn list_scheduled_posts(
        &self,
        owner_id: &str,
        account_id: Option<&str>,
    ) -> Result<Vec<ScheduledPost>>;

    /// Scheduled posts with `scheduled_at <= up_to`
    async fn list_due_scheduled_posts(&self, up_to: i64) -> Result<Vec<ScheduledPost>>;

    /// `Scheduled -> Publishing` with the claim time, as
    /// [`QueueStore::claim_queue_item`]
    async fn claim_scheduled_post(&self, id: &str, now: i64) -> Result<bool>;

    /// Publishing posts claimed at or before `claimed_before`
    async fn list_stale_publishing(&self, claimed_before: i64) -> Result<Vec<ScheduledPost>>;

    async fn transition_scheduled_status(
        &self,
        id: &str,
        from: ScheduledPostStatus,
        to: ScheduledPostStatus,
    ) -> Result<bool>;
}

/// Read access to accounts, posts and media owned by the wider application
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_account(&self, id: &str) -> Result<Option<Account>>;

    async fn get_post(&self, id: &str) -> Result<Option<Post>>;

    async fn get_media(&self, id: &str) -> Result<Option<MediaFile>>;
}

/// Fire-and-forget audit trail. Implementations swallow their own failures.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn log_activity(&self, owner_id: &str, activity_type: &str, details: &str);
}

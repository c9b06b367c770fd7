//! Scheduled-post lifecycle
//!
//! A scheduled post is a single caller-owned publish bound to one durable
//! callback. It can be edited or canceled while `Scheduled`. When the
//! callback fires the handler claims it (`Scheduled -> Publishing`), passes it
//! through the rate limiter and publishes once; there is no retry budget.
//! A post left in `Publishing` longer than `queue.claim_timeout_secs` is
//! settled as Failed by the sweep.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{Event, EventBus};
use super::queue::INTERRUPTED_DISPATCH;
use super::{DispatchOutcome, SweepReport};
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{GramcastError, Result};
use crate::jobs::{Job, JobHandle, JobScheduler};
use crate::publishing::{PublishRequest, Publisher};
use crate::rate_limiter::RateLimiter;
use crate::store::{ActivityLog, Directory, ScheduledPostStore};
use crate::types::{Account, ActionType, Post, ScheduledPost, ScheduledPostStatus};

#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub account_id: String,
    pub media_id: String,
    pub caption: Option<String>,
    pub scheduled_at: i64,
    pub kind: ActionType,
}

/// Fields left as `None` are unchanged
#[derive(Debug, Clone, Default)]
pub struct UpdateScheduledPost {
    pub caption: Option<String>,
    pub scheduled_at: Option<i64>,
}

#[derive(Clone)]
pub struct ScheduledPostService {
    store: Arc<dyn ScheduledPostStore>,
    directory: Arc<dyn Directory>,
    activity: Arc<dyn ActivityLog>,
    limiter: RateLimiter,
    scheduler: Arc<dyn JobScheduler>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    settings: QueueConfig,
}

impl ScheduledPostService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ScheduledPostStore>,
        directory: Arc<dyn Directory>,
        activity: Arc<dyn ActivityLog>,
        limiter: RateLimiter,
        scheduler: Arc<dyn JobScheduler>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
        settings: QueueConfig,
    ) -> Self {
        Self {
            store,
            directory,
            activity,
            limiter,
            scheduler,
            publisher,
            clock,
            event_bus,
            settings,
        }
    }

    /// # Errors
    ///
    /// `InvalidInput` unless `scheduled_at` is in the future, `NotFound` for
    /// an unknown account or for media the caller does not own,
    /// `Unauthorized` for an account the caller does not own.
    pub async fn schedule(&self, owner_id: &str, request: ScheduleRequest) -> Result<ScheduledPost> {
        let now = self.clock.now();
        if request.scheduled_at <= now {
            return Err(GramcastError::InvalidInput(
                "Scheduled time must be in the future".to_string(),
            ));
        }

        self.owned_account(owner_id, &request.account_id).await?;
        let media = self
            .directory
            .get_media(&request.media_id)
            .await?
            .filter(|m| m.owner_id == owner_id)
            .ok_or_else(|| GramcastError::NotFound(format!("Media {}", request.media_id)))?;

        let mut post = ScheduledPost {
            id: Uuid::new_v4().to_string(),
            account_id: request.account_id,
            media_id: media.id,
            media_ref: media.media_ref,
            caption: request.caption,
            kind: request.kind,
            scheduled_at: request.scheduled_at,
            status: ScheduledPostStatus::Scheduled,
            job_handle: None,
            external_media_id: None,
            permalink: None,
            published_at: None,
            error_message: None,
            created_at: now,
        };
        self.store.create_scheduled_post(&post).await?;

        let handle = self.register(&post.id, post.scheduled_at).await?;
        post.job_handle = Some(handle.into_string());

        info!(
            scheduled_post_id = %post.id,
            account_id = %post.account_id,
            scheduled_at = post.scheduled_at,
            "Post scheduled"
        );
        self.activity
            .log_activity(
                owner_id,
                "PostScheduled",
                &format!("{} {} at {}", post.kind, post.id, post.scheduled_at),
            )
            .await;

        Ok(post)
    }

    /// Change the caption and/or time of a Scheduled post
    ///
    /// A new time replaces the callback. Passing the current time again is
    /// not a change; any other new time must be in the future.
    pub async fn update(
        &self,
        owner_id: &str,
        id: &str,
        changes: UpdateScheduledPost,
    ) -> Result<ScheduledPost> {
        let now = self.clock.now();
        let mut post = self.get(owner_id, id).await?;
        ensure_scheduled(&post)?;

        let new_time = changes.scheduled_at.filter(|t| *t != post.scheduled_at);
        if let Some(t) = new_time {
            if t <= now {
                return Err(GramcastError::InvalidInput(
                    "Scheduled time must be in the future".to_string(),
                ));
            }
        }

        if let Some(caption) = changes.caption {
            post.caption = Some(caption);
        }
        if let Some(t) = new_time {
            post.scheduled_at = t;
        }

        if !self
            .store
            .update_scheduled_post(&post, ScheduledPostStatus::Scheduled)
            .await?
        {
            return Err(self.not_scheduled(id).await);
        }

        if let Some(t) = new_time {
            self.cancel_callback(&post).await;
            let handle = self.register(&post.id, t).await?;
            post.job_handle = Some(handle.into_string());
        }

        info!(scheduled_post_id = id, rescheduled = new_time.is_some(), "Scheduled post updated");
        self.activity
            .log_activity(owner_id, "PostUpdated", &format!("{} at {}", id, post.scheduled_at))
            .await;

        Ok(post)
    }

    pub async fn cancel(&self, owner_id: &str, id: &str) -> Result<ScheduledPost> {
        let mut post = self.get(owner_id, id).await?;
        ensure_scheduled(&post)?;

        if !self
            .store
            .transition_scheduled_status(id, ScheduledPostStatus::Scheduled, ScheduledPostStatus::Canceled)
            .await?
        {
            return Err(self.not_scheduled(id).await);
        }
        post.status = ScheduledPostStatus::Canceled;
        self.cancel_callback(&post).await;

        info!(scheduled_post_id = id, "Scheduled post canceled");
        self.activity.log_activity(owner_id, "PostCanceled", id).await;
        Ok(post)
    }

    /// # Errors
    ///
    /// `NotFound` if the post does not exist, `Unauthorized` if its account
    /// is not owned by `owner_id`
    pub async fn get(&self, owner_id: &str, id: &str) -> Result<ScheduledPost> {
        let post = self
            .store
            .get_scheduled_post(id)
            .await?
            .ok_or_else(|| GramcastError::NotFound(format!("Scheduled post {}", id)))?;

        match self.directory.get_account(&post.account_id).await? {
            Some(account) if account.owner_id == owner_id => Ok(post),
            _ => Err(GramcastError::Unauthorized(format!(
                "Scheduled post {} belongs to another owner",
                id
            ))),
        }
    }

    pub async fn list(&self, owner_id: &str, account_id: Option<&str>) -> Result<Vec<ScheduledPost>> {
        if let Some(account_id) = account_id {
            self.owned_account(owner_id, account_id).await?;
        }
        self.store.list_scheduled_posts(owner_id, account_id).await
    }

    /// Fire handler for [`Job::PublishScheduledPost`]. Never fails; see
    /// [`DispatchOutcome`].
    pub async fn on_fire(&self, id: &str) -> DispatchOutcome {
        let mut post = match self.claim(id, self.clock.now()).await {
            Ok(Some(post)) => post,
            Ok(None) => return DispatchOutcome::Skipped,
            Err(e) => {
                error!(scheduled_post_id = id, error = %e, "Could not claim scheduled post");
                return DispatchOutcome::Interrupted {
                    error: e.to_string(),
                };
            }
        };

        match self.publish(&mut post).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Hand the post back and try again after the retry delay
                warn!(scheduled_post_id = id, error = %e, "Publish interrupted by storage error");
                let retry_at = self
                    .clock
                    .now()
                    .saturating_add(self.settings.retry_delay_secs as i64);
                match self.reschedule(&mut post, retry_at).await {
                    Ok(()) => DispatchOutcome::Retrying { retry_at },
                    Err(e) => {
                        error!(scheduled_post_id = id, error = %e, "Could not hand back scheduled post");
                        DispatchOutcome::Interrupted {
                            error: e.to_string(),
                        }
                    }
                }
            }
        }
    }

    async fn claim(&self, id: &str, now: i64) -> Result<Option<ScheduledPost>> {
        let Some(mut post) = self.store.get_scheduled_post(id).await? else {
            debug!(scheduled_post_id = id, "Fire for unknown scheduled post");
            return Ok(None);
        };

        if post.status != ScheduledPostStatus::Scheduled {
            debug!(scheduled_post_id = id, status = %post.status, "Stale fire");
            return Ok(None);
        }
        // Left over from before a reschedule
        if post.scheduled_at > now {
            debug!(scheduled_post_id = id, scheduled_at = post.scheduled_at, "Stale fire, not yet due");
            return Ok(None);
        }

        if !self.store.claim_scheduled_post(id, now).await? {
            debug!(scheduled_post_id = id, "Lost claim to a concurrent fire");
            return Ok(None);
        }

        post.status = ScheduledPostStatus::Publishing;
        Ok(Some(post))
    }

    /// Everything after the claim. `post` is Publishing and owned by us.
    async fn publish(&self, post: &mut ScheduledPost) -> Result<DispatchOutcome> {
        let account = match self.directory.get_account(&post.account_id).await? {
            Some(account) if account.is_active => account,
            Some(_) => {
                let reason = format!("Account {} is inactive", post.account_id);
                return self.settle_failed(post, reason).await;
            }
            None => {
                let reason = format!("Account {} not found", post.account_id);
                return self.settle_failed(post, reason).await;
            }
        };

        let _gate = self.limiter.lock_account(&post.account_id).await;
        let now = self.clock.now();
        if !self.limiter.is_allowed(&post.account_id, post.kind, now).await? {
            let until = self
                .limiter
                .next_available_time(&post.account_id, post.kind, now, now)
                .await?;
            self.reschedule(post, until).await?;

            info!(scheduled_post_id = %post.id, until, "Rate limited, deferred");
            self.event_bus.emit(Event::ScheduledPostDeferred {
                scheduled_post_id: post.id.clone(),
                until,
            });
            return Ok(DispatchOutcome::Deferred { until });
        }

        let owner_id = account.owner_id.clone();
        let request = publish_request(account, post);
        let result = self.publisher.publish(&request).await;
        let finished = self.clock.now();
        match result {
            Ok(receipt) => {
                if let Err(e) = self
                    .limiter
                    .tracker()
                    .record_action(&post.account_id, post.kind, finished)
                    .await
                {
                    error!(scheduled_post_id = %post.id, error = %e, "Published but failed to record rate limit action");
                }

                post.status = ScheduledPostStatus::Published;
                post.external_media_id = Some(receipt.external_media_id.clone());
                post.permalink = receipt.permalink;
                post.published_at = Some(finished);
                post.error_message = None;
                if let Err(e) = self
                    .store
                    .update_scheduled_post(post, ScheduledPostStatus::Publishing)
                    .await
                {
                    error!(scheduled_post_id = %post.id, error = %e, "Published but failed to record it");
                    return Ok(DispatchOutcome::Interrupted {
                        error: e.to_string(),
                    });
                }

                info!(
                    scheduled_post_id = %post.id,
                    external_media_id = %receipt.external_media_id,
                    "Scheduled post published"
                );
                self.activity
                    .log_activity(
                        &owner_id,
                        "PostPublished",
                        &format!("{} as {}", post.id, receipt.external_media_id),
                    )
                    .await;
                self.event_bus.emit(Event::ScheduledPostPublished {
                    scheduled_post_id: post.id.clone(),
                    external_media_id: receipt.external_media_id,
                });
                Ok(DispatchOutcome::Completed)
            }
            Err(e) => self.settle_failed(post, e.to_string()).await,
        }
    }

    async fn settle_failed(&self, post: &mut ScheduledPost, reason: String) -> Result<DispatchOutcome> {
        post.status = ScheduledPostStatus::Failed;
        post.error_message = Some(reason.clone());
        self.store
            .update_scheduled_post(post, ScheduledPostStatus::Publishing)
            .await?;

        error!(scheduled_post_id = %post.id, error = %reason, "Scheduled post failed");
        if let Some(account) = self.directory.get_account(&post.account_id).await.ok().flatten() {
            self.activity
                .log_activity(
                    &account.owner_id,
                    "PostPublishFailed",
                    &format!("{}: {}", post.id, reason),
                )
                .await;
        }
        self.event_bus.emit(Event::ScheduledPostFailed {
            scheduled_post_id: post.id.clone(),
            error: reason.clone(),
        });
        Ok(DispatchOutcome::Failed { error: reason })
    }

    /// Return a claimed post to Scheduled at `at` with a fresh callback
    async fn reschedule(&self, post: &mut ScheduledPost, at: i64) -> Result<()> {
        post.status = ScheduledPostStatus::Scheduled;
        post.scheduled_at = at;
        self.store
            .update_scheduled_post(post, ScheduledPostStatus::Publishing)
            .await?;

        match self.register(&post.id, at).await {
            Ok(handle) => post.job_handle = Some(handle.into_string()),
            Err(e) => {
                warn!(scheduled_post_id = %post.id, error = %e, "Could not register callback; left for sweep")
            }
        }
        Ok(())
    }

    /// Fail every post whose claim outlived `claim_timeout_secs`; the
    /// publish may have gone out, so it is never retried
    pub async fn settle_stale_claims(&self) -> Result<SweepReport> {
        let cutoff = self
            .clock
            .now()
            .saturating_sub(self.settings.claim_timeout_secs as i64);
        let stale = self.store.list_stale_publishing(cutoff).await?;

        let mut report = SweepReport::default();
        for mut post in stale {
            post.status = ScheduledPostStatus::Failed;
            post.error_message = Some(INTERRUPTED_DISPATCH.to_string());
            if !self
                .store
                .update_scheduled_post(&post, ScheduledPostStatus::Publishing)
                .await?
            {
                continue;
            }

            error!(scheduled_post_id = %post.id, "Settled abandoned claim as failed");
            if let Some(account) = self.directory.get_account(&post.account_id).await.ok().flatten() {
                self.activity
                    .log_activity(
                        &account.owner_id,
                        "PostPublishFailed",
                        &format!("{}: {}", post.id, INTERRUPTED_DISPATCH),
                    )
                    .await;
            }
            let outcome = DispatchOutcome::Failed {
                error: INTERRUPTED_DISPATCH.to_string(),
            };
            report.record(&outcome);
            self.event_bus.emit(Event::ScheduledPostFailed {
                scheduled_post_id: post.id,
                error: INTERRUPTED_DISPATCH.to_string(),
            });
        }
        Ok(report)
    }

    /// Fire every Scheduled post whose time has passed, at most
    /// `max_concurrent_jobs` at a time
    pub async fn process_due_scheduled(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let due = self.store.list_due_scheduled_posts(now).await?;
        if due.is_empty() {
            return Ok(SweepReport::default());
        }

        debug!(count = due.len(), "Sweeping due scheduled posts");
        let outcomes: Vec<DispatchOutcome> = stream::iter(due)
            .map(|post| async move { self.on_fire(&post.id).await })
            .buffer_unordered(self.settings.max_concurrent_jobs.max(1))
            .collect()
            .await;

        Ok(outcomes.iter().collect())
    }

    async fn register(&self, id: &str, at: i64) -> Result<JobHandle> {
        let handle = self
            .scheduler
            .schedule(
                Job::PublishScheduledPost {
                    scheduled_post_id: id.to_string(),
                },
                at,
            )
            .await?;
        self.store.set_scheduled_job_handle(id, handle.as_str()).await?;
        Ok(handle)
    }

    async fn cancel_callback(&self, post: &ScheduledPost) {
        let Some(handle) = post.job_handle.as_deref().map(JobHandle::new) else {
            return;
        };
        match self.scheduler.cancel(&handle).await {
            Ok(true) => {}
            Ok(false) => debug!(scheduled_post_id = %post.id, job_id = %handle, "Callback already gone"),
            Err(e) => warn!(scheduled_post_id = %post.id, job_id = %handle, error = %e, "Could not cancel callback"),
        }
    }

    async fn owned_account(&self, owner_id: &str, account_id: &str) -> Result<Account> {
        let account = self
            .directory
            .get_account(account_id)
            .await?
            .ok_or_else(|| GramcastError::NotFound(format!("Account {}", account_id)))?;
        if account.owner_id != owner_id {
            return Err(GramcastError::Unauthorized(format!(
                "Account {} belongs to another owner",
                account_id
            )));
        }
        Ok(account)
    }

    async fn not_scheduled(&self, id: &str) -> GramcastError {
        let status = match self.store.get_scheduled_post(id).await {
            Ok(Some(post)) => post.status.to_string(),
            _ => "gone".to_string(),
        };
        GramcastError::InvalidState(format!(
            "Scheduled post {} is {}, only scheduled posts can be changed",
            id, status
        ))
    }
}

fn ensure_scheduled(post: &ScheduledPost) -> Result<()> {
    if post.status != ScheduledPostStatus::Scheduled {
        return Err(GramcastError::InvalidState(format!(
            "Scheduled post {} is {}, only scheduled posts can be changed",
            post.id, post.status
        )));
    }
    Ok(())
}

fn publish_request(account: Account, post: &ScheduledPost) -> PublishRequest {
    PublishRequest {
        post: Post {
            id: post.id.clone(),
            account_id: post.account_id.clone(),
            media_ref: post.media_ref.clone(),
            caption: post.caption.clone(),
        },
        account,
        kind: post.kind,
    }
}

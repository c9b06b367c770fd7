//! Publish queue processor
//!
//! Items move `Pending -> Processing -> {Completed | Pending | Failed}` and
//! `Pending -> Canceled`. Every dispatch starts by claiming the item with an
//! atomic `Pending -> Processing` transition; a fire that loses the claim does
//! nothing. Only the claimant writes the item until it hands it back to
//! `Pending` or settles it. A claim that is still open after
//! `queue.claim_timeout_secs` belongs to a dispatch that died; the sweep
//! settles it as Failed, since the publish may already have gone out.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::events::{Event, EventBus};
use super::{DispatchOutcome, SweepReport};
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{GramcastError, Result};
use crate::jobs::{Job, JobScheduler};
use crate::publishing::{PublishReceipt, PublishRequest, Publisher};
use crate::rate_limiter::RateLimiter;
use crate::store::{Directory, QueueStore};
use crate::types::{Account, ActionType, Post, Priority, QueueItem, QueueStatus};

/// Error recorded on items whose dispatch never reported back
pub const INTERRUPTED_DISPATCH: &str = "Dispatch interrupted before its outcome was recorded";

/// Request to publish a post (or story) at or after a time
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub account_id: String,
    pub post_id: String,
    pub kind: ActionType,
    /// Defaults to now; past times are treated as now
    pub requested_at: Option<i64>,
    pub priority: Priority,
}

#[derive(Clone)]
pub struct PublishQueueService {
    store: Arc<dyn QueueStore>,
    directory: Arc<dyn Directory>,
    limiter: RateLimiter,
    scheduler: Arc<dyn JobScheduler>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    settings: QueueConfig,
}

impl PublishQueueService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn QueueStore>,
        directory: Arc<dyn Directory>,
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
            limiter,
            scheduler,
            publisher,
            clock,
            event_bus,
            settings,
        }
    }

    /// Create a Pending item and register its callback
    ///
    /// If the limiter would refuse an action right now, the item is scheduled
    /// for the next time it would accept one instead of the requested time.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown account or post, `InvalidInput` for an
    /// inactive account or a post owned by another account, and storage
    /// errors.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<QueueItem> {
        let now = self.clock.now();
        self.load_target(&request.account_id, &request.post_id).await?;

        let requested = request.requested_at.map_or(now, |t| t.max(now));
        let scheduled_at = if self
            .limiter
            .is_allowed(&request.account_id, request.kind, now)
            .await?
        {
            requested
        } else {
            self.limiter
                .next_available_time(&request.account_id, request.kind, requested, now)
                .await?
        };

        let item = QueueItem::new(
            request.account_id,
            request.post_id,
            request.kind,
            request.priority,
            scheduled_at,
            now,
        );
        let mut item = self.store.create_queue_item(item).await?;

        let handle = self
            .scheduler
            .schedule(
                Job::ProcessQueueItem {
                    queue_id: item.id.clone(),
                },
                scheduled_at,
            )
            .await?;
        self.store.set_queue_job_handle(&item.id, handle.as_str()).await?;
        item.job_handle = Some(handle.into_string());

        info!(
            queue_id = %item.id,
            account_id = %item.account_id,
            kind = %item.queue_type,
            scheduled_at,
            "Enqueued"
        );
        self.event_bus.emit(Event::ItemEnqueued {
            queue_id: item.id.clone(),
            account_id: item.account_id.clone(),
            scheduled_at,
        });

        Ok(item)
    }

    /// Fire handler for [`Job::ProcessQueueItem`]. Never fails; see
    /// [`DispatchOutcome`].
    pub async fn process_queue_item(&self, queue_id: &str) -> DispatchOutcome {
        let mut item = match self.claim(queue_id, self.clock.now()).await {
            Ok(Some(item)) => item,
            Ok(None) => return DispatchOutcome::Skipped,
            Err(e) => {
                error!(queue_id, error = %e, "Could not claim queue item");
                return DispatchOutcome::Interrupted {
                    error: e.to_string(),
                };
            }
        };

        match self.attempt(&mut item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Storage trouble mid-dispatch counts as a failed attempt
                warn!(queue_id, error = %e, "Dispatch interrupted by storage error");
                let now = self.clock.now();
                match self.retry_or_fail(&mut item, e.to_string(), now).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(queue_id, error = %e, "Could not record dispatch failure");
                        DispatchOutcome::Interrupted {
                            error: e.to_string(),
                        }
                    }
                }
            }
        }
    }

    /// Load the item and take ownership of it if it is due and Pending
    async fn claim(&self, queue_id: &str, now: i64) -> Result<Option<QueueItem>> {
        let Some(mut item) = self.store.get_queue_item(queue_id).await? else {
            debug!(queue_id, "Fire for unknown queue item");
            return Ok(None);
        };

        if item.status != QueueStatus::Pending {
            debug!(queue_id, status = %item.status, "Stale fire, item not pending");
            return Ok(None);
        }
        if item.scheduled_at > now {
            debug!(queue_id, scheduled_at = item.scheduled_at, "Stale fire, item not yet due");
            return Ok(None);
        }

        if !self.store.claim_queue_item(queue_id, now).await? {
            debug!(queue_id, "Lost claim to a concurrent dispatch");
            return Ok(None);
        }

        item.status = QueueStatus::Processing;
        Ok(Some(item))
    }

    /// Everything after the claim. `item` is Processing and owned by us.
    async fn attempt(&self, item: &mut QueueItem) -> Result<DispatchOutcome> {
        let _gate = self.limiter.lock_account(&item.account_id).await;
        let now = self.clock.now();
        if !self
            .limiter
            .is_allowed(&item.account_id, item.queue_type, now)
            .await?
        {
            let until = self
                .limiter
                .next_available_time(&item.account_id, item.queue_type, now, now)
                .await?;

            item.status = QueueStatus::Pending;
            item.scheduled_at = until;
            self.store.update_queue_item(item, QueueStatus::Processing).await?;
            self.rearm(item).await;

            info!(queue_id = %item.id, account_id = %item.account_id, until, "Rate limited, deferred");
            self.event_bus.emit(Event::ItemDeferred {
                queue_id: item.id.clone(),
                until,
            });
            return Ok(DispatchOutcome::Deferred { until });
        }

        item.attempt_count += 1;
        self.store.update_queue_item(item, QueueStatus::Processing).await?;

        let request = match self.load_target(&item.account_id, &item.post_id).await {
            Ok((account, post)) => PublishRequest {
                account,
                post,
                kind: item.queue_type,
            },
            Err(GramcastError::Database(e)) => return Err(e.into()),
            Err(e) => return self.fail(item, e.to_string(), now).await,
        };

        debug!(queue_id = %item.id, attempt = item.attempt_count, "Publishing");
        let result = self.publisher.publish(&request).await;
        let finished = self.clock.now();
        match result {
            Ok(receipt) => Ok(self.complete(item, receipt, finished).await),
            Err(e) => self.retry_or_fail(item, e.to_string(), finished).await,
        }
    }

    /// Record a successful publish. Never retries: the post is already out.
    async fn complete(&self, item: &mut QueueItem, receipt: PublishReceipt, now: i64) -> DispatchOutcome {
        if let Err(e) = self
            .limiter
            .tracker()
            .record_action(&item.account_id, item.queue_type, now)
            .await
        {
            error!(queue_id = %item.id, error = %e, "Published but failed to record rate limit action");
        }

        item.status = QueueStatus::Completed;
        item.processed_at = Some(now);
        item.error_message = None;
        if let Err(e) = self.store.update_queue_item(item, QueueStatus::Processing).await {
            error!(queue_id = %item.id, error = %e, "Published but failed to mark item completed");
            return DispatchOutcome::Interrupted {
                error: e.to_string(),
            };
        }

        info!(
            queue_id = %item.id,
            account_id = %item.account_id,
            attempt = item.attempt_count,
            external_media_id = %receipt.external_media_id,
            "Published"
        );
        self.event_bus.emit(Event::ItemCompleted {
            queue_id: item.id.clone(),
            external_media_id: receipt.external_media_id,
        });
        DispatchOutcome::Completed
    }

    async fn retry_or_fail(&self, item: &mut QueueItem, error: String, now: i64) -> Result<DispatchOutcome> {
        if item.attempt_count >= self.settings.max_retries {
            return self.fail(item, error, now).await;
        }

        let retry_at = now.saturating_add(self.settings.retry_delay_secs as i64);
        item.status = QueueStatus::Pending;
        item.scheduled_at = retry_at;
        item.error_message = Some(error.clone());
        self.store.update_queue_item(item, QueueStatus::Processing).await?;
        self.rearm(item).await;

        warn!(
            queue_id = %item.id,
            attempt = item.attempt_count,
            max_retries = self.settings.max_retries,
            retry_at,
            error = %error,
            "Publish attempt failed, will retry"
        );
        self.event_bus.emit(Event::ItemRetrying {
            queue_id: item.id.clone(),
            attempt: item.attempt_count,
            retry_at,
            error,
        });
        Ok(DispatchOutcome::Retrying { retry_at })
    }

    async fn fail(&self, item: &mut QueueItem, error: String, now: i64) -> Result<DispatchOutcome> {
        item.status = QueueStatus::Failed;
        item.processed_at = Some(now);
        item.error_message = Some(error.clone());
        self.store.update_queue_item(item, QueueStatus::Processing).await?;

        error!(
            queue_id = %item.id,
            account_id = %item.account_id,
            attempt = item.attempt_count,
            error = %error,
            "Queue item failed"
        );
        self.event_bus.emit(Event::ItemFailed {
            queue_id: item.id.clone(),
            error: error.clone(),
        });
        Ok(DispatchOutcome::Failed { error })
    }

    /// Fail every item whose claim outlived `claim_timeout_secs`
    ///
    /// Such an item was claimed by a dispatcher that crashed or could not
    /// record the outcome. Whether it was published is unknown, so it is
    /// never retried.
    pub async fn settle_stale_claims(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let cutoff = now.saturating_sub(self.settings.claim_timeout_secs as i64);
        let stale = self.store.list_stale_processing(cutoff).await?;

        let mut report = SweepReport::default();
        for mut item in stale {
            item.status = QueueStatus::Failed;
            item.processed_at = Some(now);
            item.error_message = Some(INTERRUPTED_DISPATCH.to_string());
            if !self.store.update_queue_item(&item, QueueStatus::Processing).await? {
                continue;
            }

            error!(
                queue_id = %item.id,
                account_id = %item.account_id,
                attempt = item.attempt_count,
                "Settled abandoned claim as failed"
            );
            let outcome = DispatchOutcome::Failed {
                error: INTERRUPTED_DISPATCH.to_string(),
            };
            report.record(&outcome);
            self.event_bus.emit(Event::ItemFailed {
                queue_id: item.id,
                error: INTERRUPTED_DISPATCH.to_string(),
            });
        }
        Ok(report)
    }

    /// Register a callback for the item's current `scheduled_at`. A failure
    /// here leaves a due Pending item that the next sweep picks up.
    async fn rearm(&self, item: &mut QueueItem) {
        let job = Job::ProcessQueueItem {
            queue_id: item.id.clone(),
        };
        let handle = match self.scheduler.schedule(job, item.scheduled_at).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(queue_id = %item.id, error = %e, "Could not register callback; left for sweep");
                return;
            }
        };

        if let Err(e) = self.store.set_queue_job_handle(&item.id, handle.as_str()).await {
            warn!(queue_id = %item.id, error = %e, "Could not store callback handle");
        }
        item.job_handle = Some(handle.into_string());
    }

    async fn load_target(&self, account_id: &str, post_id: &str) -> Result<(Account, Post)> {
        let account = self
            .directory
            .get_account(account_id)
            .await?
            .ok_or_else(|| GramcastError::NotFound(format!("Account {}", account_id)))?;
        if !account.is_active {
            return Err(GramcastError::InvalidInput(format!(
                "Account {} is inactive",
                account_id
            )));
        }

        let post = self
            .directory
            .get_post(post_id)
            .await?
            .ok_or_else(|| GramcastError::NotFound(format!("Post {}", post_id)))?;
        if post.account_id != account_id {
            return Err(GramcastError::InvalidInput(format!(
                "Post {} does not belong to account {}",
                post_id, account_id
            )));
        }

        Ok((account, post))
    }

    /// Cancel a Pending item
    ///
    /// # Errors
    ///
    /// `NotFound` if the item does not exist, `InvalidState` if it is no
    /// longer Pending.
    pub async fn cancel(&self, queue_id: &str) -> Result<QueueItem> {
        let mut item = self.get(queue_id).await?;

        if !self
            .store
            .transition_queue_status(queue_id, QueueStatus::Pending, QueueStatus::Canceled)
            .await?
        {
            let current = self.get(queue_id).await?;
            return Err(GramcastError::InvalidState(format!(
                "Queue item {} is {}, only pending items can be canceled",
                queue_id, current.status
            )));
        }
        item.status = QueueStatus::Canceled;

        if let Some(handle) = item.job_handle.as_deref() {
            let handle = crate::jobs::JobHandle::new(handle);
            match self.scheduler.cancel(&handle).await {
                Ok(true) => {}
                Ok(false) => debug!(queue_id, job_id = %handle, "Callback already gone"),
                Err(e) => warn!(queue_id, job_id = %handle, error = %e, "Could not cancel callback"),
            }
        }

        info!(queue_id, "Canceled");
        self.event_bus.emit(Event::ItemCanceled {
            queue_id: queue_id.to_string(),
        });
        Ok(item)
    }

    /// Dispatch every Pending item that is due, at most
    /// `max_concurrent_jobs` at a time
    pub async fn process_pending_queue(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let due = self.store.list_pending_queue(now).await?;
        if due.is_empty() {
            return Ok(SweepReport::default());
        }

        debug!(count = due.len(), "Sweeping due queue items");
        let outcomes: Vec<DispatchOutcome> = stream::iter(due)
            .map(|item| async move { self.process_queue_item(&item.id).await })
            .buffer_unordered(self.settings.max_concurrent_jobs.max(1))
            .collect()
            .await;

        Ok(outcomes.iter().collect())
    }

    /// Publish immediately, bypassing the queue but not the rate limiter
    ///
    /// # Errors
    ///
    /// Validation errors as for [`Self::enqueue`], `RateLimited` when the
    /// limiter refuses, `Publish` when the attempt fails.
    pub async fn publish_now(
        &self,
        account_id: &str,
        post_id: &str,
        kind: ActionType,
    ) -> Result<PublishReceipt> {
        let (account, post) = self.load_target(account_id, post_id).await?;

        let _gate = self.limiter.lock_account(account_id).await;
        let now = self.clock.now();
        if !self.limiter.is_allowed(account_id, kind, now).await? {
            let next_available = self
                .limiter
                .next_available_time(account_id, kind, now, now)
                .await?;
            return Err(GramcastError::RateLimited {
                action: kind,
                next_available,
            });
        }

        let request = PublishRequest { account, post, kind };
        let receipt = self.publisher.publish(&request).await?;
        self.limiter
            .tracker()
            .record_action(account_id, kind, self.clock.now())
            .await?;

        info!(
            account_id,
            post_id,
            external_media_id = %receipt.external_media_id,
            "Published immediately"
        );
        Ok(receipt)
    }

    pub async fn get(&self, queue_id: &str) -> Result<QueueItem> {
        self.store
            .get_queue_item(queue_id)
            .await?
            .ok_or_else(|| GramcastError::NotFound(format!("Queue item {}", queue_id)))
    }

    pub async fn list_by_account(&self, account_id: &str) -> Result<Vec<QueueItem>> {
        self.store.list_queue_by_account(account_id).await
    }
}

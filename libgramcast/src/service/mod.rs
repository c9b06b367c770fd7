//! Service layer for Gramcast
//!
//! `GramcastService` is the facade the binaries talk to. It wires one set of
//! collaborators into two sub-services:
//!
//! - [`PublishQueueService`]: enqueue, dispatch, retry and cancel queue items
//! - [`ScheduledPostService`]: the lifecycle of caller-owned scheduled posts
//!
//! and routes fired [`Job`]s to the right handler.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use libgramcast::{Collaborators, Config, Database, GramcastService, SystemClock};
//! use libgramcast::publishing::create_publisher;
//!
//! # async fn example() -> libgramcast::Result<()> {
//! let config = Config::load()?;
//! let db = Arc::new(Database::new(&config.database.path).await?);
//! let publisher = create_publisher(&config.publisher)?;
//! let service = GramcastService::new(
//!     &config,
//!     Collaborators::sqlite(db, publisher, Arc::new(SystemClock)),
//! );
//!
//! let report = service.run_due_jobs().await?;
//! println!("Fired {} jobs", report.total());
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod queue;
pub mod scheduled;

use futures::stream::{self, StreamExt};
use std::sync::Arc;

use self::events::{EventBus, EventReceiver};
use self::queue::PublishQueueService;
use self::scheduled::ScheduledPostService;
use crate::clock::Clock;
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::jobs::{ClaimedJob, Job, JobScheduler, JobSource, SqliteJobScheduler};
use crate::publishing::Publisher;
use crate::rate_limiter::RateLimiter;
use crate::store::{ActivityLog, Directory, QueueStore, RateLimitStore, ScheduledPostStore};
use crate::tracker::RateLimitTracker;

/// Most jobs claimed by one [`GramcastService::run_due_jobs`] pass
const JOB_BATCH_SIZE: usize = 100;

/// Result of one fire-handler invocation
///
/// Handlers never return `Err`: the job runner has nobody to report to, so
/// every way a dispatch can end is a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Stale or duplicate fire; nothing happened
    Skipped,
    /// Rate limited; re-armed for `until` without consuming an attempt
    Deferred { until: i64 },
    /// Published
    Completed,
    /// Attempt failed with budget left; re-armed for `retry_at`
    Retrying { retry_at: i64 },
    /// Terminal failure
    Failed { error: String },
    /// Storage failed before the outcome could be recorded; fire again later.
    /// An item still claimed after `queue.claim_timeout_secs` is failed by
    /// the sweep.
    Interrupted { error: String },
}

/// Tally of outcomes from a batch of dispatches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub completed: usize,
    pub deferred: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
    pub interrupted: usize,
}

impl SweepReport {
    pub fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Skipped => self.skipped += 1,
            DispatchOutcome::Deferred { .. } => self.deferred += 1,
            DispatchOutcome::Completed => self.completed += 1,
            DispatchOutcome::Retrying { .. } => self.retrying += 1,
            DispatchOutcome::Failed { .. } => self.failed += 1,
            DispatchOutcome::Interrupted { .. } => self.interrupted += 1,
        }
    }

    pub fn merge(&mut self, other: SweepReport) {
        self.completed += other.completed;
        self.deferred += other.deferred;
        self.retrying += other.retrying;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.interrupted += other.interrupted;
    }

    pub fn total(&self) -> usize {
        self.completed + self.deferred + self.retrying + self.failed + self.skipped + self.interrupted
    }
}

impl<'a> FromIterator<&'a DispatchOutcome> for SweepReport {
    fn from_iter<I: IntoIterator<Item = &'a DispatchOutcome>>(iter: I) -> Self {
        let mut report = SweepReport::default();
        for outcome in iter {
            report.record(outcome);
        }
        report
    }
}

/// Everything the services depend on, behind the seams they use
#[derive(Clone)]
pub struct Collaborators {
    pub queue_store: Arc<dyn QueueStore>,
    pub scheduled_store: Arc<dyn ScheduledPostStore>,
    pub rate_limit_store: Arc<dyn RateLimitStore>,
    pub directory: Arc<dyn Directory>,
    pub activity: Arc<dyn ActivityLog>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub job_source: Arc<dyn JobSource>,
    pub publisher: Arc<dyn Publisher>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// SQLite for every store and for durable jobs
    pub fn sqlite(db: Arc<Database>, publisher: Arc<dyn Publisher>, clock: Arc<dyn Clock>) -> Self {
        let jobs = Arc::new(SqliteJobScheduler::new(&db, Arc::clone(&clock)));
        Self {
            queue_store: db.clone(),
            scheduled_store: db.clone(),
            rate_limit_store: db.clone(),
            directory: db.clone(),
            activity: db,
            scheduler: jobs.clone(),
            job_source: jobs,
            publisher,
            clock,
        }
    }
}

pub struct GramcastService {
    queue: PublishQueueService,
    scheduled: ScheduledPostService,
    job_source: Arc<dyn JobSource>,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    max_concurrent_jobs: usize,
    retry_delay_secs: i64,
}

impl GramcastService {
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let event_bus = EventBus::new(100);
        let tracker = RateLimitTracker::new(
            collaborators.rate_limit_store.clone(),
            config.queue.origin.clone(),
        );
        let limiter = RateLimiter::new(tracker, config.rate_limits.clone());

        let queue = PublishQueueService::new(
            collaborators.queue_store.clone(),
            collaborators.directory.clone(),
            limiter.clone(),
            collaborators.scheduler.clone(),
            collaborators.publisher.clone(),
            collaborators.clock.clone(),
            event_bus.clone(),
            config.queue.clone(),
        );

        let scheduled = ScheduledPostService::new(
            collaborators.scheduled_store.clone(),
            collaborators.directory.clone(),
            collaborators.activity.clone(),
            limiter,
            collaborators.scheduler.clone(),
            collaborators.publisher.clone(),
            collaborators.clock.clone(),
            event_bus.clone(),
            config.queue.clone(),
        );

        Self {
            queue,
            scheduled,
            job_source: collaborators.job_source,
            clock: collaborators.clock,
            event_bus,
            max_concurrent_jobs: config.queue.max_concurrent_jobs.max(1),
            retry_delay_secs: config.queue.retry_delay_secs as i64,
        }
    }

    pub fn queue(&self) -> &PublishQueueService {
        &self.queue
    }

    pub fn scheduled(&self) -> &ScheduledPostService {
        &self.scheduled
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    /// Route one job to its handler
    pub async fn fire(&self, job: &Job) -> DispatchOutcome {
        match job {
            Job::ProcessQueueItem { queue_id } => self.queue.process_queue_item(queue_id).await,
            Job::PublishScheduledPost { scheduled_post_id } => {
                self.scheduled.on_fire(scheduled_post_id).await
            }
        }
    }

    /// Claim every due job (up to one batch) and fire them with bounded
    /// concurrency. Interrupted dispatches are released to fire again after
    /// the retry delay; everything else is marked done.
    pub async fn run_due_jobs(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let claimed = self.job_source.claim_due(now, JOB_BATCH_SIZE).await?;
        if claimed.is_empty() {
            return Ok(SweepReport::default());
        }

        tracing::debug!(count = claimed.len(), "Claimed due jobs");

        let outcomes: Vec<DispatchOutcome> = stream::iter(claimed)
            .map(|claimed| async move {
                let outcome = self.fire(&claimed.job).await;
                self.settle(&claimed, &outcome, now).await;
                outcome
            })
            .buffer_unordered(self.max_concurrent_jobs)
            .collect()
            .await;

        Ok(outcomes.iter().collect())
    }

    async fn settle(&self, claimed: &ClaimedJob, outcome: &DispatchOutcome, now: i64) {
        let result = match outcome {
            DispatchOutcome::Interrupted { .. } => {
                self.job_source
                    .release(claimed, now.saturating_add(self.retry_delay_secs))
                    .await
            }
            _ => self.job_source.complete(claimed).await,
        };

        if let Err(e) = result {
            // The job stays claimed; recover_interrupted re-arms it on restart
            tracing::warn!(job_id = %claimed.handle, error = %e, "Failed to settle job");
        }
    }

    /// Settle claims abandoned by a dead dispatcher, then re-dispatch due
    /// Pending queue items and due Scheduled posts whose callbacks were lost
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = self.queue.settle_stale_claims().await?;
        report.merge(self.scheduled.settle_stale_claims().await?);
        report.merge(self.queue.process_pending_queue().await?);
        report.merge(self.scheduled.process_due_scheduled().await?);
        Ok(report)
    }

    /// Re-arm jobs a previous runner claimed but never settled
    pub async fn recover_interrupted(&self) -> Result<u64> {
        self.job_source.recover_interrupted().await
    }
}

/// Shared fixtures for the service unit tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ActionLimits;
    use crate::jobs::MemoryJobScheduler;
    use crate::publishing::MockPublisher;
    use crate::types::{Account, MediaFile, Post};

    pub const T0: i64 = 1_700_000_000;

    pub struct Harness {
        pub db: Arc<Database>,
        pub jobs: MemoryJobScheduler,
        pub publisher: MockPublisher,
        pub clock: ManualClock,
        pub service: GramcastService,
    }

    pub fn unlimited() -> ActionLimits {
        ActionLimits {
            per_hour: None,
            per_day: None,
            min_delay_secs: 0,
        }
    }

    pub async fn harness(config: Config, publisher: MockPublisher) -> Harness {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let jobs = MemoryJobScheduler::new();
        let clock = ManualClock::new(T0);

        let collaborators = Collaborators {
            queue_store: db.clone(),
            scheduled_store: db.clone(),
            rate_limit_store: db.clone(),
            directory: db.clone(),
            activity: db.clone(),
            scheduler: Arc::new(jobs.clone()),
            job_source: Arc::new(jobs.clone()),
            publisher: Arc::new(publisher.clone()),
            clock: Arc::new(clock.clone()),
        };
        let service = GramcastService::new(&config, collaborators);

        db.create_account(&Account {
            id: "acct-1".to_string(),
            owner_id: "alice".to_string(),
            username: "alice.gallery".to_string(),
            is_active: true,
        })
        .await
        .unwrap();
        db.create_account(&Account {
            id: "acct-2".to_string(),
            owner_id: "bob".to_string(),
            username: "bob.shop".to_string(),
            is_active: true,
        })
        .await
        .unwrap();
        db.create_media(&MediaFile {
            id: "media-1".to_string(),
            owner_id: "alice".to_string(),
            media_ref: "https://cdn.example/alice/1.jpg".to_string(),
        })
        .await
        .unwrap();
        db.create_media(&MediaFile {
            id: "media-2".to_string(),
            owner_id: "bob".to_string(),
            media_ref: "https://cdn.example/bob/1.jpg".to_string(),
        })
        .await
        .unwrap();

        Harness {
            db,
            jobs,
            publisher,
            clock,
            service,
        }
    }

    impl Harness {
        pub async fn add_post(&self, account_id: &str) -> String {
            let id = uuid::Uuid::new_v4().to_string();
            self.db
                .create_post(&Post {
                    id: id.clone(),
                    account_id: account_id.to_string(),
                    media_ref: format!("https://cdn.example/{}.jpg", id),
                    caption: Some("caption".to_string()),
                })
                .await
                .unwrap();
            id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::error::PublishError;
    use crate::publishing::MockPublisher;
    use crate::service::queue::EnqueueRequest;
    use crate::service::scheduled::ScheduleRequest;
    use crate::types::{ActionType, Priority, QueueStatus, ScheduledPostStatus};

    fn config() -> Config {
        let mut config = Config::default();
        config.rate_limits.post = unlimited();
        config
    }

    #[test]
    fn test_sweep_report_tally() {
        let outcomes = vec![
            DispatchOutcome::Completed,
            DispatchOutcome::Completed,
            DispatchOutcome::Skipped,
            DispatchOutcome::Deferred { until: 5 },
            DispatchOutcome::Failed {
                error: "x".to_string(),
            },
        ];
        let report: SweepReport = outcomes.iter().collect();
        assert_eq!(report.completed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total(), 5);
    }

    #[tokio::test]
    async fn test_run_due_jobs_routes_both_job_kinds() {
        let h = harness(config(), MockPublisher::new()).await;
        let post_id = h.add_post("acct-1").await;

        let item = h
            .service
            .queue()
            .enqueue(EnqueueRequest {
                account_id: "acct-1".to_string(),
                post_id,
                kind: ActionType::Post,
                requested_at: None,
                priority: Priority::Normal,
            })
            .await
            .unwrap();

        let scheduled = h
            .service
            .scheduled()
            .schedule(
                "alice",
                ScheduleRequest {
                    account_id: "acct-1".to_string(),
                    media_id: "media-1".to_string(),
                    caption: None,
                    scheduled_at: T0 + 60,
                    kind: ActionType::Story,
                },
            )
            .await
            .unwrap();

        let report = h.service.run_due_jobs().await.unwrap();
        assert_eq!(report.completed, 1);

        h.clock.advance(60);
        let report = h.service.run_due_jobs().await.unwrap();
        assert_eq!(report.completed, 1);

        let item = h.service.queue().get(&item.id).await.unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
        let scheduled = h.service.scheduled().get("alice", &scheduled.id).await.unwrap();
        assert_eq!(scheduled.status, ScheduledPostStatus::Published);
        assert!(h.jobs.scheduled().is_empty());
    }

    #[tokio::test]
    async fn test_retry_is_driven_by_jobs() {
        let publisher = MockPublisher::failing_times(1, PublishError::Network("reset".to_string()));
        let h = harness(config(), publisher).await;
        let post_id = h.add_post("acct-1").await;

        let item = h
            .service
            .queue()
            .enqueue(EnqueueRequest {
                account_id: "acct-1".to_string(),
                post_id,
                kind: ActionType::Post,
                requested_at: None,
                priority: Priority::Normal,
            })
            .await
            .unwrap();

        let report = h.service.run_due_jobs().await.unwrap();
        assert_eq!(report.retrying, 1);

        // Nothing due until the retry delay passes
        h.clock.advance(299);
        assert_eq!(h.service.run_due_jobs().await.unwrap().total(), 0);

        h.clock.advance(1);
        let report = h.service.run_due_jobs().await.unwrap();
        assert_eq!(report.completed, 1);

        let item = h.service.queue().get(&item.id).await.unwrap();
        assert_eq!(item.attempt_count, 2);
        assert_eq!(h.publisher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_sweep_recovers_lost_callbacks() {
        let h = harness(config(), MockPublisher::new()).await;
        let post_id = h.add_post("acct-1").await;

        let item = h
            .service
            .queue()
            .enqueue(EnqueueRequest {
                account_id: "acct-1".to_string(),
                post_id,
                kind: ActionType::Post,
                requested_at: None,
                priority: Priority::Normal,
            })
            .await
            .unwrap();

        // Lose the callback
        for (handle, _, _) in h.jobs.scheduled() {
            h.jobs.cancel(&handle).await.unwrap();
        }
        assert_eq!(h.service.run_due_jobs().await.unwrap().total(), 0);

        let report = h.service.sweep().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(
            h.service.queue().get(&item.id).await.unwrap().status,
            QueueStatus::Completed
        );

        // Sweeping again is a no-op
        assert_eq!(h.service.sweep().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_after_crash_is_harmless() {
        let h = harness(config(), MockPublisher::new()).await;
        let post_id = h.add_post("acct-1").await;

        h.service
            .queue()
            .enqueue(EnqueueRequest {
                account_id: "acct-1".to_string(),
                post_id,
                kind: ActionType::Post,
                requested_at: None,
                priority: Priority::Normal,
            })
            .await
            .unwrap();

        // A runner claims and fires the job, then dies before settling it
        let claimed = h.jobs.claim_due(T0, 10).await.unwrap();
        assert_eq!(h.service.fire(&claimed[0].job).await, DispatchOutcome::Completed);

        assert_eq!(h.service.recover_interrupted().await.unwrap(), 1);
        let report = h.service.run_due_jobs().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(h.publisher.call_count(), 1);
    }
}

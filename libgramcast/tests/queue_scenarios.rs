//! End-to-end scenarios on a file-backed database with durable SQLite jobs
//!
//! Time is driven by a `ManualClock`; jobs are fired the way gram-send does,
//! through `GramcastService::run_due_jobs`.

use std::sync::Arc;

use libgramcast::config::ActionLimits;
use libgramcast::jobs::{Job, JobScheduler, JobSource, SqliteJobScheduler};
use libgramcast::publishing::MockPublisher;
use libgramcast::service::queue::{EnqueueRequest, INTERRUPTED_DISPATCH};
use libgramcast::service::scheduled::{ScheduleRequest, UpdateScheduledPost};
use libgramcast::store::{QueueStore, RateLimitStore};
use libgramcast::{
    Account, ActionType, Collaborators, Config, Database, GramcastService, ManualClock, MediaFile,
    Post, Priority, PublishError, QueueStatus, ScheduledPostStatus,
};
use tempfile::TempDir;

const T0: i64 = 1_700_000_000;

struct Env {
    _temp_dir: TempDir,
    config: Config,
    clock: ManualClock,
    publisher: MockPublisher,
    db: Arc<Database>,
    service: GramcastService,
}

impl Env {
    async fn new(post_limits: ActionLimits, publisher: MockPublisher) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("gramcast.db")
            .to_str()
            .unwrap()
            .to_string();

        let mut config = Config::default();
        config.database.path = db_path;
        config.rate_limits.post = post_limits;

        let clock = ManualClock::new(T0);
        let (db, service) = open(&config, &clock, &publisher).await;

        db.create_account(&Account {
            id: "acct-1".to_string(),
            owner_id: "alice".to_string(),
            username: "gallery".to_string(),
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

        Self {
            _temp_dir: temp_dir,
            config,
            clock,
            publisher,
            db,
            service,
        }
    }

    /// Simulate a process restart: close the pool and open everything again
    async fn restart(&mut self) {
        self.db.pool().close().await;
        let (db, service) = open(&self.config, &self.clock, &self.publisher).await;
        self.db = db;
        self.service = service;
    }

    async fn enqueue(&self, requested_at: Option<i64>) -> String {
        let post_id = uuid::Uuid::new_v4().to_string();
        self.db
            .create_post(&Post {
                id: post_id.clone(),
                account_id: "acct-1".to_string(),
                media_ref: format!("https://cdn.example/{}.jpg", post_id),
                caption: None,
            })
            .await
            .unwrap();

        self.service
            .queue()
            .enqueue(EnqueueRequest {
                account_id: "acct-1".to_string(),
                post_id,
                kind: ActionType::Post,
                requested_at,
                priority: Priority::Normal,
            })
            .await
            .unwrap()
            .id
    }

    async fn status(&self, queue_id: &str) -> QueueStatus {
        self.service.queue().get(queue_id).await.unwrap().status
    }

    async fn posts_in_window(&self, from: i64, to: i64) -> u32 {
        self.db
            .count_actions("acct-1", ActionType::Post, from, to)
            .await
            .unwrap()
    }

    fn sqlite_jobs(&self) -> SqliteJobScheduler {
        SqliteJobScheduler::new(&self.db, Arc::new(self.clock.clone()))
    }
}

async fn open(
    config: &Config,
    clock: &ManualClock,
    publisher: &MockPublisher,
) -> (Arc<Database>, GramcastService) {
    let db = Arc::new(Database::new(&config.database.path).await.unwrap());
    let service = GramcastService::new(
        config,
        Collaborators::sqlite(
            db.clone(),
            Arc::new(publisher.clone()),
            Arc::new(clock.clone()),
        ),
    );
    (db, service)
}

fn hourly(cap: u32) -> ActionLimits {
    ActionLimits {
        per_hour: Some(cap),
        per_day: None,
        min_delay_secs: 0,
    }
}

#[tokio::test]
async fn test_concurrent_dispatch_never_exceeds_hourly_cap() {
    let env = Env::new(hourly(2), MockPublisher::new()).await;
    let ids = [
        env.enqueue(None).await,
        env.enqueue(None).await,
        env.enqueue(None).await,
    ];

    let report = env.service.run_due_jobs().await.unwrap();
    assert_eq!(report.completed, 2);
    assert_eq!(report.deferred, 1);
    assert_eq!(env.posts_in_window(T0 - 3_599, T0).await, 2);

    // Nothing else fires inside the hour
    env.clock.set(T0 + 3_599);
    assert_eq!(env.service.run_due_jobs().await.unwrap().total(), 0);

    env.clock.set(T0 + 3_600);
    let report = env.service.run_due_jobs().await.unwrap();
    assert_eq!(report.completed, 1);

    for id in &ids {
        assert_eq!(env.status(id).await, QueueStatus::Completed);
    }
    assert_eq!(env.publisher.call_count(), 3);
}

#[tokio::test]
async fn test_min_delay_spaces_out_publishes() {
    let limits = ActionLimits {
        per_hour: None,
        per_day: None,
        min_delay_secs: 30,
    };
    let env = Env::new(limits, MockPublisher::new()).await;
    let first = env.enqueue(None).await;
    let second = env.enqueue(None).await;

    let report = env.service.run_due_jobs().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.deferred, 1);

    env.clock.advance(30);
    assert_eq!(env.service.run_due_jobs().await.unwrap().completed, 1);

    let mut processed: Vec<i64> = Vec::new();
    for id in [&first, &second] {
        processed.push(env.service.queue().get(id).await.unwrap().processed_at.unwrap());
    }
    processed.sort_unstable();
    assert_eq!(processed, vec![T0, T0 + 30]);
}

#[tokio::test]
async fn test_jobs_survive_restart() {
    let mut env = Env::new(hourly(10), MockPublisher::new()).await;
    let queue_id = env.enqueue(Some(T0 + 600)).await;

    env.restart().await;
    env.clock.set(T0 + 600);

    let report = env.service.run_due_jobs().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(env.status(&queue_id).await, QueueStatus::Completed);
}

#[tokio::test]
async fn test_claimed_job_recovered_after_crash() {
    let mut env = Env::new(hourly(10), MockPublisher::new()).await;
    let queue_id = env.enqueue(None).await;

    // A runner claims the job and dies before firing it
    let claimed = env.sqlite_jobs().claim_due(T0, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    env.restart().await;
    assert_eq!(env.service.run_due_jobs().await.unwrap().total(), 0);

    assert_eq!(env.service.recover_interrupted().await.unwrap(), 1);
    let report = env.service.run_due_jobs().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(env.status(&queue_id).await, QueueStatus::Completed);
    assert_eq!(env.publisher.call_count(), 1);
}

#[tokio::test]
async fn test_crash_after_item_claim_settles_as_failed() {
    let mut env = Env::new(hourly(10), MockPublisher::new()).await;
    let queue_id = env.enqueue(None).await;

    // The runner claims both the job and the item, then dies mid-publish
    assert_eq!(env.sqlite_jobs().claim_due(T0, 10).await.unwrap().len(), 1);
    assert!(env.db.claim_queue_item(&queue_id, T0).await.unwrap());
    env.restart().await;

    assert_eq!(env.service.recover_interrupted().await.unwrap(), 1);
    assert_eq!(env.service.run_due_jobs().await.unwrap().skipped, 1);
    assert_eq!(env.status(&queue_id).await, QueueStatus::Processing);

    let timeout = env.config.queue.claim_timeout_secs as i64;
    env.clock.set(T0 + timeout - 1);
    assert_eq!(env.service.sweep().await.unwrap().total(), 0);

    env.clock.set(T0 + timeout);
    assert_eq!(env.service.sweep().await.unwrap().failed, 1);

    let item = env.service.queue().get(&queue_id).await.unwrap();
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.error_message.as_deref(), Some(INTERRUPTED_DISPATCH));
    assert_eq!(env.publisher.call_count(), 0);

    // Settled once; later sweeps leave it alone
    env.clock.advance(30 * 86_400);
    assert_eq!(env.service.sweep().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_redelivered_job_is_a_noop() {
    let env = Env::new(hourly(10), MockPublisher::new()).await;
    let queue_id = env.enqueue(None).await;
    env.service.run_due_jobs().await.unwrap();

    env.sqlite_jobs()
        .schedule(
            Job::ProcessQueueItem {
                queue_id: queue_id.clone(),
            },
            T0,
        )
        .await
        .unwrap();

    let report = env.service.run_due_jobs().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(env.publisher.call_count(), 1);
    assert_eq!(env.posts_in_window(0, i64::MAX).await, 1);
}

#[tokio::test]
async fn test_retry_budget_through_durable_jobs() {
    let publisher = MockPublisher::always_failing(PublishError::Network("connection reset".to_string()));
    let env = Env::new(hourly(10), publisher).await;
    let queue_id = env.enqueue(None).await;

    for _ in 0..2 {
        assert_eq!(env.service.run_due_jobs().await.unwrap().retrying, 1);
        env.clock.advance(env.config.queue.retry_delay_secs as i64);
    }
    assert_eq!(env.service.run_due_jobs().await.unwrap().failed, 1);

    let item = env.service.queue().get(&queue_id).await.unwrap();
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.attempt_count, env.config.queue.max_retries);
    assert_eq!(
        item.error_message.as_deref(),
        Some("Network error: connection reset")
    );

    // Failed attempts never consume rate-limit slots
    assert_eq!(env.posts_in_window(0, i64::MAX).await, 0);
    assert_eq!(env.sqlite_jobs().scheduled_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_canceled_item_never_dispatches() {
    let env = Env::new(hourly(10), MockPublisher::new()).await;
    let queue_id = env.enqueue(Some(T0 + 60)).await;

    env.service.queue().cancel(&queue_id).await.unwrap();
    env.clock.advance(60);

    let mut report = env.service.run_due_jobs().await.unwrap();
    report.merge(env.service.sweep().await.unwrap());
    assert_eq!(report.completed, 0);
    assert_eq!(env.publisher.call_count(), 0);
    assert_eq!(env.status(&queue_id).await, QueueStatus::Canceled);
}

#[tokio::test]
async fn test_rescheduled_post_fires_only_at_new_time() {
    let env = Env::new(hourly(10), MockPublisher::new()).await;
    let scheduled = env.service.scheduled();
    let post = scheduled
        .schedule(
            "alice",
            ScheduleRequest {
                account_id: "acct-1".to_string(),
                media_id: "media-1".to_string(),
                caption: Some("Sunset".to_string()),
                scheduled_at: T0 + 600,
                kind: ActionType::Post,
            },
        )
        .await
        .unwrap();

    scheduled
        .update(
            "alice",
            &post.id,
            UpdateScheduledPost {
                caption: None,
                scheduled_at: Some(T0 + 1_200),
            },
        )
        .await
        .unwrap();
    assert_eq!(env.sqlite_jobs().scheduled_count().await.unwrap(), 1);

    env.clock.set(T0 + 600);
    assert_eq!(env.service.run_due_jobs().await.unwrap().total(), 0);

    env.clock.set(T0 + 1_200);
    assert_eq!(env.service.run_due_jobs().await.unwrap().completed, 1);

    let published = scheduled.get("alice", &post.id).await.unwrap();
    assert_eq!(published.status, ScheduledPostStatus::Published);
    assert_eq!(published.published_at, Some(T0 + 1_200));
}

#[tokio::test]
async fn test_sweep_picks_up_item_whose_job_was_lost() {
    let env = Env::new(hourly(10), MockPublisher::new()).await;
    let queue_id = env.enqueue(Some(T0 + 60)).await;

    let handle = env.service.queue().get(&queue_id).await.unwrap().job_handle.unwrap();
    assert!(env
        .sqlite_jobs()
        .cancel(&libgramcast::jobs::JobHandle::new(handle))
        .await
        .unwrap());

    env.clock.advance(60);
    assert_eq!(env.service.run_due_jobs().await.unwrap().total(), 0);
    assert_eq!(env.service.sweep().await.unwrap().completed, 1);
    assert_eq!(env.status(&queue_id).await, QueueStatus::Completed);
}

//! Job scheduler persisted in the `jobs` table

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::sync::Arc;
use uuid::Uuid;

use super::{ClaimedJob, Job, JobHandle, JobScheduler, JobSource};
use crate::clock::Clock;
use crate::db::Database;
use crate::error::{DbError, Result};

#[derive(Clone)]
pub struct SqliteJobScheduler {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteJobScheduler {
    pub fn new(db: &Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: db.pool().clone(),
            clock,
        }
    }

    /// Jobs still waiting to fire
    pub async fn scheduled_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = 'scheduled'")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(count.max(0) as u64)
    }

    /// Fire time of a job that has not run yet
    pub async fn fire_time(&self, handle: &JobHandle) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT fire_at FROM jobs WHERE id = ? AND status = 'scheduled'")
            .bind(handle.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| r.get("fire_at")))
    }

    async fn set_status(&self, handle: &JobHandle, from: &str, to: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(to)
            .bind(self.clock.now())
            .bind(handle.as_str())
            .bind(from)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl JobScheduler for SqliteJobScheduler {
    async fn schedule(&self, job: Job, fire_at: i64) -> Result<JobHandle> {
        let handle = JobHandle::new(Uuid::new_v4().to_string());
        let payload = serde_json::to_string(&job).map_err(DbError::Payload)?;
        let now = self.clock.now();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, payload, fire_at, status, attempts, created_at, updated_at)
            VALUES (?, ?, ?, 'scheduled', 0, ?, ?)
            "#,
        )
        .bind(handle.as_str())
        .bind(&payload)
        .bind(fire_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        tracing::debug!(job_id = %handle, fire_at, target = job.target_id(), "Scheduled job");
        Ok(handle)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<bool> {
        self.set_status(handle, "scheduled", "canceled").await
    }
}

#[async_trait]
impl JobSource for SqliteJobScheduler {
    async fn claim_due(&self, now: i64, limit: usize) -> Result<Vec<ClaimedJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload, fire_at, attempts FROM jobs
            WHERE status = 'scheduled' AND fire_at <= ?
            ORDER BY fire_at, created_at
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let handle = JobHandle::new(row.get::<String, _>("id"));
            let payload: String = row.get("payload");

            let job: Job = match serde_json::from_str(&payload) {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(job_id = %handle, error = %e, "Dropping job with unreadable payload");
                    self.set_status(&handle, "scheduled", "canceled").await?;
                    continue;
                }
            };

            let result = sqlx::query(
                r#"
                UPDATE jobs SET status = 'running', attempts = attempts + 1, updated_at = ?
                WHERE id = ? AND status = 'scheduled'
                "#,
            )
            .bind(now)
            .bind(handle.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

            // Another runner got there first
            if result.rows_affected() != 1 {
                continue;
            }

            claimed.push(ClaimedJob {
                handle,
                job,
                fire_at: row.get("fire_at"),
                attempts: row.get::<i64, _>("attempts").max(0) as u32 + 1,
            });
        }

        Ok(claimed)
    }

    async fn complete(&self, claimed: &ClaimedJob) -> Result<()> {
        self.set_status(&claimed.handle, "running", "done").await?;
        Ok(())
    }

    async fn release(&self, claimed: &ClaimedJob, retry_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'scheduled', fire_at = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(retry_at)
        .bind(self.clock.now())
        .bind(claimed.handle.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE jobs SET status = 'scheduled', updated_at = ? WHERE status = 'running'")
            .bind(self.clock.now())
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::warn!(recovered, "Re-armed jobs interrupted by a previous run");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database, SqliteJobScheduler) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("jobs.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let scheduler = SqliteJobScheduler::new(&db, Arc::new(ManualClock::new(1_000)));
        (temp_dir, db, scheduler)
    }

    fn queue_job(id: &str) -> Job {
        Job::ProcessQueueItem {
            queue_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_only_due_jobs_are_claimed() {
        let (_temp, _db, scheduler) = setup().await;
        scheduler.schedule(queue_job("early"), 100).await.unwrap();
        scheduler.schedule(queue_job("late"), 500).await.unwrap();

        let claimed = scheduler.claim_due(200, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job, queue_job("early"));
        assert_eq!(claimed[0].attempts, 1);

        // Claimed jobs are not handed out twice
        assert!(scheduler.claim_due(200, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_limit_and_order() {
        let (_temp, _db, scheduler) = setup().await;
        scheduler.schedule(queue_job("c"), 30).await.unwrap();
        scheduler.schedule(queue_job("a"), 10).await.unwrap();
        scheduler.schedule(queue_job("b"), 20).await.unwrap();

        let claimed = scheduler.claim_due(100, 2).await.unwrap();
        let targets: Vec<_> = claimed.iter().map(|c| c.job.target_id().to_string()).collect();
        assert_eq!(targets, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_cancel_prevents_fire() {
        let (_temp, _db, scheduler) = setup().await;
        let handle = scheduler.schedule(queue_job("x"), 100).await.unwrap();

        assert!(scheduler.cancel(&handle).await.unwrap());
        assert!(!scheduler.cancel(&handle).await.unwrap());
        assert!(scheduler.claim_due(1_000, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_claim_fails() {
        let (_temp, _db, scheduler) = setup().await;
        let handle = scheduler.schedule(queue_job("x"), 100).await.unwrap();
        scheduler.claim_due(100, 10).await.unwrap();

        assert!(!scheduler.cancel(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_rearms_job() {
        let (_temp, _db, scheduler) = setup().await;
        scheduler.schedule(queue_job("x"), 100).await.unwrap();

        let claimed = scheduler.claim_due(100, 10).await.unwrap();
        scheduler.release(&claimed[0], 400).await.unwrap();

        assert!(scheduler.claim_due(399, 10).await.unwrap().is_empty());
        let again = scheduler.claim_due(400, 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen_and_interrupted_runs_recover() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("jobs.db");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));

        {
            let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
            let scheduler = SqliteJobScheduler::new(&db, clock.clone());
            scheduler.schedule(queue_job("pending"), 100).await.unwrap();
            scheduler.schedule(queue_job("crashed"), 50).await.unwrap();

            // Claim one and "crash" before completing it
            let claimed = scheduler.claim_due(60, 1).await.unwrap();
            assert_eq!(claimed[0].job, queue_job("crashed"));
            db.pool().close().await;
        }

        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let scheduler = SqliteJobScheduler::new(&db, clock);
        assert_eq!(scheduler.recover_interrupted().await.unwrap(), 1);
        assert_eq!(scheduler.scheduled_count().await.unwrap(), 2);

        let claimed = scheduler.claim_due(1_000, 10).await.unwrap();
        assert_eq!(claimed.len(), 2);
    }

    #[tokio::test]
    async fn test_completed_jobs_are_not_recovered() {
        let (_temp, _db, scheduler) = setup().await;
        scheduler.schedule(queue_job("x"), 100).await.unwrap();
        let claimed = scheduler.claim_due(100, 10).await.unwrap();
        scheduler.complete(&claimed[0]).await.unwrap();

        assert_eq!(scheduler.recover_interrupted().await.unwrap(), 0);
        assert_eq!(scheduler.scheduled_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_payload_is_dropped() {
        let (_temp, db, scheduler) = setup().await;
        sqlx::query(
            "INSERT INTO jobs (id, payload, fire_at, status, attempts, created_at, updated_at)
             VALUES ('bad', 'not json', 10, 'scheduled', 0, 0, 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();
        scheduler.schedule(queue_job("good"), 20).await.unwrap();

        let claimed = scheduler.claim_due(100, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job, queue_job("good"));
        assert_eq!(scheduler.scheduled_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fire_time() {
        let (_temp, _db, scheduler) = setup().await;
        let handle = scheduler.schedule(queue_job("x"), 777).await.unwrap();
        assert_eq!(scheduler.fire_time(&handle).await.unwrap(), Some(777));

        scheduler.cancel(&handle).await.unwrap();
        assert_eq!(scheduler.fire_time(&handle).await.unwrap(), None);
    }
}

//! SQLite storage for Gramcast
//!
//! One [`Database`] backs every store trait in [`crate::store`] plus the
//! durable job table used by [`crate::jobs::SqliteJobScheduler`].

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DbError, Result};
use crate::store::{ActivityLog, Directory, QueueStore, RateLimitStore, ScheduledPostStore};
use crate::types::{
    Account, ActionType, MediaFile, Post, QueueItem, QueueStatus, RateLimitAction, ScheduledPost,
    ScheduledPostStatus,
};

/// One row of the audit trail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    pub owner_id: String,
    pub activity_type: String,
    pub details: String,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    /// Private in-memory database, for tests and dry runs
    ///
    /// Pinned to a single long-lived connection because every SQLite
    /// connection to `:memory:` sees its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(DbError::SqlxError)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // Directory writes
    // ========================================================================

    pub async fn create_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, owner_id, username, is_active, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.owner_id)
        .bind(&account.username)
        .bind(account.is_active)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn set_account_active(&self, account_id: &str, is_active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE accounts SET is_active = ? WHERE id = ?")
            .bind(is_active)
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn create_post(&self, post: &Post) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO posts (id, account_id, media_ref, caption, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.account_id)
        .bind(&post.media_ref)
        .bind(&post.caption)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn create_media(&self, media: &MediaFile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO media_files (id, owner_id, media_ref, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&media.id)
        .bind(&media.owner_id)
        .bind(&media.media_ref)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Most recent activity first
    pub async fn activity_for_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<ActivityEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT owner_id, activity_type, details, created_at
            FROM activity_log
            WHERE owner_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(owner_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| ActivityEntry {
                owner_id: r.get("owner_id"),
                activity_type: r.get("activity_type"),
                details: r.get("details"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}

fn parse_column<T: FromStr<Err = String>>(
    row: &SqliteRow,
    column: &str,
    table: &'static str,
) -> Result<T> {
    let raw: String = row.get(column);
    raw.parse::<T>()
        .map_err(|reason| DbError::CorruptRow { table, reason }.into())
}

fn queue_item_from_row(row: &SqliteRow) -> Result<QueueItem> {
    Ok(QueueItem {
        id: row.get("id"),
        account_id: row.get("account_id"),
        post_id: row.get("post_id"),
        queue_type: parse_column(row, "queue_type", "publish_queue")?,
        priority: parse_column(row, "priority", "publish_queue")?,
        status: parse_column(row, "status", "publish_queue")?,
        scheduled_at: row.get("scheduled_at"),
        processed_at: row.get("processed_at"),
        attempt_count: row.get::<i64, _>("attempt_count").max(0) as u32,
        error_message: row.get("error_message"),
        job_handle: row.get("job_handle"),
        created_at: row.get("created_at"),
    })
}

fn action_from_row(row: &SqliteRow) -> Result<RateLimitAction> {
    Ok(RateLimitAction {
        id: row.get("id"),
        account_id: row.get("account_id"),
        action_type: parse_column(row, "action_type", "rate_limit_actions")?,
        action_time: row.get("action_time"),
        origin: row.get("origin"),
    })
}

fn scheduled_post_from_row(row: &SqliteRow) -> Result<ScheduledPost> {
    Ok(ScheduledPost {
        id: row.get("id"),
        account_id: row.get("account_id"),
        media_id: row.get("media_id"),
        media_ref: row.get("media_ref"),
        caption: row.get("caption"),
        kind: parse_column(row, "kind", "scheduled_posts")?,
        scheduled_at: row.get("scheduled_at"),
        status: parse_column(row, "status", "scheduled_posts")?,
        job_handle: row.get("job_handle"),
        external_media_id: row.get("external_media_id"),
        permalink: row.get("permalink"),
        published_at: row.get("published_at"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
    })
}

const QUEUE_COLUMNS: &str = "id, account_id, post_id, queue_type, priority, status, scheduled_at, \
     processed_at, attempt_count, error_message, job_handle, created_at";

const SCHEDULED_COLUMNS: &str = "id, account_id, media_id, media_ref, caption, kind, scheduled_at, \
     status, job_handle, external_media_id, permalink, published_at, error_message, created_at";

#[async_trait]
impl QueueStore for Database {
    async fn create_queue_item(&self, item: QueueItem) -> Result<QueueItem> {
        sqlx::query(
            r#"
            INSERT INTO publish_queue (id, account_id, post_id, queue_type, priority, status,
                scheduled_at, processed_at, attempt_count, error_message, job_handle, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(&item.account_id)
        .bind(&item.post_id)
        .bind(item.queue_type.as_str())
        .bind(item.priority.as_str())
        .bind(item.status.as_str())
        .bind(item.scheduled_at)
        .bind(item.processed_at)
        .bind(item.attempt_count as i64)
        .bind(&item.error_message)
        .bind(&item.job_handle)
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(item)
    }

    async fn get_queue_item(&self, id: &str) -> Result<Option<QueueItem>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM publish_queue WHERE id = ?",
            QUEUE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(queue_item_from_row).transpose()
    }

    async fn update_queue_item(&self, item: &QueueItem, expected: QueueStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE publish_queue
            SET status = ?, scheduled_at = ?, processed_at = ?, attempt_count = ?,
                error_message = ?, job_handle = ?, priority = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(item.status.as_str())
        .bind(item.scheduled_at)
        .bind(item.processed_at)
        .bind(item.attempt_count as i64)
        .bind(&item.error_message)
        .bind(&item.job_handle)
        .bind(item.priority.as_str())
        .bind(&item.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_queue_job_handle(&self, id: &str, handle: &str) -> Result<()> {
        sqlx::query("UPDATE publish_queue SET job_handle = ? WHERE id = ?")
            .bind(handle)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn list_queue_by_account(&self, account_id: &str) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM publish_queue WHERE account_id = ? ORDER BY created_at, rowid",
            QUEUE_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(queue_item_from_row).collect()
    }

    async fn list_pending_queue(&self, up_to: i64) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM publish_queue
            WHERE status = 'pending' AND scheduled_at <= ?
            ORDER BY scheduled_at, created_at, rowid
            "#,
            QUEUE_COLUMNS
        ))
        .bind(up_to)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(queue_item_from_row).collect()
    }

    async fn claim_queue_item(&self, id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE publish_queue SET status = 'processing', claimed_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_stale_processing(&self, claimed_before: i64) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM publish_queue
            WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at <= ?)
            ORDER BY scheduled_at, created_at, rowid
            "#,
            QUEUE_COLUMNS
        ))
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(queue_item_from_row).collect()
    }

    async fn transition_queue_status(
        &self,
        id: &str,
        from: QueueStatus,
        to: QueueStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE publish_queue SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl RateLimitStore for Database {
    async fn insert_action(&self, action: &RateLimitAction) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO rate_limit_actions (account_id, action_type, action_time, origin)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&action.account_id)
        .bind(action.action_type.as_str())
        .bind(action.action_time)
        .bind(&action.origin)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.last_insert_rowid())
    }

    async fn count_actions(
        &self,
        account_id: &str,
        action_type: ActionType,
        from: i64,
        to: i64,
    ) -> Result<u32> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM rate_limit_actions
            WHERE account_id = ? AND action_type = ? AND action_time >= ? AND action_time <= ?
            "#,
        )
        .bind(account_id)
        .bind(action_type.as_str())
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(count.max(0) as u32)
    }

    async fn last_action(
        &self,
        account_id: &str,
        action_type: ActionType,
    ) -> Result<Option<RateLimitAction>> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, action_type, action_time, origin
            FROM rate_limit_actions
            WHERE account_id = ? AND action_type = ?
            ORDER BY action_time DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .bind(action_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(action_from_row).transpose()
    }

    async fn oldest_action_since(
        &self,
        account_id: &str,
        action_type: ActionType,
        since: i64,
    ) -> Result<Option<RateLimitAction>> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, action_type, action_time, origin
            FROM rate_limit_actions
            WHERE account_id = ? AND action_type = ? AND action_time >= ?
            ORDER BY action_time ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .bind(action_type.as_str())
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(action_from_row).transpose()
    }
}

#[async_trait]
impl ScheduledPostStore for Database {
    async fn create_scheduled_post(&self, post: &ScheduledPost) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_posts (id, account_id, media_id, media_ref, caption, kind,
                scheduled_at, status, job_handle, external_media_id, permalink, published_at,
                error_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.account_id)
        .bind(&post.media_id)
        .bind(&post.media_ref)
        .bind(&post.caption)
        .bind(post.kind.as_str())
        .bind(post.scheduled_at)
        .bind(post.status.as_str())
        .bind(&post.job_handle)
        .bind(&post.external_media_id)
        .bind(&post.permalink)
        .bind(post.published_at)
        .bind(&post.error_message)
        .bind(post.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn get_scheduled_post(&self, id: &str) -> Result<Option<ScheduledPost>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM scheduled_posts WHERE id = ?",
            SCHEDULED_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(scheduled_post_from_row).transpose()
    }

    async fn update_scheduled_post(
        &self,
        post: &ScheduledPost,
        expected: ScheduledPostStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET caption = ?, scheduled_at = ?, status = ?, job_handle = ?, external_media_id = ?,
                permalink = ?, published_at = ?, error_message = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(&post.caption)
        .bind(post.scheduled_at)
        .bind(post.status.as_str())
        .bind(&post.job_handle)
        .bind(&post.external_media_id)
        .bind(&post.permalink)
        .bind(post.published_at)
        .bind(&post.error_message)
        .bind(&post.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_scheduled_job_handle(&self, id: &str, handle: &str) -> Result<()> {
        sqlx::query("UPDATE scheduled_posts SET job_handle = ? WHERE id = ?")
            .bind(handle)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn list_scheduled_posts(
        &self,
        owner_id: &str,
        account_id: Option<&str>,
    ) -> Result<Vec<ScheduledPost>> {
        let columns = SCHEDULED_COLUMNS
            .split(", ")
            .map(|c| format!("sp.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");

        let mut query_str = format!(
            r#"
            SELECT {} FROM scheduled_posts sp
            JOIN accounts a ON a.id = sp.account_id
            WHERE a.owner_id = ?
            "#,
            columns
        );
        if account_id.is_some() {
            query_str.push_str(" AND sp.account_id = ?");
        }
        query_str.push_str(" ORDER BY sp.scheduled_at, sp.created_at");

        let mut query = sqlx::query(&query_str).bind(owner_id);
        if let Some(account) = account_id {
            query = query.bind(account);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(scheduled_post_from_row).collect()
    }

    async fn list_due_scheduled_posts(&self, up_to: i64) -> Result<Vec<ScheduledPost>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM scheduled_posts
            WHERE status = 'scheduled' AND scheduled_at <= ?
            ORDER BY scheduled_at, created_at
            "#,
            SCHEDULED_COLUMNS
        ))
        .bind(up_to)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(scheduled_post_from_row).collect()
    }

    async fn claim_scheduled_post(&self, id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE scheduled_posts SET status = 'publishing', claimed_at = ? WHERE id = ? AND status = 'scheduled'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_stale_publishing(&self, claimed_before: i64) -> Result<Vec<ScheduledPost>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM scheduled_posts
            WHERE status = 'publishing' AND (claimed_at IS NULL OR claimed_at <= ?)
            ORDER BY scheduled_at, created_at
            "#,
            SCHEDULED_COLUMNS
        ))
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(scheduled_post_from_row).collect()
    }

    async fn transition_scheduled_status(
        &self,
        id: &str,
        from: ScheduledPostStatus,
        to: ScheduledPostStatus,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE scheduled_posts SET status = ? WHERE id = ? AND status = ?")
                .bind(to.as_str())
                .bind(id)
                .bind(from.as_str())
                .execute(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl Directory for Database {
    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT id, owner_id, username, is_active FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| Account {
            id: r.get("id"),
            owner_id: r.get("owner_id"),
            username: r.get("username"),
            is_active: r.get("is_active"),
        }))
    }

    async fn get_post(&self, id: &str) -> Result<Option<Post>> {
        let row = sqlx::query("SELECT id, account_id, media_ref, caption FROM posts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| Post {
            id: r.get("id"),
            account_id: r.get("account_id"),
            media_ref: r.get("media_ref"),
            caption: r.get("caption"),
        }))
    }

    async fn get_media(&self, id: &str) -> Result<Option<MediaFile>> {
        let row = sqlx::query("SELECT id, owner_id, media_ref FROM media_files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| MediaFile {
            id: r.get("id"),
            owner_id: r.get("owner_id"),
            media_ref: r.get("media_ref"),
        }))
    }
}

#[async_trait]
impl ActivityLog for Database {
    async fn log_activity(&self, owner_id: &str, activity_type: &str, details: &str) {
        let result = sqlx::query(
            r#"
            INSERT INTO activity_log (owner_id, activity_type, details, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(owner_id)
        .bind(activity_type)
        .bind(details)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(owner_id, activity_type, error = %e, "Failed to write activity log");
        }
    }
}

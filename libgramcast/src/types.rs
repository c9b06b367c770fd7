//! Core types for Gramcast

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of publish action; doubles as the rate-limit action type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Post,
    Story,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Post => "post",
            ActionType::Story => "story",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "post" => Ok(ActionType::Post),
            "story" => Ok(ActionType::Story),
            _ => Err(format!(
                "Invalid action type: '{}'. Valid options: post, story",
                s
            )),
        }
    }
}

/// Queue priority. Stored for callers; dispatch order ignores it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(format!(
                "Invalid priority: '{}'. Valid options: high, normal, low",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Canceled => "canceled",
        }
    }

    /// Completed, Failed and Canceled accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Canceled
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            "canceled" => Ok(QueueStatus::Canceled),
            _ => Err(format!("Unknown queue status: '{}'", s)),
        }
    }
}

/// One intent to publish a post or story for an account at or after a time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub account_id: String,
    pub post_id: String,
    pub queue_type: ActionType,
    pub priority: Priority,
    pub status: QueueStatus,
    pub scheduled_at: i64,
    pub processed_at: Option<i64>,
    pub attempt_count: u32,
    pub error_message: Option<String>,
    pub job_handle: Option<String>,
    pub created_at: i64,
}

impl QueueItem {
    pub fn new(
        account_id: String,
        post_id: String,
        queue_type: ActionType,
        priority: Priority,
        scheduled_at: i64,
        created_at: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id,
            post_id,
            queue_type,
            priority,
            status: QueueStatus::Pending,
            scheduled_at,
            processed_at: None,
            attempt_count: 0,
            error_message: None,
            job_handle: None,
            created_at,
        }
    }
}

/// Append-only record of an action an account performed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitAction {
    pub id: Option<i64>,
    pub account_id: String,
    pub action_type: ActionType,
    pub action_time: i64,
    pub origin: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduledPostStatus {
    Scheduled,
    /// Claimed by a fire handler; publish in flight
    Publishing,
    Published,
    Failed,
    Canceled,
}

impl ScheduledPostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledPostStatus::Scheduled => "scheduled",
            ScheduledPostStatus::Publishing => "publishing",
            ScheduledPostStatus::Published => "published",
            ScheduledPostStatus::Failed => "failed",
            ScheduledPostStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduledPostStatus::Published
                | ScheduledPostStatus::Failed
                | ScheduledPostStatus::Canceled
        )
    }
}

impl fmt::Display for ScheduledPostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduledPostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ScheduledPostStatus::Scheduled),
            "publishing" => Ok(ScheduledPostStatus::Publishing),
            "published" => Ok(ScheduledPostStatus::Published),
            "failed" => Ok(ScheduledPostStatus::Failed),
            "canceled" => Ok(ScheduledPostStatus::Canceled),
            _ => Err(format!("Unknown scheduled post status: '{}'", s)),
        }
    }
}

/// A caller-owned single publish action bound to a durable job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledPost {
    pub id: String,
    pub account_id: String,
    pub media_id: String,
    pub media_ref: String,
    pub caption: Option<String>,
    pub kind: ActionType,
    pub scheduled_at: i64,
    pub status: ScheduledPostStatus,
    pub job_handle: Option<String>,
    pub external_media_id: Option<String>,
    pub permalink: Option<String>,
    pub published_at: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
}

// ============================================================================
// Directory entities
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub owner_id: String,
    pub username: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Post {
    pub id: String,
    pub account_id: String,
    pub media_ref: String,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaFile {
    pub id: String,
    pub owner_id: String,
    pub media_ref: String,
}

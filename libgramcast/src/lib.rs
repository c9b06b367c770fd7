//! Gramcast - rate-limited publish queue for Instagram-style accounts
//!
//! This library holds the scheduler core: the per-account rate limiter,
//! the publish queue processor, the scheduled-post lifecycle and the durable
//! job runner that ties them together. The `gram-queue` and `gram-send`
//! binaries are thin shells around [`GramcastService`].

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod publishing;
pub mod rate_limiter;
pub mod scheduling;
pub mod service;
pub mod store;
pub mod tracker;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use db::Database;
pub use error::{GramcastError, PublishError, Result};
pub use rate_limiter::RateLimiter;
pub use service::{Collaborators, DispatchOutcome, GramcastService, SweepReport};
pub use tracker::RateLimitTracker;
pub use types::{
    Account, ActionType, MediaFile, Post, Priority, QueueItem, QueueStatus, ScheduledPost,
    ScheduledPostStatus,
};

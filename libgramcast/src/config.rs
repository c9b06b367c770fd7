//! Configuration management for Gramcast

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::types::ActionType;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub rate_limits: RateLimitsConfig,
    pub queue: QueueConfig,
    pub daemon: DaemonConfig,
    pub publisher: PublisherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/gramcast/gramcast.db".to_string(),
        }
    }
}

/// Limits for one action type; `None` disables that window
///
/// `min_delay_secs` applies to whichever action type sets it. Stories ship
/// with no delay, but one can be configured the same way as for posts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ActionLimits {
    pub per_hour: Option<u32>,
    pub per_day: Option<u32>,
    pub min_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub post: ActionLimits,
    pub story: ActionLimits,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            post: ActionLimits {
                per_hour: Some(5),
                per_day: Some(25),
                min_delay_secs: 60,
            },
            story: ActionLimits {
                per_hour: None,
                per_day: Some(50),
                min_delay_secs: 0,
            },
        }
    }
}

impl RateLimitsConfig {
    pub fn for_action(&self, action: ActionType) -> &ActionLimits {
        match action {
            ActionType::Post => &self.post,
            ActionType::Story => &self.story,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Total publish attempts before an item settles in Failed
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub max_concurrent_jobs: usize,
    /// How long a claimed item may stay in flight before a sweep settles it
    /// as interrupted. Must outlast a publish attempt.
    pub claim_timeout_secs: u64,
    /// Tag stamped on every recorded rate-limit action
    pub origin: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 300,
            max_concurrent_jobs: 4,
            claim_timeout_secs: 900,
            origin: "gramcast".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub poll_interval_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PublisherKind {
    #[default]
    DryRun,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub kind: PublisherKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            kind: PublisherKind::DryRun,
            command: None,
            args: Vec::new(),
            timeout_secs: 120,
        }
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file at the default location yields the default
    /// configuration; an explicit `GRAMCAST_CONFIG` path must exist.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("GRAMCAST_CONFIG").is_ok();
        let config_path = resolve_config_path()?;

        let mut config = if !explicit && !config_path.exists() {
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            Self::default()
        } else {
            Self::load_from_path(&config_path)?
        };

        if let Ok(db_path) = std::env::var("GRAMCAST_DB_PATH") {
            config.database.path = db_path;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_retries == 0 {
            return Err(invalid("queue.max_retries", "must be at least 1"));
        }
        if self.queue.max_concurrent_jobs == 0 {
            return Err(invalid("queue.max_concurrent_jobs", "must be at least 1"));
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(invalid("daemon.poll_interval_secs", "must be at least 1"));
        }
        if self.daemon.sweep_interval_secs == 0 {
            return Err(invalid("daemon.sweep_interval_secs", "must be at least 1"));
        }
        if self.queue.retry_delay_secs > MAX_DELAY_SECS {
            return Err(invalid("queue.retry_delay_secs", "must be at most 30 days"));
        }
        if self.queue.claim_timeout_secs == 0 || self.queue.claim_timeout_secs > MAX_DELAY_SECS {
            return Err(invalid(
                "queue.claim_timeout_secs",
                "must be between 1 second and 30 days",
            ));
        }
        if self.publisher.kind == PublisherKind::Command
            && self.queue.claim_timeout_secs <= self.publisher.timeout_secs
        {
            return Err(invalid(
                "queue.claim_timeout_secs",
                "must be longer than publisher.timeout_secs",
            ));
        }

        for (name, limits) in [("post", &self.rate_limits.post), ("story", &self.rate_limits.story)] {
            if limits.per_hour == Some(0) {
                return Err(invalid(
                    &format!("rate_limits.{}.per_hour", name),
                    "a cap of 0 would block every action; omit it to disable",
                ));
            }
            if limits.min_delay_secs > MAX_DELAY_SECS {
                return Err(invalid(
                    &format!("rate_limits.{}.min_delay_secs", name),
                    "must be at most 30 days",
                ));
            }
            if limits.per_day == Some(0) {
                return Err(invalid(
                    &format!("rate_limits.{}.per_day", name),
                    "a cap of 0 would block every action; omit it to disable",
                ));
            }
        }

        if self.publisher.kind == PublisherKind::Command {
            match self.publisher.command.as_deref() {
                Some(cmd) if !cmd.trim().is_empty() => {}
                _ => return Err(ConfigError::MissingField("publisher.command".to_string()).into()),
            }
        }

        Ok(())
    }
}

/// Upper bound for every configured delay
pub const MAX_DELAY_SECS: u64 = 30 * 86_400;

fn invalid(field: &str, reason: &str) -> crate::error::GramcastError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("GRAMCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("gramcast").join("config.toml"))
}

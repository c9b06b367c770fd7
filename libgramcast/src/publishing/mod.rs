//! Publishing collaborator
//!
//! The scheduler core treats one call to [`Publisher::publish`] as one
//! attempt. Whether an attempt is retried is decided by the caller, never by
//! the publisher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{PublisherConfig, PublisherKind};
use crate::error::{ConfigError, PublishError, Result};
use crate::types::{Account, ActionType, Post};

pub mod command;
pub mod dry_run;
pub mod mock;

pub use command::CommandPublisher;
pub use dry_run::DryRunPublisher;
pub use mock::MockPublisher;

/// Everything a publisher needs for one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub account: Account,
    pub post: Post,
    pub kind: ActionType,
}

/// What the upstream platform handed back for a successful publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub external_media_id: String,
    pub permalink: Option<String>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(
        &self,
        request: &PublishRequest,
    ) -> std::result::Result<PublishReceipt, PublishError>;
}

/// Build the publisher selected in configuration
pub fn create_publisher(config: &PublisherConfig) -> Result<Arc<dyn Publisher>> {
    match config.kind {
        PublisherKind::DryRun => Ok(Arc::new(DryRunPublisher::new())),
        PublisherKind::Command => {
            let program = config
                .command
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingField("publisher.command".to_string()))?;

            let program = shellexpand::tilde(program).to_string();
            Ok(Arc::new(CommandPublisher::new(
                program,
                config.args.clone(),
                Duration::from_secs(config.timeout_secs),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GramcastError;

    #[test]
    fn test_create_dry_run_by_default() {
        let publisher = create_publisher(&PublisherConfig::default()).unwrap();
        assert_eq!(publisher.name(), "dry-run");
    }

    #[test]
    fn test_command_without_program_is_config_error() {
        let config = PublisherConfig {
            kind: PublisherKind::Command,
            command: Some("   ".to_string()),
            ..PublisherConfig::default()
        };

        match create_publisher(&config) {
            Err(GramcastError::Config(ConfigError::MissingField(field))) => {
                assert_eq!(field, "publisher.command");
            }
            Err(other) => panic!("Expected missing field error, got {:?}", other),
            Ok(_) => panic!("Expected missing field error"),
        }
    }

    #[test]
    fn test_command_publisher_selected() {
        let config = PublisherConfig {
            kind: PublisherKind::Command,
            command: Some("/bin/cat".to_string()),
            ..PublisherConfig::default()
        };
        assert_eq!(create_publisher(&config).unwrap().name(), "command");
    }
}

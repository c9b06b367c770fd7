//! Publisher that only logs what it would have sent

use async_trait::async_trait;
use uuid::Uuid;

use super::{PublishReceipt, PublishRequest, Publisher};
use crate::error::PublishError;

#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunPublisher;

impl DryRunPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Publisher for DryRunPublisher {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        tracing::info!(
            account_id = %request.account.id,
            username = %request.account.username,
            post_id = %request.post.id,
            kind = %request.kind,
            media_ref = %request.post.media_ref,
            "[dry-run] Would publish"
        );

        Ok(PublishReceipt {
            external_media_id: format!("dry-run-{}", Uuid::new_v4()),
            permalink: None,
        })
    }
}

//! Rate limit tracker
//!
//! Thin wrapper over the append-only action ledger. Every action it records
//! is stamped with the origin tag of the running process.

use std::sync::Arc;

use crate::error::Result;
use crate::store::RateLimitStore;
use crate::types::{ActionType, RateLimitAction};

#[derive(Clone)]
pub struct RateLimitTracker {
    store: Arc<dyn RateLimitStore>,
    origin: String,
}

impl RateLimitTracker {
    pub fn new(store: Arc<dyn RateLimitStore>, origin: impl Into<String>) -> Self {
        Self {
            store,
            origin: origin.into(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Append one action to the ledger
    pub async fn record_action(
        &self,
        account_id: &str,
        action_type: ActionType,
        time: i64,
    ) -> Result<RateLimitAction> {
        let mut action = RateLimitAction {
            id: None,
            account_id: account_id.to_string(),
            action_type,
            action_time: time,
            origin: self.origin.clone(),
        };

        let id = self.store.insert_action(&action).await?;
        action.id = Some(id);

        tracing::debug!(
            account_id,
            action_type = %action_type,
            action_time = time,
            "Recorded rate limit action"
        );

        Ok(action)
    }

    /// Number of actions with `from <= action_time <= to`
    pub async fn count_actions(
        &self,
        account_id: &str,
        action_type: ActionType,
        from: i64,
        to: i64,
    ) -> Result<u32> {
        if from > to {
            return Ok(0);
        }
        self.store.count_actions(account_id, action_type, from, to).await
    }

    pub async fn last_action(
        &self,
        account_id: &str,
        action_type: ActionType,
    ) -> Result<Option<RateLimitAction>> {
        self.store.last_action(account_id, action_type).await
    }

    /// Earliest action at or after `window_start`
    pub async fn oldest_action_in_window(
        &self,
        account_id: &str,
        action_type: ActionType,
        window_start: i64,
    ) -> Result<Option<RateLimitAction>> {
        self.store
            .oldest_action_since(account_id, action_type, window_start)
            .await
    }
}

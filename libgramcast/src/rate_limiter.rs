//! Sliding-window rate limiting per account and action type
//!
//! Each action type has an optional hourly cap, an optional daily cap and a
//! minimum delay between consecutive actions. A window of length `L` evaluated
//! at `now` covers `(now - L, now]`, so an action stops counting at exactly
//! `action_time + L`. That is also the instant [`RateLimiter::next_available_time`]
//! reports for a saturated window, which keeps the two answers consistent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::config::{ActionLimits, RateLimitsConfig};
use crate::error::Result;
use crate::tracker::RateLimitTracker;
use crate::types::ActionType;

pub const HOUR_SECS: i64 = 3_600;
pub const DAY_SECS: i64 = 86_400;

/// Rate limiter backed by the action ledger
///
/// Clones share the per-account gates handed out by
/// [`RateLimiter::lock_account`].
#[derive(Clone)]
pub struct RateLimiter {
    tracker: RateLimitTracker,
    limits: RateLimitsConfig,
    gates: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl RateLimiter {
    pub fn new(tracker: RateLimitTracker, limits: RateLimitsConfig) -> Self {
        Self {
            tracker,
            limits,
            gates: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Serialize check, publish and record for one account in this process
    ///
    /// Hold the guard from [`RateLimiter::is_allowed`] until the action is
    /// recorded; otherwise two dispatches can both see the last free slot.
    pub async fn lock_account(&self, account_id: &str) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.gates.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(gates.entry(account_id.to_string()).or_default())
        };
        gate.lock_owned().await
    }

    pub fn tracker(&self) -> &RateLimitTracker {
        &self.tracker
    }

    pub fn limits(&self, action_type: ActionType) -> &ActionLimits {
        self.limits.for_action(action_type)
    }

    /// Whether one more action of this type may happen at `now`
    pub async fn is_allowed(&self, account_id: &str, action_type: ActionType, now: i64) -> Result<bool> {
        let limits = self.limits(action_type);

        if limits.min_delay_secs > 0 {
            if let Some(last) = self.tracker.last_action(account_id, action_type).await? {
                if now < last.action_time.saturating_add(limits.min_delay_secs as i64) {
                    tracing::debug!(account_id, action_type = %action_type, "Minimum delay not yet elapsed");
                    return Ok(false);
                }
            }
        }

        for (window, cap) in capped_windows(limits) {
            let count = self
                .tracker
                .count_actions(account_id, action_type, window_start(now, window), now)
                .await?;
            if count >= cap {
                tracing::debug!(
                    account_id,
                    action_type = %action_type,
                    window,
                    count,
                    cap,
                    "Window cap reached"
                );
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Earliest time not before `requested` at which the limits allow the
    /// next action, given the ledger as it stands at `now`
    pub async fn next_available_time(
        &self,
        account_id: &str,
        action_type: ActionType,
        requested: i64,
        now: i64,
    ) -> Result<i64> {
        let limits = self.limits(action_type);
        let mut next = requested;

        if limits.min_delay_secs > 0 {
            if let Some(last) = self.tracker.last_action(account_id, action_type).await? {
                next = next.max(last.action_time.saturating_add(limits.min_delay_secs as i64));
            }
        }

        for (window, cap) in capped_windows(limits) {
            let start = window_start(now, window);
            let count = self
                .tracker
                .count_actions(account_id, action_type, start, now)
                .await?;
            if count < cap {
                continue;
            }
            if let Some(oldest) = self
                .tracker
                .oldest_action_in_window(account_id, action_type, start)
                .await?
            {
                next = next.max(oldest.action_time.saturating_add(window));
            }
        }

        Ok(next)
    }
}

fn capped_windows(limits: &ActionLimits) -> impl Iterator<Item = (i64, u32)> {
    [(HOUR_SECS, limits.per_hour), (DAY_SECS, limits.per_day)]
        .into_iter()
        .filter_map(|(window, cap)| cap.map(|cap| (window, cap)))
}

fn window_start(now: i64, window: i64) -> i64 {
    now - window + 1
}

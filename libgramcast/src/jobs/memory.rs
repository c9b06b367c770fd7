//! In-process job scheduler for tests and simulations
//!
//! Same contract as the SQLite scheduler, but nothing survives the process.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::{ClaimedJob, Job, JobHandle, JobScheduler, JobSource};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Scheduled,
    Running,
    Done,
    Canceled,
}

#[derive(Debug, Clone)]
struct Slot {
    job: Job,
    fire_at: i64,
    state: SlotState,
    attempts: u32,
}

#[derive(Debug, Default)]
struct Inner {
    // Keyed by insertion sequence so ties on fire_at keep FIFO order
    slots: BTreeMap<u64, Slot>,
    next_seq: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryJobScheduler {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryJobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs still waiting to fire, ordered by fire time
    pub fn scheduled(&self) -> Vec<(JobHandle, Job, i64)> {
        let inner = self.lock();
        let mut jobs: Vec<_> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.state == SlotState::Scheduled)
            .map(|(seq, slot)| (handle_for(*seq), slot.job.clone(), slot.fire_at))
            .collect();
        jobs.sort_by_key(|(_, _, fire_at)| *fire_at);
        jobs
    }

    /// Fire time of `handle` if it has not run or been canceled
    pub fn fire_time(&self, handle: &JobHandle) -> Option<i64> {
        let inner = self.lock();
        parse_handle(handle)
            .and_then(|seq| inner.slots.get(&seq))
            .filter(|slot| slot.state == SlotState::Scheduled)
            .map(|slot| slot.fire_at)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the map half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, handle: &JobHandle, from: SlotState, to: SlotState) -> bool {
        let mut inner = self.lock();
        match parse_handle(handle).and_then(|seq| inner.slots.get_mut(&seq)) {
            Some(slot) if slot.state == from => {
                slot.state = to;
                true
            }
            _ => false,
        }
    }
}

fn handle_for(seq: u64) -> JobHandle {
    JobHandle::new(format!("mem-{}", seq))
}

fn parse_handle(handle: &JobHandle) -> Option<u64> {
    handle.as_str().strip_prefix("mem-")?.parse().ok()
}

#[async_trait]
impl JobScheduler for MemoryJobScheduler {
    async fn schedule(&self, job: Job, fire_at: i64) -> Result<JobHandle> {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.slots.insert(
            seq,
            Slot {
                job,
                fire_at,
                state: SlotState::Scheduled,
                attempts: 0,
            },
        );
        Ok(handle_for(seq))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<bool> {
        Ok(self.transition(handle, SlotState::Scheduled, SlotState::Canceled))
    }
}

#[async_trait]
impl JobSource for MemoryJobScheduler {
    async fn claim_due(&self, now: i64, limit: usize) -> Result<Vec<ClaimedJob>> {
        let mut inner = self.lock();

        let mut due: Vec<(i64, u64)> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.state == SlotState::Scheduled && slot.fire_at <= now)
            .map(|(seq, slot)| (slot.fire_at, *seq))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, seq) in due {
            if let Some(slot) = inner.slots.get_mut(&seq) {
                slot.state = SlotState::Running;
                slot.attempts += 1;
                claimed.push(ClaimedJob {
                    handle: handle_for(seq),
                    job: slot.job.clone(),
                    fire_at: slot.fire_at,
                    attempts: slot.attempts,
                });
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, claimed: &ClaimedJob) -> Result<()> {
        self.transition(&claimed.handle, SlotState::Running, SlotState::Done);
        Ok(())
    }

    async fn release(&self, claimed: &ClaimedJob, retry_at: i64) -> Result<()> {
        let mut inner = self.lock();
        if let Some(slot) = parse_handle(&claimed.handle).and_then(|seq| inner.slots.get_mut(&seq)) {
            if slot.state == SlotState::Running {
                slot.state = SlotState::Scheduled;
                slot.fire_at = retry_at;
            }
        }
        Ok(())
    }

    async fn recover_interrupted(&self) -> Result<u64> {
        let mut inner = self.lock();
        let mut recovered = 0;
        for slot in inner.slots.values_mut() {
            if slot.state == SlotState::Running {
                slot.state = SlotState::Scheduled;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> Job {
        Job::PublishScheduledPost {
            scheduled_post_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_schedule_claim_complete() {
        let scheduler = MemoryJobScheduler::new();
        let handle = scheduler.schedule(job("a"), 10).await.unwrap();
        assert_eq!(scheduler.fire_time(&handle), Some(10));

        assert!(scheduler.claim_due(9, 10).await.unwrap().is_empty());
        let claimed = scheduler.claim_due(10, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].handle, handle);

        scheduler.complete(&claimed[0]).await.unwrap();
        assert!(scheduler.scheduled().is_empty());
        assert_eq!(scheduler.recover_interrupted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ties_fire_in_insertion_order() {
        let scheduler = MemoryJobScheduler::new();
        scheduler.schedule(job("first"), 5).await.unwrap();
        scheduler.schedule(job("second"), 5).await.unwrap();
        scheduler.schedule(job("zeroth"), 1).await.unwrap();

        let claimed = scheduler.claim_due(5, 10).await.unwrap();
        let order: Vec<_> = claimed.iter().map(|c| c.job.target_id().to_string()).collect();
        assert_eq!(order, vec!["zeroth", "first", "second"]);
    }

    #[tokio::test]
    async fn test_cancel_and_recover() {
        let scheduler = MemoryJobScheduler::new();
        let canceled = scheduler.schedule(job("a"), 1).await.unwrap();
        scheduler.schedule(job("b"), 1).await.unwrap();

        assert!(scheduler.cancel(&canceled).await.unwrap());
        assert!(!scheduler.cancel(&JobHandle::new("bogus")).await.unwrap());

        let claimed = scheduler.claim_due(1, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(scheduler.recover_interrupted().await.unwrap(), 1);

        let again = scheduler.claim_due(1, 10).await.unwrap();
        assert_eq!(again[0].attempts, 2);
    }
}

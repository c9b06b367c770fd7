//! Scripted publisher for tests
//!
//! Outcomes are consumed in order; once the script runs out every call gets
//! the fallback outcome (success unless built with `always_failing`). Clones
//! share their script and call log, so a test can keep one handle for
//! assertions after passing another to the services.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{PublishReceipt, PublishRequest, Publisher};
use crate::clock::ManualClock;
use crate::error::PublishError;

#[derive(Debug, Clone, Default)]
pub struct MockPublisher {
    script: Arc<Mutex<VecDeque<Result<(), PublishError>>>>,
    requests: Arc<Mutex<Vec<PublishRequest>>>,
    fallback: Option<PublishError>,
    delay: Duration,
    elapsed: Arc<Mutex<Option<(ManualClock, i64)>>>,
}

impl MockPublisher {
    /// Publisher that always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Publisher that fails with `error` on every call
    pub fn always_failing(error: PublishError) -> Self {
        Self {
            fallback: Some(error),
            ..Self::default()
        }
    }

    /// Publisher that fails `failures` times, then succeeds
    pub fn failing_times(failures: usize, error: PublishError) -> Self {
        let publisher = Self::new();
        for _ in 0..failures {
            publisher.push_failure(error.clone());
        }
        publisher
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Advance `clock` by `seconds` inside every call, as if publishing
    /// took that long
    pub fn set_publish_time(&self, clock: &ManualClock, seconds: i64) {
        *self.elapsed.lock().unwrap() = Some((clock.clone(), seconds));
    }

    pub fn push_failure(&self, error: PublishError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn push_success(&self) {
        self.script.lock().unwrap().push_back(Ok(()));
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<PublishRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    fn name(&self) -> &str {
        "mock"
    }

    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        let attempt = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some((clock, seconds)) = self.elapsed.lock().unwrap().clone() {
            clock.advance(seconds);
        }

        let scripted = self.script.lock().unwrap().pop_front();
        let outcome = scripted.unwrap_or_else(|| match &self.fallback {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        });
        outcome.map(|()| PublishReceipt {
            external_media_id: format!("mock-{}-{}", request.post.id, attempt),
            permalink: Some(format!(
                "https://example.test/{}/p/{}",
                request.account.username, request.post.id
            )),
        })
    }
}

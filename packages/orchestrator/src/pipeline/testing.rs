//! Fakes for pipeline tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::pipeline::fetch::{FetchedPage, PageFetcher};

/// Fetcher returning a fixed body, with optional delay and induced
/// transient failures for retry and cancellation tests.
pub struct StaticFetcher {
    body: Vec<u8>,
    content_type: String,
    delay: Duration,
    failures_remaining: AtomicUsize,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new(body: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: content_type.into(),
            delay: Duration::ZERO,
            failures_remaining: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn html(body: &str) -> Self {
        Self::new(body.as_bytes().to_vec(), "text/html")
    }

    /// Sleep this long before answering; models a slow stage.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `n` fetches with a timeout (retryable), then succeed.
    pub fn failing_times(self, n: usize) -> Self {
        self.failures_remaining.store(n, Ordering::SeqCst);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(FetchError::Timeout {
                url: url.to_string(),
            });
        }

        Ok(FetchedPage {
            body: self.body.clone(),
            content_type: self.content_type.clone(),
            final_url: url.to_string(),
        })
    }
}

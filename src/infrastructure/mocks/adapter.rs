//! Scripted export adapter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::application::ports::{ExportAdapter, ExportOutcome};
use crate::domain::metric::ExportBatch;
use crate::error::ExportError;

/// What the mock does on one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// Accept the whole batch
    Deliver,
    /// Reject this many metrics
    Partial(u64),
    /// Fail with a transport error
    Fail(String),
    /// Fail as if the backend answered with this status
    Reject(u16),
    /// Never return
    Hang,
}

/// Export adapter driven by a script of responses.
///
/// Scripted responses are consumed in order; once the script is empty every
/// call gets the fallback response. Clones share state, so a test can keep
/// one clone for assertions while the engine owns another.
#[derive(Debug, Clone)]
pub struct MockAdapter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    script: Mutex<VecDeque<MockResponse>>,
    fallback: Mutex<MockResponse>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    batches: Mutex<Vec<ExportBatch>>,
}

impl MockAdapter {
    /// An adapter that accepts everything.
    pub fn new() -> Self {
        Self::with_fallback(MockResponse::Deliver)
    }

    /// An adapter that always fails.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_fallback(MockResponse::Fail(message.into()))
    }

    pub fn with_fallback(fallback: MockResponse) -> Self {
        Self {
            inner: Arc::new(Inner {
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(fallback),
                delay: Mutex::new(Duration::ZERO),
                calls: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queue a response for the next unscripted call.
    pub fn push(&self, response: MockResponse) -> &Self {
        self.inner.script.lock().push_back(response);
        self
    }

    pub fn set_fallback(&self, response: MockResponse) {
        *self.inner.fallback.lock() = response;
    }

    /// Sleep this long before answering each call.
    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Every batch received, in call order.
    pub fn batches(&self) -> Vec<ExportBatch> {
        self.inner.batches.lock().clone()
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExportAdapter for MockAdapter {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn export(&self, batch: &ExportBatch) -> Result<ExportOutcome, ExportError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.batches.lock().push(batch.clone());

        let response = self
            .inner
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.inner.fallback.lock().clone());
        let delay = *self.inner.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let total = batch.len() as u64;
        match response {
            MockResponse::Deliver => Ok(ExportOutcome::delivered(total)),
            MockResponse::Partial(failed) => {
                let failed = failed.min(total);
                Ok(ExportOutcome {
                    delivered_count: total - failed,
                    failed_count: failed,
                    error_detail: Some(format!("{failed} rejected")),
                })
            }
            MockResponse::Fail(message) => Err(ExportError::Transport(message)),
            MockResponse::Reject(status) => Err(ExportError::Rejected {
                status,
                body: "rejected".to_string(),
            }),
            MockResponse::Hang => std::future::pending().await,
        }
    }
}

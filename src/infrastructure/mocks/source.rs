//! Scripted sample and session sources.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::application::ports::{SampleSource, SessionSource};
use crate::domain::sample::{ActiveSession, RawSample};
use crate::error::SourceError;

/// Sample source returning queued results, then nothing.
#[derive(Debug, Clone)]
pub struct MockSampleSource {
    name: String,
    queue: Arc<Mutex<VecDeque<Result<Vec<RawSample>, SourceError>>>>,
    calls: Arc<AtomicUsize>,
}

impl MockSampleSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Arc::default(),
            calls: Arc::default(),
        }
    }

    pub fn push_ok(&self, samples: Vec<RawSample>) {
        self.queue.lock().push_back(Ok(samples));
    }

    pub fn push_err(&self, error: SourceError) {
        self.queue.lock().push_back(Err(error));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SampleSource for MockSampleSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self) -> Result<Vec<RawSample>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Session source returning queued snapshots, then an empty session list.
#[derive(Debug, Clone, Default)]
pub struct MockSessionSource {
    queue: Arc<Mutex<VecDeque<Result<Vec<ActiveSession>, SourceError>>>>,
}

impl MockSessionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, sessions: Vec<ActiveSession>) {
        self.queue.lock().push_back(Ok(sessions));
    }

    pub fn push_err(&self, error: SourceError) {
        self.queue.lock().push_back(Err(error));
    }
}

#[async_trait]
impl SessionSource for MockSessionSource {
    async fn active_sessions(&self) -> Result<Vec<ActiveSession>, SourceError> {
        self.queue.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

//! Scripted in-process source for tests and embedding.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{JobSource, LagReporter, SourceError};
use crate::models::Job;

#[derive(Default)]
struct State {
    batches: VecDeque<Vec<Job>>,
    watermarks: HashMap<(String, i32), i64>,
    polls: usize,
    commits: usize,
}

/// An in-memory job source fed by `push_batch`.
///
/// The front batch is re-delivered on every poll until it is committed, which
/// mirrors the re-delivery behavior of a real log consumer whose offsets were
/// never advanced. Once all batches are committed, `poll` reports
/// [`SourceError::Closed`].
#[derive(Default)]
pub struct MemorySource {
    state: Arc<Mutex<State>>,
}

/// Inspection handle that outlives the source after the consumer takes
/// ownership of it.
#[derive(Clone)]
pub struct MemorySourceHandle {
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a batch for delivery.
    pub fn push_batch(&self, batch: Vec<Job>) {
        lock(&self.state).batches.push_back(batch);
    }

    /// Advertise a high watermark so the consumer records lag.
    pub fn set_high_water_mark(&self, topic: &str, partition: i32, offset: i64) {
        lock(&self.state)
            .watermarks
            .insert((topic.to_string(), partition), offset);
    }

    pub fn handle(&self) -> MemorySourceHandle {
        MemorySourceHandle {
            state: self.state.clone(),
        }
    }
}

impl MemorySourceHandle {
    /// Number of successful commits so far.
    pub fn commits(&self) -> usize {
        lock(&self.state).commits
    }

    /// Number of polls served, including re-deliveries.
    pub fn polls(&self) -> usize {
        lock(&self.state).polls
    }

    /// Batches still awaiting commit.
    pub fn remaining(&self) -> usize {
        lock(&self.state).batches.len()
    }
}

#[async_trait]
impl JobSource for MemorySource {
    async fn poll(&mut self) -> Result<Vec<Job>, SourceError> {
        let mut state = lock(&self.state);
        state.polls += 1;
        match state.batches.front() {
            Some(batch) => Ok(batch.clone()),
            None => Err(SourceError::Closed),
        }
    }

    async fn commit(&mut self) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        state.batches.pop_front();
        state.commits += 1;
        Ok(())
    }

    async fn close(&mut self) {}

    fn lag_reporter(&self) -> Option<&dyn LagReporter> {
        if lock(&self.state).watermarks.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

impl LagReporter for MemorySource {
    fn high_water_marks(&self) -> HashMap<(String, i32), i64> {
        lock(&self.state).watermarks.clone()
    }
}

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;

use crate::conversions::change_event::ChangeEvent;

use super::{Sink, SinkError};

/// Records every successfully written batch. Can be switched into a failing
/// mode to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<Arc<ChangeEvent>>>>,
    failing: AtomicBool,
    affected_override: Mutex<Option<u64>>,
    attempts: AtomicU64,
    flushes: AtomicU64,
}

impl MemorySink {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Forces the affected-row count reported by `write`.
    pub fn set_affected_override(&self, affected: Option<u64>) {
        *self.affected_override.lock().unwrap() = affected;
    }

    pub fn batches(&self) -> Vec<Vec<Arc<ChangeEvent>>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<Arc<ChangeEvent>> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write(&self, batch: &[Arc<ChangeEvent>]) -> Result<u64, SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Write("memory sink is failing".to_string()));
        }
        if let Some(affected) = *self.affected_override.lock().unwrap() {
            return Ok(affected);
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(batch.len() as u64)
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

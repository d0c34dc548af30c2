//! In-process store used by tests and `--dry-run`.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{CreateOutcome, StoreLayout, TimeSeriesStore};
use crate::error::{LoudlogError, Result};

#[derive(Debug, Default)]
struct Inner {
    layout: Option<StoreLayout>,
    rows: Vec<(i64, [f64; 4])>,
    create_calls: usize,
    flushes: usize,
    /// Remaining updates that should fail.
    fail_updates: usize,
}

/// Cloneable handle; clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` updates fail with a store error.
    pub fn fail_next_updates(&self, count: usize) {
        self.inner.lock().fail_updates = count;
    }

    pub fn rows(&self) -> Vec<(i64, [f64; 4])> {
        self.inner.lock().rows.clone()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.inner.lock().rows.iter().map(|(ts, _)| *ts).collect()
    }

    pub fn layout(&self) -> Option<StoreLayout> {
        self.inner.lock().layout.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.inner.lock().create_calls
    }

    pub fn flushes(&self) -> usize {
        self.inner.lock().flushes
    }
}

impl TimeSeriesStore for MemoryStore {
    fn create(&mut self, layout: &StoreLayout) -> Result<CreateOutcome> {
        let mut inner = self.inner.lock();
        inner.create_calls += 1;
        if inner.layout.is_some() {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.layout = Some(layout.clone());
        Ok(CreateOutcome::Created)
    }

    fn update(&mut self, timestamp: i64, values: [f64; 4]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_updates > 0 {
            inner.fail_updates -= 1;
            return Err(LoudlogError::StoreWrite(format!(
                "injected failure at {timestamp}"
            )));
        }
        if inner.rows.last().is_some_and(|(last, _)| *last >= timestamp) {
            // Mirrors --skip-past-updates: silently ignored.
            return Ok(());
        }
        inner.rows.push((timestamp, values));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.lock().flushes += 1;
        Ok(())
    }
}

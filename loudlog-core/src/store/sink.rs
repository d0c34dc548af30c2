//! Forwards measurements to the store with duplicate-second suppression.

use std::sync::{atomic::Ordering, Arc};

use tracing::{debug, warn};

use super::{CreateOutcome, StoreLayout, TimeSeriesStore};
use crate::engine::pipeline::PipelineDiagnostics;
use crate::error::Result;
use crate::metrics::Measurement;

/// What happened to one measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Accepted,
    /// Timestamp not newer than the last accepted one; dropped.
    Duplicate,
    /// The store failed; the measurement is a gap in the series.
    StoreFailed,
}

pub struct MetricSink<S: TimeSeriesStore> {
    store: S,
    layout: StoreLayout,
    last_timestamp: Option<i64>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl<S: TimeSeriesStore> MetricSink<S> {
    pub fn new(store: S, layout: StoreLayout, diagnostics: Arc<PipelineDiagnostics>) -> Self {
        Self {
            store,
            layout,
            last_timestamp: None,
            diagnostics,
        }
    }

    /// Idempotent create of the store target.
    pub fn ensure_store(&mut self) -> Result<CreateOutcome> {
        self.store.create(&self.layout)
    }

    /// Forward one measurement. Never fails: store errors are logged and counted.
    pub fn record(&mut self, measurement: &Measurement) -> RecordOutcome {
        if self
            .last_timestamp
            .is_some_and(|last| measurement.timestamp <= last)
        {
            self.diagnostics
                .duplicates_dropped
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                timestamp = measurement.timestamp,
                last = ?self.last_timestamp,
                "dropping measurement for an already recorded second"
            );
            return RecordOutcome::Duplicate;
        }

        // A failed write still claims its second: the store would skip a late
        // retry as a past update.
        self.last_timestamp = Some(measurement.timestamp);

        match self
            .store
            .update(measurement.timestamp, measurement.field_values())
        {
            Ok(()) => {
                self.diagnostics
                    .measurements_recorded
                    .fetch_add(1, Ordering::Relaxed);
                RecordOutcome::Accepted
            }
            Err(e) => {
                self.diagnostics.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    component = "metric_sink",
                    timestamp = measurement.timestamp,
                    "store update failed: {e}"
                );
                RecordOutcome::StoreFailed
            }
        }
    }

    /// Ask the store to flush its cache.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.last_timestamp
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

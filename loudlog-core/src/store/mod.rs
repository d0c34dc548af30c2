//! Time-series store abstraction.
//!
//! The store itself (rrdtool / rrdcached) is external infrastructure; this
//! module defines the contract the pipeline needs from it and ships two
//! clients: [`rrdtool::RrdtoolStore`] for production and
//! [`memory::MemoryStore`] for tests and dry runs.

pub mod memory;
pub mod rrdtool;
pub mod sink;

use std::path::PathBuf;

use crate::error::Result;
use crate::metrics::DEFAULT_MAX_FULL_SCALE;

/// Field names in the fixed order every update must follow.
pub const FIELD_NAMES: [&str; 4] = ["peak", "peak_dbfs", "rms", "rms_dbfs"];

/// Result of an idempotent create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// The target already existed and was left untouched.
    AlreadyExists,
}

/// Shape of the time-series target: where it lives and what it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreLayout {
    pub path: PathBuf,
    pub step_secs: u32,
    /// A field with no update for this long reads as unknown.
    pub heartbeat_secs: u32,
    /// Upper bound declared for the amplitude fields.
    pub max_full_scale: u32,
}

impl StoreLayout {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            step_secs: 1,
            heartbeat_secs: 60,
            max_full_scale: DEFAULT_MAX_FULL_SCALE,
        }
    }
}

/// Contract of the external time-series engine.
///
/// Implementations must be `Send` so the recorder can move them onto its
/// pipeline thread.
pub trait TimeSeriesStore: Send {
    /// Create the target unless it exists. Never alters existing data.
    fn create(&mut self, layout: &StoreLayout) -> Result<CreateOutcome>;

    /// Write one row; `values` follow [`FIELD_NAMES`]. Past timestamps are
    /// skipped by the store rather than rejected.
    fn update(&mut self, timestamp: i64, values: [f64; 4]) -> Result<()>;

    /// Ask a caching daemon to write pending updates to disk.
    fn flush(&mut self) -> Result<()>;
}

impl<S: TimeSeriesStore + ?Sized> TimeSeriesStore for &mut S {
    fn create(&mut self, layout: &StoreLayout) -> Result<CreateOutcome> {
        (**self).create(layout)
    }

    fn update(&mut self, timestamp: i64, values: [f64; 4]) -> Result<()> {
        (**self).update(timestamp, values)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

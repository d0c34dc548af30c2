//! # loudlog-core
//!
//! Continuous loudness logger: capture, measure, persist, archive.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CpalCapture → SPSC RingBuffer → Pipeline(spawn_blocking)
//!                                                  │
//!                                 ┌────────────────┴───────────────┐
//!                          WeightingFilter                   ArchiveWriter
//!                                 │                          (raw blocks,
//!                          metrics::compute                   rotating files)
//!                                 │
//!                             MetricSink ──► TimeSeriesStore (rrdtool)
//! ```
//!
//! The audio callback is zero-alloc. All heap work happens in the pipeline thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod archive;
pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod store;

// Convenience re-exports for downstream crates
pub use archive::{ArchiveConfig, ArchiveFormat, ArchiveWriter, FlushMode, QueueFullPolicy};
pub use audio::{weighting::Weighting, CaptureSource};
pub use buffering::block::AudioBlock;
pub use engine::{PipelineConfig, Recorder};
pub use error::{LoudlogError, Result};
pub use events::{PipelineState, StatusEvent};
pub use metrics::Measurement;
pub use store::{sink::MetricSink, StoreLayout, TimeSeriesStore};

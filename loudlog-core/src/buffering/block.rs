//! Typed audio block passed from the capture source to the metric and archive stages.

use crate::error::{LoudlogError, Result};

/// One fixed-duration unit of captured mono audio.
///
/// Allocated once per pipeline iteration (on the non-RT pipeline thread).
/// Blocks are never mutated; transforms build a new block via [`AudioBlock::with_samples`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlock {
    /// Signed 16-bit mono samples.
    pub samples: Vec<i16>,
    /// Arrival wall-clock time, whole seconds since the Unix epoch.
    pub timestamp: i64,
    /// The device dropped or corrupted samples before this block was delivered.
    pub overflow: bool,
}

impl AudioBlock {
    pub fn new(samples: Vec<i16>, timestamp: i64, overflow: bool) -> Self {
        Self {
            samples,
            timestamp,
            overflow,
        }
    }

    /// A block carrying the same timestamp and overflow flag with different samples.
    ///
    /// # Errors
    /// `InvalidInput` when the replacement length differs from the original.
    pub fn with_samples(&self, samples: Vec<i16>) -> Result<Self> {
        if samples.len() != self.samples.len() {
            return Err(LoudlogError::InvalidInput(format!(
                "block length changed from {} to {}",
                self.samples.len(),
                samples.len()
            )));
        }
        Ok(Self {
            samples,
            timestamp: self.timestamp,
            overflow: self.overflow,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of this block in seconds at `sample_rate`.
    pub fn duration_secs(&self, sample_rate: u32) -> f64 {
        self.samples.len() as f64 / sample_rate.max(1) as f64
    }
}

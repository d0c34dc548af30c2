//! Per-block loudness metrics: peak, RMS, and their dBFS transforms.
//!
//! Pure functions, no I/O. One [`Measurement`] per [`AudioBlock`].

use serde::{Deserialize, Serialize};

use crate::buffering::block::AudioBlock;
use crate::error::{LoudlogError, Result};

/// Largest representable 16-bit sample magnitude used as 0 dBFS.
pub const DEFAULT_MAX_FULL_SCALE: u32 = i16::MAX as u32;

/// Fractional digits kept for dBFS values.
const DBFS_DECIMALS: i32 = 2;

/// Loudness of one block. Immutable once computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    /// Seconds since the Unix epoch, copied from the block.
    pub timestamp: i64,
    /// Maximum absolute sample value, clamped to the full-scale value.
    pub peak: u32,
    /// `f64::NEG_INFINITY` for a silent block.
    pub peak_dbfs: f64,
    pub rms: f64,
    /// `f64::NEG_INFINITY` for a silent block.
    pub rms_dbfs: f64,
    pub overflow: bool,
}

impl Measurement {
    /// Store field values in declaration order: peak, peak_dbfs, rms, rms_dbfs.
    pub fn field_values(&self) -> [f64; 4] {
        [self.peak as f64, self.peak_dbfs, self.rms, self.rms_dbfs]
    }
}

/// Compute the measurement for one block.
///
/// # Errors
/// `InvalidInput` for an empty block or a zero full-scale value.
pub fn compute(block: &AudioBlock, max_full_scale: u32) -> Result<Measurement> {
    if block.is_empty() {
        return Err(LoudlogError::InvalidInput(format!(
            "empty audio block at {}",
            block.timestamp
        )));
    }
    if max_full_scale == 0 {
        return Err(LoudlogError::InvalidInput(
            "max full scale must be positive".into(),
        ));
    }

    let mut max_abs = 0u32;
    let mut sum_sq = 0u64;
    for &sample in &block.samples {
        let magnitude = i32::from(sample).unsigned_abs();
        max_abs = max_abs.max(magnitude);
        sum_sq += u64::from(magnitude) * u64::from(magnitude);
    }

    let peak = max_abs.min(max_full_scale);
    let rms = (sum_sq as f64 / block.len() as f64).sqrt();

    Ok(Measurement {
        timestamp: block.timestamp,
        peak,
        peak_dbfs: to_dbfs(peak as f64, max_full_scale),
        rms,
        rms_dbfs: to_dbfs(rms, max_full_scale),
        overflow: block.overflow,
    })
}

/// Decibels relative to `max_full_scale`, rounded to two decimals.
///
/// Zero (or negative) amplitude maps to negative infinity without taking a log.
pub fn to_dbfs(amplitude: f64, max_full_scale: u32) -> f64 {
    if amplitude <= 0.0 {
        return f64::NEG_INFINITY;
    }
    round_to(20.0 * (amplitude / max_full_scale as f64).log10(), DBFS_DECIMALS)
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

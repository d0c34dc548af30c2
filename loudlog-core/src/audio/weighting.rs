//! Perceptual frequency weighting applied before metric computation.
//!
//! ## Design
//!
//! IEC 61672 A-weighting, discretised once per stream with the bilinear
//! transform into three cascaded biquads:
//!
//! ```text
//! section 0: zeros {-1, -1}  poles {p(12194 Hz), p(12194 Hz)}
//! section 1: zeros { 1,  1}  poles {p(20.6 Hz),  p(20.6 Hz)}
//! section 2: zeros { 1,  1}  poles {p(107.7 Hz), p(737.9 Hz)}
//! ```
//!
//! The cascade is normalised to unity gain at 1 kHz. Filter state is carried
//! across blocks so consecutive blocks of one stream filter as one signal;
//! call [`WeightingFilter::reset`] when the stream is reopened.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::buffering::block::AudioBlock;
use crate::error::{LoudlogError, Result};

/// Analog A-weighting pole frequencies (Hz).
const A_POLE_LOW_HZ: f64 = 20.598_997;
const A_POLE_MID1_HZ: f64 = 107.652_65;
const A_POLE_MID2_HZ: f64 = 737.862_23;
const A_POLE_HIGH_HZ: f64 = 12_194.217;

/// Frequency at which the weighted response is 0 dB.
const NORMALISE_AT_HZ: f64 = 1_000.0;

/// Which weighting curve is applied before metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weighting {
    /// Metrics see the raw samples.
    #[default]
    None,
    /// IEC 61672 A-weighting.
    A,
}

impl FromStr for Weighting {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" | "flat" | "z" => Ok(Weighting::None),
            "a" | "a-weighting" | "dba" => Ok(Weighting::A),
            other => Err(format!("unknown weighting '{other}' (expected 'none' or 'a')")),
        }
    }
}

impl fmt::Display for Weighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Weighting::None => f.write_str("none"),
            Weighting::A => f.write_str("a"),
        }
    }
}

/// Second-order section, transposed direct form II.
#[derive(Debug, Clone)]
struct Biquad {
    b: [f64; 3],
    /// Denominator `a1`, `a2` (`a0` is 1).
    a: [f64; 2],
    z1: f64,
    z2: f64,
}

impl Biquad {
    /// Section with a double zero at `zero` and poles at `p` and `q`.
    fn from_roots(zero: f64, p: f64, q: f64) -> Self {
        Self {
            b: [1.0, -2.0 * zero, zero * zero],
            a: [-(p + q), p * q],
            z1: 0.0,
            z2: 0.0,
        }
    }

    fn process(&mut self, x: f64) -> f64 {
        let y = self.b[0] * x + self.z1;
        self.z1 = self.b[1] * x - self.a[0] * y + self.z2;
        self.z2 = self.b[2] * x - self.a[1] * y;
        y
    }

    /// Magnitude response at normalised angular frequency `w` (rad/sample).
    fn magnitude_at(&self, w: f64) -> f64 {
        let (c1, s1) = (w.cos(), w.sin());
        let (c2, s2) = ((2.0 * w).cos(), (2.0 * w).sin());
        let num_re = self.b[0] + self.b[1] * c1 + self.b[2] * c2;
        let num_im = -(self.b[1] * s1 + self.b[2] * s2);
        let den_re = 1.0 + self.a[0] * c1 + self.a[1] * c2;
        let den_im = -(self.a[0] * s1 + self.a[1] * s2);
        num_re.hypot(num_im) / den_re.hypot(den_im)
    }

    fn scale(&mut self, gain: f64) {
        for b in &mut self.b {
            *b *= gain;
        }
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// Map an analog real pole at `freq_hz` into the z-plane.
fn bilinear_pole(freq_hz: f64, sample_rate: f64) -> f64 {
    let k = PI * freq_hz / sample_rate;
    (1.0 - k) / (1.0 + k)
}

/// Stateful weighting filter for one audio stream.
#[derive(Debug, Clone)]
pub struct WeightingFilter {
    weighting: Weighting,
    sections: Vec<Biquad>,
}

impl WeightingFilter {
    /// Design the filter for `sample_rate`. Coefficients never change afterwards.
    ///
    /// # Errors
    /// `InvalidInput` when a weighting is requested at a rate that cannot
    /// represent the 1 kHz reference frequency.
    pub fn new(weighting: Weighting, sample_rate: u32) -> Result<Self> {
        let sections = match weighting {
            Weighting::None => Vec::new(),
            Weighting::A => design_a_weighting(sample_rate)?,
        };
        Ok(Self {
            weighting,
            sections,
        })
    }

    /// A pass-through filter.
    pub fn disabled() -> Self {
        Self {
            weighting: Weighting::None,
            sections: Vec::new(),
        }
    }

    pub fn weighting(&self) -> Weighting {
        self.weighting
    }

    pub fn is_enabled(&self) -> bool {
        !self.sections.is_empty()
    }

    /// Filter one block into a new block of the same length and metadata.
    pub fn apply(&mut self, block: &AudioBlock) -> AudioBlock {
        if !self.is_enabled() {
            return block.clone();
        }
        let samples = block
            .samples
            .iter()
            .map(|&s| {
                let y = self
                    .sections
                    .iter_mut()
                    .fold(f64::from(s), |x, section| section.process(x));
                y.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
            })
            .collect();
        AudioBlock {
            samples,
            timestamp: block.timestamp,
            overflow: block.overflow,
        }
    }

    /// Clear the filter state (new stream).
    pub fn reset(&mut self) {
        for section in &mut self.sections {
            section.reset();
        }
    }
}

fn design_a_weighting(sample_rate: u32) -> Result<Vec<Biquad>> {
    let fs = f64::from(sample_rate);
    if fs <= 2.0 * NORMALISE_AT_HZ {
        return Err(LoudlogError::InvalidInput(format!(
            "A-weighting needs a sample rate above {} Hz, got {sample_rate}",
            2.0 * NORMALISE_AT_HZ
        )));
    }

    let p_low = bilinear_pole(A_POLE_LOW_HZ, fs);
    let p_mid1 = bilinear_pole(A_POLE_MID1_HZ, fs);
    let p_mid2 = bilinear_pole(A_POLE_MID2_HZ, fs);
    let p_high = bilinear_pole(A_POLE_HIGH_HZ, fs);

    let mut sections = vec![
        Biquad::from_roots(-1.0, p_high, p_high),
        Biquad::from_roots(1.0, p_low, p_low),
        Biquad::from_roots(1.0, p_mid1, p_mid2),
    ];

    let w = 2.0 * PI * NORMALISE_AT_HZ / fs;
    let gain: f64 = sections.iter().map(|s| s.magnitude_at(w)).product();
    sections[0].scale(1.0 / gain);

    tracing::debug!(sample_rate, "A-weighting filter designed");
    Ok(sections)
}

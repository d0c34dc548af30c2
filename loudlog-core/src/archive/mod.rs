//! Rotating on-disk archive of the raw (unweighted) audio.
//!
//! ## Layout
//!
//! ```text
//! <audio_dir>/<YYYY-MM-DD>/<YYYY-MM-DDTHH:MM:SS>.<ext>
//! ```
//!
//! One file per [`segment::ArchiveSegment`], named from the segment's first
//! block timestamp (UTC). A segment is written with a single call once it
//! reaches the write-batch block count or the rotation duration, either
//! inline on the pipeline thread or by a [`worker::FlushWorker`].

pub mod segment;
pub mod worker;
pub mod writer;

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::pipeline::PipelineDiagnostics;
use crate::error::{LoudlogError, Result};
use segment::ArchiveSegment;

pub use writer::ArchiveWriter;

/// Container written for each segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    /// 16-bit PCM mono RIFF/WAVE.
    #[default]
    Wav,
    /// Headerless signed 16-bit little-endian PCM.
    Raw,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Wav => "wav",
            ArchiveFormat::Raw => "raw",
        }
    }
}

impl FromStr for ArchiveFormat {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "wav" | "wave" => Ok(ArchiveFormat::Wav),
            "raw" | "pcm" | "s16le" => Ok(ArchiveFormat::Raw),
            other => Err(format!(
                "unsupported archive format '{other}' (expected 'wav' or 'raw')"
            )),
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Where segment flushes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Written synchronously on the pipeline thread.
    #[default]
    Inline,
    /// Handed to a writer thread through a bounded queue.
    Offloaded,
}

/// What the pipeline does when the offloaded writer's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueFullPolicy {
    /// Capture waits until the writer catches up.
    #[default]
    Block,
    /// Discard the oldest pending segment to make room.
    DropOldest,
    /// Stop the pipeline with an archive error.
    Fail,
}

impl FromStr for QueueFullPolicy {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(QueueFullPolicy::Block),
            "drop-oldest" | "drop_oldest" => Ok(QueueFullPolicy::DropOldest),
            "fail" => Ok(QueueFullPolicy::Fail),
            other => Err(format!(
                "unknown queue policy '{other}' (expected block, drop-oldest or fail)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub dir: PathBuf,
    pub format: ArchiveFormat,
    /// Flush once a segment holds this many blocks.
    pub batch_blocks: usize,
    /// Flush once a segment spans this many seconds.
    pub rotation_secs: i64,
    pub flush_mode: FlushMode,
    /// Pending segments allowed in the offloaded queue.
    pub queue_capacity: usize,
    pub queue_full: QueueFullPolicy,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("audio"),
            format: ArchiveFormat::Wav,
            batch_blocks: 60,
            rotation_secs: 3_600,
            flush_mode: FlushMode::Inline,
            queue_capacity: 2,
            queue_full: QueueFullPolicy::Block,
        }
    }
}

/// Everything needed to turn a segment into a file; cloned into the worker.
#[derive(Debug, Clone)]
pub struct ArchiveTarget {
    pub dir: PathBuf,
    pub format: ArchiveFormat,
    pub sample_rate: u32,
}

impl ArchiveTarget {
    /// Destination of a segment starting at `start` (epoch seconds).
    pub fn segment_path(&self, start: i64) -> Result<PathBuf> {
        let at = DateTime::from_timestamp(start, 0).ok_or_else(|| {
            LoudlogError::InvalidInput(format!("segment start {start} is out of range"))
        })?;
        Ok(self
            .dir
            .join(at.format("%Y-%m-%d").to_string())
            .join(format!(
                "{}.{}",
                at.format("%Y-%m-%dT%H:%M:%S"),
                self.format.extension()
            )))
    }
}

/// Write `segment` as one new file and count it.
///
/// # Errors
/// `ArchiveCollision` if the file already exists, `ArchiveWrite` on any I/O failure.
pub fn persist_segment(
    segment: &ArchiveSegment,
    target: &ArchiveTarget,
    diagnostics: &PipelineDiagnostics,
) -> Result<PathBuf> {
    let path = target.segment_path(segment.start())?;
    let samples = segment.concat_samples();

    let write_err = |source: io::Error| LoudlogError::ArchiveWrite {
        path: path.clone(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(LoudlogError::ArchiveCollision { path: path.clone() });
        }
        Err(e) => return Err(write_err(e)),
    };

    match target.format {
        ArchiveFormat::Wav => write_wav(file, &samples, target.sample_rate),
        ArchiveFormat::Raw => write_raw(file, &samples),
    }
    .map_err(write_err)?;

    diagnostics.segments_flushed.fetch_add(1, Ordering::Relaxed);
    diagnostics
        .samples_archived
        .fetch_add(samples.len(), Ordering::Relaxed);
    info!(
        path = %path.display(),
        blocks = segment.len(),
        samples = samples.len(),
        "archive segment written"
    );
    Ok(path)
}

fn write_wav(file: File, samples: &[i16], sample_rate: u32) -> io::Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut out = BufWriter::new(file);
    let mut wav = hound::WavWriter::new(&mut out, spec).map_err(hound_to_io)?;
    for &sample in samples {
        wav.write_sample(sample).map_err(hound_to_io)?;
    }
    wav.finalize().map_err(hound_to_io)?;
    out.flush()?;
    out.get_ref().sync_data()
}

fn write_raw(file: File, samples: &[i16]) -> io::Result<()> {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let mut out = BufWriter::new(file);
    out.write_all(&bytes)?;
    out.flush()?;
    out.get_ref().sync_data()
}

fn hound_to_io(err: hound::Error) -> io::Error {
    match err {
        hound::Error::IoError(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

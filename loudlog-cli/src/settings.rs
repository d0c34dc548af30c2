//! Persistent recorder settings (JSON file in the user data directory).
//!
//! Resolution order: built-in defaults, then the settings file, then CLI flags
//! (which fall back to `LOUDLOG_*` environment variables).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

use loudlog_core::{
    audio::device::DeviceSelector, engine::PipelineConfig, metrics::DEFAULT_MAX_FULL_SCALE,
    ArchiveConfig, ArchiveFormat, FlushMode, QueueFullPolicy, StoreLayout, Weighting,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct RecorderSettings {
    /// Device index, exact name, or `None` for the system default.
    pub device: Option<String>,
    pub sample_rate: u32,
    pub block_secs: f64,
    pub max_full_scale: u32,
    pub ring_blocks: usize,
    pub store_path: PathBuf,
    pub store_step_secs: u32,
    pub store_daemon: Option<String>,
    pub archive_dir: PathBuf,
    pub archive_format: ArchiveFormat,
    /// Ceiling on the wall-clock time one archive file covers. Files usually
    /// close earlier, once `batch_blocks` blocks are buffered.
    pub segment_secs: i64,
    /// Blocks per archive file; spans at least one second after `normalize`.
    pub batch_blocks: usize,
    pub weighting: Weighting,
    pub flush_mode: FlushMode,
    pub queue_capacity: usize,
    pub queue_full: QueueFullPolicy,
    pub slow_block_fraction: f64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: 44_100,
            block_secs: 1.0,
            max_full_scale: DEFAULT_MAX_FULL_SCALE,
            ring_blocks: 4,
            store_path: PathBuf::from("mixer.rrd"),
            store_step_secs: 1,
            store_daemon: None,
            archive_dir: PathBuf::from("audio"),
            archive_format: ArchiveFormat::Wav,
            segment_secs: 3_600,
            batch_blocks: 60,
            weighting: Weighting::None,
            flush_mode: FlushMode::Inline,
            queue_capacity: 2,
            queue_full: QueueFullPolicy::Block,
            slow_block_fraction: 0.5,
        }
    }
}

impl RecorderSettings {
    pub fn normalize(&mut self) {
        let defaults = Self::default();
        self.device = non_empty(self.device.take());
        self.store_daemon = non_empty(self.store_daemon.take());
        self.sample_rate = self.sample_rate.clamp(8_000, 192_000);
        self.block_secs = if self.block_secs.is_finite() {
            self.block_secs.clamp(0.05, 10.0)
        } else {
            defaults.block_secs
        };
        if self.max_full_scale == 0 {
            self.max_full_scale = defaults.max_full_scale;
        }
        self.ring_blocks = self.ring_blocks.clamp(2, 64);
        self.store_step_secs = self.store_step_secs.max(1);
        self.segment_secs = self.segment_secs.clamp(1, 86_400);
        // Archive files are named by second.
        let block_len = ((f64::from(self.sample_rate) * self.block_secs).round() as usize).max(1);
        let min_batch = (self.sample_rate as usize).div_ceil(block_len);
        self.batch_blocks = self.batch_blocks.clamp(1, 86_400).max(min_batch);
        self.queue_capacity = self.queue_capacity.clamp(1, 16);
        self.slow_block_fraction = if self.slow_block_fraction.is_finite() {
            self.slow_block_fraction.clamp(0.0, 10.0)
        } else {
            defaults.slow_block_fraction
        };
        if self.store_path.as_os_str().is_empty() {
            self.store_path = defaults.store_path;
        }
        if self.archive_dir.as_os_str().is_empty() {
            self.archive_dir = defaults.archive_dir;
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let device = self
            .device
            .as_deref()
            .and_then(|raw| raw.parse::<DeviceSelector>().ok())
            .unwrap_or_default();
        let mut store = StoreLayout::new(&self.store_path);
        store.step_secs = self.store_step_secs;
        store.max_full_scale = self.max_full_scale;

        PipelineConfig {
            device,
            sample_rate: self.sample_rate,
            block_secs: self.block_secs,
            ring_blocks: self.ring_blocks,
            stall_timeout: None,
            weighting: self.weighting,
            store,
            store_daemon: self.store_daemon.clone(),
            archive: ArchiveConfig {
                dir: self.archive_dir.clone(),
                format: self.archive_format,
                batch_blocks: self.batch_blocks,
                rotation_secs: self.segment_secs,
                flush_mode: self.flush_mode,
                queue_capacity: self.queue_capacity,
                queue_full: self.queue_full,
            },
            slow_block_fraction: self.slow_block_fraction,
        }
    }

    /// Seconds of audio buffered before a segment is written.
    pub fn batch_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_secs * self.batch_blocks as f64)
    }

    /// Longest span one archive file covers: whichever threshold fires first.
    pub fn archive_file_span(&self) -> Duration {
        let ceiling = Duration::from_secs(self.segment_secs.max(1) as u64);
        self.batch_duration().min(ceiling)
    }
}

/// Command-line overrides; unset flags keep the settings-file value.
#[derive(Debug, Clone, Default, Args)]
pub struct SettingsOverrides {
    /// Input device: index from `list-devices`, exact name, or "default".
    #[arg(short, long, env = "LOUDLOG_DEVICE")]
    pub device: Option<String>,

    /// Capture sample rate in Hz.
    #[arg(long, env = "LOUDLOG_SAMPLE_RATE")]
    pub sample_rate: Option<u32>,

    /// Block duration in seconds (one measurement per block).
    #[arg(long, env = "LOUDLOG_BLOCK_SECS")]
    pub block_secs: Option<f64>,

    /// Time-series store file.
    #[arg(long, env = "LOUDLOG_STORE")]
    pub store: Option<PathBuf>,

    /// rrdcached address, e.g. unix:/var/run/rrdcached.sock.
    #[arg(long, env = "LOUDLOG_DAEMON")]
    pub daemon: Option<String>,

    /// Root directory of the audio archive.
    #[arg(long, env = "LOUDLOG_ARCHIVE_DIR")]
    pub archive_dir: Option<PathBuf>,

    /// Archive container: wav or raw.
    #[arg(long, env = "LOUDLOG_FORMAT")]
    pub format: Option<ArchiveFormat>,

    /// Wall-clock ceiling in seconds for one archive file. Takes effect only
    /// when it is shorter than --batch-blocks worth of audio or input has gaps.
    #[arg(long, env = "LOUDLOG_SEGMENT_SECS")]
    pub segment_secs: Option<i64>,

    /// Blocks per archive file (written in one go). With the default 1 s
    /// blocks this is the file length in seconds.
    #[arg(long, env = "LOUDLOG_BATCH_BLOCKS")]
    pub batch_blocks: Option<usize>,

    /// Frequency weighting for metrics: none or a.
    #[arg(long, env = "LOUDLOG_WEIGHTING")]
    pub weighting: Option<Weighting>,

    /// Write archive segments on a background thread.
    #[arg(long, env = "LOUDLOG_OFFLOAD")]
    pub offload: bool,

    /// Behaviour when the background writer falls behind: block, drop-oldest or fail.
    #[arg(long, env = "LOUDLOG_QUEUE_FULL")]
    pub queue_full: Option<QueueFullPolicy>,
}

impl SettingsOverrides {
    pub fn apply(&self, settings: &mut RecorderSettings) {
        if let Some(device) = &self.device {
            settings.device = Some(device.clone());
        }
        if let Some(rate) = self.sample_rate {
            settings.sample_rate = rate;
        }
        if let Some(secs) = self.block_secs {
            settings.block_secs = secs;
        }
        if let Some(store) = &self.store {
            settings.store_path = store.clone();
        }
        if let Some(daemon) = &self.daemon {
            settings.store_daemon = Some(daemon.clone());
        }
        if let Some(dir) = &self.archive_dir {
            settings.archive_dir = dir.clone();
        }
        if let Some(format) = self.format {
            settings.archive_format = format;
        }
        if let Some(secs) = self.segment_secs {
            settings.segment_secs = secs;
        }
        if let Some(blocks) = self.batch_blocks {
            settings.batch_blocks = blocks;
        }
        if let Some(weighting) = self.weighting {
            settings.weighting = weighting;
        }
        if self.offload {
            settings.flush_mode = FlushMode::Offloaded;
        }
        if let Some(policy) = self.queue_full {
            settings.queue_full = policy;
        }
        settings.normalize();
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("loudlog")
        .join("settings.json")
}

pub fn load_settings(path: &Path) -> RecorderSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<RecorderSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &RecorderSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

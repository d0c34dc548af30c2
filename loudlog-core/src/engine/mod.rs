//! `Recorder`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! Recorder::new(config)
//!     └─► start()        → device open confirmed, pipeline spawned
//!         └─► stop()     → running=false, loop drains at the next block boundary
//!             └─► wait() → final pipeline result (Stopped or Failed)
//! ```
//!
//! `start()`/`stop()` return an error rather than panicking when called in
//! the wrong state.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread affinity).
//! The capture source is therefore created *inside* the `spawn_blocking`
//! closure so it never crosses a thread boundary. A sync oneshot channel
//! propagates any open-device errors back to the `start()` caller.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::info;

use crate::{
    archive::ArchiveConfig,
    audio::{
        device::DeviceSelector, weighting::Weighting, CaptureConfig, CaptureSource, CpalCapture,
    },
    buffering::MIN_RING_BLOCKS,
    error::{LoudlogError, Result},
    events::{PipelineState, StatusBoard, StatusEvent},
    store::{rrdtool::RrdtoolStore, StoreLayout, TimeSeriesStore},
};

/// Broadcast channel capacity for status events.
const BROADCAST_CAP: usize = 64;

/// Stall timeout when none is configured, in block durations.
const DEFAULT_STALL_BLOCKS: u32 = 5;

/// Configuration for one recording pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub device: DeviceSelector,
    /// Capture sample rate (Hz). Default: 44100.
    pub sample_rate: u32,
    /// Block duration in seconds; one measurement per block. Default: 1.0.
    pub block_secs: f64,
    /// Capture ring capacity in blocks. Default: 4.
    pub ring_blocks: usize,
    /// Fail with a device error when no samples arrive for this long.
    /// `None` means five block durations.
    pub stall_timeout: Option<Duration>,
    pub weighting: Weighting,
    /// Store target and its field layout (carries `max_full_scale`).
    pub store: StoreLayout,
    /// rrdcached address used for updates and flushes.
    pub store_daemon: Option<String>,
    pub archive: ArchiveConfig,
    /// A block taking longer than this share of its real-time duration is
    /// reported as slow. Default: 0.5.
    pub slow_block_fraction: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device: DeviceSelector::Default,
            sample_rate: 44_100,
            block_secs: 1.0,
            ring_blocks: 4,
            stall_timeout: None,
            weighting: Weighting::None,
            store: StoreLayout::new("mixer.rrd"),
            store_daemon: None,
            archive: ArchiveConfig::default(),
            slow_block_fraction: 0.5,
        }
    }
}

impl PipelineConfig {
    /// Samples per block at the configured rate.
    pub fn block_len(&self) -> usize {
        ((self.sample_rate as f64 * self.block_secs).round() as usize).max(1)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_len() as f64 / self.sample_rate.max(1) as f64)
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device: self.device.clone(),
            sample_rate: self.sample_rate,
            block_len: self.block_len(),
            ring_blocks: self.ring_blocks.max(MIN_RING_BLOCKS),
            stall_timeout: self
                .stall_timeout
                .unwrap_or_else(|| self.block_duration() * DEFAULT_STALL_BLOCKS),
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(LoudlogError::InvalidInput("sample rate must be positive".into()));
        }
        if !(self.block_secs.is_finite() && self.block_secs > 0.0) {
            return Err(LoudlogError::InvalidInput(format!(
                "block duration {}s is not positive",
                self.block_secs
            )));
        }
        if self.store.max_full_scale == 0 {
            return Err(LoudlogError::InvalidInput(
                "max full scale must be positive".into(),
            ));
        }
        if self.archive.batch_blocks == 0 || self.archive.rotation_secs <= 0 {
            return Err(LoudlogError::InvalidInput(
                "archive thresholds must be positive".into(),
            ));
        }
        // Segment files are named by second, so a batch must span at least one.
        if (self.block_len() as u64).saturating_mul(self.archive.batch_blocks as u64)
            < u64::from(self.sample_rate)
        {
            return Err(LoudlogError::InvalidInput(format!(
                "archive batch of {} x {}s blocks is shorter than one second",
                self.archive.batch_blocks, self.block_secs
            )));
        }
        Ok(())
    }

    /// The production store: `rrdtool`, optionally through `rrdcached`.
    pub fn rrdtool_store(&self) -> RrdtoolStore {
        RrdtoolStore::new(&self.store.path, self.store_daemon.clone())
    }
}

/// The top-level recorder handle.
///
/// `Recorder` is `Send + Sync`; all fields use interior mutability.
pub struct Recorder {
    config: PipelineConfig,
    /// `true` while capture + pipeline are active.
    running: Arc<AtomicBool>,
    status: StatusBoard,
    diagnostics: Arc<pipeline::PipelineDiagnostics>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Recorder {
    /// Create a recorder. Does not open anything; call `start()`.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            status: StatusBoard::new(BROADCAST_CAP),
            diagnostics: Arc::new(pipeline::PipelineDiagnostics::default()),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Open the configured cpal device and `rrdtool` store, then run.
    ///
    /// Blocks until the audio device is confirmed open (or fails), then returns.
    /// The pipeline continues on a blocking worker thread.
    ///
    /// # Errors
    /// - `LoudlogError::AlreadyRunning` if already started.
    /// - `LoudlogError::NoDefaultInputDevice` / `LoudlogError::Device` on device error.
    pub fn start(&self) -> Result<()> {
        let store = self.config.rrdtool_store();
        self.start_with(
            |config: &PipelineConfig| CpalCapture::open(&config.capture_config()),
            store,
        )
    }

    /// Start with a custom capture source and store.
    ///
    /// `open_capture` runs on the pipeline thread, so the source need not be `Send`.
    pub fn start_with<F, C, S>(&self, open_capture: F, store: S) -> Result<()>
    where
        F: FnOnce(&PipelineConfig) -> Result<C> + Send + 'static,
        C: CaptureSource + 'static,
        S: TimeSeriesStore + 'static,
    {
        if self.running.load(Ordering::SeqCst) {
            return Err(LoudlogError::AlreadyRunning);
        }
        self.config.validate()?;

        self.diagnostics.reset();
        self.running.store(true, Ordering::SeqCst);
        self.status.set(PipelineState::Initializing, None);

        // Clone all Arc-wrapped state before moving into the closure.
        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let status = self.status.clone();
        let diagnostics = Arc::clone(&self.diagnostics);

        // Sync oneshot: pipeline thread signals open success/failure to start().
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let task = tokio::task::spawn_blocking(move || {
            // ── Open capture (must happen on THIS thread; cpal::Stream is !Send) ──
            let capture = match open_capture(&config) {
                Ok(c) => {
                    let _ = open_tx.send(Ok(c.sample_rate()));
                    c
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    return Ok(());
                }
            };

            pipeline::run(pipeline::PipelineContext {
                config,
                capture: Box::new(capture),
                store: Box::new(store),
                running,
                status,
                diagnostics,
            })
        });

        match open_rx.recv() {
            Ok(Ok(rate)) => {
                info!(sample_rate = rate, device = %self.config.device, "recorder started");
                *self.task.lock() = Some(task);
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                self.status.set(PipelineState::Failed, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                // Channel closed before a message was sent: the task panicked.
                self.running.store(false, Ordering::SeqCst);
                self.status
                    .set(PipelineState::Failed, Some("pipeline failed to start".into()));
                Err(LoudlogError::Other(anyhow::anyhow!(
                    "pipeline task died unexpectedly"
                )))
            }
        }
    }

    /// Request shutdown; the loop drains at the next block boundary.
    ///
    /// # Errors
    /// - `LoudlogError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(LoudlogError::NotRunning);
        }
        self.running.store(false, Ordering::SeqCst);
        info!("recorder stop requested");
        Ok(())
    }

    /// Wait for the pipeline to finish and return its result.
    ///
    /// # Errors
    /// - `LoudlogError::NotRunning` if the recorder was never started (or already waited on).
    /// - Whatever fatal error ended the pipeline.
    pub async fn wait(&self) -> Result<()> {
        let task = self.task.lock().take().ok_or(LoudlogError::NotRunning)?;
        task.await
            .map_err(|e| LoudlogError::Other(anyhow::anyhow!("pipeline task failed: {e}")))?
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current pipeline state (snapshot).
    pub fn status(&self) -> PipelineState {
        self.status.current()
    }

    /// Subscribe to live status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

//! Blocking pipeline loop.
//!
//! ## Pipeline stages (per block)
//!
//! ```text
//! 1. Check running flag (shutdown is only observed here)
//! 2. CaptureSource::next_block → AudioBlock (blocks on hardware timing)
//! 3. WeightingFilter::apply (when enabled) → metrics::compute → MetricSink::record
//! 4. Duration rotation check at the block's timestamp → flush old segment
//! 5. ArchiveWriter::append(raw block)
//! 6. Count rotation check → flush
//! ```
//!
//! This entire loop runs in `spawn_blocking` (or a plain thread in tests); the
//! capture source is created on that same thread.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    archive::ArchiveWriter,
    audio::{weighting::WeightingFilter, CaptureSource},
    buffering::block::AudioBlock,
    engine::PipelineConfig,
    error::{LoudlogError, Result},
    events::{PipelineState, StatusBoard},
    metrics,
    store::{sink::MetricSink, TimeSeriesStore},
};

pub struct PipelineDiagnostics {
    pub blocks_in: AtomicUsize,
    pub overflow_blocks: AtomicUsize,
    pub measurements_recorded: AtomicUsize,
    pub duplicates_dropped: AtomicUsize,
    pub store_errors: AtomicUsize,
    pub segments_flushed: AtomicUsize,
    pub segments_dropped: AtomicUsize,
    pub samples_archived: AtomicUsize,
    pub slow_blocks: AtomicUsize,
}

impl Default for PipelineDiagnostics {
    fn default() -> Self {
        Self {
            blocks_in: AtomicUsize::new(0),
            overflow_blocks: AtomicUsize::new(0),
            measurements_recorded: AtomicUsize::new(0),
            duplicates_dropped: AtomicUsize::new(0),
            store_errors: AtomicUsize::new(0),
            segments_flushed: AtomicUsize::new(0),
            segments_dropped: AtomicUsize::new(0),
            samples_archived: AtomicUsize::new(0),
            slow_blocks: AtomicUsize::new(0),
        }
    }
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.blocks_in.store(0, Ordering::Relaxed);
        self.overflow_blocks.store(0, Ordering::Relaxed);
        self.measurements_recorded.store(0, Ordering::Relaxed);
        self.duplicates_dropped.store(0, Ordering::Relaxed);
        self.store_errors.store(0, Ordering::Relaxed);
        self.segments_flushed.store(0, Ordering::Relaxed);
        self.segments_dropped.store(0, Ordering::Relaxed);
        self.samples_archived.store(0, Ordering::Relaxed);
        self.slow_blocks.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            blocks_in: self.blocks_in.load(Ordering::Relaxed),
            overflow_blocks: self.overflow_blocks.load(Ordering::Relaxed),
            measurements_recorded: self.measurements_recorded.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            segments_flushed: self.segments_flushed.load(Ordering::Relaxed),
            segments_dropped: self.segments_dropped.load(Ordering::Relaxed),
            samples_archived: self.samples_archived.load(Ordering::Relaxed),
            slow_blocks: self.slow_blocks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub blocks_in: usize,
    pub overflow_blocks: usize,
    pub measurements_recorded: usize,
    pub duplicates_dropped: usize,
    pub store_errors: usize,
    pub segments_flushed: usize,
    pub segments_dropped: usize,
    pub samples_archived: usize,
    pub slow_blocks: usize,
}

/// All context the pipeline needs, passed as one struct so the closure stays tidy.
pub struct PipelineContext {
    pub config: PipelineConfig,
    /// Already open; created on the thread that runs the loop.
    pub capture: Box<dyn CaptureSource>,
    pub store: Box<dyn TimeSeriesStore>,
    pub running: Arc<AtomicBool>,
    pub status: StatusBoard,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Run the blocking pipeline until `ctx.running` becomes false or a fatal error.
///
/// The capture source is closed exactly once before returning, and the final
/// state (`Stopped` or `Failed`) is published.
pub fn run(mut ctx: PipelineContext) -> Result<()> {
    info!(
        sample_rate = ctx.capture.sample_rate(),
        weighting = %ctx.config.weighting,
        "pipeline started"
    );

    let outcome = run_stages(&mut ctx);
    ctx.capture.close();
    ctx.running.store(false, Ordering::SeqCst);

    match &outcome {
        Ok(()) => {
            ctx.status.set(PipelineState::Stopped, None);
            info!(diagnostics = ?ctx.diagnostics.snapshot(), "pipeline stopped");
        }
        Err(e) => {
            error!(diagnostics = ?ctx.diagnostics.snapshot(), "pipeline failed: {e}");
            ctx.status.set(PipelineState::Failed, Some(e.to_string()));
        }
    }
    outcome
}

fn run_stages(ctx: &mut PipelineContext) -> Result<()> {
    ctx.status.set(PipelineState::Initializing, None);

    let sample_rate = ctx.capture.sample_rate();
    let mut filter = WeightingFilter::new(ctx.config.weighting, sample_rate)?;
    let mut sink = MetricSink::new(
        ctx.store.as_mut(),
        ctx.config.store.clone(),
        Arc::clone(&ctx.diagnostics),
    );
    let outcome = sink.ensure_store()?;
    debug!(?outcome, path = ?ctx.config.store.path, "time-series store ready");
    let mut archive = ArchiveWriter::new(
        &ctx.config.archive,
        sample_rate,
        Arc::clone(&ctx.diagnostics),
    )?;

    ctx.status.set(PipelineState::Capturing, None);

    loop {
        // ── 0. Check running flag ─────────────────────────────────────────
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        // ── 1. Pull one block ─────────────────────────────────────────────
        let block = match ctx.capture.next_block() {
            Ok(block) => block,
            Err(e) => return Err(abandon(archive, e)),
        };
        let started = Instant::now();
        let block_duration = Duration::from_secs_f64(block.duration_secs(sample_rate));
        let timestamp = block.timestamp;

        ctx.diagnostics.blocks_in.fetch_add(1, Ordering::Relaxed);
        if block.overflow {
            ctx.diagnostics
                .overflow_blocks
                .fetch_add(1, Ordering::Relaxed);
            warn!(timestamp, "input overflow: samples were dropped before this block");
        }

        // ── 2. Measure and record ─────────────────────────────────────────
        let measured = if filter.is_enabled() {
            metrics::compute(&filter.apply(&block), ctx.config.store.max_full_scale)
        } else {
            metrics::compute(&block, ctx.config.store.max_full_scale)
        };
        let measurement = match measured {
            Ok(measurement) => measurement,
            Err(e) => return Err(abandon(archive, e)),
        };
        sink.record(&measurement);

        // ── 3. Archive the raw block ──────────────────────────────────────
        if let Err(e) = archive_block(&mut archive, block, &ctx.status) {
            return Err(abandon(archive, e));
        }

        // ── 4. Timing ─────────────────────────────────────────────────────
        let elapsed = started.elapsed();
        debug!(
            timestamp,
            peak = measurement.peak,
            peak_dbfs = measurement.peak_dbfs,
            rms = measurement.rms,
            rms_dbfs = measurement.rms_dbfs,
            elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
            "block processed"
        );
        if is_slow(elapsed, block_duration, ctx.config.slow_block_fraction) {
            ctx.diagnostics.slow_blocks.fetch_add(1, Ordering::Relaxed);
            warn!(
                timestamp,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = block_duration.as_millis() as u64,
                "block processing is falling behind real time"
            );
        }
    }

    // ── Draining ──────────────────────────────────────────────────────────
    ctx.status.set(PipelineState::Draining, None);
    archive.finish()?;
    if let Err(e) = sink.flush() {
        ctx.diagnostics.store_errors.fetch_add(1, Ordering::Relaxed);
        warn!(component = "metric_sink", "store flush on shutdown failed: {e}");
    }
    Ok(())
}

fn archive_block(
    archive: &mut ArchiveWriter,
    block: AudioBlock,
    status: &StatusBoard,
) -> Result<()> {
    let timestamp = block.timestamp;
    if archive.maybe_rotate(timestamp) {
        rotate(archive, status)?;
    }
    archive.append(block)?;
    if archive.maybe_rotate(timestamp) {
        rotate(archive, status)?;
    }
    Ok(())
}

/// Write out what the archive still holds, then return the error that stopped the loop.
fn abandon(archive: ArchiveWriter, err: LoudlogError) -> LoudlogError {
    if let Err(archive_err) = archive.finish() {
        error!("archive flush after fatal error: {archive_err}");
    }
    err
}

fn rotate(archive: &mut ArchiveWriter, status: &StatusBoard) -> Result<()> {
    status.set(PipelineState::Rotating, None);
    let written = archive.flush()?;
    status.set(
        PipelineState::Capturing,
        written.map(|path| path.display().to_string()),
    );
    Ok(())
}

fn is_slow(elapsed: Duration, block_duration: Duration, fraction: f64) -> bool {
    fraction > 0.0 && elapsed.as_secs_f64() > block_duration.as_secs_f64() * fraction
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_every_counter() {
        let diagnostics = PipelineDiagnostics::default();
        diagnostics.blocks_in.fetch_add(3, Ordering::Relaxed);
        diagnostics.slow_blocks.fetch_add(1, Ordering::Relaxed);
        diagnostics.segments_dropped.fetch_add(2, Ordering::Relaxed);
        diagnostics.reset();
        assert_eq!(diagnostics.snapshot(), DiagnosticsSnapshot::default());
    }

    #[test]
    fn slow_means_over_the_configured_share_of_real_time() {
        let block = Duration::from_millis(1_000);
        assert!(!is_slow(Duration::from_millis(400), block, 0.5));
        assert!(is_slow(Duration::from_millis(600), block, 0.5));
        assert!(!is_slow(Duration::from_secs(5), block, 0.0));
    }
}

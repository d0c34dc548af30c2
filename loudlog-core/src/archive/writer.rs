use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use super::segment::ArchiveSegment;
use super::worker::{FlushWorker, Rejected};
use super::{persist_segment, ArchiveConfig, ArchiveTarget, FlushMode};
use crate::buffering::block::AudioBlock;
use crate::engine::pipeline::PipelineDiagnostics;
use crate::error::{LoudlogError, Result};

/// Batches raw blocks into segments and writes each segment as one file.
pub struct ArchiveWriter {
    target: ArchiveTarget,
    batch_blocks: usize,
    rotation_secs: i64,
    segment: Option<ArchiveSegment>,
    /// Start second of the most recent segment; the next one names a later second.
    last_start: Option<i64>,
    worker: Option<FlushWorker>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl ArchiveWriter {
    pub fn new(
        config: &ArchiveConfig,
        sample_rate: u32,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Result<Self> {
        if config.batch_blocks == 0 {
            return Err(LoudlogError::InvalidInput(
                "archive batch size must be at least one block".into(),
            ));
        }
        if config.rotation_secs <= 0 {
            return Err(LoudlogError::InvalidInput(format!(
                "archive rotation of {}s is not positive",
                config.rotation_secs
            )));
        }

        let target = ArchiveTarget {
            dir: config.dir.clone(),
            format: config.format,
            sample_rate,
        };
        let worker = match config.flush_mode {
            FlushMode::Inline => None,
            FlushMode::Offloaded => Some(FlushWorker::spawn(
                target.clone(),
                config.queue_capacity,
                config.queue_full,
                Arc::clone(&diagnostics),
            )?),
        };

        Ok(Self {
            target,
            batch_blocks: config.batch_blocks,
            rotation_secs: config.rotation_secs,
            segment: None,
            last_start: None,
            worker,
            diagnostics,
        })
    }

    /// Add a block to the current segment, starting one if there is none.
    ///
    /// The block is kept even when a writer-thread failure is reported.
    pub fn append(&mut self, block: AudioBlock) -> Result<()> {
        match &mut self.segment {
            Some(segment) => segment.push(block),
            None => {
                let start = match self.last_start {
                    Some(prev) => block.timestamp.max(prev.saturating_add(1)),
                    None => block.timestamp,
                };
                debug!(start, first = block.timestamp, "opening archive segment");
                self.last_start = Some(start);
                self.segment = Some(ArchiveSegment::starting_at(block, start));
            }
        }
        match &self.worker {
            Some(worker) => worker.check(),
            None => Ok(()),
        }
    }

    /// Whether the current segment is due for a flush at wall-clock `now`.
    pub fn maybe_rotate(&self, now: i64) -> bool {
        self.segment.as_ref().is_some_and(|segment| {
            segment.len() >= self.batch_blocks || segment.span_secs(now) >= self.rotation_secs
        })
    }

    /// Write out the current segment.
    ///
    /// Returns the file path when the write happened inline; `None` when there
    /// was nothing buffered or the segment went to the writer thread. A segment
    /// the writer thread refused stays current so [`finish`](Self::finish)
    /// still writes it.
    pub fn flush(&mut self) -> Result<Option<PathBuf>> {
        let Some(segment) = self.segment.take() else {
            return Ok(None);
        };
        match &self.worker {
            None => persist_segment(&segment, &self.target, &self.diagnostics).map(Some),
            Some(worker) => match worker.submit(segment) {
                Ok(()) => Ok(None),
                Err(Rejected { error, segment }) => {
                    self.segment = Some(segment);
                    Err(error)
                }
            },
        }
    }

    /// Write any partial segment and wait for pending writes.
    ///
    /// Also the cleanup path after a fatal error: everything buffered or queued
    /// is written before the first failure is returned.
    pub fn finish(mut self) -> Result<()> {
        let last = self.segment.take();
        match self.worker.take() {
            Some(worker) => worker.finish(last),
            None => match last {
                Some(segment) => {
                    persist_segment(&segment, &self.target, &self.diagnostics).map(|_| ())
                }
                None => Ok(()),
            },
        }
    }

    /// The segment being filled, if any.
    pub fn segment(&self) -> Option<&ArchiveSegment> {
        self.segment.as_ref()
    }

    pub fn target(&self) -> &ArchiveTarget {
        &self.target
    }
}

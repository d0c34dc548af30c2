//! Writer thread for offloaded segment flushes.
//!
//! Segments cross a bounded `crossbeam_channel` complete and read-only; the
//! pipeline never touches a segment after handing it over. What happens when
//! the queue is full is the configured [`QueueFullPolicy`]. Dropping the
//! worker closes the queue and waits for it to drain.

use std::io;
use std::sync::{atomic::Ordering, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendError, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{error, warn};

use super::{persist_segment, segment::ArchiveSegment, ArchiveTarget, QueueFullPolicy};
use crate::engine::pipeline::PipelineDiagnostics;
use crate::error::{LoudlogError, Result};

/// How often a blocked submit re-checks for a dead worker.
const BLOCKED_SEND_RECHECK: Duration = Duration::from_millis(100);

/// A segment the worker did not take, handed back with the reason.
#[derive(Debug)]
pub struct Rejected {
    pub error: LoudlogError,
    pub segment: ArchiveSegment,
}

pub struct FlushWorker {
    tx: Option<Sender<ArchiveSegment>>,
    /// Second receiver so `DropOldest` can evict from the sending side.
    evict_rx: Receiver<ArchiveSegment>,
    policy: QueueFullPolicy,
    target: ArchiveTarget,
    /// Oldest unreported write failure on the worker thread.
    failure: Arc<Mutex<Option<LoudlogError>>>,
    handle: Option<JoinHandle<()>>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl FlushWorker {
    pub fn spawn(
        target: ArchiveTarget,
        capacity: usize,
        policy: QueueFullPolicy,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<ArchiveSegment>(capacity.max(1));
        let failure = Arc::new(Mutex::new(None));

        let worker_target = target.clone();
        let worker_failure = Arc::clone(&failure);
        let worker_diagnostics = Arc::clone(&diagnostics);
        let worker_rx = rx.clone();
        let handle = std::thread::Builder::new()
            .name("loudlog-archive".into())
            .spawn(move || {
                // One bad segment does not stop the ones queued behind it.
                for segment in worker_rx.iter() {
                    if let Err(e) = persist_segment(&segment, &worker_target, &worker_diagnostics)
                    {
                        error!(component = "archive_worker", start = segment.start(), "{e}");
                        worker_failure.lock().get_or_insert(e);
                    }
                }
            })?;

        Ok(Self {
            tx: Some(tx),
            evict_rx: rx,
            policy,
            target,
            failure,
            handle: Some(handle),
            diagnostics,
        })
    }

    /// Surface a write failure from the worker thread.
    pub fn check(&self) -> Result<()> {
        match self.failure.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Hand a complete segment to the writer thread.
    ///
    /// A segment that was not queued comes back in [`Rejected`].
    pub fn submit(&self, segment: ArchiveSegment) -> std::result::Result<(), Rejected> {
        if let Err(error) = self.check() {
            return Err(Rejected { error, segment });
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(Rejected {
                error: LoudlogError::Other(anyhow::anyhow!("archive worker already closed")),
                segment,
            });
        };

        match self.policy {
            QueueFullPolicy::Block => {
                let mut pending = segment;
                loop {
                    match tx.send_timeout(pending, BLOCKED_SEND_RECHECK) {
                        Ok(()) => return Ok(()),
                        Err(SendTimeoutError::Timeout(back)) => {
                            if let Err(error) = self.check() {
                                return Err(Rejected {
                                    error,
                                    segment: back,
                                });
                            }
                            pending = back;
                        }
                        Err(SendTimeoutError::Disconnected(back)) => {
                            return Err(self.worker_gone(back))
                        }
                    }
                }
            }
            QueueFullPolicy::DropOldest => {
                let mut pending = segment;
                loop {
                    match tx.try_send(pending) {
                        Ok(()) => return Ok(()),
                        Err(TrySendError::Full(back)) => {
                            if let Ok(evicted) = self.evict_rx.try_recv() {
                                self.diagnostics
                                    .segments_dropped
                                    .fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    start = evicted.start(),
                                    blocks = evicted.len(),
                                    "archive queue full: dropped oldest pending segment"
                                );
                            }
                            pending = back;
                        }
                        Err(TrySendError::Disconnected(back)) => return Err(self.worker_gone(back)),
                    }
                }
            }
            QueueFullPolicy::Fail => match tx.try_send(segment) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(back)) => {
                    let error = match self.target.segment_path(back.start()) {
                        Ok(path) => LoudlogError::ArchiveWrite {
                            path,
                            source: io::Error::other("archive write queue full"),
                        },
                        Err(e) => e,
                    };
                    Err(Rejected {
                        error,
                        segment: back,
                    })
                }
                Err(TrySendError::Disconnected(back)) => Err(self.worker_gone(back)),
            },
        }
    }

    fn worker_gone(&self, segment: ArchiveSegment) -> Rejected {
        let error = self.check().err().unwrap_or_else(|| {
            LoudlogError::Other(anyhow::anyhow!("archive worker exited unexpectedly"))
        });
        Rejected { error, segment }
    }

    /// Queue `last` regardless of policy, wait for every pending segment to be
    /// written, then report the first failure.
    pub fn finish(mut self, last: Option<ArchiveSegment>) -> Result<()> {
        let mut inline = Ok(());
        if let (Some(segment), Some(tx)) = (last, self.tx.as_ref()) {
            if let Err(SendError(segment)) = tx.send(segment) {
                // No writer thread left to take it.
                inline = persist_segment(&segment, &self.target, &self.diagnostics).map(|_| ());
            }
        }
        self.close()?;
        self.check().and(inline)
    }

    /// Close the queue and wait for the worker to drain it.
    fn close(&mut self) -> Result<()> {
        self.tx = None;
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| LoudlogError::Other(anyhow::anyhow!("archive worker panicked"))),
            None => Ok(()),
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(component = "archive_worker", "{e}");
        }
        if let Some(e) = self.failure.lock().take() {
            error!(component = "archive_worker", "unreported archive failure: {e}");
        }
    }
}

//! Status events broadcast by the recorder.
//!
//! Serialised as camelCase JSON so a supervisor process can log or forward
//! them unchanged.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

/// Lifecycle state of the capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Recorder created, nothing opened yet.
    #[default]
    Idle,
    /// Opening the device, creating the store, preparing the archive.
    Initializing,
    /// Pulling and processing one block per iteration.
    Capturing,
    /// Writing out a full archive segment.
    Rotating,
    /// Shutdown requested; writing the partial segment.
    Draining,
    /// Clean shutdown finished.
    Stopped,
    /// A fatal error ended the pipeline.
    Failed,
}

impl PipelineState {
    /// `Stopped` and `Failed` never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub state: PipelineState,
    /// Optional human-readable detail (error message, segment path).
    pub detail: Option<String>,
}

/// Current pipeline state plus the broadcast of every change to it.
#[derive(Clone)]
pub struct StatusBoard {
    current: Arc<Mutex<PipelineState>>,
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBoard {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            current: Arc::new(Mutex::new(PipelineState::Idle)),
            tx,
        }
    }

    pub fn set(&self, state: PipelineState, detail: Option<String>) {
        *self.current.lock() = state;
        if state != PipelineState::Rotating {
            info!(state = ?state, detail = detail.as_deref().unwrap_or(""), "pipeline state");
        }
        // No subscribers is fine.
        let _ = self.tx.send(StatusEvent { state, detail });
    }

    pub fn current(&self) -> PipelineState {
        *self.current.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

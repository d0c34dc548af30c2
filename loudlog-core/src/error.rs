use std::path::PathBuf;

use thiserror::Error;

/// All errors produced by loudlog-core.
#[derive(Debug, Error)]
pub enum LoudlogError {
    /// Device lost, misconfigured, or the driver reported an unrecoverable fault.
    #[error("audio device error: {0}")]
    Device(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    /// The time-series store rejected an operation or could not be reached.
    #[error("time-series store error: {0}")]
    StoreWrite(String),

    #[error("archive write failed for {path}: {source}")]
    ArchiveWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive segment already exists: {path}")]
    ArchiveCollision { path: PathBuf },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("recorder is already running")]
    AlreadyRunning,

    #[error("recorder is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoudlogError {
    /// Whether the pipeline must stop when this error surfaces.
    ///
    /// Store failures are the only errors the capture loop absorbs.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LoudlogError::StoreWrite(_))
    }
}

pub type Result<T> = std::result::Result<T, LoudlogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_errors_are_non_fatal() {
        assert!(!LoudlogError::StoreWrite("daemon down".into()).is_fatal());
        assert!(LoudlogError::Device("unplugged".into()).is_fatal());
        assert!(LoudlogError::ArchiveCollision {
            path: PathBuf::from("a.wav")
        }
        .is_fatal());
    }
}

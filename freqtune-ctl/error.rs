use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FreqError {
    #[error("permission denied accessing {path}")]
    PermissionDenied { path: String },

    #[error("{path} not found")]
    NotFound { path: String },

    #[error("unsupported hardware: {0}")]
    Unsupported(String),

    #[error("out of resources: {0}")]
    ResourceExhausted(String),

    #[error("I/O error on {path}: {source}")]
    Io { path: String, source: io::Error },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device index {index} out of range ({count} devices)")]
    OutOfRange { index: u32, count: u32 },

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("MSR access failed: {0}")]
    Msr(#[from] freqtune_raw::MsrError),

    #[error("access daemon error: {0}")]
    Daemon(String),
}

pub type Result<T> = std::result::Result<T, FreqError>;

impl FreqError {
    /// Classify an `io::Error` from a filesystem touch into the taxonomy,
    /// keeping the failing path.
    pub(crate) fn from_io(path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::PermissionDenied => FreqError::PermissionDenied { path },
            io::ErrorKind::NotFound => FreqError::NotFound { path },
            _ => FreqError::Io { path, source },
        }
    }
}

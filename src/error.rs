//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `DaqError`, used across the crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can end a run or reject a request.
//!
//! ## Error Hierarchy
//!
//! - **`Storage`**: A segment could not be opened, written or closed. Fatal to the
//!   current run; the run controller stops the run and reports it once.
//! - **`InvalidRequest`**: A remote fetch carried a malformed channel pattern, an
//!   unknown stream or a bad downsample factor. Rejected at the boundary, nothing
//!   is mutated.
//! - **`NoData`**: A remote fetch resolved to zero scans. Reported as text, never as
//!   a zero-length binary frame.
//! - **`Config`** / **`Configuration`**: Parsing and semantic validation failures.
//! - **`Allocation`**: A buffer for a concatenated fetch could not be reserved.
//!
//! Transient conditions are deliberately absent. An empty fetch is a zero count,
//! and a time-mapping miss is a [`crate::timing::MapError`]; the trigger loop
//! absorbs both and retries on its next tick.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The configuration parsed but is not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or device I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A segment could not be opened, written or closed.
    #[error("Storage error on {stream}: {message}")]
    Storage {
        /// Stream whose segment failed.
        stream: String,
        /// What went wrong, with the file path when there is one.
        message: String,
    },

    /// A remote request was malformed.
    #[error("{0}")]
    InvalidRequest(String),

    /// A remote fetch found nothing to return.
    #[error("{0}")]
    NoData(String),

    /// A fetch buffer could not be reserved.
    #[error("Failed to allocate {bytes} bytes for fetch buffer")]
    Allocation {
        /// Size of the failed reservation.
        bytes: usize,
    },

    /// The command needs a running acquisition.
    #[error("Not running.")]
    NotRunning,

    /// The command does not apply to the current gate or trigger.
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// A worker thread could not be started or died.
    #[error("Thread error: {0}")]
    Thread(String),
}

impl DaqError {
    /// Build a storage error for a named stream.
    pub fn storage(stream: impl ToString, message: impl ToString) -> Self {
        DaqError::Storage {
            stream: stream.to_string(),
            message: message.to_string(),
        }
    }

    /// True for errors that must end the current run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::Storage { .. } | DaqError::Io(_) | DaqError::Allocation { .. } | DaqError::Thread(_)
        )
    }

    /// True for errors that only reject one request.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            DaqError::InvalidRequest(_) | DaqError::NoData(_) | DaqError::NotRunning
        )
    }
}

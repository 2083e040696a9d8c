//! Errors raised by storage pools.

use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors surfaced by [`StoragePool`](super::StoragePool) operations.
///
/// Every error is scoped to the single filesystem operation that raised it;
/// the pool stays usable afterwards.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PoolError {
    /// Raised when a filesystem does not exist.
    #[error("filesystem {volume} not found in pool {pool}")]
    NotFound {
        /// Pool that was searched.
        pool: String,
        /// Requested volume.
        volume: String,
    },
    /// Raised when creating a filesystem whose name is taken.
    #[error("filesystem {volume} already exists in pool {pool}")]
    AlreadyExists {
        /// Pool holding the existing filesystem.
        pool: String,
        /// Conflicting volume.
        volume: String,
    },
    /// Raised when a snapshot range is not part of the local history.
    #[error("invalid snapshot range for {volume}: {message}")]
    InvalidRange {
        /// Volume whose history was consulted.
        volume: String,
        /// Human-readable description of the mismatch.
        message: String,
    },
    /// Raised when an incoming stream cannot be applied.
    #[error("corrupt snapshot stream for {volume}: {message}")]
    StreamCorrupt {
        /// Volume the stream was applied to.
        volume: String,
        /// Human-readable description of the defect.
        message: String,
    },
    /// Raised when a pool or volume name fails validation.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName {
        /// Rejected value.
        name: String,
        /// Reason for the rejection.
        reason: String,
    },
    /// Raised when writing a stream to its sink fails, usually because the
    /// receiving end went away.
    #[error("stream sink failed: {message}")]
    Sink {
        /// Operating system error string.
        message: String,
    },
    /// Raised when the underlying storage fails.
    #[error("storage failure at {path}: {message}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

impl PoolError {
    /// Label [`PoolError::kind`] reports for storage failures.
    pub const IO_FAILURE: &'static str = "io_failure";

    pub(crate) fn io(path: impl Into<Utf8PathBuf>, err: &io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn sink(err: &io::Error) -> Self {
        Self::Sink {
            message: err.to_string(),
        }
    }

    /// Returns `true` when the error came from the stream sink rather than
    /// from local storage.
    #[must_use]
    pub const fn is_sink_failure(&self) -> bool {
        matches!(self, Self::Sink { .. })
    }

    pub(crate) fn invalid_name(name: &str, reason: &str) -> Self {
        Self::InvalidName {
            name: name.to_owned(),
            reason: reason.to_owned(),
        }
    }

    pub(crate) fn corrupt(volume: impl ToString, message: impl Into<String>) -> Self {
        Self::StreamCorrupt {
            volume: volume.to_string(),
            message: message.into(),
        }
    }

    /// Stable machine-readable label for the error kind.
    ///
    /// The receiver command reports this label so the pushing side can tell
    /// storage failures apart from protocol failures.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::InvalidRange { .. } => "invalid_range",
            Self::StreamCorrupt { .. } => "stream_corrupt",
            Self::InvalidName { .. } => "invalid_name",
            Self::Sink { .. } | Self::Io { .. } => Self::IO_FAILURE,
        }
    }
}

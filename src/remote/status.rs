//! Status line written by the receiver command.

use serde::{Deserialize, Serialize};

use crate::pool::{PoolName, SnapshotId, VolumeName};

/// Machine-readable outcome of one receiver invocation.
///
/// The receiver prints exactly one of these as a JSON line on its output,
/// for example `{"status":"ok","volume":"data","latest":{"sequence":2,...}}`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReceiverStatus {
    /// The command succeeded.
    Ok {
        /// Pool the command acted on, reported by `init`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pool: Option<PoolName>,
        /// Volume the command acted on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume: Option<VolumeName>,
        /// Newest snapshot of that volume; `null` when it has none or is
        /// absent.
        #[serde(default)]
        latest: Option<SnapshotId>,
        /// Full snapshot history, oldest first.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        snapshots: Vec<SnapshotId>,
        /// Registered volumes, for listings.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        volumes: Vec<VolumeName>,
    },
    /// The command failed.
    Error {
        /// Stable label such as `io_failure` or `stream_corrupt`.
        kind: String,
        /// Human-readable description.
        message: String,
    },
}

impl ReceiverStatus {
    /// Success status for a single volume.
    #[must_use]
    pub const fn volume(volume: VolumeName, latest: Option<SnapshotId>) -> Self {
        Self::Ok {
            pool: None,
            volume: Some(volume),
            latest,
            snapshots: Vec::new(),
            volumes: Vec::new(),
        }
    }

    /// Failure status.
    #[must_use]
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for [`ReceiverStatus::Ok`].
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Renders the status as a single line without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns the serialiser error; in practice rendering cannot fail.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses the last non-empty line of `output`.
    ///
    /// # Errors
    ///
    /// Returns an error message when no line parses as a status.
    pub fn parse(output: &str) -> Result<Self, String> {
        let line = output
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| String::from("receiver produced no status line"))?;
        serde_json::from_str(line.trim())
            .map_err(|err| format!("unreadable receiver status {line:?}: {err}"))
    }
}

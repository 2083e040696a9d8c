//! Identifiers shared by storage pools and the replication protocol.

use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PoolError;

/// Longest volume name accepted by a pool, in bytes.
pub const MAX_VOLUME_NAME_LEN: usize = 255;

/// Prefix applied to generated pool names.
pub const POOL_NAME_PREFIX: &str = "ferry-";

/// Host-unique name of a storage pool.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PoolName(String);

impl PoolName {
    /// Generates a fresh, UUID-derived pool name.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("{POOL_NAME_PREFIX}{}", Uuid::new_v4()))
    }

    /// Validates and wraps an existing pool name.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidName`] when the trimmed value is empty or
    /// contains path separators.
    pub fn new(value: impl Into<String>) -> Result<Self, PoolError> {
        let raw = value.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PoolError::invalid_name(&raw, "pool name is empty"));
        }
        if trimmed.contains(['/', '\0']) {
            return Err(PoolError::invalid_name(
                &raw,
                "pool name must not contain '/' or NUL",
            ));
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PoolName {
    type Error = PoolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PoolName> for String {
    fn from(value: PoolName) -> Self {
        value.0
    }
}

/// Name of a volume, unique within its pool and service.
///
/// Names double as directory names under the pool's mount root, so they are
/// restricted to a single path component that is not hidden.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeName(String);

impl VolumeName {
    /// Validates and wraps a volume name.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidName`] when the value is empty, longer than
    /// [`MAX_VOLUME_NAME_LEN`], contains `/` or NUL, or starts with `.`.
    pub fn new(value: impl Into<String>) -> Result<Self, PoolError> {
        let raw = value.into();
        if raw.is_empty() {
            return Err(PoolError::invalid_name(&raw, "volume name is empty"));
        }
        if raw.len() > MAX_VOLUME_NAME_LEN {
            return Err(PoolError::invalid_name(
                &raw,
                "volume name exceeds 255 bytes",
            ));
        }
        if raw.contains(['/', '\0']) {
            return Err(PoolError::invalid_name(
                &raw,
                "volume name must not contain '/' or NUL",
            ));
        }
        if raw.starts_with('.') {
            return Err(PoolError::invalid_name(
                &raw,
                "volume name must not start with '.'",
            ));
        }
        Ok(Self(raw))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for VolumeName {
    type Error = PoolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VolumeName> for String {
    fn from(value: VolumeName) -> Self {
        value.0
    }
}

/// Position of a snapshot in its filesystem's history.
///
/// `sequence` starts at 1 and grows by one per snapshot. `digest` chains the
/// previous snapshot's digest with the snapshot's manifest, so two hosts
/// holding the same history agree on every identifier.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SnapshotId {
    /// Monotonic position within the filesystem history.
    pub sequence: u64,
    /// Hex-encoded SHA-256 chained over the history up to this snapshot.
    pub digest: String,
}

impl SnapshotId {
    /// Returns an abbreviated digest for log and error messages.
    #[must_use]
    pub fn short_digest(&self) -> &str {
        self.digest.get(..12).unwrap_or(&self.digest)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.sequence, self.short_digest())
    }
}

/// A named filesystem living inside a pool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Filesystem {
    /// Pool owning the filesystem.
    pub pool: PoolName,
    /// Volume the filesystem backs.
    pub volume: VolumeName,
    /// Directory where the writable state is mounted.
    pub mount_path: Utf8PathBuf,
}

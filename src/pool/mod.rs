//! Snapshot-capable storage pools.
//!
//! A pool owns a set of named filesystems on local disk, captures immutable
//! snapshots of them, and turns snapshot ranges into byte streams another
//! pool can apply. Every operation against one filesystem is serialised by a
//! per-filesystem lock; operations on different filesystems run
//! concurrently.

use std::future::Future;
use std::pin::Pin;

use camino::Utf8Path;

mod directory;
mod error;
mod locks;
mod manifest;
mod stream;
mod types;

pub use directory::DirectoryPool;
pub use error::PoolError;
pub use stream::{StreamSink, StreamSource};
pub use types::{Filesystem, MAX_VOLUME_NAME_LEN, POOL_NAME_PREFIX, PoolName, SnapshotId, VolumeName};

/// Future returned by pool operations.
pub type PoolFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PoolError>> + Send + 'a>>;

/// Operations a storage pool offers to the volume service and the push
/// protocol.
pub trait StoragePool: Send + Sync {
    /// Host-unique pool name.
    fn name(&self) -> &PoolName;

    /// Directory under which filesystems are mounted.
    fn mount_root(&self) -> &Utf8Path;

    /// Creates an empty filesystem with no snapshots.
    ///
    /// Fails with [`PoolError::AlreadyExists`] when the name is taken.
    fn create<'a>(&'a self, volume: &'a VolumeName) -> PoolFuture<'a, Filesystem>;

    /// Looks up an existing filesystem.
    ///
    /// Fails with [`PoolError::NotFound`] when absent.
    fn get<'a>(&'a self, volume: &'a VolumeName) -> PoolFuture<'a, Filesystem>;

    /// Lists the filesystems present when the call is made, sorted by name.
    fn enumerate(&self) -> PoolFuture<'_, Vec<Filesystem>>;

    /// Captures the current mounted state as a new snapshot.
    ///
    /// Succeeds even when nothing changed since the previous snapshot.
    fn snapshot<'a>(&'a self, volume: &'a VolumeName) -> PoolFuture<'a, SnapshotId>;

    /// Returns the snapshot history, oldest first.
    fn snapshots<'a>(&'a self, volume: &'a VolumeName) -> PoolFuture<'a, Vec<SnapshotId>>;

    /// Returns the newest snapshot, if any.
    fn latest_snapshot<'a>(
        &'a self,
        volume: &'a VolumeName,
    ) -> PoolFuture<'a, Option<SnapshotId>> {
        Box::pin(async move { Ok(self.snapshots(volume).await?.pop()) })
    }

    /// Writes the delta between `from` (exclusive) and `to` (inclusive) into
    /// `sink`, one frame per intermediate snapshot, and returns the number of
    /// bytes written. `from = None` produces a full stream.
    ///
    /// Fails with [`PoolError::InvalidRange`] when either end is not part of
    /// this filesystem's history or `from` is newer than `to`.
    fn serialize_incremental<'a>(
        &'a self,
        volume: &'a VolumeName,
        from: Option<&'a SnapshotId>,
        to: &'a SnapshotId,
        sink: StreamSink<'a>,
    ) -> PoolFuture<'a, u64>;

    /// Writes a full stream of the whole history. A filesystem without
    /// snapshots produces a stream that only creates the filesystem.
    fn serialize_full_history<'a>(
        &'a self,
        volume: &'a VolumeName,
        sink: StreamSink<'a>,
    ) -> PoolFuture<'a, u64>;

    /// Applies a stream produced by [`StoragePool::serialize_incremental`],
    /// creating the filesystem when absent.
    ///
    /// Application is atomic: on any error the filesystem is left exactly as
    /// it was. Fails with [`PoolError::StreamCorrupt`] when the declared base
    /// does not match the local latest snapshot, when a full stream meets
    /// existing history, or when the stream fails verification.
    fn receive_incremental<'a>(
        &'a self,
        volume: &'a VolumeName,
        source: StreamSource<'a>,
    ) -> PoolFuture<'a, Filesystem>;
}

#[cfg(test)]
mod tests;

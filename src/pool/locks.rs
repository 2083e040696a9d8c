//! Per-filesystem mutual exclusion.
//!
//! Two layers guard each volume: an async mutex shared by tasks holding the
//! same [`DirectoryPool`](super::DirectoryPool) and an advisory lock file
//! under `.ferry/locks` shared by every process that opens the pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs_utf8::Dir;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{PoolError, VolumeName};
use crate::file_lock::FileLock;

const LOCKS_DIR: &str = ".ferry/locks";

type Slots = Arc<Mutex<HashMap<VolumeName, Arc<AsyncMutex<()>>>>>;

/// Hands out one lock per volume so operations on a single filesystem never
/// overlap while different filesystems proceed concurrently. Entries are
/// dropped once nobody holds or waits for them.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    slots: Slots,
}

/// Held for the duration of one filesystem operation.
#[derive(Debug)]
pub(crate) struct VolumeGuard {
    file: Option<FileLock>,
    local: Option<OwnedMutexGuard<()>>,
    slots: Slots,
    volume: VolumeName,
}

impl LockTable {
    /// Waits for exclusive access to `volume` within this process and then
    /// across processes sharing the pool at `root`.
    pub(crate) async fn acquire(
        &self,
        root: &Dir,
        mount_root: &Utf8Path,
        volume: &VolumeName,
    ) -> Result<VolumeGuard, PoolError> {
        let slot = Arc::clone(lock_slots(&self.slots).entry(volume.clone()).or_default());
        let local = slot.lock_owned().await;
        let mut guard = VolumeGuard {
            file: None,
            local: Some(local),
            slots: Arc::clone(&self.slots),
            volume: volume.clone(),
        };

        let path = lock_path(volume);
        root.create_dir_all(LOCKS_DIR)
            .map_err(|err| PoolError::io(mount_root.join(LOCKS_DIR), &err))?;
        let file = FileLock::acquire_async(root, &path)
            .await
            .map_err(|err| PoolError::io(mount_root.join(&path), &err))?;
        guard.file = Some(file);
        Ok(guard)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}

impl Drop for VolumeGuard {
    fn drop(&mut self) {
        drop(self.file.take());
        drop(self.local.take());
        let mut slots = lock_slots(&self.slots);
        if slots
            .get(&self.volume)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.volume);
        }
    }
}

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<VolumeName, Arc<AsyncMutex<()>>>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_path(volume: &VolumeName) -> Utf8PathBuf {
    Utf8PathBuf::from(LOCKS_DIR).join(format!("{volume}.lock"))
}

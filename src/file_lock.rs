//! Advisory file locks shared between processes.
//!
//! Every receiver invocation opens its own pool and registry handles, so
//! in-process mutexes alone cannot serialise work on one host. These locks
//! use `flock`-style advisory locking through `fs2` and are released when the
//! guard drops.

use std::fs::File;
use std::io;

use camino::Utf8Path;
use cap_std::fs_utf8::{Dir, OpenOptions};
use fs2::FileExt;
use tracing::debug;

/// Exclusive advisory lock on a file.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    /// Blocks the calling thread until the lock on `name` inside `dir` is
    /// held. The lock file is created when missing.
    pub(crate) fn acquire(dir: &Dir, name: &Utf8Path) -> io::Result<Self> {
        let file = open_lock_file(dir, name)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    /// Waits for the lock on a blocking thread so the runtime keeps serving
    /// the tasks that currently hold it.
    pub(crate) async fn acquire_async(dir: &Dir, name: &Utf8Path) -> io::Result<Self> {
        let file = open_lock_file(dir, name)?;
        tokio::task::spawn_blocking(move || {
            file.lock_exclusive()?;
            Ok(Self { file })
        })
        .await
        .map_err(io::Error::other)?
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(error = %err, "file unlock failed; closing releases it");
        }
    }
}

fn open_lock_file(dir: &Dir, name: &Utf8Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    Ok(dir.open_with(name, &options)?.into_std())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std::ambient_authority;
    use rstest::{fixture, rstest};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Scratch {
        dir: Dir,
        _tmp: TempDir,
    }

    #[fixture]
    fn scratch() -> Scratch {
        let tmp = TempDir::new().expect("temp dir");
        let path = Utf8Path::from_path(tmp.path()).expect("utf8 path");
        let dir = Dir::open_ambient_dir(path, ambient_authority()).expect("open temp dir");
        Scratch { dir, _tmp: tmp }
    }

    #[rstest]
    #[tokio::test]
    async fn second_handle_waits_for_the_first(scratch: Scratch) {
        let held = FileLock::acquire(&scratch.dir, Utf8Path::new("a.lock")).expect("first lock");

        let contended = tokio::time::timeout(
            Duration::from_millis(100),
            FileLock::acquire_async(&scratch.dir, Utf8Path::new("a.lock")),
        )
        .await;
        assert!(contended.is_err(), "second lock must wait while the first is held");

        drop(held);
        let reacquired = tokio::time::timeout(
            Duration::from_secs(5),
            FileLock::acquire_async(&scratch.dir, Utf8Path::new("a.lock")),
        )
        .await;
        assert!(
            matches!(reacquired, Ok(Ok(_))),
            "lock should be free once the holder drops"
        );
    }

    #[rstest]
    fn distinct_files_do_not_contend(scratch: Scratch) {
        let _first = FileLock::acquire(&scratch.dir, Utf8Path::new("a.lock")).expect("a");
        let second = FileLock::acquire(&scratch.dir, Utf8Path::new("b.lock"));
        assert!(second.is_ok(), "unrelated lock files must not contend");
    }
}

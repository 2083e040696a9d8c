//! Snapshot manifests: the list of regular files captured by a snapshot and
//! the digests that chain snapshots into a verifiable history.

use std::collections::BTreeMap;
use std::io::{self, Read};

use cap_std::fs_utf8::Dir;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::SnapshotId;

const DIGEST_CHUNK: usize = 64 * 1024;

/// Size and content digest of one captured file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct FileRecord {
    pub(crate) size: u64,
    pub(crate) digest: String,
}

/// Files captured by a snapshot, keyed by `/`-separated relative path.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct Manifest {
    files: BTreeMap<String, FileRecord>,
}

/// Changes turning one manifest into a later one.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Delta {
    pub(crate) removed: Vec<String>,
    pub(crate) changed: Vec<(String, FileRecord)>,
}

impl Manifest {
    pub(crate) fn insert(&mut self, path: String, record: FileRecord) {
        self.files.insert(path, record);
    }

    pub(crate) fn remove(&mut self, path: &str) -> Option<FileRecord> {
        self.files.remove(path)
    }

    pub(crate) fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &FileRecord)> {
        self.files.iter()
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.files.values().map(|record| record.size).sum()
    }

    /// Digest of this manifest chained onto `previous`.
    pub(crate) fn chain_digest(&self, previous: Option<&SnapshotId>) -> String {
        let mut hasher = Sha256::new();
        if let Some(parent) = previous {
            hasher.update(parent.digest.as_bytes());
        }
        hasher.update(b"\n");
        for (path, record) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
            hasher.update(record.size.to_string().as_bytes());
            hasher.update(b"\0");
            hasher.update(record.digest.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Files removed from `self` and files added or modified in `newer`.
    pub(crate) fn diff(&self, newer: &Self) -> Delta {
        let removed = self
            .files
            .keys()
            .filter(|path| !newer.files.contains_key(*path))
            .cloned()
            .collect();
        let changed = newer
            .files
            .iter()
            .filter(|(path, record)| self.files.get(*path) != Some(record))
            .map(|(path, record)| (path.clone(), record.clone()))
            .collect();
        Delta { removed, changed }
    }
}

/// Incremental SHA-256 over file content.
#[derive(Default)]
pub(crate) struct ContentHasher {
    hasher: Sha256,
    size: u64,
}

impl ContentHasher {
    pub(crate) fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
    }

    pub(crate) fn finish(self) -> FileRecord {
        FileRecord {
            size: self.size,
            digest: hex::encode(self.hasher.finalize()),
        }
    }
}

pub(crate) fn digest_file(dir: &Dir, path: &str) -> io::Result<FileRecord> {
    let mut file = dir.open(path)?;
    let mut hasher = ContentHasher::default();
    let mut buffer = vec![0_u8; DIGEST_CHUNK];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(buffer.get(..read).unwrap_or_default());
    }
    Ok(hasher.finish())
}

/// Lists the regular files below `dir` as sorted relative paths.
///
/// Symlinks and other special files are skipped.
pub(crate) fn scan(dir: &Dir) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    scan_into(dir, "", &mut files)?;
    files.sort();
    Ok(files)
}

fn scan_into(dir: &Dir, prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
    for entry in dir.entries()? {
        let entry = entry?;
        let name = entry.file_name()?;
        let relative = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let child = dir.open_dir(&name)?;
            scan_into(&child, &relative, out)?;
        } else if file_type.is_file() {
            out.push(relative);
        } else {
            warn!(path = %relative, "skipping non-regular file");
        }
    }
    Ok(())
}

/// Checks that a path received from a peer stays inside the filesystem.
pub(crate) fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\0')
        && path
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

/// Parent directory of a relative path, if it has one.
pub(crate) fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

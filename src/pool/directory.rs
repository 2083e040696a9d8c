//! Storage pool backed by a plain directory tree.
//!
//! Each filesystem is a directory under the mount root. Snapshots are
//! immutable copies kept under `.ferry/volumes/<volume>/snapshots/<seq>`;
//! files that did not change since the previous snapshot are hard links to
//! the earlier copy, so a snapshot only costs the space of what changed.
//! Incoming streams are staged under `.ferry/staging` and renamed into place
//! once fully verified. Work on one filesystem is serialised across processes
//! by lock files under `.ferry/locks`.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};
use uuid::Uuid;

use super::locks::LockTable;
use super::manifest::{
    self, ContentHasher, FileRecord, Manifest, is_safe_relative_path, parent_of,
};
use super::stream::{
    CopyError, DecodeError, FileEntry, FrameHeader, Record, StreamHeader, StreamReader, StreamSink,
    StreamSource, StreamWriter,
};
use super::{Filesystem, PoolError, PoolFuture, PoolName, SnapshotId, StoragePool, VolumeName};

const MARKER_FILE: &str = ".ferry/pool.toml";
const VOLUMES_DIR: &str = ".ferry/volumes";
const STAGING_DIR: &str = ".ferry/staging";
const HISTORY_FILE: &str = "history.json";
const MANIFEST_FILE: &str = "manifest.json";
const DATA_DIR: &str = "data";
const RECEIVE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Deserialize, Serialize)]
struct PoolMarker {
    name: PoolName,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct History {
    snapshots: Vec<SnapshotId>,
}

impl History {
    fn latest(&self) -> Option<&SnapshotId> {
        self.snapshots.last()
    }

    fn at(&self, sequence: u64) -> Option<&SnapshotId> {
        let index = usize::try_from(sequence.checked_sub(1)?).ok()?;
        self.snapshots.get(index)
    }

    fn contains(&self, id: &SnapshotId) -> bool {
        self.at(id.sequence) == Some(id)
    }
}

/// Directory-backed [`StoragePool`].
#[derive(Debug)]
pub struct DirectoryPool {
    name: PoolName,
    mount_root: Utf8PathBuf,
    root: Arc<Dir>,
    locks: LockTable,
}

impl DirectoryPool {
    /// Creates a pool at `mount_root`, or reopens it when it already carries
    /// the same name.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Io`] when the directory cannot be prepared or
    /// already belongs to a pool with a different name.
    pub fn create(name: PoolName, mount_root: &Utf8Path) -> Result<Self, PoolError> {
        Dir::create_ambient_dir_all(mount_root, ambient_authority())
            .map_err(|err| PoolError::io(mount_root, &err))?;
        let root = Dir::open_ambient_dir(mount_root, ambient_authority())
            .map_err(|err| PoolError::io(mount_root, &err))?;

        let marker_path = mount_root.join(MARKER_FILE);
        if root
            .try_exists(MARKER_FILE)
            .map_err(|err| PoolError::io(&marker_path, &err))?
        {
            let existing = read_marker(&root, mount_root)?;
            if existing.name != name {
                return Err(PoolError::Io {
                    path: marker_path,
                    message: format!("directory already holds pool {}", existing.name),
                });
            }
        } else {
            for dir in [VOLUMES_DIR, STAGING_DIR] {
                root.create_dir_all(dir)
                    .map_err(|err| PoolError::io(mount_root.join(dir), &err))?;
            }
            let rendered = ortho_config::toml::to_string_pretty(&PoolMarker { name: name.clone() })
                .map_err(|err| PoolError::Io {
                    path: marker_path.clone(),
                    message: err.to_string(),
                })?;
            root.write(MARKER_FILE, rendered)
                .map_err(|err| PoolError::io(&marker_path, &err))?;
        }

        debug!(pool = %name, root = %mount_root, "pool ready");
        Ok(Self::from_parts(name, mount_root, root))
    }

    /// Opens an existing pool.
    ///
    /// When `expected` is given the pool marker must carry that name.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Io`] when the directory or its marker is missing,
    /// unreadable, or names a different pool.
    pub fn open(expected: Option<&PoolName>, mount_root: &Utf8Path) -> Result<Self, PoolError> {
        let root = Dir::open_ambient_dir(mount_root, ambient_authority())
            .map_err(|err| PoolError::io(mount_root, &err))?;
        let marker = read_marker(&root, mount_root)?;
        if let Some(name) = expected {
            if &marker.name != name {
                return Err(PoolError::Io {
                    path: mount_root.join(MARKER_FILE),
                    message: format!("expected pool {name}, found {}", marker.name),
                });
            }
        }
        Ok(Self::from_parts(marker.name, mount_root, root))
    }

    fn from_parts(name: PoolName, mount_root: &Utf8Path, root: Dir) -> Self {
        Self {
            name,
            mount_root: mount_root.to_path_buf(),
            root: Arc::new(root),
            locks: LockTable::default(),
        }
    }

    /// Irreversibly removes the pool and every filesystem it holds.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Io`] when the tree cannot be removed.
    pub fn destroy(&self) -> Result<(), PoolError> {
        let parent = self
            .mount_root
            .parent()
            .unwrap_or_else(|| Utf8Path::new("."));
        let file_name = self
            .mount_root
            .file_name()
            .ok_or_else(|| PoolError::Io {
                path: self.mount_root.clone(),
                message: String::from("pool root has no final component"),
            })?;
        let parent_dir = Dir::open_ambient_dir(parent, ambient_authority())
            .map_err(|err| PoolError::io(parent, &err))?;
        parent_dir
            .remove_dir_all(file_name)
            .map_err(|err| PoolError::io(&self.mount_root, &err))?;
        info!(pool = %self.name, "pool destroyed");
        Ok(())
    }

    fn ensure_reachable(&self) -> Result<(), PoolError> {
        let reachable = self.root.try_exists(MARKER_FILE).unwrap_or(false);
        if reachable {
            Ok(())
        } else {
            Err(PoolError::Io {
                path: self.mount_root.clone(),
                message: format!("pool {} is not reachable", self.name),
            })
        }
    }

    fn filesystem(&self, volume: &VolumeName) -> Filesystem {
        Filesystem {
            pool: self.name.clone(),
            volume: volume.clone(),
            mount_path: self.mount_root.join(volume.as_str()),
        }
    }

    fn exists(&self, volume: &VolumeName) -> Result<bool, PoolError> {
        let path = history_path(volume);
        self.root
            .try_exists(&path)
            .map_err(|err| PoolError::io(self.mount_root.join(&path), &err))
    }

    fn not_found(&self, volume: &VolumeName) -> PoolError {
        PoolError::NotFound {
            pool: self.name.to_string(),
            volume: volume.to_string(),
        }
    }

    fn load_history(&self, volume: &VolumeName) -> Result<History, PoolError> {
        if !self.exists(volume)? {
            return Err(self.not_found(volume));
        }
        read_json(&self.root, &self.mount_root, &history_path(volume))
    }

    fn store_history(&self, volume: &VolumeName, history: &History) -> Result<(), PoolError> {
        write_json_atomic(&self.root, &self.mount_root, &history_path(volume), history)
    }

    fn load_manifest(&self, volume: &VolumeName, sequence: u64) -> Result<Manifest, PoolError> {
        let path = snapshot_path(volume, sequence).join(MANIFEST_FILE);
        read_json(&self.root, &self.mount_root, &path)
    }

    fn open_dir(&self, path: &Utf8Path) -> Result<Dir, PoolError> {
        self.root
            .open_dir(path)
            .map_err(|err| PoolError::io(self.mount_root.join(path), &err))
    }

    fn staging(&self) -> Result<Staging, PoolError> {
        let path = Utf8PathBuf::from(STAGING_DIR).join(Uuid::new_v4().to_string());
        self.root
            .create_dir_all(&path)
            .map_err(|err| PoolError::io(self.mount_root.join(&path), &err))?;
        Ok(Staging {
            root: Arc::clone(&self.root),
            path,
            cleaned: false,
        })
    }

    async fn create_filesystem(&self, volume: &VolumeName) -> Result<Filesystem, PoolError> {
        self.ensure_reachable()?;
        let _guard = self.locks.acquire(&self.root, &self.mount_root, volume).await?;
        if self.exists(volume)? {
            return Err(PoolError::AlreadyExists {
                pool: self.name.to_string(),
                volume: volume.to_string(),
            });
        }
        self.prepare_filesystem(volume)?;
        debug!(pool = %self.name, %volume, "filesystem created");
        Ok(self.filesystem(volume))
    }

    fn prepare_filesystem(&self, volume: &VolumeName) -> Result<(), PoolError> {
        self.prepare_directories(volume)?;
        self.store_history(volume, &History::default())
    }

    fn prepare_directories(&self, volume: &VolumeName) -> Result<(), PoolError> {
        for path in [
            Utf8PathBuf::from(volume.as_str()),
            volume_state_path(volume).join("snapshots"),
        ] {
            self.root
                .create_dir_all(&path)
                .map_err(|err| PoolError::io(self.mount_root.join(&path), &err))?;
        }
        Ok(())
    }

    async fn get_filesystem(&self, volume: &VolumeName) -> Result<Filesystem, PoolError> {
        self.ensure_reachable()?;
        if self.exists(volume)? {
            Ok(self.filesystem(volume))
        } else {
            Err(self.not_found(volume))
        }
    }

    fn list_filesystems(&self) -> Result<Vec<Filesystem>, PoolError> {
        self.ensure_reachable()?;
        let volumes_path = self.mount_root.join(VOLUMES_DIR);
        let entries = self
            .root
            .read_dir(VOLUMES_DIR)
            .map_err(|err| PoolError::io(&volumes_path, &err))?;
        let mut filesystems = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PoolError::io(&volumes_path, &err))?;
            let name = entry
                .file_name()
                .map_err(|err| PoolError::io(&volumes_path, &err))?;
            let Ok(volume) = VolumeName::new(name) else {
                continue;
            };
            if self.exists(&volume)? {
                filesystems.push(self.filesystem(&volume));
            }
        }
        filesystems.sort_by(|left, right| left.volume.cmp(&right.volume));
        Ok(filesystems)
    }

    async fn take_snapshot(&self, volume: &VolumeName) -> Result<SnapshotId, PoolError> {
        self.ensure_reachable()?;
        let _guard = self.locks.acquire(&self.root, &self.mount_root, volume).await?;
        let mut history = self.load_history(volume)?;
        let previous = history.latest().cloned();
        let previous_manifest = match &previous {
            Some(id) => Some(self.load_manifest(volume, id.sequence)?),
            None => None,
        };
        let staging = self.staging()?;
        let staged_snapshot = staging.path.join("snapshot");

        let capture = Capture {
            root: Arc::clone(&self.root),
            mount_root: self.mount_root.clone(),
            volume: volume.clone(),
            staging: staged_snapshot.clone(),
            previous: previous.clone().zip(previous_manifest),
        };
        let manifest = tokio::task::spawn_blocking(move || capture.run())
            .await
            .map_err(|err| PoolError::Io {
                path: self.mount_root.join(volume.as_str()),
                message: err.to_string(),
            })??;

        let id = SnapshotId {
            sequence: previous.as_ref().map_or(1, |id| id.sequence + 1),
            digest: manifest.chain_digest(previous.as_ref()),
        };
        write_json_atomic(
            &self.root,
            &self.mount_root,
            &staged_snapshot.join(MANIFEST_FILE),
            &manifest,
        )?;
        self.install(&staged_snapshot, &snapshot_path(volume, id.sequence))?;
        history.snapshots.push(id.clone());
        self.store_history(volume, &history)?;
        staging.discard();

        debug!(pool = %self.name, %volume, snapshot = %id, size = manifest.total_size(), "snapshot taken");
        Ok(id)
    }

    /// Moves a staged directory to its final location, replacing leftovers
    /// from an interrupted earlier attempt.
    fn install(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), PoolError> {
        if self
            .root
            .try_exists(to)
            .map_err(|err| PoolError::io(self.mount_root.join(to), &err))?
        {
            self.root
                .remove_dir_all(to)
                .map_err(|err| PoolError::io(self.mount_root.join(to), &err))?;
        }
        self.root
            .rename(from, &self.root, to)
            .map_err(|err| PoolError::io(self.mount_root.join(to), &err))
    }

    async fn write_incremental(
        &self,
        volume: &VolumeName,
        from: Option<&SnapshotId>,
        to: &SnapshotId,
        sink: StreamSink<'_>,
    ) -> Result<u64, PoolError> {
        self.ensure_reachable()?;
        let _guard = self.locks.acquire(&self.root, &self.mount_root, volume).await?;
        let history = self.load_history(volume)?;
        check_range(volume, &history, from, to)?;

        let header = StreamHeader {
            volume: volume.clone(),
            base: from.cloned(),
        };
        let sink_error = |err: io::Error| PoolError::sink(&err);
        let mut writer = StreamWriter::begin(sink, &header)
            .await
            .map_err(sink_error)?;

        let first = from.map_or(1, |id| id.sequence + 1);
        let mut previous = match from {
            Some(id) => self.load_manifest(volume, id.sequence)?,
            None => Manifest::default(),
        };
        for sequence in first..=to.sequence {
            let snapshot = history
                .at(sequence)
                .cloned()
                .ok_or_else(|| range_error(volume, format!("snapshot #{sequence} is missing")))?;
            let current = self.load_manifest(volume, sequence)?;
            let delta = previous.diff(&current);
            let frame = FrameHeader {
                snapshot,
                removed: delta.removed,
                files: delta
                    .changed
                    .iter()
                    .map(|(path, record)| FileEntry {
                        path: path.clone(),
                        size: record.size,
                        digest: record.digest.clone(),
                    })
                    .collect(),
            };
            writer.frame(&frame).await.map_err(sink_error)?;

            let data_path = snapshot_path(volume, sequence).join(DATA_DIR);
            let data = self.open_dir(&data_path)?;
            for (path, record) in &delta.changed {
                let file_path = self.mount_root.join(&data_path).join(path);
                let file = data
                    .open(path)
                    .map_err(|err| PoolError::io(&file_path, &err))?;
                let mut file = tokio::fs::File::from_std(file.into_std());
                writer
                    .content(&mut file, record.size)
                    .await
                    .map_err(|failure| match failure {
                        CopyError::Source(err) => PoolError::io(&file_path, &err),
                        CopyError::Sink(err) => PoolError::sink(&err),
                    })?;
            }
            previous = current;
        }

        let written = writer.finish().await.map_err(sink_error)?;
        debug!(pool = %self.name, %volume, from = ?from.map(ToString::to_string), to = %to, bytes = written, "stream serialised");
        Ok(written)
    }

    async fn write_history(
        &self,
        volume: &VolumeName,
        sink: StreamSink<'_>,
    ) -> Result<u64, PoolError> {
        let latest = self.load_history(volume)?.latest().cloned();
        match latest {
            Some(to) => self.write_incremental(volume, None, &to, sink).await,
            None => super::stream::write_empty(sink, volume, None)
                .await
                .map_err(|err| PoolError::sink(&err)),
        }
    }

    async fn apply_stream(
        &self,
        volume: &VolumeName,
        source: StreamSource<'_>,
    ) -> Result<Filesystem, PoolError> {
        self.ensure_reachable()?;
        let _guard = self.locks.acquire(&self.root, &self.mount_root, volume).await?;
        let decode = |err: DecodeError| PoolError::corrupt(volume, err.to_string());

        let (mut reader, header) = StreamReader::begin(source).await.map_err(decode)?;
        if &header.volume != volume {
            return Err(PoolError::corrupt(
                volume,
                format!("stream carries volume {}", header.volume),
            ));
        }
        let existing = if self.exists(volume)? {
            Some(self.load_history(volume)?)
        } else {
            None
        };
        let local_latest = existing.as_ref().and_then(History::latest);
        match (&header.base, local_latest) {
            (Some(base), Some(latest)) if base == latest => {}
            (Some(base), latest) => {
                return Err(PoolError::corrupt(
                    volume,
                    format!(
                        "declared base {base} does not match local latest {}",
                        latest.map_or_else(|| String::from("(none)"), ToString::to_string)
                    ),
                ));
            }
            (None, Some(latest)) => {
                return Err(PoolError::corrupt(
                    volume,
                    format!("full stream conflicts with existing history ending at {latest}"),
                ));
            }
            (None, None) => {}
        }

        let staging = self.staging()?;
        let mut tip = header.base.clone();
        let mut manifest = match &tip {
            Some(id) => self.load_manifest(volume, id.sequence)?,
            None => Manifest::default(),
        };
        let mut staged = Vec::new();

        loop {
            let frame = match reader.next().await.map_err(decode)? {
                Record::End => break,
                Record::Snapshot(frame) => frame,
            };
            let expected = tip.as_ref().map_or(1, |id| id.sequence + 1);
            if frame.snapshot.sequence != expected {
                return Err(PoolError::corrupt(
                    volume,
                    format!(
                        "expected snapshot #{expected}, stream carries {}",
                        frame.snapshot
                    ),
                ));
            }

            let previous_path = match (staged.last(), &tip) {
                (Some(id), _) => Some(staged_path(&staging, id).join(DATA_DIR)),
                (None, Some(id)) => Some(snapshot_path(volume, id.sequence).join(DATA_DIR)),
                (None, None) => None,
            };
            let previous_data = match previous_path {
                Some(path) => Some(self.open_dir(&path)?),
                None => None,
            };
            let frame_path = staged_path(&staging, &frame.snapshot);
            let data_path = frame_path.join(DATA_DIR);
            self.root
                .create_dir_all(&data_path)
                .map_err(|err| PoolError::io(self.mount_root.join(&data_path), &err))?;
            let data = self.open_dir(&data_path)?;

            manifest = self
                .apply_frame(volume, &mut reader, &frame, manifest, previous_data.as_ref(), &data)
                .await?;
            let digest = manifest.chain_digest(tip.as_ref());
            if digest != frame.snapshot.digest {
                return Err(PoolError::corrupt(
                    volume,
                    format!("snapshot {} failed digest verification", frame.snapshot),
                ));
            }
            write_json_atomic(
                &self.root,
                &self.mount_root,
                &frame_path.join(MANIFEST_FILE),
                &manifest,
            )?;
            staged.push(frame.snapshot.clone());
            tip = Some(frame.snapshot);
        }

        self.commit_received(volume, &staging, existing, &staged)?;
        staging.discard();
        info!(
            pool = %self.name,
            %volume,
            snapshots = staged.len(),
            latest = ?tip.map(|id| id.to_string()),
            "stream applied"
        );
        Ok(self.filesystem(volume))
    }

    async fn apply_frame(
        &self,
        volume: &VolumeName,
        reader: &mut StreamReader<'_>,
        frame: &FrameHeader,
        mut manifest: Manifest,
        previous_data: Option<&Dir>,
        data: &Dir,
    ) -> Result<Manifest, PoolError> {
        for path in &frame.removed {
            if manifest.remove(path).is_none() {
                return Err(PoolError::corrupt(
                    volume,
                    format!("stream removes unknown file {path:?}"),
                ));
            }
        }
        let changed: HashSet<&str> = frame.files.iter().map(|entry| entry.path.as_str()).collect();

        if let Some(previous) = previous_data {
            for (path, _) in manifest.iter() {
                if changed.contains(&path.as_str()) {
                    continue;
                }
                create_parent(data, path).map_err(|err| PoolError::io(path.as_str(), &err))?;
                previous
                    .hard_link(path, data, path)
                    .map_err(|err| PoolError::io(path.as_str(), &err))?;
            }
        }

        for entry in &frame.files {
            if !is_safe_relative_path(&entry.path) {
                return Err(PoolError::corrupt(
                    volume,
                    format!("unsafe path {:?} in stream", entry.path),
                ));
            }
            create_parent(data, &entry.path)
                .map_err(|err| PoolError::io(entry.path.as_str(), &err))?;
            let file = data
                .create(&entry.path)
                .map_err(|err| PoolError::io(entry.path.as_str(), &err))?;
            let mut file = tokio::fs::File::from_std(file.into_std());
            let record = receive_content(volume, reader, entry, &mut file).await?;
            if record.digest != entry.digest {
                return Err(PoolError::corrupt(
                    volume,
                    format!("content of {:?} failed digest verification", entry.path),
                ));
            }
            manifest.insert(entry.path.clone(), record);
        }
        Ok(manifest)
    }

    /// Makes staged snapshots visible. The history file is written last, so
    /// a failure before that point leaves the previous history in force.
    fn commit_received(
        &self,
        volume: &VolumeName,
        staging: &Staging,
        existing: Option<History>,
        staged: &[SnapshotId],
    ) -> Result<(), PoolError> {
        let mut history = match existing {
            Some(history) => history,
            None => {
                self.prepare_directories(volume)?;
                History::default()
            }
        };
        let Some(latest) = staged.last() else {
            return self.store_history(volume, &history);
        };

        let mount_stage = staging.path.join("mount");
        self.copy_tree(&staged_path(staging, latest).join(DATA_DIR), &mount_stage)?;
        for id in staged {
            self.install(&staged_path(staging, id), &snapshot_path(volume, id.sequence))?;
        }

        let mount = Utf8PathBuf::from(volume.as_str());
        let mount_error = |err: io::Error| PoolError::io(self.mount_root.join(volume.as_str()), &err);
        if self.root.try_exists(&mount).map_err(mount_error)? {
            self.root
                .rename(&mount, &self.root, staging.path.join("retired"))
                .map_err(mount_error)?;
        }
        self.root
            .rename(&mount_stage, &self.root, &mount)
            .map_err(mount_error)?;

        history.snapshots.extend(staged.iter().cloned());
        self.store_history(volume, &history)
    }

    /// Copies the files of a snapshot data directory into a fresh directory.
    fn copy_tree(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), PoolError> {
        let source = self.open_dir(from)?;
        self.root
            .create_dir_all(to)
            .map_err(|err| PoolError::io(self.mount_root.join(to), &err))?;
        let target = self.open_dir(to)?;
        let files = manifest::scan(&source).map_err(|err| PoolError::io(self.mount_root.join(from), &err))?;
        for path in files {
            create_parent(&target, &path).map_err(|err| PoolError::io(self.mount_root.join(to).join(&path), &err))?;
            source
                .copy(&path, &target, &path)
                .map_err(|err| PoolError::io(self.mount_root.join(to).join(&path), &err))?;
        }
        Ok(())
    }
}

impl StoragePool for DirectoryPool {
    fn name(&self) -> &PoolName {
        &self.name
    }

    fn mount_root(&self) -> &Utf8Path {
        &self.mount_root
    }

    fn create<'a>(&'a self, volume: &'a VolumeName) -> PoolFuture<'a, Filesystem> {
        Box::pin(self.create_filesystem(volume))
    }

    fn get<'a>(&'a self, volume: &'a VolumeName) -> PoolFuture<'a, Filesystem> {
        Box::pin(self.get_filesystem(volume))
    }

    fn enumerate(&self) -> PoolFuture<'_, Vec<Filesystem>> {
        Box::pin(async move { self.list_filesystems() })
    }

    fn snapshot<'a>(&'a self, volume: &'a VolumeName) -> PoolFuture<'a, SnapshotId> {
        Box::pin(self.take_snapshot(volume))
    }

    fn snapshots<'a>(&'a self, volume: &'a VolumeName) -> PoolFuture<'a, Vec<SnapshotId>> {
        Box::pin(async move {
            self.ensure_reachable()?;
            Ok(self.load_history(volume)?.snapshots)
        })
    }

    fn serialize_incremental<'a>(
        &'a self,
        volume: &'a VolumeName,
        from: Option<&'a SnapshotId>,
        to: &'a SnapshotId,
        sink: StreamSink<'a>,
    ) -> PoolFuture<'a, u64> {
        Box::pin(self.write_incremental(volume, from, to, sink))
    }

    fn serialize_full_history<'a>(
        &'a self,
        volume: &'a VolumeName,
        sink: StreamSink<'a>,
    ) -> PoolFuture<'a, u64> {
        Box::pin(self.write_history(volume, sink))
    }

    fn receive_incremental<'a>(
        &'a self,
        volume: &'a VolumeName,
        source: StreamSource<'a>,
    ) -> PoolFuture<'a, Filesystem> {
        Box::pin(self.apply_stream(volume, source))
    }
}

/// Blocking part of a snapshot: copies the mounted files into staging and
/// records their digests.
struct Capture {
    root: Arc<Dir>,
    mount_root: Utf8PathBuf,
    volume: VolumeName,
    staging: Utf8PathBuf,
    previous: Option<(SnapshotId, Manifest)>,
}

impl Capture {
    fn run(self) -> Result<Manifest, PoolError> {
        let mount_path = self.mount_root.join(self.volume.as_str());
        let mount = self
            .root
            .open_dir(self.volume.as_str())
            .map_err(|err| PoolError::io(&mount_path, &err))?;
        let data_path = self.staging.join(DATA_DIR);
        self.root
            .create_dir_all(&data_path)
            .map_err(|err| PoolError::io(self.mount_root.join(&data_path), &err))?;
        let data = self
            .root
            .open_dir(&data_path)
            .map_err(|err| PoolError::io(self.mount_root.join(&data_path), &err))?;
        let previous_data = match &self.previous {
            Some((id, _)) => {
                let path = snapshot_path(&self.volume, id.sequence).join(DATA_DIR);
                Some(
                    self.root
                        .open_dir(&path)
                        .map_err(|err| PoolError::io(self.mount_root.join(&path), &err))?,
                )
            }
            None => None,
        };

        let files = manifest::scan(&mount).map_err(|err| PoolError::io(&mount_path, &err))?;
        let mut captured = Manifest::default();
        for path in files {
            let file_path = mount_path.join(&path);
            create_parent(&data, &path).map_err(|err| PoolError::io(&file_path, &err))?;
            mount
                .copy(&path, &data, &path)
                .map_err(|err| PoolError::io(&file_path, &err))?;
            let record =
                manifest::digest_file(&data, &path).map_err(|err| PoolError::io(&file_path, &err))?;
            if let (Some(previous), Some((_, previous_manifest))) =
                (&previous_data, &self.previous)
            {
                if previous_manifest.get(&path) == Some(&record) {
                    data.remove_file(&path)
                        .map_err(|err| PoolError::io(&file_path, &err))?;
                    previous
                        .hard_link(&path, &data, &path)
                        .map_err(|err| PoolError::io(&file_path, &err))?;
                }
            }
            captured.insert(path, record);
        }
        Ok(captured)
    }
}

/// Scratch directory removed on drop unless discarded explicitly.
struct Staging {
    root: Arc<Dir>,
    path: Utf8PathBuf,
    cleaned: bool,
}

impl Staging {
    fn discard(mut self) {
        self.remove();
        self.cleaned = true;
    }

    fn remove(&self) {
        if let Err(err) = self.root.remove_dir_all(&self.path) {
            debug!(path = %self.path, error = %err, "staging cleanup failed");
        }
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.cleaned {
            self.remove();
        }
    }
}

async fn receive_content(
    volume: &VolumeName,
    reader: &mut StreamReader<'_>,
    entry: &FileEntry,
    file: &mut tokio::fs::File,
) -> Result<FileRecord, PoolError> {
    let mut content = reader.content(entry.size);
    let mut hasher = ContentHasher::default();
    let mut buffer = vec![0_u8; RECEIVE_CHUNK];
    loop {
        let read = content
            .read(&mut buffer)
            .await
            .map_err(|err| PoolError::corrupt(volume, err.to_string()))?;
        if read == 0 {
            break;
        }
        let chunk = buffer.get(..read).unwrap_or_default();
        hasher.update(chunk);
        file.write_all(chunk)
            .await
            .map_err(|err| PoolError::io(entry.path.as_str(), &err))?;
    }
    file.flush()
        .await
        .map_err(|err| PoolError::io(entry.path.as_str(), &err))?;
    let record = hasher.finish();
    if record.size != entry.size {
        return Err(PoolError::corrupt(
            volume,
            format!(
                "stream ended inside {:?}: expected {} bytes, got {}",
                entry.path, entry.size, record.size
            ),
        ));
    }
    Ok(record)
}

fn check_range(
    volume: &VolumeName,
    history: &History,
    from: Option<&SnapshotId>,
    to: &SnapshotId,
) -> Result<(), PoolError> {
    if !history.contains(to) {
        return Err(range_error(volume, format!("snapshot {to} is not in the history")));
    }
    if let Some(base) = from {
        if !history.contains(base) {
            return Err(range_error(volume, format!("base {base} is not in the history")));
        }
        if base.sequence > to.sequence {
            return Err(range_error(
                volume,
                format!("base {base} is newer than target {to}"),
            ));
        }
    }
    Ok(())
}

fn range_error(volume: &VolumeName, message: String) -> PoolError {
    PoolError::InvalidRange {
        volume: volume.to_string(),
        message,
    }
}

fn volume_state_path(volume: &VolumeName) -> Utf8PathBuf {
    Utf8PathBuf::from(VOLUMES_DIR).join(volume.as_str())
}

fn history_path(volume: &VolumeName) -> Utf8PathBuf {
    volume_state_path(volume).join(HISTORY_FILE)
}

fn snapshot_path(volume: &VolumeName, sequence: u64) -> Utf8PathBuf {
    volume_state_path(volume)
        .join("snapshots")
        .join(sequence_name(sequence))
}

fn staged_path(staging: &Staging, id: &SnapshotId) -> Utf8PathBuf {
    staging.path.join(sequence_name(id.sequence))
}

fn sequence_name(sequence: u64) -> String {
    format!("{sequence:020}")
}

fn create_parent(dir: &Dir, path: &str) -> io::Result<()> {
    match parent_of(path) {
        Some(parent) => dir.create_dir_all(parent),
        None => Ok(()),
    }
}

fn read_marker(root: &Dir, mount_root: &Utf8Path) -> Result<PoolMarker, PoolError> {
    let path = mount_root.join(MARKER_FILE);
    let contents = root
        .read_to_string(MARKER_FILE)
        .map_err(|err| PoolError::io(&path, &err))?;
    ortho_config::toml::from_str(&contents).map_err(|err| PoolError::Io {
        path,
        message: err.to_string(),
    })
}

fn read_json<T: serde::de::DeserializeOwned>(
    root: &Dir,
    mount_root: &Utf8Path,
    path: &Utf8Path,
) -> Result<T, PoolError> {
    let full = mount_root.join(path);
    let contents = root
        .read_to_string(path)
        .map_err(|err| PoolError::io(&full, &err))?;
    serde_json::from_str(&contents).map_err(|err| PoolError::Io {
        path: full,
        message: err.to_string(),
    })
}

fn write_json_atomic<T: Serialize>(
    root: &Dir,
    mount_root: &Utf8Path,
    path: &Utf8Path,
    value: &T,
) -> Result<(), PoolError> {
    let full = mount_root.join(path);
    let rendered = serde_json::to_vec_pretty(value).map_err(|err| PoolError::Io {
        path: full.clone(),
        message: err.to_string(),
    })?;
    let temporary = Utf8PathBuf::from(format!("{path}.{}.tmp", Uuid::new_v4()));
    root.write(&temporary, rendered)
        .map_err(|err| PoolError::io(&full, &err))?;
    root.rename(&temporary, root, path)
        .map_err(|err| PoolError::io(&full, &err))
}

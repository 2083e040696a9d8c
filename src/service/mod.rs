//! Volume service: the addressable face of one storage pool.
//!
//! A [`VolumeService`] owns a pool and a durable name to filesystem
//! registry. It is constructed with explicit dependencies and must be
//! started before use. Registry changes are merged into the file on disk
//! under its lock as they happen, so other processes sharing the config
//! location see them and never lose theirs.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::pool::{Filesystem, PoolError, SnapshotId, StoragePool, StreamSource, VolumeName};
use crate::registry::{PoolDescriptor, Registry, RegistryError};
use crate::remote::{PushError, PushResult, RemoteVolumeManager};
use crate::transport::Node;

/// Registered volume and the filesystem backing it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    /// Volume name.
    pub name: VolumeName,
    /// Backing filesystem.
    pub filesystem: Filesystem,
}

/// Errors raised by [`VolumeService`] operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ServiceError {
    /// The service has not been started, or has been stopped.
    #[error("volume service is not running")]
    NotRunning,
    /// The volume is not in the registry.
    #[error("volume {volume} is not registered")]
    UnknownVolume {
        /// Requested volume.
        volume: String,
    },
    /// The pool failed.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// The registry could not be read or written.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A push failed.
    #[error(transparent)]
    Push(#[from] PushError),
}

impl ServiceError {
    /// Stable machine-readable label, matching [`PoolError::kind`] for pool
    /// failures.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotRunning => "not_running",
            Self::UnknownVolume { .. } => "unknown_volume",
            Self::Pool(err) => err.kind(),
            Self::Registry(_) => "registry_failure",
            Self::Push(_) => "push_failed",
        }
    }
}

#[derive(Debug)]
enum State {
    Stopped,
    Running(Registry),
}

/// Façade over a storage pool and its volume registry.
#[derive(Debug)]
pub struct VolumeService<P: StoragePool> {
    config_path: Utf8PathBuf,
    pool: Arc<P>,
    state: Mutex<State>,
}

impl<P: StoragePool> VolumeService<P> {
    /// Creates a stopped service keeping its registry at `config_path`.
    pub fn new(config_path: impl Into<Utf8PathBuf>, pool: Arc<P>) -> Self {
        Self {
            config_path: config_path.into(),
            pool,
            state: Mutex::new(State::Stopped),
        }
    }

    /// Registry location.
    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }

    /// Pool backing the service.
    pub const fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    /// Returns `true` between [`Self::start_service`] and
    /// [`Self::stop_service`].
    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, State::Running(_))
    }

    /// Checks the pool is reachable and records it in the registry, which is
    /// only rewritten when the recorded pool differs. Starting a running
    /// service does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Registry`] when the registry cannot be loaded
    /// or saved and [`ServiceError::Pool`] when the pool is unreachable.
    pub async fn start_service(&self) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        if matches!(*state, State::Running(_)) {
            debug!(config = %self.config_path, "service already running");
            return Ok(());
        }
        self.pool.enumerate().await?;
        let descriptor = PoolDescriptor {
            name: self.pool.name().clone(),
            mount_root: self.pool.mount_root().to_path_buf(),
        };
        let registry = Registry::update(&self.config_path, |registry| {
            registry.pool = Some(descriptor);
        })?;
        info!(
            pool = %self.pool.name(),
            config = %self.config_path,
            volumes = registry.volumes.len(),
            "volume service started"
        );
        *state = State::Running(registry);
        Ok(())
    }

    /// Stops the service. Every change was already merged into the registry
    /// file, so nothing is written here. Stopping a stopped service does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Never fails at present.
    pub async fn stop_service(&self) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        if matches!(*state, State::Running(_)) {
            *state = State::Stopped;
            info!(config = %self.config_path, "volume service stopped");
        }
        Ok(())
    }

    /// Creates a filesystem in the pool and registers it.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotRunning`] when stopped,
    /// [`PoolError::AlreadyExists`] (wrapped) when the name is taken, or a
    /// registry failure.
    pub async fn create_volume(&self, name: &VolumeName) -> Result<Volume, ServiceError> {
        let mut state = self.state.lock().await;
        let registry = running(&mut state)?;
        let filesystem = self.pool.create(name).await?;
        *registry = self.register(name, &filesystem)?;
        debug!(volume = %name, mount = %filesystem.mount_path, "volume created");
        Ok(Volume {
            name: name.clone(),
            filesystem,
        })
    }

    /// Looks up a registered volume.
    ///
    /// A miss reloads the registry from disk first, since another process
    /// sharing the config location may have registered the volume.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotRunning`] when stopped and
    /// [`ServiceError::UnknownVolume`] when the name is not registered.
    pub async fn volume(&self, name: &VolumeName) -> Result<Volume, ServiceError> {
        {
            let mut state = self.state.lock().await;
            let registry = running(&mut state)?;
            if registry.get(name).is_none() {
                *registry = Registry::load(&self.config_path)?;
            }
            if registry.get(name).is_none() {
                return Err(ServiceError::UnknownVolume {
                    volume: name.to_string(),
                });
            }
        }
        let filesystem = self.pool.get(name).await?;
        Ok(Volume {
            name: name.clone(),
            filesystem,
        })
    }

    /// Lists registered volumes by name, reloading the registry so volumes
    /// registered by other processes are included.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotRunning`] when stopped, a registry failure,
    /// or the pool error raised while resolving a filesystem.
    pub async fn enumerate_volumes(&self) -> Result<Vec<Volume>, ServiceError> {
        let names: Vec<VolumeName> = {
            let mut state = self.state.lock().await;
            let registry = running(&mut state)?;
            *registry = Registry::load(&self.config_path)?;
            registry.volumes.keys().cloned().collect()
        };
        let mut volumes = Vec::with_capacity(names.len());
        for name in names {
            let filesystem = self.pool.get(&name).await?;
            volumes.push(Volume { name, filesystem });
        }
        Ok(volumes)
    }

    /// Captures a snapshot of a registered volume.
    ///
    /// # Errors
    ///
    /// Returns the lookup errors of [`Self::volume`] or the pool failure.
    pub async fn snapshot_volume(&self, name: &VolumeName) -> Result<SnapshotId, ServiceError> {
        self.volume(name).await?;
        let id = self.pool.snapshot(name).await?;
        debug!(volume = %name, snapshot = %id, "volume snapshotted");
        Ok(id)
    }

    /// Snapshot history of `name` in the pool, or `None` when the pool has
    /// no such filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotRunning`] when stopped or the pool failure.
    pub async fn history(&self, name: &VolumeName) -> Result<Option<Vec<SnapshotId>>, ServiceError> {
        self.ensure_running().await?;
        match self.pool.snapshots(name).await {
            Ok(history) => Ok(Some(history)),
            Err(PoolError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Pushes a registered volume to the peer behind `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotRunning`] when stopped,
    /// [`ServiceError::UnknownVolume`] when the name is not registered, and
    /// [`ServiceError::Push`] when the push fails.
    pub async fn push<N: Node>(
        &self,
        name: &VolumeName,
        remote: &RemoteVolumeManager<N>,
    ) -> Result<PushResult, ServiceError> {
        self.volume(name).await?;
        Ok(remote.push(self.pool.as_ref(), name).await?)
    }

    /// Applies an incoming stream and registers the volume.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotRunning`] when stopped, the pool error
    /// raised while applying, or a registry failure.
    pub async fn receive(
        &self,
        name: &VolumeName,
        source: StreamSource<'_>,
    ) -> Result<Volume, ServiceError> {
        self.ensure_running().await?;
        let filesystem = self.pool.receive_incremental(name, source).await?;
        let mut state = self.state.lock().await;
        let registry = running(&mut state)?;
        *registry = self.register(name, &filesystem)?;
        Ok(Volume {
            name: name.clone(),
            filesystem,
        })
    }

    fn register(&self, name: &VolumeName, filesystem: &Filesystem) -> Result<Registry, ServiceError> {
        let registry = Registry::update(&self.config_path, |registry| {
            registry.register(name.clone(), filesystem.mount_path.clone());
        })?;
        Ok(registry)
    }

    async fn ensure_running(&self) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        running(&mut state).map(|_| ())
    }
}

fn running(state: &mut State) -> Result<&mut Registry, ServiceError> {
    match state {
        State::Running(registry) => Ok(registry),
        State::Stopped => Err(ServiceError::NotRunning),
    }
}

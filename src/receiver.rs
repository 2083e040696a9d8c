//! Receiving side of the push protocol.
//!
//! These are the operations behind the `ferry-volume` command a pushing
//! peer runs through its transport. Each invocation binds a
//! [`VolumeService`] to the pool named on the command line, or to the pool
//! recorded in the registry, performs one request, and reports the outcome
//! as a single [`ReceiverStatus`].

use std::ffi::OsString;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cli::{Cli, Command};
use crate::pool::{DirectoryPool, PoolError, PoolName, StoragePool, StreamSource, VolumeName};
use crate::registry::{Registry, RegistryError, default_registry_path};
use crate::remote::ReceiverStatus;
use crate::service::{ServiceError, VolumeService};

/// One receiver request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request {
    /// Create the pool and record it in the registry.
    Init,
    /// Report the snapshot history of a volume.
    Snapshots(VolumeName),
    /// Apply a stream read from the input.
    Receive(VolumeName),
    /// Create an empty volume.
    Create(VolumeName),
    /// Snapshot a volume.
    Snapshot(VolumeName),
    /// List registered volumes.
    List,
}

/// Parsed receiver command line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Invocation {
    /// Pool name given with `--pool`.
    pub pool: Option<PoolName>,
    /// Pool directory given with `--mountpoint`.
    pub mountpoint: Option<Utf8PathBuf>,
    /// Registry location.
    pub config: Utf8PathBuf,
    /// Requested operation.
    pub request: Request,
}

/// Errors raised while serving a request.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReceiverError {
    /// The command line could not be parsed.
    #[error("invalid arguments: {0}")]
    Usage(String),
    /// No pool was named and the registry records none.
    #[error("no pool recorded in {path}; pass --pool and --mountpoint or run init")]
    NotConfigured {
        /// Registry that was consulted.
        path: Utf8PathBuf,
    },
    /// The pool failed.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// The volume service failed.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// The registry could not be read.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ReceiverError {
    /// Stable label reported in the error status.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Usage(_) => "usage",
            Self::NotConfigured { .. } => "not_configured",
            Self::Pool(err) => err.kind(),
            Self::Service(err) => err.kind(),
            Self::Registry(_) => "registry_failure",
        }
    }
}

impl Invocation {
    /// Parses a full command line, program name first.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Usage`] for malformed arguments and
    /// [`ReceiverError::Pool`] for invalid pool or volume names.
    pub fn parse_from<I, T>(args: I) -> Result<Self, ReceiverError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).map_err(|err| ReceiverError::Usage(err.to_string()))?;
        Self::from_cli(cli)
    }

    /// Validates parsed arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Pool`] for invalid names and
    /// [`ReceiverError::Registry`] when no registry location can be found.
    pub fn from_cli(cli: Cli) -> Result<Self, ReceiverError> {
        let pool = cli.pool.map(PoolName::new).transpose()?;
        let config = match cli.config {
            Some(path) => Utf8PathBuf::from(path),
            None => default_registry_path()?,
        };
        let request = match cli.command {
            Command::Init => Request::Init,
            Command::Snapshots { volume } => Request::Snapshots(VolumeName::new(volume)?),
            Command::Receive { volume } => Request::Receive(VolumeName::new(volume)?),
            Command::Create { volume } => Request::Create(VolumeName::new(volume)?),
            Command::Snapshot { volume } => Request::Snapshot(VolumeName::new(volume)?),
            Command::List => Request::List,
        };
        Ok(Self {
            pool,
            mountpoint: cli.mountpoint.map(Utf8PathBuf::from),
            config,
            request,
        })
    }
}

/// Serves one request, reading stream data from `input` when receiving.
pub async fn execute(invocation: &Invocation, input: StreamSource<'_>) -> ReceiverStatus {
    match serve(invocation, input).await {
        Ok(status) => status,
        Err(err) => {
            warn!(request = ?invocation.request, error = %err, "request failed");
            ReceiverStatus::error(err.kind(), err.to_string())
        }
    }
}

async fn serve(
    invocation: &Invocation,
    input: StreamSource<'_>,
) -> Result<ReceiverStatus, ReceiverError> {
    if invocation.request == Request::Init {
        return init(invocation).await;
    }
    let pool = Arc::new(open_pool(invocation)?);
    let service = VolumeService::new(invocation.config.clone(), pool);
    service.start_service().await?;
    let outcome = dispatch(&service, &invocation.request, input).await;
    let stopped = service.stop_service().await;
    let status = outcome?;
    stopped?;
    Ok(status)
}

async fn init(invocation: &Invocation) -> Result<ReceiverStatus, ReceiverError> {
    let mountpoint = invocation
        .mountpoint
        .as_ref()
        .ok_or_else(|| ReceiverError::Usage(String::from("init requires --mountpoint")))?;
    let name = invocation.pool.clone().unwrap_or_else(PoolName::generate);
    let pool = Arc::new(DirectoryPool::create(name, mountpoint)?);
    let service = VolumeService::new(invocation.config.clone(), Arc::clone(&pool));
    service.start_service().await?;
    service.stop_service().await?;
    Ok(ReceiverStatus::Ok {
        pool: Some(pool.name().clone()),
        volume: None,
        latest: None,
        snapshots: Vec::new(),
        volumes: Vec::new(),
    })
}

fn open_pool(invocation: &Invocation) -> Result<DirectoryPool, ReceiverError> {
    if let Some(mountpoint) = &invocation.mountpoint {
        return Ok(DirectoryPool::open(invocation.pool.as_ref(), mountpoint)?);
    }
    let registry = Registry::load(&invocation.config)?;
    let descriptor = registry.pool.ok_or_else(|| ReceiverError::NotConfigured {
        path: invocation.config.clone(),
    })?;
    debug!(pool = %descriptor.name, root = %descriptor.mount_root, "using registered pool");
    Ok(DirectoryPool::open(
        Some(&descriptor.name),
        &descriptor.mount_root,
    )?)
}

async fn dispatch(
    service: &VolumeService<DirectoryPool>,
    request: &Request,
    input: StreamSource<'_>,
) -> Result<ReceiverStatus, ReceiverError> {
    let status = match request {
        Request::Init => {
            return Err(ReceiverError::Usage(String::from(
                "init cannot run against an open pool",
            )));
        }
        Request::Snapshots(volume) => {
            let history = service.history(volume).await?.unwrap_or_default();
            ReceiverStatus::Ok {
                pool: None,
                volume: Some(volume.clone()),
                latest: history.last().cloned(),
                snapshots: history,
                volumes: Vec::new(),
            }
        }
        Request::Receive(volume) => {
            service.receive(volume, input).await?;
            let latest = service.pool().latest_snapshot(volume).await?;
            ReceiverStatus::volume(volume.clone(), latest)
        }
        Request::Create(volume) => {
            service.create_volume(volume).await?;
            ReceiverStatus::volume(volume.clone(), None)
        }
        Request::Snapshot(volume) => {
            let id = service.snapshot_volume(volume).await?;
            ReceiverStatus::volume(volume.clone(), Some(id))
        }
        Request::List => ReceiverStatus::Ok {
            pool: Some(service.pool().name().clone()),
            volume: None,
            latest: None,
            snapshots: Vec::new(),
            volumes: service
                .enumerate_volumes()
                .await?
                .into_iter()
                .map(|volume| volume.name)
                .collect(),
        },
    };
    Ok(status)
}

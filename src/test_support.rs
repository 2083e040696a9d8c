//! Test support utilities shared across unit and integration tests.
//!
//! The nodes here stand in for a real peer: [`LoopbackNode`] serves the
//! receiver protocol in-process, [`MutatingProcessNode`] rewrites the
//! command another node runs, and [`ScriptedNode`] replays canned receiver
//! output.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::Cursor;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, duplex};
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::{ConfigError, TransferConfig};
use crate::pool::{DirectoryPool, Filesystem, PoolError, PoolName, StoragePool};
use crate::receiver::{self, Invocation};
use crate::remote::{ReceiverStatus, RemoteVolumeManager};
use crate::service::{ServiceError, VolumeService};
use crate::transport::{ExitReport, Node, ProcessChannel, TransportError};

/// Registry file name used by the fixtures.
pub const REGISTRY_FILE: &str = "volumes.toml";

/// Pool directory name used by the fixtures.
pub const POOL_DIR: &str = "pool";

/// Errors raised while building a fixture.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The pool could not be created.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// The service failed to start.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// The transfer settings were rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A fixture file could not be written.
    #[error("failed to prepare {path}: {message}")]
    Io {
        /// Path being prepared.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

/// Creates a pool and a started service keeping its registry under `root`.
///
/// # Errors
///
/// Returns [`SetupError`] when the pool cannot be created or the service
/// fails to start.
pub async fn create_volume_service(
    root: &Utf8Path,
) -> Result<VolumeService<DirectoryPool>, SetupError> {
    let pool = DirectoryPool::create(PoolName::generate(), &root.join(POOL_DIR))?;
    let service = VolumeService::new(root.join(REGISTRY_FILE), Arc::new(pool));
    service.start_service().await?;
    Ok(service)
}

/// Writes `contents` to `relative` inside a mounted filesystem, creating
/// parent directories as needed.
///
/// # Errors
///
/// Returns [`SetupError::Io`] when the file cannot be written.
pub fn write_file(
    filesystem: &Filesystem,
    relative: &str,
    contents: impl AsRef<[u8]>,
) -> Result<(), SetupError> {
    let io_error = |err: std::io::Error| SetupError::Io {
        path: filesystem.mount_path.join(relative),
        message: err.to_string(),
    };
    let dir = Dir::open_ambient_dir(&filesystem.mount_path, ambient_authority())
        .map_err(io_error)?;
    if let Some(parent) = Utf8Path::new(relative).parent().filter(|p| !p.as_str().is_empty()) {
        dir.create_dir_all(parent).map_err(io_error)?;
    }
    dir.write(relative, contents).map_err(io_error)
}

/// Two volume services on one host and a manager pushing from the first to
/// the second.
#[derive(Debug)]
pub struct ServicePair<N: Node> {
    /// Pushing side.
    pub from_service: VolumeService<DirectoryPool>,
    /// Receiving side.
    pub to_service: VolumeService<DirectoryPool>,
    /// Handle on the receiving side.
    pub remote: RemoteVolumeManager<N>,
}

impl<N: Node> ServicePair<N> {
    /// Builds both services under `root/from` and `root/to` and a manager
    /// that reaches the receiving registry through `node`.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] when either service cannot be started or
    /// `config` is invalid.
    pub async fn start(root: &Utf8Path, node: N, config: TransferConfig) -> Result<Self, SetupError> {
        let from_service = create_volume_service(&root.join("from")).await?;
        let to_service = create_volume_service(&root.join("to")).await?;
        let remote = RemoteVolumeManager::new(node, to_service.config_path().to_path_buf(), config)?;
        Ok(Self {
            from_service,
            to_service,
            remote,
        })
    }
}

/// Runs receiver commands in-process over in-memory pipes.
///
/// Commands are parsed exactly as the `ferry-volume` binary parses them, so
/// the push protocol is exercised end to end without spawning processes.
#[derive(Clone, Debug)]
pub struct LoopbackNode {
    capacity: usize,
}

impl LoopbackNode {
    /// Creates a node whose pipes buffer `capacity` bytes.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for LoopbackNode {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl Node for LoopbackNode {
    fn open(&self, command: &[OsString]) -> Result<ProcessChannel, TransportError> {
        let parsed = Invocation::parse_from(command);
        let (sink, mut input) = duplex(self.capacity);
        let (mut output, source) = duplex(self.capacity);
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = match parsed {
                Ok(invocation) => receiver::execute(&invocation, &mut input).await,
                Err(err) => ReceiverStatus::error(err.kind(), err.to_string()),
            };
            drop(input);
            let (code, stderr) = match &status {
                ReceiverStatus::Ok { .. } => (0, String::new()),
                ReceiverStatus::Error { message, .. } => (1, message.clone()),
            };
            let line = status.to_line().unwrap_or_default();
            let written = async {
                output.write_all(line.as_bytes()).await?;
                output.write_all(b"\n").await?;
                output.shutdown().await
            }
            .await;
            if let Err(err) = written {
                debug!(error = %err, "loopback caller stopped reading");
            }
            drop(output);
            if exit_tx.send(ExitReport { code: Some(code), stderr }).is_err() {
                debug!("loopback caller dropped the exit future");
            }
        });
        Ok(ProcessChannel {
            sink: Box::new(sink),
            source: Box::new(source),
            exit: Box::pin(async move {
                exit_rx.await.map_err(|_| TransportError::Io {
                    message: String::from("receiver task ended without an exit status"),
                })
            }),
        })
    }
}

/// Wraps a node and inserts extra arguments after the program name of
/// every command it runs.
#[derive(Clone, Debug)]
pub struct MutatingProcessNode<N: Node> {
    inner: N,
    injected: Vec<OsString>,
}

impl<N: Node> MutatingProcessNode<N> {
    /// Wraps `inner`, injecting `injected` into each command.
    pub fn new<I, S>(inner: N, injected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            inner,
            injected: injected.into_iter().map(Into::into).collect(),
        }
    }

    /// Wraps `inner` so every command addresses `pool` explicitly.
    pub fn for_pool<P: StoragePool>(inner: N, pool: &P) -> Self {
        Self::new(
            inner,
            [
                OsString::from("--pool"),
                OsString::from(pool.name().as_str()),
                OsString::from("--mountpoint"),
                OsString::from(pool.mount_root().as_str()),
            ],
        )
    }

    /// Returns `command` with the injected arguments in place.
    #[must_use]
    pub fn mutate(&self, command: &[OsString]) -> Vec<OsString> {
        let mut mutated = Vec::with_capacity(command.len() + self.injected.len());
        let mut parts = command.iter().cloned();
        mutated.extend(parts.next());
        mutated.extend(self.injected.iter().cloned());
        mutated.extend(parts);
        mutated
    }
}

impl<N: Node> Node for MutatingProcessNode<N> {
    fn open(&self, command: &[OsString]) -> Result<ProcessChannel, TransportError> {
        self.inner.open(&self.mutate(command))
    }
}

/// Node that answers each command with pre-seeded output in FIFO order and
/// records the commands it was given.
#[derive(Clone, Debug, Default)]
pub struct ScriptedNode {
    responses: Arc<Mutex<VecDeque<ScriptedResponse>>>,
    invocations: Arc<Mutex<Vec<Vec<OsString>>>>,
}

#[derive(Clone, Debug)]
struct ScriptedResponse {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl ScriptedNode {
    /// Creates a node with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(ScriptedResponse {
                code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            });
    }

    /// Queues a successful exit printing `status`.
    pub fn push_status(&self, status: &ReceiverStatus) {
        let (code, line) = match status.to_line() {
            Ok(line) => (Some(i32::from(!status.is_ok())), line),
            Err(err) => (Some(1), err.to_string()),
        };
        self.push_output(code, line, "");
    }

    /// Commands run so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<Vec<OsString>> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Node for ScriptedNode {
    fn open(&self, command: &[OsString]) -> Result<ProcessChannel, TransportError> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_vec());
        let response = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| TransportError::Launch {
                program: command
                    .first()
                    .map(|program| program.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                message: String::from("no scripted response available"),
            })?;
        let ScriptedResponse {
            code,
            stdout,
            stderr,
        } = response;
        Ok(ProcessChannel {
            sink: Box::new(tokio::io::sink()),
            source: Box::new(Cursor::new(stdout.into_bytes())),
            exit: Box::pin(async move { Ok(ExitReport { code, stderr }) }),
        })
    }
}

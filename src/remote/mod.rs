//! Push protocol: replicates a volume's snapshot history to a peer.
//!
//! A push negotiates the base snapshot with the peer's receiver command,
//! streams the delta from that base to the local latest snapshot through a
//! [`Node`], and confirms the peer's reported latest snapshot. The peer
//! applies the stream atomically, so a failed or cancelled push leaves it at
//! its previous state and retrying from scratch is always safe.

use std::ffi::OsString;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, TransferConfig};
use crate::pool::{PoolError, SnapshotId, StoragePool, VolumeName};
use crate::transport::{
    CommandOutput, ExitReport, Node, ProcessChannel, TransportError, display_command,
};

mod status;

pub use status::ReceiverStatus;

/// Largest status output read back from the receiver.
const MAX_STATUS_BYTES: u64 = 1024 * 1024;

/// Stages of a single push.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PushState {
    /// Nothing has happened yet.
    Idle,
    /// Asking the peer for its latest snapshot.
    NegotiatingBase,
    /// Writing the delta to the peer.
    Streaming,
    /// Waiting for the peer to report the outcome.
    Confirming,
    /// The peer holds the local latest snapshot.
    Done,
    /// The push failed; it is never retried automatically.
    Failed,
}

impl fmt::Display for PushState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::NegotiatingBase => "negotiating-base",
            Self::Streaming => "streaming",
            Self::Confirming => "confirming",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Outcome of a successful push.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PushResult {
    /// Volume that was pushed.
    pub volume: VolumeName,
    /// Snapshot the peer held before the push.
    pub base: Option<SnapshotId>,
    /// Snapshot the peer holds now; `None` when the volume has no snapshots.
    pub latest: Option<SnapshotId>,
    /// Number of snapshots carried by the stream.
    pub snapshots_sent: u64,
    /// Size of the stream in bytes.
    pub bytes_sent: u64,
}

/// Errors that end a push in [`PushState::Failed`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PushError {
    /// The peer's latest snapshot is not part of the local history.
    #[error(
        "history of {volume} diverged: peer holds {actual}, which is not in the local history (local latest {})",
        describe(.expected.as_ref())
    )]
    DivergentHistory {
        /// Volume being pushed.
        volume: String,
        /// Local latest snapshot.
        expected: Option<SnapshotId>,
        /// Snapshot the peer reported.
        actual: SnapshotId,
    },
    /// The peer rejected the stream or reported an unexpected result.
    #[error("transfer of {volume} failed (exit status {}): {message}", describe_code(.status.as_ref()))]
    TransferFailed {
        /// Volume being pushed.
        volume: String,
        /// Exit code of the receiver command, if any.
        status: Option<i32>,
        /// Peer-supplied description.
        message: String,
    },
    /// The receiver command could not be started.
    #[error("failed to launch {program}: {message}")]
    Launch {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// The channel to the peer failed, or the peer's storage failed.
    #[error("peer I/O failed: {message}")]
    Io {
        /// Description of the failure.
        message: String,
    },
    /// The peer answered with something other than a receiver status.
    #[error("receiver protocol error: {message}")]
    Protocol {
        /// Description of the malformed answer.
        message: String,
    },
    /// Local storage failed.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl From<TransportError> for PushError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Launch { program, message } => Self::Launch { program, message },
            TransportError::Io { message } => Self::Io { message },
        }
    }
}

fn describe(snapshot: Option<&SnapshotId>) -> String {
    snapshot.map_or_else(|| String::from("none"), ToString::to_string)
}

fn describe_code(code: Option<&i32>) -> String {
    code.map_or_else(|| String::from("unknown"), ToString::to_string)
}

/// Handle describing how to reach a peer volume service.
///
/// The manager holds no peer state: it knows the node to run commands on,
/// where the peer keeps its registry, and the transfer settings.
#[derive(Clone, Debug)]
pub struct RemoteVolumeManager<N: Node> {
    node: N,
    config_path: Utf8PathBuf,
    config: TransferConfig,
}

impl<N: Node> RemoteVolumeManager<N> {
    /// Creates a manager for the peer whose registry lives at
    /// `config_path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation.
    pub fn new(
        node: N,
        config_path: impl Into<Utf8PathBuf>,
        config: TransferConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            node,
            config_path: config_path.into(),
            config,
        })
    }

    /// Node commands run on.
    pub const fn node(&self) -> &N {
        &self.node
    }

    /// Registry location on the peer.
    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }

    /// Receiver command line for `subcommand`.
    #[must_use]
    pub fn command(&self, subcommand: &str, volume: Option<&VolumeName>) -> Vec<OsString> {
        let mut command = vec![
            OsString::from(&self.config.program),
            OsString::from("--config"),
            OsString::from(self.config_path.as_str()),
            OsString::from(subcommand),
        ];
        if let Some(name) = volume {
            command.push(OsString::from(name.as_str()));
        }
        command
    }

    /// Asks the peer for its latest snapshot of `volume`.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Launch`] when the receiver cannot be started,
    /// [`PushError::Io`] when the peer reports a storage failure or exits
    /// without a status, and [`PushError::Protocol`] for unreadable output.
    pub async fn remote_latest(
        &self,
        volume: &VolumeName,
    ) -> Result<Option<SnapshotId>, PushError> {
        let command = self.command("snapshots", Some(volume));
        debug!(command = %display_command(&command), "querying peer history");
        let output = self.node.get_output(&command).await?;
        match ReceiverStatus::parse(&output.stdout) {
            Ok(ReceiverStatus::Ok { latest, .. }) if output.is_success() => Ok(latest),
            Ok(ReceiverStatus::Error { kind, message }) => {
                Err(negotiation_failure(volume, &output, &kind, message))
            }
            Ok(ReceiverStatus::Ok { .. }) => Err(PushError::Protocol {
                message: format!(
                    "receiver reported success but exited with status {}",
                    describe_code(output.code.as_ref())
                ),
            }),
            Err(message) if output.is_success() => Err(PushError::Protocol { message }),
            Err(_) => Err(PushError::Io {
                message: format!(
                    "receiver exited with status {}: {}",
                    describe_code(output.code.as_ref()),
                    output.stderr.trim()
                ),
            }),
        }
    }

    /// Replicates `volume` from `pool` to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::DivergentHistory`] when the peer holds a
    /// snapshot the local history lacks, [`PushError::TransferFailed`] when
    /// the peer rejects the stream, and the transport or storage error that
    /// interrupted the push otherwise. The peer is left unchanged on error.
    pub async fn push<P>(&self, pool: &P, volume: &VolumeName) -> Result<PushResult, PushError>
    where
        P: StoragePool + ?Sized,
    {
        let mut tracker = Tracker::new(volume);
        let result = self.drive(pool, volume, &mut tracker).await;
        match &result {
            Ok(outcome) => {
                tracker.advance(PushState::Done);
                info!(
                    %volume,
                    base = %describe(outcome.base.as_ref()),
                    latest = %describe(outcome.latest.as_ref()),
                    snapshots = outcome.snapshots_sent,
                    bytes = outcome.bytes_sent,
                    "push complete"
                );
            }
            Err(err) => {
                let stage = tracker.state;
                tracker.advance(PushState::Failed);
                warn!(%volume, %stage, error = %err, "push failed");
            }
        }
        result
    }

    async fn drive<P>(
        &self,
        pool: &P,
        volume: &VolumeName,
        tracker: &mut Tracker<'_>,
    ) -> Result<PushResult, PushError>
    where
        P: StoragePool + ?Sized,
    {
        tracker.advance(PushState::NegotiatingBase);
        let history = pool.snapshots(volume).await?;
        let local_latest = history.last().cloned();
        let base = match self.remote_latest(volume).await? {
            None => None,
            Some(remote) if history.contains(&remote) => Some(remote),
            Some(remote) => {
                return Err(PushError::DivergentHistory {
                    volume: volume.to_string(),
                    expected: local_latest,
                    actual: remote,
                });
            }
        };
        debug!(%volume, base = %describe(base.as_ref()), latest = %describe(local_latest.as_ref()), "base negotiated");

        tracker.advance(PushState::Streaming);
        let command = self.command("receive", Some(volume));
        debug!(command = %display_command(&command), "opening receiver");
        let ProcessChannel {
            sink,
            mut source,
            exit,
        } = self.node.open(&command)?;
        let mut writer = BufWriter::with_capacity(self.config.stream_buffer_bytes, sink);
        let streamed = match &local_latest {
            Some(latest) => {
                pool.serialize_incremental(volume, base.as_ref(), latest, &mut writer)
                    .await
            }
            None => pool.serialize_full_history(volume, &mut writer).await,
        };
        let (bytes_sent, sink_failure) = match streamed {
            Ok(bytes) => (
                bytes,
                writer.shutdown().await.err().map(|err| PoolError::sink(&err)),
            ),
            Err(err) if err.is_sink_failure() => (0, Some(err)),
            Err(err) => return Err(err.into()),
        };
        drop(writer);

        tracker.advance(PushState::Confirming);
        let mut stdout = Vec::new();
        (&mut source)
            .take(MAX_STATUS_BYTES)
            .read_to_end(&mut stdout)
            .await
            .map_err(|err| TransportError::io(&err))?;
        let report = exit.await?;
        let status = ReceiverStatus::parse(&String::from_utf8_lossy(&stdout));
        confirm(volume, &report, status, local_latest.as_ref(), sink_failure)?;

        Ok(PushResult {
            volume: volume.clone(),
            snapshots_sent: sent_between(base.as_ref(), local_latest.as_ref()),
            base,
            latest: local_latest,
            bytes_sent,
        })
    }
}

fn negotiation_failure(
    volume: &VolumeName,
    output: &CommandOutput,
    kind: &str,
    message: String,
) -> PushError {
    if kind == PoolError::IO_FAILURE {
        PushError::Io { message }
    } else {
        PushError::TransferFailed {
            volume: volume.to_string(),
            status: output.code,
            message: format!("{kind}: {message}"),
        }
    }
}

fn confirm(
    volume: &VolumeName,
    report: &ExitReport,
    status: Result<ReceiverStatus, String>,
    expected: Option<&SnapshotId>,
    sink_failure: Option<PoolError>,
) -> Result<(), PushError> {
    let failed = |message: String| PushError::TransferFailed {
        volume: volume.to_string(),
        status: report.code,
        message,
    };
    match status {
        Ok(ReceiverStatus::Error { kind, message }) => Err(failed(format!("{kind}: {message}"))),
        Ok(ReceiverStatus::Ok { latest, .. }) => {
            if !report.is_success() {
                return Err(failed(format!(
                    "receiver reported success but exited abnormally: {}",
                    report.stderr.trim()
                )));
            }
            if let Some(err) = sink_failure {
                return Err(PushError::Io {
                    message: err.to_string(),
                });
            }
            if latest.as_ref() == expected {
                Ok(())
            } else {
                Err(failed(format!(
                    "peer reports latest {} after transfer, expected {}",
                    describe(latest.as_ref()),
                    describe(expected)
                )))
            }
        }
        Err(message) if report.is_success() => Err(PushError::Protocol { message }),
        Err(_) => Err(failed(if report.stderr.trim().is_empty() {
            sink_failure.map_or_else(
                || String::from("receiver exited without a status"),
                |err| err.to_string(),
            )
        } else {
            report.stderr.trim().to_owned()
        })),
    }
}

fn sent_between(base: Option<&SnapshotId>, latest: Option<&SnapshotId>) -> u64 {
    let from = base.map_or(0, |id| id.sequence);
    latest.map_or(0, |id| id.sequence.saturating_sub(from))
}

/// Tracks and logs the state of one push.
struct Tracker<'a> {
    volume: &'a VolumeName,
    state: PushState,
}

impl<'a> Tracker<'a> {
    const fn new(volume: &'a VolumeName) -> Self {
        Self {
            volume,
            state: PushState::Idle,
        }
    }

    fn advance(&mut self, next: PushState) {
        debug!(volume = %self.volume, from = %self.state, to = %next, "push state");
        self.state = next;
    }
}

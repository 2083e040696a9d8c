//! Byte-stream transport to a peer process.
//!
//! A [`Node`] starts a command, local or remote, and hands back a
//! [`ProcessChannel`]: a sink feeding the command's input, a source yielding
//! its output, and a future resolving to its exit report. Closing the sink
//! signals end of input. Everything above this module talks to peers only
//! through `Node`, so tests can wrap or replace the command that is run.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

mod process;

pub use process::ProcessNode;

/// Future returned by transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Future resolving once the command has exited.
pub type ExitFuture = TransportFuture<'static, ExitReport>;

/// Errors raised while starting or talking to a peer command.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// The command could not be started.
    #[error("failed to launch {program}: {message}")]
    Launch {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Reading from or writing to the command failed.
    #[error("transport I/O failed: {message}")]
    Io {
        /// Description of the failure.
        message: String,
    },
}

impl TransportError {
    pub(crate) fn io(err: &std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Exit status and diagnostics of a finished command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExitReport {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard error.
    pub stderr: String,
}

impl ExitReport {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Result of running a command to completion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Live connection to a started command.
pub struct ProcessChannel {
    /// Bytes written here reach the command's input.
    pub sink: Box<dyn AsyncWrite + Send + Unpin>,
    /// Bytes the command writes to its output.
    pub source: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves once the command terminates.
    pub exit: ExitFuture,
}

impl fmt::Debug for ProcessChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessChannel").finish_non_exhaustive()
    }
}

/// Something that can run a command with a byte stream attached.
pub trait Node: Send + Sync {
    /// Starts `command`, whose first element is the program.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Launch`] when the command cannot be started.
    fn open(&self, command: &[OsString]) -> Result<ProcessChannel, TransportError>;

    /// Runs `command` with empty input and collects its output.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Launch`] when the command cannot be started
    /// and [`TransportError::Io`] when its output cannot be read.
    fn get_output<'a>(&'a self, command: &'a [OsString]) -> TransportFuture<'a, CommandOutput> {
        Box::pin(async move {
            let ProcessChannel {
                mut sink,
                mut source,
                exit,
            } = self.open(command)?;
            if let Err(err) = sink.shutdown().await {
                debug!(error = %err, "closing command input failed");
            }
            drop(sink);
            let mut stdout = Vec::new();
            source
                .read_to_end(&mut stdout)
                .await
                .map_err(|err| TransportError::io(&err))?;
            let report = exit.await?;
            Ok(CommandOutput {
                code: report.code,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: report.stderr,
            })
        })
    }
}

impl<N: Node + ?Sized> Node for &N {
    fn open(&self, command: &[OsString]) -> Result<ProcessChannel, TransportError> {
        (**self).open(command)
    }
}

impl<N: Node + ?Sized> Node for std::sync::Arc<N> {
    fn open(&self, command: &[OsString]) -> Result<ProcessChannel, TransportError> {
        (**self).open(command)
    }
}

/// Renders a command for log output.
pub(crate) fn display_command(command: &[OsString]) -> String {
    command
        .iter()
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

//! Subprocess-backed [`Node`].

use std::ffi::OsString;
use std::process::Stdio;

use shell_escape::unix::escape;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use super::{ExitReport, Node, ProcessChannel, TransportError, display_command};
use crate::config::TransferConfig;

/// Runs commands as child processes, optionally behind a fixed prefix such
/// as an `ssh` invocation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessNode {
    initial_arguments: Vec<OsString>,
    quote_command: bool,
}

impl ProcessNode {
    /// Runs commands directly on this host.
    #[must_use]
    pub fn local() -> Self {
        Self::default()
    }

    /// Prepends `arguments` to every command; the first becomes the program.
    #[must_use]
    pub fn with_initial_arguments<I, A>(arguments: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            initial_arguments: arguments.into_iter().map(Into::into).collect(),
            quote_command: false,
        }
    }

    /// Runs commands on `host` through `ssh`.
    ///
    /// The remote shell receives the command as a single escaped string.
    #[must_use]
    pub fn ssh(config: &TransferConfig, host: &str) -> Self {
        let mut arguments = vec![
            OsString::from(&config.ssh_bin),
            OsString::from("-p"),
            OsString::from(config.ssh_port.to_string()),
        ];
        if config.ssh_batch_mode {
            arguments.push(OsString::from("-o"));
            arguments.push(OsString::from("BatchMode=yes"));
        }
        arguments.push(OsString::from(format!("{}@{host}", config.ssh_user)));
        Self {
            initial_arguments: arguments,
            quote_command: true,
        }
    }

    /// Full argument vector run for `command`.
    #[must_use]
    pub fn argv(&self, command: &[OsString]) -> Vec<OsString> {
        let mut argv = self.initial_arguments.clone();
        if self.quote_command {
            let quoted = command
                .iter()
                .map(|part| escape(part.to_string_lossy()).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            argv.push(OsString::from(quoted));
        } else {
            argv.extend(command.iter().cloned());
        }
        argv
    }
}

impl Node for ProcessNode {
    fn open(&self, command: &[OsString]) -> Result<ProcessChannel, TransportError> {
        let argv = self.argv(command);
        let Some((program, args)) = argv.split_first() else {
            return Err(TransportError::Launch {
                program: String::new(),
                message: String::from("empty command"),
            });
        };
        let program_name = program.to_string_lossy().into_owned();
        debug!(command = %display_command(&argv), "launching");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TransportError::Launch {
                program: program_name.clone(),
                message: err.to_string(),
            })?;

        let missing = |stream: &str| TransportError::Launch {
            program: program_name.clone(),
            message: format!("{stream} was not captured"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let mut stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        // Drained while the caller streams so a chatty child never blocks.
        let stderr_task = tokio::spawn(async move {
            let mut captured = Vec::new();
            if let Err(err) = stderr.read_to_end(&mut captured).await {
                debug!(error = %err, "reading child stderr failed");
            }
            String::from_utf8_lossy(&captured).into_owned()
        });

        let exit = Box::pin(async move {
            let status = child.wait().await.map_err(|err| TransportError::io(&err))?;
            let stderr = stderr_task.await.map_err(|err| TransportError::Io {
                message: err.to_string(),
            })?;
            debug!(program = %program_name, code = ?status.code(), "command exited");
            Ok(ExitReport {
                code: status.code(),
                stderr,
            })
        });

        Ok(ProcessChannel {
            sink: Box::new(stdin),
            source: Box::new(stdout),
            exit,
        })
    }
}

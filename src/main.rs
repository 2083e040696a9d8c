//! Binary entry point for the `ferry-volume` receiver.
//!
//! Every invocation prints exactly one JSON status line on standard output
//! and exits 0 on success or 1 on failure. Diagnostics go to standard
//! error, filtered by `FERRY_LOG`.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ferry::ReceiverStatus;
use ferry::cli::Cli;
use ferry::receiver::{self, Invocation};

const LOG_ENV: &str = "FERRY_LOG";

#[tokio::main]
async fn main() {
    init_logging();
    let status = match Cli::try_parse() {
        Ok(cli) => match Invocation::from_cli(cli) {
            Ok(invocation) => receiver::execute(&invocation, &mut tokio::io::stdin()).await,
            Err(err) => ReceiverStatus::error(err.kind(), err.to_string()),
        },
        Err(err) if !err.use_stderr() => {
            // --help and --version are not receiver requests.
            err.exit()
        }
        Err(err) => ReceiverStatus::error("usage", err.to_string()),
    };
    process::exit(report(&status));
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn report(status: &ReceiverStatus) -> i32 {
    let Ok(line) = status.to_line() else {
        return 1;
    };
    let mut stdout = io::stdout().lock();
    if writeln!(stdout, "{line}").and_then(|()| stdout.flush()).is_err() {
        return 1;
    }
    i32::from(!status.is_ok())
}

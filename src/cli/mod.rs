//! Command-line interface definitions for the `ferry-volume` binary.
//!
//! This module centralises the clap parser structures so the library, the
//! binary, and the build script can reuse them when generating the manual
//! page.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `ferry-volume` receiver.
#[derive(Debug, Parser)]
#[command(
    name = "ferry-volume",
    about = "Serve a local volume pool to pushing peers",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Name of the pool to act on, instead of the one recorded in the
    /// registry.
    #[arg(long, value_name = "NAME", global = true, requires = "mountpoint")]
    pub pool: Option<String>,
    /// Directory the pool is mounted at.
    #[arg(long, value_name = "PATH", global = true)]
    pub mountpoint: Option<String>,
    /// Registry file; discovered via `FERRY_REGISTRY_PATH` and the usual
    /// configuration directories when omitted.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<String>,
    /// Operation to perform.
    #[command(subcommand)]
    pub command: Command,
}

/// Receiver operations. Each prints one JSON status line.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a pool at `--mountpoint` and record it in the registry.
    #[command(name = "init")]
    Init,
    /// Report the snapshot history of a volume.
    #[command(name = "snapshots")]
    Snapshots {
        /// Volume to inspect.
        volume: String,
    },
    /// Apply a snapshot stream read from standard input.
    #[command(name = "receive")]
    Receive {
        /// Volume the stream belongs to.
        volume: String,
    },
    /// Create an empty volume.
    #[command(name = "create")]
    Create {
        /// Volume to create.
        volume: String,
    },
    /// Capture a snapshot of a volume.
    #[command(name = "snapshot")]
    Snapshot {
        /// Volume to snapshot.
        volume: String,
    },
    /// List registered volumes.
    #[command(name = "list")]
    List,
}

//! Core library for Ferry, a volume storage and replication engine.
//!
//! A [`DirectoryPool`] keeps named filesystems and immutable snapshots of
//! them on local disk. A [`VolumeService`] fronts one pool with a durable
//! volume registry, and a [`RemoteVolumeManager`] replicates a volume's
//! snapshot history to a peer by running the `ferry-volume` receiver
//! through a [`transport::Node`] and streaming only the snapshots the peer
//! lacks.

pub mod cli;
pub mod config;
mod file_lock;
pub mod pool;
pub mod receiver;
pub mod registry;
pub mod remote;
pub mod service;
#[cfg(test)]
mod test_helpers;
pub mod test_support;
pub mod transport;

pub use config::{ConfigError, TransferConfig};
pub use pool::{DirectoryPool, Filesystem, PoolError, PoolName, SnapshotId, StoragePool, VolumeName};
pub use receiver::{Invocation, ReceiverError, Request};
pub use registry::{Registry, RegistryError};
pub use remote::{PushError, PushResult, PushState, ReceiverStatus, RemoteVolumeManager};
pub use service::{ServiceError, Volume, VolumeService};
pub use transport::{Node, ProcessNode, TransportError};

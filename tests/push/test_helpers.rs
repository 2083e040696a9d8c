//! Shared fixtures for push BDD scenarios.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use ferry::test_support::{LoopbackNode, ServicePair, SetupError};
use ferry::{PushError, PushResult, ServiceError, SnapshotId, TransferConfig, VolumeName};
use rstest::fixture;
use tempfile::TempDir;
use thiserror::Error;
use tokio::runtime::Runtime;

#[derive(Clone, Debug)]
pub enum PushOutcome {
    Success(PushResult),
    Failure(ServiceError),
}

#[derive(Clone, Debug)]
pub struct PushContext {
    pub runtime: Arc<Runtime>,
    pub pair: Arc<ServicePair<LoopbackNode>>,
    pub volume: VolumeName,
    pub peer_history_before: Option<Vec<SnapshotId>>,
    pub outcome: Option<PushOutcome>,
    _tmp: Arc<TempDir>,
}

#[derive(Debug, Error)]
pub enum PushTestError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("fixture failure: {0}")]
    Fixture(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[fixture]
pub fn push_context() -> PushContext {
    build_push_context()
        .unwrap_or_else(|err| panic!("push context fixture should initialise: {err}"))
}

fn build_push_context() -> Result<PushContext, PushTestError> {
    let runtime = Runtime::new().map_err(|err| PushTestError::Fixture(err.to_string()))?;
    let tmp = TempDir::new().map_err(|err| PushTestError::Fixture(err.to_string()))?;
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .map_err(|path| PushTestError::Fixture(format!("non-UTF-8 path {}", path.display())))?;
    let pair = runtime.block_on(ServicePair::start(
        &root,
        LoopbackNode::default(),
        TransferConfig::default(),
    ))?;
    let volume =
        VolumeName::new("data").map_err(|err| PushTestError::Fixture(err.to_string()))?;
    Ok(PushContext {
        runtime: Arc::new(runtime),
        pair: Arc::new(pair),
        volume,
        peer_history_before: None,
        outcome: None,
        _tmp: Arc::new(tmp),
    })
}

/// Stable label for a push failure, as named in the feature file.
pub const fn failure_kind(err: &ServiceError) -> &'static str {
    match err {
        ServiceError::Push(PushError::DivergentHistory { .. }) => "divergent_history",
        ServiceError::Push(PushError::TransferFailed { .. }) => "transfer_failed",
        ServiceError::Push(PushError::Io { .. }) => "io",
        ServiceError::Push(PushError::Launch { .. }) => "launch",
        ServiceError::Push(PushError::Protocol { .. }) => "protocol",
        other => other.kind(),
    }
}

pub fn read_tree(root: &Utf8Path) -> Result<BTreeMap<String, Vec<u8>>, PushTestError> {
    let io = |err: std::io::Error| PushTestError::Fixture(err.to_string());
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in dir.read_dir_utf8().map_err(io)? {
            let path = entry.map_err(io)?.into_path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let relative = path
                    .strip_prefix(root)
                    .map_err(|err| PushTestError::Fixture(err.to_string()))?
                    .to_string();
                files.insert(relative, std::fs::read(&path).map_err(io)?);
            }
        }
    }
    Ok(files)
}

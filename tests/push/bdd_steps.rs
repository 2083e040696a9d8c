//! BDD step definitions for pushing a volume to a peer.

use ferry::test_support::write_file;
use ferry::StoragePool;
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{PushContext, PushOutcome, PushTestError, failure_kind, read_tree};

fn snapshot_source(push_context: &PushContext, round: u64) -> Result<(), PushTestError> {
    let service = &push_context.pair.from_service;
    push_context.runtime.block_on(async {
        let found = service.volume(&push_context.volume).await?;
        write_file(&found.filesystem, "round", format!("{round}\n"))?;
        service.snapshot_volume(&push_context.volume).await?;
        Ok::<(), PushTestError>(())
    })
}

#[given("a source volume with \"{count}\" snapshots")]
fn source_volume(push_context: PushContext, count: u64) -> Result<PushContext, PushTestError> {
    let service = &push_context.pair.from_service;
    push_context.runtime.block_on(async {
        let created = service.create_volume(&push_context.volume).await?;
        write_file(&created.filesystem, "payload.bin", vec![3_u8; 64 * 1024])?;
        Ok::<_, PushTestError>(())
    })?;
    for round in 0..count {
        snapshot_source(&push_context, round)?;
    }
    Ok(push_context)
}

#[given("the volume has been pushed")]
fn volume_pushed(push_context: PushContext) -> Result<PushContext, PushTestError> {
    let pair = &push_context.pair;
    push_context
        .runtime
        .block_on(pair.from_service.push(&push_context.volume, &pair.remote))?;
    Ok(push_context)
}

#[given("the source takes another snapshot")]
fn source_snapshots(push_context: PushContext) -> Result<PushContext, PushTestError> {
    snapshot_source(&push_context, 100)?;
    Ok(push_context)
}

#[given("the peer takes its own snapshot")]
fn peer_snapshots(push_context: PushContext) -> Result<PushContext, PushTestError> {
    let service = &push_context.pair.to_service;
    push_context.runtime.block_on(async {
        let found = service.volume(&push_context.volume).await?;
        write_file(&found.filesystem, "peer-only", "edited on the peer\n")?;
        service.snapshot_volume(&push_context.volume).await?;
        Ok::<_, PushTestError>(())
    })?;
    Ok(push_context)
}

#[given("the peer pool is destroyed")]
fn peer_destroyed(push_context: PushContext) -> Result<PushContext, PushTestError> {
    push_context
        .pair
        .to_service
        .pool()
        .destroy()
        .map_err(|err| PushTestError::Fixture(err.to_string()))?;
    Ok(push_context)
}

#[when("I push the volume to the peer")]
fn push_volume(mut push_context: PushContext) -> Result<PushContext, PushTestError> {
    let pair = std::sync::Arc::clone(&push_context.pair);
    let (before, outcome) = push_context.runtime.block_on(async {
        let before = peer_history(&pair, &push_context.volume).await;
        let outcome = match pair.from_service.push(&push_context.volume, &pair.remote).await {
            Ok(result) => PushOutcome::Success(result),
            Err(err) => PushOutcome::Failure(err),
        };
        (before, outcome)
    });
    push_context.peer_history_before = before;
    push_context.outcome = Some(outcome);
    Ok(push_context)
}

async fn peer_history(
    pair: &ferry::test_support::ServicePair<ferry::test_support::LoopbackNode>,
    volume: &ferry::VolumeName,
) -> Option<Vec<ferry::SnapshotId>> {
    pair.to_service.history(volume).await.ok().flatten()
}

#[then("the push succeeds sending \"{count}\" snapshots")]
fn push_succeeds(push_context: &PushContext, count: u64) -> Result<(), PushTestError> {
    match &push_context.outcome {
        Some(PushOutcome::Success(result)) if result.snapshots_sent == count => Ok(()),
        Some(PushOutcome::Success(result)) => Err(PushTestError::Assertion(format!(
            "expected {count} snapshots sent, got {}",
            result.snapshots_sent
        ))),
        Some(PushOutcome::Failure(err)) => Err(PushTestError::Assertion(format!(
            "expected success, push failed: {err}"
        ))),
        None => Err(PushTestError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the push fails with \"{kind}\"")]
fn push_fails(push_context: &PushContext, kind: String) -> Result<(), PushTestError> {
    let Some(PushOutcome::Failure(err)) = &push_context.outcome else {
        return Err(PushTestError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if failure_kind(err) == kind {
        Ok(())
    } else {
        Err(PushTestError::Assertion(format!(
            "expected failure kind {kind}, got {} ({err})",
            failure_kind(err)
        )))
    }
}

#[then("the peer holds the source history")]
fn peer_matches_history(push_context: &PushContext) -> Result<(), PushTestError> {
    let pair = &push_context.pair;
    let (local, peer) = push_context.runtime.block_on(async {
        let local = pair.from_service.history(&push_context.volume).await?;
        let peer = pair.to_service.history(&push_context.volume).await?;
        Ok::<_, PushTestError>((local, peer))
    })?;
    if local.is_some() && local == peer {
        Ok(())
    } else {
        Err(PushTestError::Assertion(format!(
            "peer history {peer:?} differs from source {local:?}"
        )))
    }
}

#[then("the peer files match the source")]
fn peer_matches_files(push_context: &PushContext) -> Result<(), PushTestError> {
    let pair = &push_context.pair;
    let (local, peer) = push_context.runtime.block_on(async {
        let local = pair.from_service.volume(&push_context.volume).await?;
        let peer = pair.to_service.pool().get(&push_context.volume).await
            .map_err(|err| PushTestError::Fixture(err.to_string()))?;
        Ok::<_, PushTestError>((local.filesystem.mount_path, peer.mount_path))
    })?;
    if read_tree(&local)? == read_tree(&peer)? {
        Ok(())
    } else {
        Err(PushTestError::Assertion(format!(
            "files under {peer} differ from {local}"
        )))
    }
}

#[then("the peer history is unchanged")]
fn peer_unchanged(push_context: &PushContext) -> Result<(), PushTestError> {
    let after = push_context.runtime.block_on(peer_history(
        &push_context.pair,
        &push_context.volume,
    ));
    if after.is_some() && after == push_context.peer_history_before {
        Ok(())
    } else {
        Err(PushTestError::Assertion(format!(
            "peer history changed from {:?} to {after:?}",
            push_context.peer_history_before
        )))
    }
}

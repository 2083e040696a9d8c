//! BDD scenarios for the push workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{PushContext, push_context};

#[scenario(
    path = "tests/features/push.feature",
    name = "Replicate a new volume to an empty peer"
)]
fn scenario_first_push(push_context: PushContext) {
    drop(push_context);
}

#[scenario(
    path = "tests/features/push.feature",
    name = "Send only new snapshots on later pushes"
)]
fn scenario_incremental_push(push_context: PushContext) {
    drop(push_context);
}

#[scenario(
    path = "tests/features/push.feature",
    name = "Refuse to overwrite a diverged peer"
)]
fn scenario_divergent_peer(push_context: PushContext) {
    drop(push_context);
}

#[scenario(
    path = "tests/features/push.feature",
    name = "Report a destroyed peer pool"
)]
fn scenario_destroyed_peer(push_context: PushContext) {
    drop(push_context);
}

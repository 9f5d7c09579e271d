// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The idle-suspend timer: a node that stays idle is suspended after the
//! configured timeout and not before.

use patchbay_core::{NodeState, Properties};
use patchbay_graph::GraphActor;
use patchbayd::idle;
use std::time::Duration;

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn idle_nodes_suspend_after_the_timeout() {
    let (actor, handle) = GraphActor::new("idle-test", Properties::new()).unwrap();
    tokio::spawn(actor.run());
    tokio::spawn(idle::run(handle.clone(), Duration::from_secs(3)));
    settle().await;

    patchbayd::nodes::register_builtin(&handle).await.unwrap();
    let node = handle
        .create_node("support.null-sink", "sink", Properties::new(), None)
        .await
        .unwrap();

    handle.set_node_state(node, NodeState::Idle).await.unwrap();
    settle().await;

    // Two seconds in: still idle.
    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    let snapshot = handle.node_snapshot(node).await.unwrap().unwrap();
    assert_eq!(snapshot.state, NodeState::Idle, "suspended before the timeout");

    // Past the timeout: suspended.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    settle().await;
    let snapshot = handle.node_snapshot(node).await.unwrap().unwrap();
    assert_eq!(snapshot.state, NodeState::Suspended);
}

#[tokio::test(start_paused = true)]
async fn activity_disarms_the_timer() {
    let (actor, handle) = GraphActor::new("idle-test", Properties::new()).unwrap();
    tokio::spawn(actor.run());
    tokio::spawn(idle::run(handle.clone(), Duration::from_secs(3)));
    settle().await;

    patchbayd::nodes::register_builtin(&handle).await.unwrap();
    let node = handle
        .create_node("support.null-sink", "sink", Properties::new(), None)
        .await
        .unwrap();

    handle.set_node_state(node, NodeState::Idle).await.unwrap();
    settle().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;

    // Running again before the timeout cancels the pending suspend.
    handle.set_node_state(node, NodeState::Running).await.unwrap();
    settle().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;

    let snapshot = handle.node_snapshot(node).await.unwrap().unwrap();
    assert_eq!(snapshot.state, NodeState::Running);
}

// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Suspend-on-idle: nodes that stay idle past the timeout get suspended.
//!
//! The module observes node state changes; entering `Idle` arms a timer, any
//! other activity on the node disarms it.

use patchbay_core::{NodeState, ObjectId};
use patchbay_graph::{GraphHandle, NodeEvent};
use std::collections::HashMap;
use std::time::Duration;

/// Runs until the graph actor goes away.
pub async fn run(handle: GraphHandle, timeout: Duration) {
    let Ok(mut events) = handle.subscribe_nodes().await else {
        return;
    };
    let mut timers: HashMap<ObjectId, tokio::task::JoinHandle<()>> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            NodeEvent::StateChanged { node, new: NodeState::Idle, .. } => {
                tracing::debug!(node = %node, "node idle, arming suspend timer");
                let handle = handle.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    tracing::debug!(node = %node, "idle timeout, suspending");
                    let _ = handle.set_node_state_nowait(node, NodeState::Suspended);
                });
                if let Some(previous) = timers.insert(node, timer) {
                    previous.abort();
                }
            },
            NodeEvent::StateChanged { node, .. } | NodeEvent::StateRequested { node, .. } => {
                if let Some(timer) = timers.remove(&node) {
                    timer.abort();
                }
            },
            NodeEvent::PortAdded { .. } | NodeEvent::PortRemoved { .. } => {},
        }
    }
    for (_, timer) in timers {
        timer.abort();
    }
}

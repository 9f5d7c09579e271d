// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The SYNC → DONE barrier through the actor, ordered behind async work.

use super::{s16_48k, TestPlugin};
use crate::actor::GraphActor;
use crate::events::{ClientEvent, EventPayload};
use crate::factory::FactoryDef;
use crate::node::NodePlugin;
use crate::Request;
use patchbay_core::{NodeState, ObjectId, Properties};
use std::time::Duration;
use tokio::sync::mpsc;

async fn wait_for_done(
    rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
    seq: u32,
) -> Option<ClientEvent> {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await?;
            if matches!(event.payload, EventPayload::Done { seq: s } if s == seq) {
                return Some(event);
            }
        }
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_completes_after_pending_async_work() {
    let (actor, handle) = GraphActor::new("test-core", Properties::new()).unwrap();
    let actor_task = tokio::spawn(actor.run());

    let mut plugin = TestPlugin::source(vec![s16_48k()]);
    plugin.async_commands = true;
    let plugin_handle = plugin.handle.clone();
    let mut slot = Some(Box::new(plugin) as Box<dyn NodePlugin>);
    handle
        .register_factory(FactoryDef::new("test.async-source", 0, move |_props| {
            slot.take()
                .ok_or_else(|| patchbay_core::Error::InvalidArgument("factory exhausted".into()))
        }))
        .await
        .unwrap();

    let node = handle
        .create_node("test.async-source", "pending", Properties::new(), None)
        .await
        .unwrap();

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let client = handle.new_client(None, Properties::new(), event_tx).await.unwrap();

    // Park an async transition in the work queue, then issue the barrier.
    handle.set_node_state_nowait(node, NodeState::Running).unwrap();
    handle.request(client, ObjectId::CORE, Request::Sync { seq: 77 }).unwrap();

    // The barrier must not fire while the transition is in flight.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut premature = false;
    while let Ok(event) = events.try_recv() {
        premature |= matches!(event.payload, EventPayload::Done { .. });
    }
    assert!(!premature, "DONE overtook a pending async item");

    plugin_handle.complete_pending(&Ok(()));
    let done = wait_for_done(&mut events, 77).await.expect("DONE never arrived");
    assert_eq!(done.resource, ObjectId::CORE);

    // Exactly one DONE per SYNC.
    assert!(wait_for_done(&mut events, 77)
        .await
        .is_none());

    let snapshot = handle.node_snapshot(node).await.unwrap().unwrap();
    assert_eq!(snapshot.state, NodeState::Running);

    handle.shutdown();
    let _ = actor_task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_round_trips_on_an_idle_core() {
    let (actor, handle) = GraphActor::new("test-core", Properties::new()).unwrap();
    let actor_task = tokio::spawn(actor.run());

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let client = handle.new_client(None, Properties::new(), event_tx).await.unwrap();

    for seq in [1u32, 2, 3] {
        handle.request(client, ObjectId::CORE, Request::Sync { seq }).unwrap();
        let done = wait_for_done(&mut events, seq).await.expect("DONE never arrived");
        assert_eq!(done.resource, ObjectId::CORE);
    }

    handle.shutdown();
    let _ = actor_task.await;
}

// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Registry visibility and bind permission checks.

use super::{s16_48k, Fixture, TestPlugin};
use crate::access::OwnerUidPolicy;
use crate::client::Ucred;
use crate::events::{ClientEvent, EventPayload};
use crate::Request;
use patchbay_core::{ErrorCode, ObjectId, Properties};
use tokio::sync::mpsc;

fn creds(uid: u32) -> Option<Ucred> {
    Some(Ucred { uid, gid: uid, pid: 1 })
}

fn connect(fx: &mut Fixture, uid: u32) -> (ObjectId, mpsc::UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = fx.ctx.add_client(creds(uid), Properties::new(), tx);
    (id, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn notified_globals(events: &[ClientEvent]) -> Vec<ObjectId> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::NotifyGlobal { id, .. } => Some(*id),
            _ => None,
        })
        .collect()
}

#[test]
fn bind_succeeds_for_same_uid() {
    let mut fx = Fixture::new();
    fx.ctx.access.add(Box::new(OwnerUidPolicy));

    let (client_a, _rx_a) = connect(&mut fx, 1000);
    let (node, _) = fx.add_node("shared", TestPlugin::source(vec![s16_48k()]));
    // Tag the node as owned by client A.
    set_owner(&mut fx, node, client_a);

    let (client_b, mut rx_b) = connect(&mut fx, 1000);
    fx.ctx
        .dispatch(client_b, ObjectId::CORE, Request::GetRegistry { new_id: ObjectId::REGISTRY });
    fx.ctx.drain_work();

    let events = drain(&mut rx_b);
    assert!(notified_globals(&events).contains(&node), "B never saw the node global");

    fx.ctx.dispatch(
        client_b,
        ObjectId::REGISTRY,
        Request::Bind { id: node, version: 0, new_id: ObjectId(42) },
    );
    fx.ctx.drain_work();

    // Local id 42 now resolves to the node.
    let resource = fx.ctx.client(client_b).unwrap().resource(ObjectId(42)).unwrap().clone();
    assert_eq!(resource.global, node);

    // And the bind produced the initial node info on the new resource.
    let events = drain(&mut rx_b);
    assert!(events.iter().any(|e| {
        e.resource == ObjectId(42) && matches!(&e.payload, EventPayload::NodeInfo { id, .. } if *id == node)
    }));
}

#[test]
fn bind_refused_across_uids() {
    let mut fx = Fixture::new();
    fx.ctx.access.add(Box::new(OwnerUidPolicy));

    let (client_a, _rx_a) = connect(&mut fx, 1000);
    let (node, _) = fx.add_node("private", TestPlugin::source(vec![s16_48k()]));
    set_owner(&mut fx, node, client_a);

    let (client_b, mut rx_b) = connect(&mut fx, 1001);
    fx.ctx
        .dispatch(client_b, ObjectId::CORE, Request::GetRegistry { new_id: ObjectId::REGISTRY });
    fx.ctx.drain_work();

    // The foreign-owned global is silently absent from the replay.
    let events = drain(&mut rx_b);
    assert!(!notified_globals(&events).contains(&node));

    fx.ctx.dispatch(
        client_b,
        ObjectId::REGISTRY,
        Request::Bind { id: node, version: 0, new_id: ObjectId(42) },
    );
    fx.ctx.drain_work();

    let events = drain(&mut rx_b);
    let error = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::Error { id, code, message } => Some((*id, *code, message.clone())),
            _ => None,
        })
        .expect("expected an error event");
    assert_eq!(error.0, ObjectId::REGISTRY);
    assert_eq!(error.1, ErrorCode::NoPermission);
    assert!(error.2.contains("no permission"));
    assert!(fx.ctx.client(client_b).unwrap().resource(ObjectId(42)).is_none());
}

#[test]
fn unowned_globals_are_visible_to_everyone() {
    let mut fx = Fixture::new();
    fx.ctx.access.add(Box::new(OwnerUidPolicy));

    let (node, _) = fx.add_node("public", TestPlugin::source(vec![s16_48k()]));
    let (client, mut rx) = connect(&mut fx, 4242);
    fx.ctx
        .dispatch(client, ObjectId::CORE, Request::GetRegistry { new_id: ObjectId::REGISTRY });
    fx.ctx.drain_work();

    assert!(notified_globals(&drain(&mut rx)).contains(&node));

    fx.ctx.dispatch(
        client,
        ObjectId::REGISTRY,
        Request::Bind { id: node, version: 0, new_id: ObjectId(7) },
    );
    fx.ctx.drain_work();
    assert!(fx.ctx.client(client).unwrap().resource(ObjectId(7)).is_some());
}

#[test]
fn later_globals_reach_only_permitted_registries() {
    let mut fx = Fixture::new();
    fx.ctx.access.add(Box::new(OwnerUidPolicy));

    let (client_a, mut rx_a) = connect(&mut fx, 1000);
    let (client_b, mut rx_b) = connect(&mut fx, 1001);
    for (client, rx) in [(client_a, &mut rx_a), (client_b, &mut rx_b)] {
        fx.ctx
            .dispatch(client, ObjectId::CORE, Request::GetRegistry { new_id: ObjectId::REGISTRY });
        fx.ctx.drain_work();
        drain(rx);
    }

    let (node, _) = fx.add_node("late", TestPlugin::source(vec![s16_48k()]));
    set_owner(&mut fx, node, client_a);
    // Re-announce after tagging the owner, as a client-created node would be.
    fx.ctx.announce_global(node);

    assert!(notified_globals(&drain(&mut rx_a)).contains(&node));
    assert!(!notified_globals(&drain(&mut rx_b)).contains(&node));
}

#[test]
fn client_update_reaches_bound_holders() {
    let mut fx = Fixture::new();
    let (client_a, mut rx_a) = connect(&mut fx, 1000);
    let (client_b, mut rx_b) = connect(&mut fx, 1000);

    // B binds A's client global.
    fx.ctx
        .dispatch(client_b, ObjectId::CORE, Request::GetRegistry { new_id: ObjectId::REGISTRY });
    fx.ctx.dispatch(
        client_b,
        ObjectId::REGISTRY,
        Request::Bind { id: client_a, version: 0, new_id: ObjectId(9) },
    );
    fx.ctx.drain_work();
    drain(&mut rx_a);
    drain(&mut rx_b);

    fx.ctx.dispatch(
        client_a,
        ObjectId::CORE,
        Request::ClientUpdate { props: Properties::from([("application.name", "mixer")]) },
    );
    fx.ctx.drain_work();

    // The requester hears the merge on its core resource.
    let events = drain(&mut rx_a);
    assert!(events.iter().any(|e| {
        matches!(&e.payload, EventPayload::ClientInfo { id, props }
            if *id == client_a && props.get("application.name") == Some("mixer"))
    }));

    // And so does the holder, on the resource it bound.
    let events = drain(&mut rx_b);
    assert!(events.iter().any(|e| {
        e.resource == ObjectId(9)
            && matches!(&e.payload, EventPayload::ClientInfo { id, props }
                if *id == client_a && props.get("application.name") == Some("mixer"))
    }));
}

#[test]
fn unknown_resource_id_disconnects_the_client() {
    let mut fx = Fixture::new();
    let (client, _rx) = connect(&mut fx, 1000);
    fx.ctx.dispatch(client, ObjectId(99), Request::Sync { seq: 1 });
    fx.ctx.drain_work();
    assert!(fx.ctx.client(client).is_none());
}

/// Stamps `owner` onto an existing global, as if the client had created it.
fn set_owner(fx: &mut Fixture, global: ObjectId, owner: ObjectId) {
    // Recreate the entry with the owner set; the registry API assigns
    // ownership only at creation time.
    let entry = fx.ctx.registry.get(global).unwrap().clone();
    fx.ctx.registry.remove(global);
    let mut restored = entry;
    restored.owner = Some(owner);
    fx.ctx.registry.restore(restored);
}

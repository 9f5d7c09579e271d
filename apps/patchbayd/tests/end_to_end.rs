// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Full-stack scenario: two clients over the real socket, registry replay,
//! bind, and the SYNC barrier.

use patchbay_core::format::FormatTypes;
use patchbay_core::{ObjectId, Properties, TypeMap};
use patchbay_graph::{EventPayload, Request};
use patchbay_proto::{demarshal_event, marshal_request, Class, Connection};
use patchbayd::config::Config;
use patchbayd::socket::ServerSocket;
use patchbayd::Daemon;
use std::collections::VecDeque;
use std::time::Duration;

struct TestClient {
    conn: Connection,
    types: FormatTypes,
    fds: VecDeque<std::os::fd::OwnedFd>,
}

impl TestClient {
    async fn connect(path: &std::path::Path) -> Self {
        let conn = Connection::connect(path).await.unwrap();
        Self { conn, types: FormatTypes::register(&TypeMap::new()), fds: VecDeque::new() }
    }

    async fn send(&mut self, resource: ObjectId, request: &Request) {
        let (opcode, payload) = marshal_request(request, &self.types).unwrap();
        self.conn.send(resource.0, opcode, &payload, &[]).await.unwrap();
    }

    /// Receives one event, resolving its class from the resource id.
    async fn recv(&mut self, class_of: impl Fn(u32) -> Class) -> (ObjectId, EventPayload) {
        let message = tokio::time::timeout(Duration::from_secs(5), self.conn.recv())
            .await
            .expect("timed out waiting for an event")
            .unwrap()
            .expect("connection closed");
        while let Some(fd) = self.conn.pop_fd() {
            self.fds.push_back(fd);
        }
        let payload = demarshal_event(
            class_of(message.id),
            message.opcode,
            &message.payload,
            &self.types,
            &mut self.fds,
        )
        .unwrap();
        (ObjectId(message.id), payload)
    }

    /// Core/registry-only class mapping, enough for these scenarios.
    async fn recv_core(&mut self) -> (ObjectId, EventPayload) {
        self.recv(|id| match id {
            1 => Class::Registry,
            42 => Class::Node,
            _ => Class::Core,
        })
        .await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registry_replay_bind_and_sync() {
    let dir = tempfile::tempdir().unwrap();
    let socket = ServerSocket::create_in(dir.path(), "e2e-core").unwrap();
    let socket_path = socket.guard.path.clone();
    let daemon = Daemon::start(&Config::default(), socket).await.unwrap();

    // Client A creates a node through the builtin factory.
    let mut client_a = TestClient::connect(&socket_path).await;
    let (_, core_info) = client_a.recv_core().await;
    assert!(matches!(core_info, EventPayload::CoreInfo { .. }));

    client_a
        .send(
            ObjectId::CORE,
            &Request::CreateNode {
                factory: "support.tone-source".into(),
                name: "tone".into(),
                props: Properties::new(),
                new_id: ObjectId(2),
            },
        )
        .await;
    // The bind ack is the node info on the fresh resource.
    let node_global = loop {
        let (resource, payload) = client_a
            .recv(|id| if id == 2 { Class::Node } else { Class::Core })
            .await;
        if let EventPayload::NodeInfo { id, .. } = payload {
            assert_eq!(resource, ObjectId(2));
            break id;
        }
    };

    // Client B (same uid) lists the registry and binds the node.
    let mut client_b = TestClient::connect(&socket_path).await;
    let (_, core_info) = client_b.recv_core().await;
    assert!(matches!(core_info, EventPayload::CoreInfo { .. }));

    client_b.send(ObjectId::CORE, &Request::GetRegistry { new_id: ObjectId::REGISTRY }).await;
    client_b.send(ObjectId::CORE, &Request::Sync { seq: 11 }).await;

    let mut saw_node_global = false;
    loop {
        let (_, payload) = client_b.recv_core().await;
        match payload {
            EventPayload::NotifyGlobal { id, type_uri } => {
                if id == node_global {
                    assert!(type_uri.contains("Node"));
                    saw_node_global = true;
                }
            },
            EventPayload::Done { seq } => {
                assert_eq!(seq, 11);
                break;
            },
            _ => {},
        }
    }
    assert!(saw_node_global, "registry replay skipped the node");

    client_b
        .send(
            ObjectId::REGISTRY,
            &Request::Bind { id: node_global, version: 0, new_id: ObjectId(42) },
        )
        .await;
    let (resource, payload) = client_b.recv_core().await;
    assert_eq!(resource, ObjectId(42));
    match payload {
        EventPayload::NodeInfo { id, name, .. } => {
            assert_eq!(id, node_global);
            assert_eq!(name, "tone");
        },
        other => panic!("expected node info, got {other:?}"),
    }

    // One more barrier; exactly one DONE comes back.
    client_b.send(ObjectId::CORE, &Request::Sync { seq: 12 }).await;
    let (_, payload) = client_b.recv_core().await;
    assert!(matches!(payload, EventPayload::Done { seq: 12 }));

    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_resource_closes_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let socket = ServerSocket::create_in(dir.path(), "e2e-bad").unwrap();
    let socket_path = socket.guard.path.clone();
    let daemon = Daemon::start(&Config::default(), socket).await.unwrap();

    let mut client = TestClient::connect(&socket_path).await;
    let (_, core_info) = client.recv_core().await;
    assert!(matches!(core_info, EventPayload::CoreInfo { .. }));

    // Resource 99 was never installed.
    client.send(ObjectId(99), &Request::Sync { seq: 1 }).await;
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.conn.recv().await {
                Ok(None) | Err(_) => break,
                Ok(Some(_)) => {},
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection stayed open after an unknown resource id");

    daemon.shutdown().await;
}

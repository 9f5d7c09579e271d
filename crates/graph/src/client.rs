// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Clients and their per-client resource maps.

use crate::events::{ClientEvent, EventPayload};
use patchbay_core::{Error, IdMap, ObjectId, Properties, Result, TypeId};
use tokio::sync::mpsc;

/// Unix credentials captured from the socket at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ucred {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

impl From<nix::sys::socket::UnixCredentials> for Ucred {
    fn from(creds: nix::sys::socket::UnixCredentials) -> Self {
        Self { uid: creds.uid(), gid: creds.gid(), pid: creds.pid() }
    }
}

/// A per-client handle to one global.
///
/// Resources are the only path between a client and a server object: every
/// request addresses one and every event originates from one.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Client-local id.
    pub id: ObjectId,
    pub type_id: TypeId,
    /// The global this resource is bound to.
    pub global: ObjectId,
}

/// One connected peer.
pub struct Client {
    /// The client's own global id.
    pub id: ObjectId,
    pub creds: Option<Ucred>,
    pub props: Properties,
    resources: IdMap<Resource>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
}

impl Client {
    pub fn new(
        id: ObjectId,
        creds: Option<Ucred>,
        props: Properties,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self { id, creds, props, resources: IdMap::new(), event_tx }
    }

    pub fn uid(&self) -> Option<u32> {
        self.creds.map(|c| c.uid)
    }

    /// Installs a resource at the client-chosen local id.
    pub fn add_resource(&mut self, local: ObjectId, type_id: TypeId, global: ObjectId) -> Result<()> {
        self.resources
            .insert_at(local.0, Resource { id: local, type_id, global })
            .map_err(|_| {
                Error::InvalidArgument(format!("client id {local} is already in use"))
            })
    }

    pub fn resource(&self, local: ObjectId) -> Option<&Resource> {
        self.resources.get(local.0)
    }

    pub fn remove_resource(&mut self, local: ObjectId) -> Option<Resource> {
        self.resources.remove(local.0)
    }

    /// Local ids of every resource bound to `global`.
    pub fn resources_for_global(&self, global: ObjectId) -> Vec<ObjectId> {
        self.resources
            .iter()
            .filter(|(_, r)| r.global == global)
            .map(|(id, _)| ObjectId(id))
            .collect()
    }

    pub fn resource_ids(&self) -> Vec<ObjectId> {
        self.resources.iter().map(|(id, _)| ObjectId(id)).collect()
    }

    /// Queues an event for the connection writer. Returns false when the
    /// connection is gone.
    pub fn send(&self, resource: ObjectId, payload: EventPayload) -> bool {
        self.event_tx.send(ClientEvent { resource, payload }).is_ok()
    }

    /// The raw event channel, for plugins that emit on the client's behalf.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<ClientEvent> {
        self.event_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (Client, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Client::new(ObjectId(2), None, Properties::new(), tx), rx)
    }

    #[test]
    fn duplicate_local_id_is_refused() {
        let (mut client, _rx) = client();
        client.add_resource(ObjectId(4), TypeId(1), ObjectId(9)).unwrap();
        assert!(client.add_resource(ObjectId(4), TypeId(1), ObjectId(10)).is_err());
        assert_eq!(client.resource(ObjectId(4)).map(|r| r.global), Some(ObjectId(9)));
    }

    #[test]
    fn lookup_by_global() {
        let (mut client, _rx) = client();
        client.add_resource(ObjectId(0), TypeId(0), ObjectId(0)).unwrap();
        client.add_resource(ObjectId(5), TypeId(1), ObjectId(3)).unwrap();
        client.add_resource(ObjectId(6), TypeId(1), ObjectId(3)).unwrap();
        assert_eq!(
            client.resources_for_global(ObjectId(3)),
            vec![ObjectId(5), ObjectId(6)]
        );
    }

    #[test]
    fn send_reports_closed_connections() {
        let (mut client, rx) = client();
        client.add_resource(ObjectId(0), TypeId(0), ObjectId(0)).unwrap();
        assert!(client.send(ObjectId(0), EventPayload::Done { seq: 1 }));
        drop(rx);
        assert!(!client.send(ObjectId(0), EventPayload::Done { seq: 2 }));
    }
}

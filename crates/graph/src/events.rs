// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Event fan-out and the event payloads observers receive.
//!
//! The graph actor is the single writer of all control-plane state; everyone
//! else observes it through subscriber channels. A [`Listeners`] list is the
//! fan-out point: emission walks a snapshot of the current subscribers and
//! prunes the ones that went away, so subscribing and dropping receivers is
//! always safe, including while an emission is in flight on the actor.

use patchbay_core::{
    Direction, ErrorCode, LinkState, MediaFormat, NodeState, ObjectId, Pod, Properties, SeqId,
    TypeId,
};
use std::os::fd::OwnedFd;
use tokio::sync::mpsc;

/// A list of event subscribers.
pub struct Listeners<E> {
    subs: Vec<mpsc::UnboundedSender<E>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self { subs: Vec::new() }
    }
}

impl<E: Clone> Listeners<E> {
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.push(tx);
        rx
    }

    /// Delivers `event` to every live subscriber, dropping the dead ones.
    pub fn emit(&mut self, event: &E) {
        self.subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

/// Registry-level events.
#[derive(Debug, Clone)]
pub enum GlobalEvent {
    Added { id: ObjectId, type_id: TypeId, owner: Option<ObjectId> },
    Removed { id: ObjectId },
}

/// Node lifecycle events.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A state change was requested but not yet applied.
    StateRequested { node: ObjectId, target: NodeState },
    StateChanged { node: ObjectId, old: NodeState, new: NodeState },
    PortAdded { node: ObjectId, direction: Direction, port: u32 },
    PortRemoved { node: ObjectId, direction: Direction, port: u32 },
}

/// Link lifecycle events.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    StateChanged { link: ObjectId, old: LinkState, new: LinkState },
    PortUnlinked { link: ObjectId, node: ObjectId, direction: Direction, port: u32 },
}

/// An event queued for delivery to one client, addressed by the client-local
/// resource id it originates from.
#[derive(Debug)]
pub struct ClientEvent {
    pub resource: ObjectId,
    pub payload: EventPayload,
}

/// The server-to-client event set.
///
/// Fd-carrying events own their descriptor until the connection writer hands
/// it to `sendmsg`.
#[derive(Debug)]
pub enum EventPayload {
    // Core resource.
    CoreInfo { props: Properties, name: String, version: String, cookie: u32 },
    Done { seq: u32 },
    Error { id: ObjectId, code: ErrorCode, message: String },
    RemoveId { id: ObjectId },
    // Registry resource.
    NotifyGlobal { id: ObjectId, type_uri: String },
    NotifyGlobalRemove { id: ObjectId },
    // Node resource.
    NodeInfo { id: ObjectId, name: String, state: NodeState, props: Properties },
    // Link resource.
    LinkInfo {
        id: ObjectId,
        output_node: ObjectId,
        output_port: u32,
        input_node: ObjectId,
        input_port: u32,
        state: LinkState,
    },
    // Client resource.
    ClientInfo { id: ObjectId, props: Properties },
    // Client-node resource.
    AddMem { mem_id: u32, fd: OwnedFd, size: u32 },
    SetFormat { direction: Direction, port: u32, format: Box<MediaFormat> },
    UseBuffers { direction: Direction, port: u32, buffers: Pod },
    NodeCommand { command: Pod },
}

/// Coarse classification used by access hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CoreInfo,
    Done,
    Error,
    RemoveId,
    NotifyGlobal,
    NotifyGlobalRemove,
    Info,
    Memory,
    Buffers,
    Command,
}

impl EventPayload {
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::CoreInfo { .. } => EventKind::CoreInfo,
            Self::Done { .. } => EventKind::Done,
            Self::Error { .. } => EventKind::Error,
            Self::RemoveId { .. } => EventKind::RemoveId,
            Self::NotifyGlobal { .. } => EventKind::NotifyGlobal,
            Self::NotifyGlobalRemove { .. } => EventKind::NotifyGlobalRemove,
            Self::NodeInfo { .. } | Self::LinkInfo { .. } | Self::ClientInfo { .. } => {
                EventKind::Info
            },
            Self::AddMem { .. } => EventKind::Memory,
            Self::SetFormat { .. } | Self::UseBuffers { .. } => EventKind::Buffers,
            Self::NodeCommand { .. } => EventKind::Command,
        }
    }

    /// The global this event advertises, when it advertises one.
    pub const fn subject_global(&self) -> Option<ObjectId> {
        match self {
            Self::NotifyGlobal { id, .. } | Self::NotifyGlobalRemove { id } => Some(*id),
            _ => None,
        }
    }
}

/// Plugin acknowledgements of async operations, delivered into the actor.
#[derive(Debug, Clone)]
pub struct AsyncComplete {
    pub node: ObjectId,
    pub seq: SeqId,
    pub result: Result<(), String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_prunes_dead_subscribers() {
        let mut listeners = Listeners::default();
        let mut alive = listeners.subscribe();
        let dead = listeners.subscribe();
        drop(dead);

        listeners.emit(&GlobalEvent::Removed { id: ObjectId(4) });
        assert_eq!(listeners.len(), 1);
        assert!(matches!(alive.try_recv(), Ok(GlobalEvent::Removed { id }) if id == ObjectId(4)));
    }

    #[test]
    fn event_kind_classification() {
        let notify = EventPayload::NotifyGlobal { id: ObjectId(2), type_uri: "t".into() };
        assert_eq!(notify.kind(), EventKind::NotifyGlobal);
        assert_eq!(notify.subject_global(), Some(ObjectId(2)));

        let done = EventPayload::Done { seq: 1 };
        assert_eq!(done.kind(), EventKind::Done);
        assert_eq!(done.subject_global(), None);
    }
}

// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The graph context: every piece of control-plane state, owned by the graph
//! actor task.
//!
//! Nothing here is shared; connection tasks and modules observe through
//! subscriber channels and mutate through actor commands. The data loop is
//! reached only via its invoke handle.

use crate::access::{AccessChains, Decision, GlobalInfo, SendCheck};
use crate::client::{Client, Ucred};
use crate::data_loop::{DataLoopHandle, RtNode};
use crate::events::{
    AsyncComplete, ClientEvent, EventPayload, GlobalEvent, Listeners, LinkEvent, NodeEvent,
};
use crate::factory::FactoryDef;
use crate::link::Link;
use crate::node::Node;
use crate::work_queue::{WorkInput, WorkQueue};
use indexmap::IndexMap;
use patchbay_core::format::FormatTypes;
use patchbay_core::{
    Completion, Direction, Error, ErrorCode, IdMap, InterfaceTypes, MemPool, NodeCommand,
    NodeState, ObjectId, Properties, Result, SeqId, TypeMap,
};
use std::time::Duration;
use tokio::sync::mpsc;

/// Processing quantum used to drive a running clock owner.
pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(20);

/// All control-plane state of one patchbay core.
pub struct Context {
    pub types: TypeMap,
    pub iface: InterfaceTypes,
    pub format_types: FormatTypes,
    pub mempool: MemPool,
    pub props: Properties,
    pub name: String,

    pub registry: crate::registry::Registry,
    pub(crate) nodes: IdMap<Node>,
    pub(crate) links: IdMap<Link>,
    pub(crate) clients: IdMap<Client>,
    pub(crate) factories: IndexMap<String, FactoryDef>,

    pub work: WorkQueue<Context>,
    pub data_loop: DataLoopHandle,
    pub access: AccessChains,

    pub global_events: Listeners<GlobalEvent>,
    pub node_events: Listeners<NodeEvent>,
    pub link_events: Listeners<LinkEvent>,

    pub(crate) completion_tx: mpsc::UnboundedSender<AsyncComplete>,
    seq_counter: u32,
}

impl Context {
    pub fn new(
        name: impl Into<String>,
        props: Properties,
        data_loop: DataLoopHandle,
        completion_tx: mpsc::UnboundedSender<AsyncComplete>,
    ) -> Self {
        let types = TypeMap::new();
        let iface = InterfaceTypes::register(&types);
        let format_types = FormatTypes::register(&types);
        let mut registry = crate::registry::Registry::new();
        let core_id =
            registry.add(None, iface.core, 0, crate::registry::GlobalKind::Core);
        debug_assert_eq!(core_id, ObjectId::CORE);

        Self {
            types,
            iface,
            format_types,
            mempool: MemPool::new(),
            props,
            name: name.into(),
            registry,
            nodes: IdMap::new(),
            links: IdMap::new(),
            clients: IdMap::new(),
            factories: IndexMap::new(),
            work: WorkQueue::new(),
            data_loop,
            access: AccessChains::new(),
            global_events: Listeners::default(),
            node_events: Listeners::default(),
            link_events: Listeners::default(),
            completion_tx,
            seq_counter: 0x8000_0000,
        }
    }

    /// Sequence numbers for server-initiated async operations (link
    /// teardown invokes). The high bit keeps them clear of plugin ranges.
    pub fn next_seq(&mut self) -> SeqId {
        self.seq_counter = self.seq_counter.wrapping_add(1) | 0x8000_0000;
        SeqId(self.seq_counter)
    }

    pub fn node(&self, id: ObjectId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn node_mut(&mut self, id: ObjectId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0)
    }

    pub fn link(&self, id: ObjectId) -> Option<&Link> {
        self.links.get(id.0)
    }

    pub fn link_mut(&mut self, id: ObjectId) -> Option<&mut Link> {
        self.links.get_mut(id.0)
    }

    pub fn client(&self, id: ObjectId) -> Option<&Client> {
        self.clients.get(id.0)
    }

    pub fn client_mut(&mut self, id: ObjectId) -> Option<&mut Client> {
        self.clients.get_mut(id.0)
    }

    pub fn node_ids(&self) -> Vec<ObjectId> {
        self.nodes.iter().map(|(id, _)| ObjectId(id)).collect()
    }

    pub fn link_ids(&self) -> Vec<ObjectId> {
        self.links.iter().map(|(id, _)| ObjectId(id)).collect()
    }

    pub fn client_ids(&self) -> Vec<ObjectId> {
        self.clients.iter().map(|(id, _)| ObjectId(id)).collect()
    }

    /// What access hooks may see about a global.
    pub fn global_info(&self, id: ObjectId) -> Option<GlobalInfo> {
        let global = self.registry.get(id)?;
        let owner_uid = global.owner.and_then(|owner| self.client(owner).and_then(Client::uid));
        Some(GlobalInfo { id: global.id, type_id: global.type_id, owner_uid })
    }

    // ---- factories ------------------------------------------------------

    /// Publishes a node factory.
    pub fn register_factory(&mut self, factory: FactoryDef) -> ObjectId {
        let name = factory.name.clone();
        let id = self.registry.add(
            None,
            self.iface.factory,
            factory.version,
            crate::registry::GlobalKind::Factory(name.clone()),
        );
        self.factories.insert(name, factory);
        self.announce_global(id);
        id
    }

    // ---- clients --------------------------------------------------------

    /// Registers a connected peer: publishes its global and installs the
    /// core resource at client-local id 0.
    pub fn add_client(
        &mut self,
        creds: Option<Ucred>,
        props: Properties,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
    ) -> ObjectId {
        let id = self.registry.add(None, self.iface.client, 0, crate::registry::GlobalKind::Client);
        let mut client = Client::new(id, creds, props, event_tx);
        // Local id 0 is the core resource on every client.
        let _ = client.add_resource(ObjectId::CORE, self.iface.core, ObjectId::CORE);
        let _ = self.clients.insert_at(id.0, client);
        tracing::info!(client = %id, uid = ?creds.map(|c| c.uid), "client connected");

        self.client_send(
            id,
            ObjectId::CORE,
            EventPayload::CoreInfo {
                props: self.props.clone(),
                name: self.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                cookie: std::process::id(),
            },
        );
        self.announce_global(id);
        id
    }

    /// Tears down a client: its resources, the globals it owns, its entry.
    pub fn destroy_client(&mut self, id: ObjectId) {
        let Some(_) = self.client(id) else { return };
        tracing::info!(client = %id, "client disconnected");

        for owned in self.registry.owned_by(id) {
            self.destroy_global(owned);
        }
        self.work.cancel(Some(id), None);
        self.clients.remove(id.0);
        if self.registry.remove(id).is_some() {
            self.global_events.emit(&GlobalEvent::Removed { id });
            self.notify_global_removed(id);
        }
    }

    // ---- event delivery -------------------------------------------------

    /// Queues an event on one client resource, subject to `check_send`.
    ///
    /// Returns true when the event was delivered to the connection writer.
    pub fn client_send(
        &mut self,
        client_id: ObjectId,
        resource: ObjectId,
        payload: EventPayload,
    ) -> bool {
        let Some(client) = self.clients.get(client_id.0) else { return false };
        let Some(res) = client.resource(resource) else { return false };
        let resource_type = res.type_id;
        let client_uid = client.uid();
        let subject = payload.subject_global().and_then(|gid| self.global_info(gid));

        let check = SendCheck {
            client: client_id,
            client_uid,
            resource_type,
            registry_type: self.iface.registry,
            event: payload.kind(),
            subject: subject.as_ref(),
        };
        match self.access.check_send(&check) {
            Decision::Allow => {},
            Decision::Skip => return false,
            Decision::Deny => {
                let code = ErrorCode::NoPermission;
                let message = "no permission".to_string();
                if let Some(client) = self.clients.get(client_id.0) {
                    client.send(
                        ObjectId::CORE,
                        EventPayload::Error { id: resource, code, message },
                    );
                }
                return false;
            },
        }
        self.clients
            .get(client_id.0)
            .is_some_and(|client| client.send(resource, payload))
    }

    /// Reports an error on the client's core resource.
    pub fn client_error(&mut self, client_id: ObjectId, id: ObjectId, err: &Error) {
        if let Some(client) = self.clients.get(client_id.0) {
            client.send(
                ObjectId::CORE,
                EventPayload::Error { id, code: err.code(), message: err.to_string() },
            );
        }
    }

    /// Emits `global-added` and replays the new global to every client
    /// holding a registry resource (hook-filtered).
    pub fn announce_global(&mut self, id: ObjectId) {
        let Some(global) = self.registry.get(id) else { return };
        let type_id = global.type_id;
        let owner = global.owner;
        self.global_events.emit(&GlobalEvent::Added { id, type_id, owner });

        let type_uri =
            self.types.uri_of(type_id).map_or_else(|| "unknown".to_string(), |u| u.to_string());
        for (client_id, registry_res) in self.registry_resources() {
            self.client_send(
                client_id,
                registry_res,
                EventPayload::NotifyGlobal { id, type_uri: type_uri.clone() },
            );
        }
    }

    /// Tells registry holders a global went away and retires the resources
    /// bound to it.
    pub fn notify_global_removed(&mut self, id: ObjectId) {
        for (client_id, registry_res) in self.registry_resources() {
            self.client_send(client_id, registry_res, EventPayload::NotifyGlobalRemove { id });
        }
        for client_id in self.client_ids() {
            let locals = self
                .client(client_id)
                .map(|c| c.resources_for_global(id))
                .unwrap_or_default();
            for local in locals {
                if local == ObjectId::CORE {
                    continue;
                }
                if let Some(client) = self.client_mut(client_id) {
                    client.remove_resource(local);
                    client.send(ObjectId::CORE, EventPayload::RemoveId { id: local });
                }
            }
        }
    }

    /// `(client, registry-resource-local-id)` pairs across all clients.
    fn registry_resources(&self) -> Vec<(ObjectId, ObjectId)> {
        let registry_type = self.iface.registry;
        let mut out = Vec::new();
        for (client_id, client) in self.clients.iter() {
            for local in client.resource_ids() {
                if client.resource(local).is_some_and(|r| r.type_id == registry_type) {
                    out.push((ObjectId(client_id), local));
                }
            }
        }
        out
    }

    // ---- nodes ----------------------------------------------------------

    /// Creates a node through a registered factory and publishes it.
    pub fn create_node(
        &mut self,
        factory_name: &str,
        node_name: &str,
        props: Properties,
        owner: Option<ObjectId>,
    ) -> Result<ObjectId> {
        let factory = self
            .factories
            .get_mut(factory_name)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("no factory named '{factory_name}'"))
            })?;
        let mut plugin = factory.create(&props)?;

        let id = self.registry.add(
            owner,
            self.iface.node,
            0,
            crate::registry::GlobalKind::Node,
        );
        plugin.attach(crate::node::AsyncNotify::new(id, self.completion_tx.clone()));

        let mut node = Node::new(id, node_name.to_string(), props, plugin);
        let rt = node.plugin.rt();
        let driving = node.driving;
        let mut new_ports = Vec::new();
        for port in node.plugin.input_ports() {
            node.add_port(Direction::Input, port)?;
            new_ports.push((Direction::Input, port));
        }
        for port in node.plugin.output_ports() {
            node.add_port(Direction::Output, port)?;
            new_ports.push((Direction::Output, port));
        }
        let _ = self.nodes.insert_at(id.0, node);

        if let Some(process) = rt {
            let result = self.data_loop.invoke(Box::new(move |rt_loop| {
                rt_loop.with_state(|state| {
                    state.add_node(id, RtNode { process, driving });
                    if driving {
                        state.set_driver(Some(id));
                    }
                });
            }));
            if let Err(err) = result {
                tracing::warn!(node = %id, error = %err, "failed to install rt node");
            }
        }

        tracing::info!(node = %id, name = node_name, factory = factory_name, "node created");
        self.update_node_state(id, NodeState::Suspended);
        for (direction, port) in new_ports {
            self.node_events.emit(&NodeEvent::PortAdded { node: id, direction, port });
        }
        self.announce_global(id);
        Ok(id)
    }

    /// Removes a node: tears down incident links, unsplices the rt side,
    /// retires the global.
    pub fn destroy_node(&mut self, id: ObjectId) {
        let Some(node) = self.node(id) else { return };

        // Collect the ports first; link teardown mutates the lists.
        let mut ports: Vec<(Direction, u32)> = Vec::new();
        for direction in [Direction::Output, Direction::Input] {
            for port in node.ports(direction) {
                ports.push((direction, port.id));
            }
        }
        for (direction, port) in ports {
            self.on_port_destroyed(id, direction, port);
        }

        let _ = self.data_loop.invoke(Box::new(move |rt_loop| {
            rt_loop.with_state(|state| state.remove_node(id));
        }));

        self.work.cancel(Some(id), None);
        self.nodes.remove(id.0);
        if self.registry.remove(id).is_some() {
            self.global_events.emit(&GlobalEvent::Removed { id });
            self.notify_global_removed(id);
        }
        tracing::info!(node = %id, "node destroyed");
    }

    /// Applies a node state and fires the change notification.
    pub fn update_node_state(&mut self, id: ObjectId, new: NodeState) {
        let Some(node) = self.node_mut(id) else { return };
        if node.state == new {
            return;
        }
        // Error is sticky until destruction.
        if matches!(node.state, NodeState::Error(_)) {
            return;
        }
        let old = std::mem::replace(&mut node.state, new.clone());
        let driving = node.driving;
        tracing::debug!(node = %id, from = old.as_str(), to = new.as_str(), "node state");

        if driving {
            let interval =
                if matches!(new, NodeState::Running) { Some(DEFAULT_QUANTUM) } else { None };
            let _ = self
                .data_loop
                .invoke(Box::new(move |rt_loop| rt_loop.set_interval(interval)));
        }
        self.node_events.emit(&NodeEvent::StateChanged { node: id, old, new });
    }

    /// Commands a state transition through the plugin. Async transitions
    /// settle through the work queue.
    pub fn node_set_state(&mut self, id: ObjectId, target: NodeState) -> Result<Completion> {
        let command = match &target {
            NodeState::Running => NodeCommand::Start,
            NodeState::Idle => NodeCommand::Pause,
            NodeState::Suspended => NodeCommand::Suspend,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "cannot request node state '{}'",
                    other.as_str()
                )))
            },
        };
        self.node_events.emit(&NodeEvent::StateRequested { node: id, target: target.clone() });

        let node =
            self.node_mut(id).ok_or(Error::UnknownObject(id.0))?;
        if matches!(node.state, NodeState::Error(_)) {
            return Err(Error::InvalidArgument("node is in error".into()));
        }
        let completion = node.plugin.send_command(command)?;

        if matches!(target, NodeState::Suspended) {
            self.suspend_ports(id);
        }
        match completion {
            Completion::Done => self.update_node_state(id, target),
            Completion::Async(seq) => {
                let wanted = target;
                self.work.add(
                    id,
                    WorkInput::Async(seq),
                    Box::new(move |ctx: &mut Context, res| match res {
                        Ok(()) => ctx.update_node_state(id, wanted),
                        Err(reason) => ctx.report_node_error(id, reason),
                    }),
                );
            },
        }
        Ok(completion)
    }

    /// Clears formats and buffers on every port; they fall back to
    /// `Configure`.
    fn suspend_ports(&mut self, id: ObjectId) {
        let Some(node) = self.node_mut(id) else { return };
        let mut to_clear = Vec::new();
        for direction in [Direction::Input, Direction::Output] {
            for port in node.ports(direction) {
                to_clear.push((direction, port.id));
            }
        }
        for (direction, port_id) in to_clear {
            let Some(node) = self.node_mut(id) else { return };
            let _ = node.plugin.port_use_buffers(direction, port_id, None);
            let _ = node.plugin.port_set_format(direction, port_id, None);
            if let Some(port) = node.port_mut(direction, port_id) {
                port.clear_format();
            }
        }
    }

    /// Moves the node into the sticky error state, taking ownership of the
    /// message.
    pub fn report_node_error(&mut self, id: ObjectId, message: String) {
        let Some(node) = self.node_mut(id) else { return };
        if matches!(node.state, NodeState::Error(_)) {
            return;
        }
        let old = std::mem::replace(&mut node.state, NodeState::Error(message.clone()));
        tracing::warn!(node = %id, error = %message, "node error");
        self.node_events.emit(&NodeEvent::StateChanged {
            node: id,
            old,
            new: NodeState::Error(message),
        });
    }

    /// Handles a plugin acknowledgement: completes parked work and drains.
    pub fn async_complete(&mut self, done: &AsyncComplete) {
        let matched = self.work.complete(done.node, done.seq, &done.result);
        if !matched {
            tracing::debug!(obj = %done.node, seq = %done.seq, "completion matched no work item");
        }
    }

    /// Runs everything the work queue will release right now.
    pub fn drain_work(&mut self) {
        loop {
            let ready = self.work.take_ready();
            if ready.is_empty() {
                break;
            }
            for (_obj, res, func) in ready {
                func(self, res);
            }
        }
    }

    // ---- globals --------------------------------------------------------

    /// Destroys any global by id, cascading by kind.
    pub fn destroy_global(&mut self, id: ObjectId) {
        let Some(kind) = self.registry.get(id).map(|g| g.kind.clone()) else { return };
        match kind {
            crate::registry::GlobalKind::Node => self.destroy_node(id),
            crate::registry::GlobalKind::Link => self.link_destroy(id),
            crate::registry::GlobalKind::Client => self.destroy_client(id),
            crate::registry::GlobalKind::Core => {},
            crate::registry::GlobalKind::Factory(name) => {
                self.factories.shift_remove(&name);
                if self.registry.remove(id).is_some() {
                    self.global_events.emit(&GlobalEvent::Removed { id });
                    self.notify_global_removed(id);
                }
            },
            crate::registry::GlobalKind::Module(_) => {
                if self.registry.remove(id).is_some() {
                    self.global_events.emit(&GlobalEvent::Removed { id });
                    self.notify_global_removed(id);
                }
            },
        }
    }
}

// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The graph actor: the single task that owns the [`Context`] and serializes
//! every mutation, plus the typed handle other tasks use to reach it.

use crate::access::{AccessPolicy, Decision, DispatchCheck, RequestKind};
use crate::client::Ucred;
use crate::client_node::ClientNodePlugin;
use crate::context::Context;
use crate::data_loop::DataLoop;
use crate::events::{
    AsyncComplete, ClientEvent, EventPayload, GlobalEvent, LinkEvent, NodeEvent,
};
use crate::factory::FactoryDef;
use crate::link::BufferOwner;
use crate::node::Node;
use crate::registry::GlobalKind;
use crate::work_queue::WorkInput;
use patchbay_core::{
    Direction, Error, LinkState, MediaFormat, NodeState, ObjectId, PortState, Properties, Result,
};
use tokio::sync::{mpsc, oneshot};

/// Requests arriving from clients, already demarshalled by the protocol.
#[derive(Debug)]
pub enum Request {
    ClientUpdate { props: Properties },
    Sync { seq: u32 },
    GetRegistry { new_id: ObjectId },
    Bind { id: ObjectId, version: u32, new_id: ObjectId },
    CreateNode { factory: String, name: String, props: Properties, new_id: ObjectId },
    CreateClientNode { name: String, props: Properties, new_id: ObjectId },
    NodeRemove,
    PortUpdate { direction: Direction, port: u32, formats: Vec<MediaFormat> },
    Destroy,
}

impl Request {
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::ClientUpdate { .. } => RequestKind::ClientUpdate,
            Self::Sync { .. } => RequestKind::Sync,
            Self::GetRegistry { .. } => RequestKind::GetRegistry,
            Self::Bind { .. } => RequestKind::Bind,
            Self::CreateNode { .. } => RequestKind::CreateNode,
            Self::CreateClientNode { .. } => RequestKind::CreateClientNode,
            Self::NodeRemove => RequestKind::NodeRemove,
            Self::PortUpdate { .. } => RequestKind::ClientNodeUpdate,
            Self::Destroy => RequestKind::Destroy,
        }
    }
}

/// Read-only view of a port, for inspection and tests.
#[derive(Debug, Clone)]
pub struct PortSnapshot {
    pub id: u32,
    pub direction: Direction,
    pub state: PortState,
    pub format: Option<MediaFormat>,
    pub allocated: bool,
    pub pool_block: Option<u32>,
    pub pool_len: usize,
}

/// Read-only view of a node.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: ObjectId,
    pub name: String,
    pub state: NodeState,
    pub live: bool,
    pub n_used_input_links: u32,
    pub n_used_output_links: u32,
    pub ports: Vec<PortSnapshot>,
}

/// Read-only view of a link.
#[derive(Debug, Clone)]
pub struct LinkSnapshot {
    pub id: ObjectId,
    pub state: LinkState,
    pub pool_block: Option<u32>,
    pub pool_len: usize,
    pub link_owns_buffers: bool,
}

/// Commands the handle sends to the actor.
pub enum Command {
    NewClient {
        creds: Option<Ucred>,
        props: Properties,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
        reply: oneshot::Sender<ObjectId>,
    },
    ClientGone {
        client: ObjectId,
    },
    Request {
        client: ObjectId,
        resource: ObjectId,
        request: Request,
    },
    RegisterFactory {
        factory: FactoryDef,
        reply: oneshot::Sender<ObjectId>,
    },
    AddAccessPolicy {
        policy: Box<dyn AccessPolicy>,
    },
    CreateNode {
        factory: String,
        name: String,
        props: Properties,
        owner: Option<ObjectId>,
        reply: oneshot::Sender<Result<ObjectId>>,
    },
    CreateLink {
        output: (ObjectId, u32),
        input: (ObjectId, u32),
        filters: Vec<MediaFormat>,
        owner: Option<ObjectId>,
        reply: oneshot::Sender<Result<ObjectId>>,
    },
    ActivateLink {
        link: ObjectId,
    },
    SetNodeState {
        node: ObjectId,
        state: NodeState,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    DestroyGlobal {
        id: ObjectId,
    },
    SubscribeGlobals {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<GlobalEvent>>,
    },
    SubscribeNodes {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<NodeEvent>>,
    },
    SubscribeLinks {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<LinkEvent>>,
    },
    Describe {
        reply: oneshot::Sender<(patchbay_core::TypeMap, patchbay_core::format::FormatTypes)>,
    },
    NodeSnapshot {
        node: ObjectId,
        reply: oneshot::Sender<Option<NodeSnapshot>>,
    },
    LinkSnapshot {
        link: ObjectId,
        reply: oneshot::Sender<Option<LinkSnapshot>>,
    },
    Shutdown,
}

/// Cloneable typed handle to the actor.
#[derive(Clone)]
pub struct GraphHandle {
    tx: mpsc::UnboundedSender<Command>,
}

macro_rules! ask {
    ($self:ident, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (reply, rx) = oneshot::channel();
        $self
            .tx
            .send(Command::$variant { $($field: $value,)* reply })
            .map_err(|_| Error::Io(std::io::Error::other("graph actor is gone")))?;
        rx.await.map_err(|_| Error::Io(std::io::Error::other("graph actor dropped the reply")))
    }};
}

impl GraphHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::Io(std::io::Error::other("graph actor is gone")))
    }

    pub async fn new_client(
        &self,
        creds: Option<Ucred>,
        props: Properties,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<ObjectId> {
        ask!(self, NewClient { creds: creds, props: props, event_tx: event_tx })
    }

    pub fn client_gone(&self, client: ObjectId) {
        let _ = self.send(Command::ClientGone { client });
    }

    pub fn request(&self, client: ObjectId, resource: ObjectId, request: Request) -> Result<()> {
        self.send(Command::Request { client, resource, request })
    }

    pub async fn register_factory(&self, factory: FactoryDef) -> Result<ObjectId> {
        ask!(self, RegisterFactory { factory: factory })
    }

    pub fn add_access_policy(&self, policy: Box<dyn AccessPolicy>) -> Result<()> {
        self.send(Command::AddAccessPolicy { policy })
    }

    pub async fn create_node(
        &self,
        factory: &str,
        name: &str,
        props: Properties,
        owner: Option<ObjectId>,
    ) -> Result<ObjectId> {
        ask!(self, CreateNode {
            factory: factory.to_string(),
            name: name.to_string(),
            props: props,
            owner: owner,
        })?
    }

    pub async fn create_link(
        &self,
        output: (ObjectId, u32),
        input: (ObjectId, u32),
        filters: Vec<MediaFormat>,
    ) -> Result<ObjectId> {
        ask!(self, CreateLink { output: output, input: input, filters: filters, owner: None })?
    }

    pub fn activate_link(&self, link: ObjectId) -> Result<()> {
        self.send(Command::ActivateLink { link })
    }

    pub async fn set_node_state(&self, node: ObjectId, state: NodeState) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetNodeState { node, state, reply: Some(reply) })?;
        rx.await
            .map_err(|_| Error::Io(std::io::Error::other("graph actor dropped the reply")))?
    }

    pub fn set_node_state_nowait(&self, node: ObjectId, state: NodeState) -> Result<()> {
        self.send(Command::SetNodeState { node, state, reply: None })
    }

    pub fn destroy_global(&self, id: ObjectId) -> Result<()> {
        self.send(Command::DestroyGlobal { id })
    }

    pub async fn subscribe_globals(&self) -> Result<mpsc::UnboundedReceiver<GlobalEvent>> {
        ask!(self, SubscribeGlobals {})
    }

    pub async fn subscribe_nodes(&self) -> Result<mpsc::UnboundedReceiver<NodeEvent>> {
        ask!(self, SubscribeNodes {})
    }

    pub async fn subscribe_links(&self) -> Result<mpsc::UnboundedReceiver<LinkEvent>> {
        ask!(self, SubscribeLinks {})
    }

    pub async fn describe(
        &self,
    ) -> Result<(patchbay_core::TypeMap, patchbay_core::format::FormatTypes)> {
        ask!(self, Describe {})
    }

    pub async fn node_snapshot(&self, node: ObjectId) -> Result<Option<NodeSnapshot>> {
        ask!(self, NodeSnapshot { node: node })
    }

    pub async fn link_snapshot(&self, link: ObjectId) -> Result<Option<LinkSnapshot>> {
        ask!(self, LinkSnapshot { link: link })
    }

    pub fn shutdown(&self) {
        let _ = self.send(Command::Shutdown);
    }
}

/// The actor itself. Owns the context, the data loop, and the command
/// receiver; `run` consumes it.
pub struct GraphActor {
    ctx: Context,
    data_loop: DataLoop,
    rx: mpsc::UnboundedReceiver<Command>,
    completions: mpsc::UnboundedReceiver<AsyncComplete>,
}

impl GraphActor {
    /// Builds the actor and spawns the data-loop thread. Fatal when the
    /// thread cannot start.
    pub fn new(name: impl Into<String>, props: Properties) -> Result<(Self, GraphHandle)> {
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let data_loop = DataLoop::spawn(completion_tx.clone())?;
        let ctx = Context::new(name, props, data_loop.handle(), completion_tx);
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((Self { ctx, data_loop, rx, completions }, GraphHandle { tx }))
    }

    /// The actor loop. Single writer for the whole context.
    pub async fn run(mut self) {
        tracing::info!(core = %self.ctx.name, "graph actor running");
        let work_notify = self.ctx.work.notifier();
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                },
                done = self.completions.recv() => {
                    if let Some(done) = done {
                        self.ctx.async_complete(&done);
                    }
                },
                () = work_notify.notified() => {},
            }
            self.ctx.drain_work();
        }
        tracing::info!(core = %self.ctx.name, "graph actor shutting down");
        self.data_loop.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        let ctx = &mut self.ctx;
        match command {
            Command::NewClient { creds, props, event_tx, reply } => {
                let _ = reply.send(ctx.add_client(creds, props, event_tx));
            },
            Command::ClientGone { client } => ctx.destroy_client(client),
            Command::Request { client, resource, request } => {
                ctx.dispatch(client, resource, request);
            },
            Command::RegisterFactory { factory, reply } => {
                let _ = reply.send(ctx.register_factory(factory));
            },
            Command::AddAccessPolicy { policy } => ctx.access.add(policy),
            Command::CreateNode { factory, name, props, owner, reply } => {
                let _ = reply.send(ctx.create_node(&factory, &name, props, owner));
            },
            Command::CreateLink { output, input, filters, owner, reply } => {
                let _ = reply.send(ctx.create_link(output, input, filters, owner));
            },
            Command::ActivateLink { link } => ctx.link_activate(link),
            Command::SetNodeState { node, state, reply } => {
                let result = ctx.node_set_state(node, state).map(|_| ());
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            },
            Command::DestroyGlobal { id } => ctx.destroy_global(id),
            Command::SubscribeGlobals { reply } => {
                let _ = reply.send(ctx.global_events.subscribe());
            },
            Command::SubscribeNodes { reply } => {
                let _ = reply.send(ctx.node_events.subscribe());
            },
            Command::SubscribeLinks { reply } => {
                let _ = reply.send(ctx.link_events.subscribe());
            },
            Command::Describe { reply } => {
                let _ = reply.send((ctx.types.clone(), ctx.format_types.clone()));
            },
            Command::NodeSnapshot { node, reply } => {
                let _ = reply.send(ctx.node_snapshot(node));
            },
            Command::LinkSnapshot { link, reply } => {
                let _ = reply.send(ctx.link_snapshot(link));
            },
            Command::Shutdown => {},
        }
    }
}

impl Context {
    /// Entry point for every client request: resolves the resource, runs the
    /// dispatch hook chain, then executes.
    ///
    /// An unknown resource id is a framing-level fault and tears the client
    /// down, which closes its connection.
    pub fn dispatch(&mut self, client_id: ObjectId, resource: ObjectId, request: Request) {
        let Some(client) = self.client(client_id) else { return };
        let Some(res) = client.resource(resource) else {
            tracing::error!(client = %client_id, resource = %resource, "unknown resource id");
            self.destroy_client(client_id);
            return;
        };
        let resource_type = res.type_id;
        let resource_global = res.global;
        let client_uid = client.uid();

        let target = match &request {
            Request::Bind { id, .. } => self.global_info(*id),
            _ => None,
        };
        let check = DispatchCheck {
            client: client_id,
            client_uid,
            resource_type,
            registry_type: self.iface.registry,
            request: request.kind(),
            target: target.as_ref(),
        };
        if self.access.check_dispatch(&check) == Decision::Deny {
            self.client_error(client_id, resource, &Error::NoPermission);
            return;
        }

        if let Err(err) = self.execute(client_id, resource, resource_global, request) {
            tracing::debug!(client = %client_id, resource = %resource, error = %err, "request failed");
            self.client_error(client_id, resource, &err);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn execute(
        &mut self,
        client_id: ObjectId,
        resource: ObjectId,
        resource_global: ObjectId,
        request: Request,
    ) -> Result<()> {
        match request {
            Request::ClientUpdate { props } => {
                let client_obj = self
                    .client_mut(client_id)
                    .ok_or(Error::UnknownObject(client_id.0))?;
                client_obj.props.update(&props);
                let updated = client_obj.props.clone();
                self.client_send(
                    client_id,
                    resource,
                    EventPayload::ClientInfo { id: client_id, props: updated.clone() },
                );
                // Re-broadcast to everyone holding a resource bound to this
                // client's global.
                for holder in self.client_ids() {
                    let locals = self
                        .client(holder)
                        .map(|c| c.resources_for_global(client_id))
                        .unwrap_or_default();
                    for local in locals {
                        self.client_send(
                            holder,
                            local,
                            EventPayload::ClientInfo { id: client_id, props: updated.clone() },
                        );
                    }
                }
                Ok(())
            },
            Request::Sync { seq } => {
                // Round-trips through the work queue: DONE fires only after
                // everything queued before it has completed.
                self.work.add(
                    client_id,
                    WorkInput::WaitSync,
                    Box::new(move |ctx: &mut Context, _res| {
                        ctx.client_send(client_id, ObjectId::CORE, EventPayload::Done { seq });
                    }),
                );
                Ok(())
            },
            Request::GetRegistry { new_id } => {
                let registry_type = self.iface.registry;
                let client = self
                    .client_mut(client_id)
                    .ok_or(Error::UnknownObject(client_id.0))?;
                client.add_resource(new_id, registry_type, ObjectId::CORE)?;
                // Replay the visible part of the registry.
                for global in self.registry.iter().map(|g| (g.id, g.type_id)).collect::<Vec<_>>() {
                    let type_uri = self
                        .types
                        .uri_of(global.1)
                        .map_or_else(|| "unknown".to_string(), |u| u.to_string());
                    self.client_send(
                        client_id,
                        new_id,
                        EventPayload::NotifyGlobal { id: global.0, type_uri },
                    );
                }
                Ok(())
            },
            Request::Bind { id, version: _, new_id } => self.bind_global(client_id, id, new_id),
            Request::CreateNode { factory, name, props, new_id } => {
                let node = self.create_node(&factory, &name, props, Some(client_id))?;
                self.bind_global(client_id, node, new_id)
            },
            Request::CreateClientNode { name, props, new_id } => {
                let node = self.create_client_node(client_id, &name, props, new_id)?;
                self.bind_global(client_id, node, new_id)
            },
            Request::NodeRemove | Request::Destroy => {
                let global = self
                    .registry
                    .get(resource_global)
                    .ok_or(Error::UnknownObject(resource_global.0))?;
                if global.owner != Some(client_id) {
                    return Err(Error::NoPermission);
                }
                self.destroy_global(resource_global);
                Ok(())
            },
            Request::PortUpdate { direction, port, formats } => {
                self.client_node_port_update(client_id, resource_global, direction, port, formats)
            },
        }
    }

    /// Creates a per-client resource for `global` and sends the initial info
    /// event.
    ///
    /// Both hook chains gate a bind: the dispatch chain already ran on the
    /// request, and the send chain must admit the global's advertisement.
    pub fn bind_global(
        &mut self,
        client_id: ObjectId,
        global_id: ObjectId,
        new_id: ObjectId,
    ) -> Result<()> {
        let global = self
            .registry
            .get(global_id)
            .ok_or(Error::UnknownObject(global_id.0))?;
        let type_id = global.type_id;
        let kind = global.kind.clone();

        let client_uid = self.client(client_id).and_then(crate::client::Client::uid);
        let subject = self.global_info(global_id);
        let send_check = crate::access::SendCheck {
            client: client_id,
            client_uid,
            resource_type: self.iface.registry,
            registry_type: self.iface.registry,
            event: crate::events::EventKind::NotifyGlobal,
            subject: subject.as_ref(),
        };
        if self.access.check_send(&send_check) != Decision::Allow {
            return Err(Error::NoPermission);
        }

        let client = self.client_mut(client_id).ok_or(Error::UnknownObject(client_id.0))?;
        client.add_resource(new_id, type_id, global_id)?;
        tracing::debug!(client = %client_id, global = %global_id, local = %new_id, "bound");

        let info = match kind {
            GlobalKind::Core => Some(EventPayload::CoreInfo {
                props: self.props.clone(),
                name: self.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                cookie: std::process::id(),
            }),
            GlobalKind::Node => self.node(global_id).map(|node| EventPayload::NodeInfo {
                id: global_id,
                name: node.name.clone(),
                state: node.state.clone(),
                props: node.props.clone(),
            }),
            GlobalKind::Link => self.link(global_id).map(|link| EventPayload::LinkInfo {
                id: global_id,
                output_node: link.output.map_or(ObjectId::INVALID, |p| p.node),
                output_port: link.output.map_or(u32::MAX, |p| p.port),
                input_node: link.input.map_or(ObjectId::INVALID, |p| p.node),
                input_port: link.input.map_or(u32::MAX, |p| p.port),
                state: link.state.clone(),
            }),
            GlobalKind::Client => self.client(global_id).map(|c| EventPayload::ClientInfo {
                id: global_id,
                props: c.props.clone(),
            }),
            GlobalKind::Factory(_) | GlobalKind::Module(_) => None,
        };
        if let Some(info) = info {
            self.client_send(client_id, new_id, info);
        }
        Ok(())
    }

    /// Creates a node whose implementation lives in the client.
    fn create_client_node(
        &mut self,
        client_id: ObjectId,
        name: &str,
        props: Properties,
        resource: ObjectId,
    ) -> Result<ObjectId> {
        let client = self.client(client_id).ok_or(Error::UnknownObject(client_id.0))?;
        let event_tx = client.event_sender();
        let plugin =
            ClientNodePlugin::new(event_tx, resource, self.mempool.clone());

        let id = self.registry.add(
            Some(client_id),
            self.iface.client_node,
            0,
            GlobalKind::Node,
        );
        let mut props = props;
        props.update(&crate::client_node::client_node_props(client_id));
        let mut node = Node::new(id, name.to_string(), props, Box::new(plugin));
        node.state = NodeState::Suspended;
        let _ = self.nodes.insert_at(id.0, node);
        self.announce_global(id);
        Ok(id)
    }

    /// Applies a `PORT_UPDATE` from the owning client to its client node.
    fn client_node_port_update(
        &mut self,
        client_id: ObjectId,
        node_id: ObjectId,
        direction: Direction,
        port: u32,
        formats: Vec<MediaFormat>,
    ) -> Result<()> {
        let global = self.registry.get(node_id).ok_or(Error::UnknownObject(node_id.0))?;
        if global.owner != Some(client_id) {
            return Err(Error::NoPermission);
        }
        let node = self.node_mut(node_id).ok_or(Error::UnknownObject(node_id.0))?;
        let added = node.port(direction, port).is_none();
        if added {
            node.add_port(direction, port)?;
        }
        node.plugin.port_update(direction, port, formats)?;
        if added {
            self.node_events
                .emit(&crate::events::NodeEvent::PortAdded { node: node_id, direction, port });
        }
        Ok(())
    }

    pub fn node_snapshot(&self, id: ObjectId) -> Option<NodeSnapshot> {
        let node = self.node(id)?;
        let mut ports = Vec::new();
        for direction in [Direction::Input, Direction::Output] {
            for port in node.ports(direction) {
                ports.push(PortSnapshot {
                    id: port.id,
                    direction,
                    state: port.state,
                    format: port.format.clone(),
                    allocated: port.allocated,
                    pool_block: port.buffers.as_ref().map(|p| p.block.0),
                    pool_len: port.buffers.as_ref().map_or(0, |p| p.len()),
                });
            }
        }
        Some(NodeSnapshot {
            id,
            name: node.name.clone(),
            state: node.state.clone(),
            live: node.live,
            n_used_input_links: node.n_used_input_links,
            n_used_output_links: node.n_used_output_links,
            ports,
        })
    }

    pub fn link_snapshot(&self, id: ObjectId) -> Option<LinkSnapshot> {
        let link = self.link(id)?;
        Some(LinkSnapshot {
            id,
            state: link.state.clone(),
            pool_block: link.buffers.as_ref().map(|p| p.block.0),
            pool_len: link.buffers.as_ref().map_or(0, |p| p.len()),
            link_owns_buffers: matches!(link.buffer_owner, Some(BufferOwner::Link)),
        })
    }
}

// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Nodes: media processing units driven by pluggable implementations.
//!
//! The control side of a node is a [`NodePlugin`] trait object owned by the
//! graph; the real-time side is an optional [`RtProcess`] installed on the
//! data loop. A plugin call either finishes inline (`Completion::Done`) or
//! hands back a sequence number it will later acknowledge through its
//! [`AsyncNotify`] handle.

use crate::events::AsyncComplete;
use crate::port::Port;
use indexmap::IndexMap;
use patchbay_core::{
    BufferPool, Completion, Direction, Error, MediaFormat, MemMap, MetaKind, NodeCommand,
    NodeState, ObjectId, Properties, Result, SeqId,
};
use std::ops::BitOr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Capability flags a port reports from `port_get_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortFlags(pub u32);

impl PortFlags {
    pub const NONE: Self = Self(0);
    /// The port can adopt buffers allocated elsewhere.
    pub const CAN_USE_BUFFERS: Self = Self(1 << 0);
    /// The port can allocate buffers itself.
    pub const CAN_ALLOC_BUFFERS: Self = Self(1 << 1);
    /// The port produces live data; nodes on a live path must not be
    /// rescheduled freely.
    pub const LIVE: Self = Self(1 << 2);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PortFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Buffer sizing preferences a port reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferHints {
    /// Minimum data size per buffer; 0 means "no preference".
    pub size: u32,
    pub stride: u32,
    /// Maximum usable buffer count; 0 means "no preference".
    pub buffers: u32,
}

/// Ring-buffer metadata parameters, when a port asks for that mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingbufferParams {
    pub size: u32,
    pub stride: u32,
}

/// Everything `port_get_info` reports about a port.
#[derive(Debug, Clone, Default)]
pub struct PortCaps {
    pub flags: PortFlags,
    pub hints: BufferHints,
    /// Metadata kinds the port wants on each buffer (`Shared` is implied).
    pub metas: Vec<MetaKind>,
    pub ringbuffer: Option<RingbufferParams>,
}

/// Handle a plugin uses to acknowledge asynchronous operations.
#[derive(Debug, Clone)]
pub struct AsyncNotify {
    node: ObjectId,
    tx: mpsc::UnboundedSender<AsyncComplete>,
}

impl AsyncNotify {
    pub fn new(node: ObjectId, tx: mpsc::UnboundedSender<AsyncComplete>) -> Self {
        Self { node, tx }
    }

    /// Reports completion of `seq`. Safe to call from any thread.
    pub fn complete(&self, seq: SeqId, result: std::result::Result<(), String>) {
        let _ = self.tx.send(AsyncComplete { node: self.node, seq, result });
    }
}

/// An I/O region shared with the plugin's real-time side.
#[derive(Debug, Clone)]
pub struct IoArea {
    pub map: MemMap,
}

/// Events the real-time side produces while processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtEvent {
    /// An output port filled `buffer`.
    HaveBuffer { direction: Direction, port: u32, buffer: u32 },
    /// An input port is done with `buffer`; hand it back to the producer.
    ReuseBuffer { direction: Direction, port: u32, buffer: u32 },
}

/// Context handed to the real-time process callback.
pub struct RtContext<'a> {
    pub now_ns: u64,
    /// Events to propagate along the rt link chain after the callback.
    pub events: &'a mut Vec<RtEvent>,
}

/// The real-time face of a node. Runs only on the data loop.
pub trait RtProcess: Send + Sync {
    /// One processing cycle, fired from the driving clock.
    fn process(&self, ctx: &mut RtContext<'_>);

    /// A linked output delivered `buffer` to this node's input `port`.
    fn receive_buffer(&self, port: u32, buffer: u32) {
        let _ = (port, buffer);
    }

    /// A linked input recycled `buffer` back to this node's output `port`.
    fn recycle_buffer(&self, port: u32, buffer: u32) {
        let _ = (port, buffer);
    }
}

/// A clock capability; the driving node's clock advances graph time.
pub trait Clock: Send + Sync {
    /// Current media time in nanoseconds.
    fn get_time(&self) -> u64;
}

/// The pluggable node implementation the graph drives.
///
/// Mutating operations return [`Completion`]: `Done` when applied inline,
/// `Async(seq)` when the plugin will acknowledge later through the
/// [`AsyncNotify`] it received in [`NodePlugin::attach`].
pub trait NodePlugin: Send {
    /// Called once when the node is added to the graph.
    fn attach(&mut self, notify: AsyncNotify) {
        let _ = notify;
    }

    /// Numeric ids of the input ports this node starts with.
    fn input_ports(&self) -> Vec<u32> {
        Vec::new()
    }

    /// Numeric ids of the output ports this node starts with.
    fn output_ports(&self) -> Vec<u32> {
        Vec::new()
    }

    fn port_get_info(&self, direction: Direction, port: u32) -> Result<PortCaps>;

    /// Formats the port can carry, in preference order.
    fn port_enum_formats(&self, direction: Direction, port: u32) -> Result<Vec<MediaFormat>>;

    /// Updates a port's declared formats. Only meaningful for nodes whose
    /// ports are described from outside (client nodes).
    fn port_update(
        &mut self,
        direction: Direction,
        port: u32,
        formats: Vec<MediaFormat>,
    ) -> Result<()> {
        let _ = (direction, port, formats);
        Err(Error::InvalidArgument("node does not accept port updates".into()))
    }

    /// Applies (or with `None`, clears) the port format.
    fn port_set_format(
        &mut self,
        direction: Direction,
        port: u32,
        format: Option<&MediaFormat>,
    ) -> Result<Completion>;

    /// Points the port at an externally owned buffer pool (or clears it).
    fn port_use_buffers(
        &mut self,
        direction: Direction,
        port: u32,
        buffers: Option<Arc<BufferPool>>,
    ) -> Result<Completion>;

    /// Lets the port allocate its own pool. Only meaningful for ports that
    /// report `CAN_ALLOC_BUFFERS`.
    fn port_alloc_buffers(
        &mut self,
        direction: Direction,
        port: u32,
        hints: &BufferHints,
    ) -> Result<(Arc<BufferPool>, Completion)> {
        let _ = (direction, port, hints);
        Err(Error::InvalidArgument("port cannot allocate buffers".into()))
    }

    /// Installs an I/O region on the port.
    fn port_set_io(&mut self, direction: Direction, port: u32, io: Option<IoArea>) -> Result<()> {
        let _ = (direction, port, io);
        Ok(())
    }

    /// Lifecycle command (start, pause, suspend).
    fn send_command(&mut self, command: NodeCommand) -> Result<Completion>;

    fn clock(&self) -> Option<Arc<dyn Clock>> {
        None
    }

    /// The real-time side to install on the data loop, if the node processes.
    fn rt(&self) -> Option<Arc<dyn RtProcess>> {
        None
    }
}

/// A node in the graph. All fields live on the control plane.
pub struct Node {
    pub id: ObjectId,
    pub name: String,
    pub props: Properties,
    pub state: NodeState,
    pub plugin: Box<dyn NodePlugin>,
    pub clock: Option<Arc<dyn Clock>>,
    /// Set while any incident link carries live data.
    pub live: bool,
    /// This node's clock drives its subgraph.
    pub driving: bool,
    pub n_used_input_links: u32,
    pub n_used_output_links: u32,
    input_ports: IndexMap<u32, Port>,
    output_ports: IndexMap<u32, Port>,
}

impl Node {
    pub fn new(id: ObjectId, name: String, props: Properties, plugin: Box<dyn NodePlugin>) -> Self {
        let clock = plugin.clock();
        Self {
            id,
            name,
            props,
            state: NodeState::Creating,
            driving: clock.is_some(),
            clock,
            plugin,
            live: false,
            n_used_input_links: 0,
            n_used_output_links: 0,
            input_ports: IndexMap::new(),
            output_ports: IndexMap::new(),
        }
    }

    fn ports_of(&self, direction: Direction) -> &IndexMap<u32, Port> {
        match direction {
            Direction::Input => &self.input_ports,
            Direction::Output => &self.output_ports,
        }
    }

    fn ports_of_mut(&mut self, direction: Direction) -> &mut IndexMap<u32, Port> {
        match direction {
            Direction::Input => &mut self.input_ports,
            Direction::Output => &mut self.output_ports,
        }
    }

    /// Adds a port. Returns an error when the numeric id is taken.
    pub fn add_port(&mut self, direction: Direction, port_id: u32) -> Result<()> {
        let ports = self.ports_of_mut(direction);
        if ports.contains_key(&port_id) {
            return Err(Error::InvalidArgument(format!(
                "{} port {port_id} already exists",
                direction.as_str()
            )));
        }
        ports.insert(port_id, Port::new(port_id, direction));
        Ok(())
    }

    pub fn remove_port(&mut self, direction: Direction, port_id: u32) -> Option<Port> {
        // shift_remove keeps the insertion order of the survivors.
        self.ports_of_mut(direction).shift_remove(&port_id)
    }

    pub fn port(&self, direction: Direction, port_id: u32) -> Option<&Port> {
        self.ports_of(direction).get(&port_id)
    }

    pub fn port_mut(&mut self, direction: Direction, port_id: u32) -> Option<&mut Port> {
        self.ports_of_mut(direction).get_mut(&port_id)
    }

    /// Ports in insertion order.
    pub fn ports(&self, direction: Direction) -> impl Iterator<Item = &Port> {
        self.ports_of(direction).values()
    }

    pub fn ports_mut(&mut self, direction: Direction) -> impl Iterator<Item = &mut Port> {
        self.ports_of_mut(direction).values_mut()
    }

    /// First port in `direction` without an active link.
    pub fn get_free_port(&self, direction: Direction) -> Option<&Port> {
        self.ports(direction).find(|port| port.links.is_empty())
    }

    /// Both link counters at zero.
    pub const fn is_unused(&self) -> bool {
        self.n_used_input_links == 0 && self.n_used_output_links == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyPlugin;

    impl NodePlugin for DummyPlugin {
        fn port_get_info(&self, _: Direction, _: u32) -> Result<PortCaps> {
            Ok(PortCaps::default())
        }

        fn port_enum_formats(&self, _: Direction, _: u32) -> Result<Vec<MediaFormat>> {
            Ok(Vec::new())
        }

        fn port_set_format(
            &mut self,
            _: Direction,
            _: u32,
            _: Option<&MediaFormat>,
        ) -> Result<Completion> {
            Ok(Completion::Done)
        }

        fn port_use_buffers(
            &mut self,
            _: Direction,
            _: u32,
            _: Option<Arc<BufferPool>>,
        ) -> Result<Completion> {
            Ok(Completion::Done)
        }

        fn send_command(&mut self, _: NodeCommand) -> Result<Completion> {
            Ok(Completion::Done)
        }
    }

    fn node() -> Node {
        Node::new(ObjectId(1), "test".into(), Properties::new(), Box::new(DummyPlugin))
    }

    #[test]
    fn ports_keep_insertion_order() {
        let mut node = node();
        for id in [3, 1, 2] {
            node.add_port(Direction::Output, id).unwrap();
        }
        let order: Vec<u32> = node.ports(Direction::Output).map(|p| p.id).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn duplicate_port_id_is_rejected() {
        let mut node = node();
        node.add_port(Direction::Input, 0).unwrap();
        assert!(node.add_port(Direction::Input, 0).is_err());
        assert!(node.add_port(Direction::Output, 0).is_ok());
    }

    #[test]
    fn free_port_skips_linked_ports() {
        let mut node = node();
        node.add_port(Direction::Output, 0).unwrap();
        node.add_port(Direction::Output, 1).unwrap();
        node.port_mut(Direction::Output, 0).unwrap().links.push(ObjectId(9));
        assert_eq!(node.get_free_port(Direction::Output).map(|p| p.id), Some(1));
    }

    #[test]
    fn flags_compose() {
        let flags = PortFlags::CAN_USE_BUFFERS | PortFlags::LIVE;
        assert!(flags.contains(PortFlags::CAN_USE_BUFFERS));
        assert!(flags.contains(PortFlags::LIVE));
        assert!(!flags.contains(PortFlags::CAN_ALLOC_BUFFERS));
    }
}

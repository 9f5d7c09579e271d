// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Links: negotiated pairings of an output port and an input port.
//!
//! A link advances through format negotiation, buffer allocation, and start
//! in a deferred `check_states` task that re-posts itself through the work
//! queue whenever a step completes asynchronously. Teardown is two-phase:
//! the control plane retires the link, an invoke unsplices the rt twin on
//! the data loop, and only the completion releases the storage.

use crate::context::Context;
use crate::data_loop::RtLink;
use crate::events::{GlobalEvent, LinkEvent, NodeEvent};
use crate::node::{BufferHints, Node, PortCaps, PortFlags, RingbufferParams};
use crate::registry::GlobalKind;
use crate::work_queue::WorkInput;
use patchbay_core::{
    Buffer, BufferPool, Completion, DataChunk, Direction, Error, LinkState, MediaFormat, MemFlags,
    Meta, MetaKind, NodeState, ObjectId, PortState, Result, SharedRange,
};
use std::sync::Arc;

/// Hard cap on buffers in one pool.
pub const MAX_BUFFERS: u32 = 16;

/// Identifies one port in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRef {
    pub node: ObjectId,
    pub direction: Direction,
    pub port: u32,
}

/// Who allocated the pool a link uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    Link,
    OutputPort,
    InputPort,
}

/// A link between two ports. Port references go `None` when the port is
/// destroyed under the link.
pub struct Link {
    pub id: ObjectId,
    pub output: Option<PortRef>,
    pub input: Option<PortRef>,
    pub filters: Vec<MediaFormat>,
    pub state: LinkState,
    pub buffers: Option<Arc<BufferPool>>,
    pub buffer_owner: Option<BufferOwner>,
    /// Teardown has been scheduled; ignore further destroy requests.
    pub(crate) dying: bool,
}

enum Side {
    Output,
    Input,
}

impl Side {
    const fn name(&self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Input => "input",
        }
    }
}

impl Context {
    // ---- construction ---------------------------------------------------

    /// Creates a link between an output port and an input port and installs
    /// its rt twin on the data loop. The link starts in `Init`; call
    /// [`Context::link_activate`] to begin negotiation.
    pub fn create_link(
        &mut self,
        output: (ObjectId, u32),
        input: (ObjectId, u32),
        filters: Vec<MediaFormat>,
        owner: Option<ObjectId>,
    ) -> Result<ObjectId> {
        let out_ref = PortRef { node: output.0, direction: Direction::Output, port: output.1 };
        let in_ref = PortRef { node: input.0, direction: Direction::Input, port: input.1 };
        for (label, port_ref) in [("output", &out_ref), ("input", &in_ref)] {
            let node = self
                .node(port_ref.node)
                .ok_or(Error::UnknownObject(port_ref.node.0))?;
            node.port(port_ref.direction, port_ref.port).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "node {} has no {label} port {}",
                    port_ref.node, port_ref.port
                ))
            })?;
        }

        let id = self.registry.add(owner, self.iface.link, 0, GlobalKind::Link);
        self.links
            .insert_at(
                id.0,
                Link {
                    id,
                    output: Some(out_ref),
                    input: Some(in_ref),
                    filters,
                    state: LinkState::Init,
                    buffers: None,
                    buffer_owner: None,
                    dying: false,
                },
            )
            .ok();

        if let Some(node) = self.node_mut(out_ref.node) {
            node.n_used_output_links += 1;
            if let Some(port) = node.port_mut(Direction::Output, out_ref.port) {
                port.links.push(id);
            }
        }
        if let Some(node) = self.node_mut(in_ref.node) {
            node.n_used_input_links += 1;
            if let Some(port) = node.port_mut(Direction::Input, in_ref.port) {
                port.links.push(id);
            }
        }

        let rt_link = RtLink {
            link: id,
            output: (out_ref.node, out_ref.port),
            input: (in_ref.node, in_ref.port),
        };
        let _ = self.data_loop.invoke(Box::new(move |rt| {
            rt.with_state(|state| state.add_link(rt_link));
        }));

        tracing::info!(
            link = %id,
            output = %out_ref.node, output_port = out_ref.port,
            input = %in_ref.node, input_port = in_ref.port,
            "link created"
        );
        self.announce_global(id);
        Ok(id)
    }

    /// Queues the first `check_states` pass behind everything already on the
    /// work queue.
    pub fn link_activate(&mut self, id: ObjectId) {
        tracing::debug!(link = %id, "link activate");
        self.schedule_check_states(id);
    }

    fn schedule_check_states(&mut self, id: ObjectId) {
        self.work.add(
            id,
            WorkInput::WaitSync,
            Box::new(move |ctx: &mut Context, _res| ctx.check_states(id)),
        );
    }

    // ---- the state driver -----------------------------------------------

    /// Advances the link as far as the current port states allow. Re-posted
    /// behind async completions; loops while its own actions move the ports.
    pub fn check_states(&mut self, id: ObjectId) {
        loop {
            let Some(link) = self.link(id) else { return };
            if link.dying
                || matches!(link.state, LinkState::Error(_) | LinkState::Unlinked)
            {
                return;
            }
            let (Some(out_ref), Some(in_ref)) = (link.output, link.input) else { return };
            if self.node_in_error(out_ref.node) || self.node_in_error(in_ref.node) {
                return;
            }
            let Some(out_state) = self.port_state(&out_ref) else { return };
            let Some(in_state) = self.port_state(&in_ref) else { return };
            tracing::debug!(
                link = %id,
                output = out_state.as_str(),
                input = in_state.as_str(),
                "check states"
            );

            match self.do_negotiate(id, out_ref, in_ref, out_state, in_state) {
                Err(message) => return self.link_error(id, message),
                Ok(true) => return self.schedule_check_states(id),
                Ok(false) => {},
            }
            match self.do_allocation(id, out_ref, in_ref, out_state, in_state) {
                Err(message) => {
                    self.clear_both_ports(out_ref, in_ref);
                    return self.link_error(id, message);
                },
                Ok(true) => return self.schedule_check_states(id),
                Ok(false) => {},
            }
            match self.do_start(id, out_ref, in_ref, out_state, in_state) {
                Err(message) => return self.link_error(id, message),
                Ok(true) => return self.schedule_check_states(id),
                Ok(false) => {},
            }

            let moved = self.port_state(&out_ref) != Some(out_state)
                || self.port_state(&in_ref) != Some(in_state);
            if !moved {
                return;
            }
        }
    }

    fn node_in_error(&self, id: ObjectId) -> bool {
        self.node(id).is_some_and(|n| matches!(n.state, NodeState::Error(_)))
    }

    fn port_state(&self, port_ref: &PortRef) -> Option<PortState> {
        self.node(port_ref.node)?
            .port(port_ref.direction, port_ref.port)
            .map(|p| p.state)
    }

    // ---- stage N: negotiate ---------------------------------------------

    fn do_negotiate(
        &mut self,
        id: ObjectId,
        out_ref: PortRef,
        in_ref: PortRef,
        mut out_state: PortState,
        mut in_state: PortState,
    ) -> std::result::Result<bool, String> {
        if out_state != PortState::Configure && in_state != PortState::Configure {
            return Ok(false);
        }
        self.update_link_state(id, LinkState::Negotiating);

        let filters = self.link(id).map(|l| l.filters.clone()).unwrap_or_default();
        let format = self.find_format(&out_ref, &in_ref, &filters)?;
        tracing::debug!(link = %id, format = format.media_class(), "negotiated format");

        // A side past configure on an idle node has to renegotiate from
        // scratch; suspend drops it back.
        if out_state > PortState::Configure && self.node_is_idle(out_ref.node) {
            let _ = self.node_set_state(out_ref.node, NodeState::Suspended);
            out_state = PortState::Configure;
        }
        if in_state > PortState::Configure && self.node_is_idle(in_ref.node) {
            let _ = self.node_set_state(in_ref.node, NodeState::Suspended);
            in_state = PortState::Configure;
        }

        let mut pending = false;
        if out_state == PortState::Configure {
            pending |= self
                .apply_format(id, out_ref, &format, Side::Output)
                .map_err(|e| format!("error set output format: {e}"))?;
        }
        if in_state == PortState::Configure {
            pending |= self
                .apply_format(id, in_ref, &format, Side::Input)
                .map_err(|e| format!("error set input format: {e}"))?;
        }
        Ok(pending)
    }

    fn node_is_idle(&self, id: ObjectId) -> bool {
        self.node(id).is_some_and(|n| matches!(n.state, NodeState::Idle))
    }

    fn apply_format(
        &mut self,
        link_id: ObjectId,
        port_ref: PortRef,
        format: &MediaFormat,
        side: Side,
    ) -> Result<bool> {
        let node = self.node_mut(port_ref.node).ok_or(Error::UnknownObject(port_ref.node.0))?;
        let completion =
            node.plugin.port_set_format(port_ref.direction, port_ref.port, Some(format))?;
        if let Some(port) = node.port_mut(port_ref.direction, port_ref.port) {
            port.format = Some(format.clone());
            port.state = PortState::Ready;
        }
        match completion {
            Completion::Done => Ok(false),
            Completion::Async(seq) => {
                let side_name = side.name();
                self.work.add(
                    port_ref.node,
                    WorkInput::Async(seq),
                    Box::new(move |ctx: &mut Context, res| {
                        if let Err(reason) = res {
                            ctx.link_error(
                                link_id,
                                format!("error set {side_name} format: {reason}"),
                            );
                        }
                    }),
                );
                Ok(true)
            },
        }
    }

    /// Enumerates the output's candidates, intersects with the input's, and
    /// applies the link filter set. First survivor wins.
    pub fn find_format(
        &self,
        out_ref: &PortRef,
        in_ref: &PortRef,
        filters: &[MediaFormat],
    ) -> std::result::Result<MediaFormat, String> {
        let out_node =
            self.node(out_ref.node).ok_or_else(|| "output node is gone".to_string())?;
        let in_node = self.node(in_ref.node).ok_or_else(|| "input node is gone".to_string())?;
        let outputs = out_node
            .plugin
            .port_enum_formats(Direction::Output, out_ref.port)
            .map_err(|e| format!("error enum output formats: {e}"))?;
        let inputs = in_node
            .plugin
            .port_enum_formats(Direction::Input, in_ref.port)
            .map_err(|e| format!("error enum input formats: {e}"))?;
        patchbay_core::format::intersect(&outputs, &inputs, filters)
            .cloned()
            .ok_or_else(|| "no common format".to_string())
    }

    // ---- stage A: allocate ----------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn do_allocation(
        &mut self,
        id: ObjectId,
        out_ref: PortRef,
        in_ref: PortRef,
        out_state: PortState,
        in_state: PortState,
    ) -> std::result::Result<bool, String> {
        if out_state != PortState::Ready && in_state != PortState::Ready {
            return Ok(false);
        }
        self.update_link_state(id, LinkState::Allocating);

        let out_caps = self
            .port_caps(&out_ref)
            .map_err(|e| format!("error get output port info: {e}"))?;
        let in_caps =
            self.port_caps(&in_ref).map_err(|e| format!("error get input port info: {e}"))?;

        if (out_caps.flags | in_caps.flags).contains(PortFlags::LIVE) {
            tracing::debug!(link = %id, "link carries live data");
            for node_id in [out_ref.node, in_ref.node] {
                if let Some(node) = self.node_mut(node_id) {
                    node.live = true;
                }
            }
        }

        let mut out_flags = out_caps.flags;
        let mut in_flags = in_caps.flags;
        if in_state == PortState::Ready && out_state == PortState::Ready {
            let out_alloc = out_flags.contains(PortFlags::CAN_ALLOC_BUFFERS);
            let out_use = out_flags.contains(PortFlags::CAN_USE_BUFFERS);
            let in_alloc = in_flags.contains(PortFlags::CAN_ALLOC_BUFFERS);
            let in_use = in_flags.contains(PortFlags::CAN_USE_BUFFERS);
            if out_alloc && in_use {
                out_flags = PortFlags::CAN_ALLOC_BUFFERS;
                in_flags = PortFlags::CAN_USE_BUFFERS;
            } else if out_use && in_alloc {
                out_flags = PortFlags::CAN_USE_BUFFERS;
                in_flags = PortFlags::CAN_ALLOC_BUFFERS;
            } else if out_use && in_use {
                out_flags = PortFlags::CAN_USE_BUFFERS;
                in_flags = PortFlags::CAN_USE_BUFFERS;
            } else if out_alloc && in_alloc {
                // Both insist on allocating; the output side wins and the
                // input adopts its pool.
                out_flags = PortFlags::CAN_ALLOC_BUFFERS;
                in_flags = PortFlags::CAN_USE_BUFFERS;
            } else {
                return Err("no common buffer alloc found".to_string());
            }
        } else if in_state == PortState::Ready {
            // The output side is already past ready on another link; the
            // input must adopt the existing pool.
            out_flags = PortFlags::NONE;
            in_flags = PortFlags::CAN_USE_BUFFERS;
        } else if out_state == PortState::Ready {
            in_flags = PortFlags::NONE;
            out_flags = PortFlags::CAN_USE_BUFFERS;
        } else {
            tracing::debug!(link = %id, "delaying allocation");
            return Ok(false);
        }

        let mut pending = false;
        if self.link(id).is_some_and(|l| l.buffers.is_none()) {
            let (max_buffers, hints) = self.sizing(&out_ref, &out_caps, &in_caps);

            let adopt_out = self.port_buffers(&out_ref);
            let adopt_in = self.port_buffers(&in_ref);
            let (pool, owner) = if let Some(pool) = adopt_out {
                tracing::debug!(link = %id, n = pool.len(), "reusing output buffers");
                out_flags = PortFlags::NONE;
                in_flags = PortFlags::CAN_USE_BUFFERS;
                (pool, BufferOwner::OutputPort)
            } else if let Some(pool) = adopt_in {
                tracing::debug!(link = %id, n = pool.len(), "reusing input buffers");
                out_flags = PortFlags::CAN_USE_BUFFERS;
                in_flags = PortFlags::NONE;
                (pool, BufferOwner::InputPort)
            } else if out_flags.contains(PortFlags::CAN_ALLOC_BUFFERS) {
                let (pool, was_async) = self
                    .alloc_on_port(id, out_ref, &hints, Side::Output)
                    .map_err(|e| format!("error alloc output buffers: {e}"))?;
                pending |= was_async;
                (pool, BufferOwner::OutputPort)
            } else if in_flags.contains(PortFlags::CAN_ALLOC_BUFFERS) {
                let (pool, was_async) = self
                    .alloc_on_port(id, in_ref, &hints, Side::Input)
                    .map_err(|e| format!("error alloc input buffers: {e}"))?;
                pending |= was_async;
                (pool, BufferOwner::InputPort)
            } else {
                let metas = merge_metas(&out_caps, &in_caps);
                let pool = self
                    .allocate_pool(max_buffers, &hints, &metas, out_caps.ringbuffer
                        .zip(in_caps.ringbuffer)
                        .map(|(a, b)| RingbufferParams {
                            size: a.size.max(b.size),
                            stride: a.stride.max(b.stride),
                        }))
                    .map_err(|e| format!("error alloc buffers: {e}"))?;
                tracing::debug!(link = %id, n = pool.len(), "allocated link buffers");
                (pool, BufferOwner::Link)
            };
            if let Some(link) = self.link_mut(id) {
                link.buffers = Some(pool);
                link.buffer_owner = Some(owner);
            }
        }

        let pool = self
            .link(id)
            .and_then(|l| l.buffers.clone())
            .ok_or_else(|| "no common buffer alloc found".to_string())?;

        if in_flags.contains(PortFlags::CAN_USE_BUFFERS)
            && self.port_state(&in_ref) == Some(PortState::Ready)
        {
            pending |= self
                .use_buffers_on_port(id, in_ref, pool.clone(), Side::Input)
                .map_err(|e| format!("error use input buffers: {e}"))?;
        } else if out_flags.contains(PortFlags::CAN_USE_BUFFERS)
            && self.port_state(&out_ref) == Some(PortState::Ready)
        {
            pending |= self
                .use_buffers_on_port(id, out_ref, pool, Side::Output)
                .map_err(|e| format!("error use output buffers: {e}"))?;
        }
        Ok(pending)
    }

    fn port_caps(&self, port_ref: &PortRef) -> Result<PortCaps> {
        let node = self.node(port_ref.node).ok_or(Error::UnknownObject(port_ref.node.0))?;
        node.plugin.port_get_info(port_ref.direction, port_ref.port)
    }

    fn port_buffers(&self, port_ref: &PortRef) -> Option<Arc<BufferPool>> {
        self.node(port_ref.node)?
            .port(port_ref.direction, port_ref.port)?
            .buffers
            .clone()
    }

    /// Combines the hard cap, both ports' hints, and the ring-buffer
    /// override into the effective sizing.
    fn sizing(
        &self,
        out_ref: &PortRef,
        out_caps: &PortCaps,
        in_caps: &PortCaps,
    ) -> (u32, BufferHints) {
        if let (Some(out_ring), Some(in_ring)) = (out_caps.ringbuffer, in_caps.ringbuffer) {
            // Both sides stream through a ring: one large buffer.
            return (
                1,
                BufferHints {
                    size: out_ring.size.max(in_ring.size),
                    stride: out_ring.stride.max(in_ring.stride),
                    buffers: 1,
                },
            );
        }
        let mut max_buffers = MAX_BUFFERS;
        let mut size = 0u32;
        let mut stride = 0u32;
        for hints in [&out_caps.hints, &in_caps.hints] {
            if hints.buffers != 0 {
                max_buffers = max_buffers.min(hints.buffers);
            }
            size = size.max(hints.size);
            stride = stride.max(hints.stride);
        }
        if size == 0 {
            // No preference from either side: size from the negotiated
            // format.
            if let Some(format) = self
                .node(out_ref.node)
                .and_then(|n| n.port(Direction::Output, out_ref.port))
                .and_then(|p| p.format.as_ref())
            {
                size = format.default_buffer_size();
                if stride == 0 {
                    stride = format.default_stride();
                }
            } else {
                size = 4096;
            }
        }
        (max_buffers, BufferHints { size, stride, buffers: max_buffers })
    }

    fn alloc_on_port(
        &mut self,
        link_id: ObjectId,
        port_ref: PortRef,
        hints: &BufferHints,
        side: Side,
    ) -> Result<(Arc<BufferPool>, bool)> {
        let node = self.node_mut(port_ref.node).ok_or(Error::UnknownObject(port_ref.node.0))?;
        let (pool, completion) =
            node.plugin.port_alloc_buffers(port_ref.direction, port_ref.port, hints)?;
        if let Some(port) = node.port_mut(port_ref.direction, port_ref.port) {
            port.buffers = Some(pool.clone());
            port.allocated = true;
            port.state = PortState::Paused;
        }
        tracing::debug!(
            link = %link_id, node = %port_ref.node, port = port_ref.port,
            n = pool.len(), "{} port allocated buffers", side.name()
        );
        let was_async = self.track_buffer_completion(link_id, port_ref, completion, side);
        Ok((pool, was_async))
    }

    fn use_buffers_on_port(
        &mut self,
        link_id: ObjectId,
        port_ref: PortRef,
        pool: Arc<BufferPool>,
        side: Side,
    ) -> Result<bool> {
        let node = self.node_mut(port_ref.node).ok_or(Error::UnknownObject(port_ref.node.0))?;
        let completion =
            node.plugin.port_use_buffers(port_ref.direction, port_ref.port, Some(pool.clone()))?;
        if let Some(port) = node.port_mut(port_ref.direction, port_ref.port) {
            port.buffers = Some(pool);
            port.allocated = false;
            port.state = PortState::Paused;
        }
        Ok(self.track_buffer_completion(link_id, port_ref, completion, side))
    }

    fn track_buffer_completion(
        &mut self,
        link_id: ObjectId,
        port_ref: PortRef,
        completion: Completion,
        side: Side,
    ) -> bool {
        match completion {
            Completion::Done => false,
            Completion::Async(seq) => {
                let side_name = side.name();
                self.work.add(
                    port_ref.node,
                    WorkInput::Async(seq),
                    Box::new(move |ctx: &mut Context, res| {
                        if let Err(reason) = res {
                            ctx.link_error(
                                link_id,
                                format!("error use {side_name} buffers: {reason}"),
                            );
                        }
                    }),
                );
                true
            },
        }
    }

    /// Builds a link-owned pool: one sealed memfd block carved into
    /// `max_buffers` equal regions, each described by a `shared` meta entry.
    fn allocate_pool(
        &mut self,
        max_buffers: u32,
        hints: &BufferHints,
        metas: &[MetaKind],
        ring: Option<RingbufferParams>,
    ) -> Result<Arc<BufferPool>> {
        let data_size = hints.size.max(64);
        let total = data_size as usize * max_buffers as usize;
        let block = self
            .mempool
            .alloc(MemFlags::WITH_FD | MemFlags::MAP_READWRITE | MemFlags::SEAL, total)?;

        let mut buffers = Vec::with_capacity(max_buffers as usize);
        for index in 0..max_buffers {
            let offset = index * data_size;
            let mut buffer_metas = vec![Meta::Shared(SharedRange {
                block,
                offset,
                size: data_size,
            })];
            for kind in metas {
                match kind {
                    MetaKind::Header => buffer_metas.push(Meta::Header),
                    MetaKind::Ringbuffer => {
                        if let Some(params) = ring {
                            buffer_metas.push(Meta::Ringbuffer {
                                size: params.size,
                                stride: params.stride,
                            });
                        }
                    },
                    MetaKind::Shared => {},
                }
            }
            buffers.push(Buffer {
                id: index,
                metas: buffer_metas,
                datas: vec![DataChunk {
                    block,
                    offset,
                    maxsize: data_size,
                    stride: hints.stride,
                }],
            });
        }
        Ok(Arc::new(BufferPool::new(self.mempool.clone(), block, buffers)))
    }

    // ---- stage S: start -------------------------------------------------

    fn do_start(
        &mut self,
        id: ObjectId,
        out_ref: PortRef,
        in_ref: PortRef,
        out_state: PortState,
        in_state: PortState,
    ) -> std::result::Result<bool, String> {
        if in_state < PortState::Paused || out_state < PortState::Paused {
            return Ok(false);
        }
        if in_state == PortState::Streaming && out_state == PortState::Streaming {
            self.update_link_state(id, LinkState::Running);
            return Ok(false);
        }
        self.update_link_state(id, LinkState::Paused);

        let mut pending = false;
        for (port_ref, state, side) in
            [(in_ref, in_state, Side::Input), (out_ref, out_state, Side::Output)]
        {
            if state != PortState::Paused {
                continue;
            }
            let completion = self
                .node_set_state(port_ref.node, NodeState::Running)
                .map_err(|e| format!("error starting {} node: {e}", side.name()))?;
            if let Completion::Async(seq) = completion {
                // A failed start must park the link in error, not only the
                // node.
                let side_name = side.name();
                self.work.add(
                    port_ref.node,
                    WorkInput::Async(seq),
                    Box::new(move |ctx: &mut Context, res| {
                        if let Err(reason) = res {
                            ctx.link_error(
                                id,
                                format!("error starting {side_name} node: {reason}"),
                            );
                        }
                    }),
                );
                pending = true;
            }
            if let Some(port) = self
                .node_mut(port_ref.node)
                .and_then(|n| n.port_mut(port_ref.direction, port_ref.port))
            {
                port.state = PortState::Streaming;
            }
        }
        Ok(pending)
    }

    // ---- state & errors -------------------------------------------------

    pub(crate) fn update_link_state(&mut self, id: ObjectId, new: LinkState) {
        let Some(link) = self.link_mut(id) else { return };
        if link.state == new {
            return;
        }
        let old = std::mem::replace(&mut link.state, new.clone());
        tracing::debug!(link = %id, from = old.as_str(), to = new.as_str(), "link state");
        self.link_events.emit(&LinkEvent::StateChanged { link: id, old, new });
    }

    /// Parks the link in the sticky error state with the formatted reason.
    pub fn link_error(&mut self, id: ObjectId, message: String) {
        tracing::warn!(link = %id, error = %message, "link error");
        self.update_link_state(id, LinkState::Error(message));
    }

    fn clear_both_ports(&mut self, out_ref: PortRef, in_ref: PortRef) {
        for port_ref in [out_ref, in_ref] {
            if let Some(port) = self
                .node_mut(port_ref.node)
                .and_then(|n| n.port_mut(port_ref.direction, port_ref.port))
            {
                port.clear_buffers();
                port.allocated = false;
            }
        }
    }

    // ---- teardown -------------------------------------------------------

    /// A port under this link is going away.
    pub(crate) fn link_port_gone(
        &mut self,
        id: ObjectId,
        node: ObjectId,
        direction: Direction,
        port: u32,
    ) {
        let Some(link) = self.link_mut(id) else { return };
        let gone = PortRef { node, direction, port };
        let (owner_gone, survivor) = if link.output == Some(gone) {
            link.output = None;
            (matches!(link.buffer_owner, Some(BufferOwner::OutputPort | BufferOwner::Link)),
             link.input)
        } else if link.input == Some(gone) {
            link.input = None;
            (matches!(link.buffer_owner, Some(BufferOwner::InputPort | BufferOwner::Link)),
             link.output)
        } else {
            return;
        };
        if owner_gone {
            link.buffers = None;
            link.buffer_owner = None;
        }
        if owner_gone {
            if let Some(surviving) = survivor {
                self.clear_port_buffers(&surviving);
            }
        }

        self.link_events.emit(&LinkEvent::PortUnlinked { link: id, node, direction, port });
        self.update_link_state(id, LinkState::Unlinked);
        self.link_destroy(id);
    }

    /// Releases a port's pool unless the port allocated it itself.
    fn clear_port_buffers(&mut self, port_ref: &PortRef) {
        let Some(node) = self.node_mut(port_ref.node) else { return };
        if node
            .port(port_ref.direction, port_ref.port)
            .is_some_and(|p| p.allocated)
        {
            return;
        }
        let _ = node.plugin.port_use_buffers(port_ref.direction, port_ref.port, None);
        if let Some(port) = node.port_mut(port_ref.direction, port_ref.port) {
            port.clear_buffers();
        }
    }

    /// Two-phase link destruction: retire the global now, unsplice the rt
    /// twin on the data loop, finish on the completion.
    pub fn link_destroy(&mut self, id: ObjectId) {
        let Some(link) = self.link_mut(id) else { return };
        if link.dying {
            return;
        }
        link.dying = true;
        tracing::info!(link = %id, "link destroy");

        if self.registry.remove(id).is_some() {
            self.global_events.emit(&GlobalEvent::Removed { id });
            self.notify_global_removed(id);
        }
        self.work.cancel(Some(id), None);

        let seq = self.next_seq();
        let result = self.data_loop.invoke_seq(
            id,
            seq,
            Box::new(move |rt| rt.with_state(|state| state.remove_link(id))),
        );
        match result {
            Ok(()) => {
                self.work.add(
                    id,
                    WorkInput::Async(seq),
                    Box::new(move |ctx: &mut Context, _res| ctx.link_finish_destroy(id)),
                );
            },
            Err(err) => {
                tracing::warn!(link = %id, error = %err, "rt unsplice failed, finishing inline");
                self.link_finish_destroy(id);
            },
        }
    }

    /// Control-side completion of the teardown: detach the ports, drop the
    /// counters, idle unused nodes, release the storage.
    fn link_finish_destroy(&mut self, id: ObjectId) {
        let Some(link) = self.links.remove(id.0) else { return };
        for (side_ref, is_input) in
            [(link.input, true), (link.output, false)].into_iter()
        {
            let Some(port_ref) = side_ref else { continue };
            if let Some(node) = self.node_mut(port_ref.node) {
                if let Some(port) = node.port_mut(port_ref.direction, port_ref.port) {
                    port.detach_link(id);
                }
                if is_input {
                    node.n_used_input_links = node.n_used_input_links.saturating_sub(1);
                } else {
                    node.n_used_output_links = node.n_used_output_links.saturating_sub(1);
                }
            }
            self.clear_port_buffers(&port_ref);
            if self.node(port_ref.node).is_some_and(Node::is_unused) {
                let _ = self.node_set_state(port_ref.node, NodeState::Idle);
            }
        }
        tracing::debug!(link = %id, "link released");
    }

    /// Called while removing a port: unlinks everything attached to it and
    /// fires the removal notification.
    pub fn on_port_destroyed(&mut self, node: ObjectId, direction: Direction, port: u32) {
        let links: Vec<ObjectId> = self
            .node(node)
            .and_then(|n| n.port(direction, port))
            .map(|p| p.links.clone())
            .unwrap_or_default();
        for link_id in links {
            self.link_port_gone(link_id, node, direction, port);
        }
        if let Some(n) = self.node_mut(node) {
            n.remove_port(direction, port);
        }
        self.node_events.emit(&NodeEvent::PortRemoved { node, direction, port });
    }
}

fn merge_metas(out_caps: &PortCaps, in_caps: &PortCaps) -> Vec<MetaKind> {
    let mut metas = Vec::new();
    for kind in out_caps.metas.iter().chain(in_caps.metas.iter()) {
        if !metas.contains(kind) {
            metas.push(*kind);
        }
    }
    metas
}

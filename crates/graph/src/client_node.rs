// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Client-provided nodes: the processing lives in the client process, and the
//! server drives it over the protocol.
//!
//! Port formats, buffer installation, and lifecycle commands are forwarded as
//! events on the client-node resource; pool memory crosses once as an
//! `ADD_MEM` event carrying the sealed fd. The client declares and updates
//! its ports with `PORT_UPDATE` requests.

use crate::events::{ClientEvent, EventPayload};
use crate::node::{NodePlugin, PortCaps, PortFlags};
use patchbay_core::{
    BufferPool, Completion, Direction, Error, MediaFormat, MemPool, NodeCommand, ObjectId, Pod,
    Properties, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct ClientNodePlugin {
    events: mpsc::UnboundedSender<ClientEvent>,
    /// Client-local id of the client-node resource; events originate here.
    resource: ObjectId,
    mempool: MemPool,
    /// Formats the client declared per `(direction, port)`.
    formats: HashMap<(Direction, u32), Vec<MediaFormat>>,
    /// Blocks already announced with `ADD_MEM`.
    sent_blocks: Vec<u32>,
    next_mem_id: u32,
}

impl ClientNodePlugin {
    pub fn new(
        events: mpsc::UnboundedSender<ClientEvent>,
        resource: ObjectId,
        mempool: MemPool,
    ) -> Self {
        Self {
            events,
            resource,
            mempool,
            formats: HashMap::new(),
            sent_blocks: Vec::new(),
            next_mem_id: 0,
        }
    }

    fn emit(&self, payload: EventPayload) {
        let _ = self.events.send(ClientEvent { resource: self.resource, payload });
    }

    /// Announces the pool's memory block to the client, once.
    fn announce_block(&mut self, pool: &BufferPool) -> Result<u32> {
        let block = pool.block;
        if let Some(position) = self.sent_blocks.iter().position(|&b| b == block.0) {
            return Ok(u32::try_from(position).unwrap_or(u32::MAX));
        }
        let fd = self.mempool.dup_fd(block)?;
        let size = u32::try_from(self.mempool.size_of(block)?).unwrap_or(u32::MAX);
        let mem_id = self.next_mem_id;
        self.next_mem_id += 1;
        self.sent_blocks.push(block.0);
        self.emit(EventPayload::AddMem { mem_id, fd, size });
        Ok(mem_id)
    }
}

impl NodePlugin for ClientNodePlugin {
    fn port_get_info(&self, _direction: Direction, _port: u32) -> Result<PortCaps> {
        // The client maps server-allocated pools; it never allocates.
        Ok(PortCaps { flags: PortFlags::CAN_USE_BUFFERS, ..PortCaps::default() })
    }

    fn port_enum_formats(&self, direction: Direction, port: u32) -> Result<Vec<MediaFormat>> {
        Ok(self.formats.get(&(direction, port)).cloned().unwrap_or_default())
    }

    fn port_update(
        &mut self,
        direction: Direction,
        port: u32,
        formats: Vec<MediaFormat>,
    ) -> Result<()> {
        self.formats.insert((direction, port), formats);
        Ok(())
    }

    fn port_set_format(
        &mut self,
        direction: Direction,
        port: u32,
        format: Option<&MediaFormat>,
    ) -> Result<Completion> {
        if let Some(format) = format {
            self.emit(EventPayload::SetFormat {
                direction,
                port,
                format: Box::new(format.clone()),
            });
        }
        Ok(Completion::Done)
    }

    fn port_use_buffers(
        &mut self,
        direction: Direction,
        port: u32,
        buffers: Option<Arc<BufferPool>>,
    ) -> Result<Completion> {
        let pod = match buffers {
            Some(pool) => {
                let mem_id = self.announce_block(&pool)?;
                let mut entries = Vec::with_capacity(pool.buffers.len());
                for buffer in &pool.buffers {
                    let chunk = buffer.datas.first().ok_or_else(|| {
                        Error::InvalidArgument("buffer without data chunk".into())
                    })?;
                    entries.push(Pod::Struct(vec![
                        Pod::Int(buffer.id as i32),
                        Pod::Int(mem_id as i32),
                        Pod::Int(chunk.offset as i32),
                        Pod::Int(chunk.maxsize as i32),
                        Pod::Int(chunk.stride as i32),
                    ]));
                }
                Pod::Struct(entries)
            },
            None => Pod::Struct(Vec::new()),
        };
        self.emit(EventPayload::UseBuffers { direction, port, buffers: pod });
        Ok(Completion::Done)
    }

    fn send_command(&mut self, command: NodeCommand) -> Result<Completion> {
        let name = match command {
            NodeCommand::Start => "Start",
            NodeCommand::Pause => "Pause",
            NodeCommand::Suspend => "Suspend",
        };
        self.emit(EventPayload::NodeCommand { command: Pod::String(name.to_string()) });
        Ok(Completion::Done)
    }
}

/// Properties every client node gets tagged with.
pub fn client_node_props(client: ObjectId) -> Properties {
    Properties::from([("node.client", client.to_string().as_str())])
}

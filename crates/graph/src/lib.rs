// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Patchbay graph engine - nodes, ports, links, and the machinery that
//! drives them.
//!
//! ## Architecture
//!
//! A single **graph actor** task owns all control-plane state ([`Context`]):
//! the global registry, clients and their resources, nodes with their ports,
//! links, the work queue, and the access hook chains. Connection tasks and
//! modules talk to it through the [`GraphHandle`] command channel and observe
//! it through subscriber channels.
//!
//! Real-time processing runs on a separate OS thread (the [`data_loop`]),
//! reached exclusively through its lock-free invoke channel.
//!
//! ## Modules
//!
//! - [`work_queue`]: deferred work with async-sequence completion
//! - [`data_loop`]: the real-time thread and its invoke bridge
//! - [`node`] / [`port`]: the pluggable node abstraction
//! - [`link`]: format negotiation, buffer allocation, start/stop
//! - [`registry`]: the global object table
//! - [`client`]: per-client resource maps and credentials
//! - [`client_node`]: nodes implemented by a client over the protocol
//! - [`access`]: check_send / check_dispatch hook chains
//! - [`events`]: event payloads and subscriber fan-out
//! - [`context`] / [`actor`]: the state owner and its actor shell

pub mod access;
pub mod actor;
pub mod client;
pub mod client_node;
pub mod context;
pub mod data_loop;
pub mod events;
pub mod factory;
pub mod link;
pub mod node;
pub mod port;
pub mod registry;
pub mod work_queue;

#[cfg(test)]
mod tests;

pub use access::{AccessChains, AccessPolicy, Decision, OwnerUidPolicy, RequestKind};
pub use actor::{Command, GraphActor, GraphHandle, LinkSnapshot, NodeSnapshot, PortSnapshot, Request};
pub use client::{Client, Resource, Ucred};
pub use context::Context;
pub use data_loop::{DataLoop, DataLoopHandle, RtLink, RtNode, RtState};
pub use events::{ClientEvent, EventKind, EventPayload, GlobalEvent, LinkEvent, NodeEvent};
pub use factory::FactoryDef;
pub use link::{BufferOwner, Link, PortRef, MAX_BUFFERS};
pub use node::{
    AsyncNotify, BufferHints, Clock, IoArea, Node, NodePlugin, PortCaps, PortFlags, RtContext,
    RtEvent, RtProcess,
};
pub use port::Port;
pub use registry::{Global, GlobalKind, Registry};
pub use work_queue::{AsyncResult, WorkFn, WorkId, WorkInput, WorkQueue};

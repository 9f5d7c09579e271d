// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Patchbay core - fundamental data structures for the media routing server.
//!
//! This crate holds the vocabulary shared by every other workspace member:
//!
//! - [`types`]: object ids and the port/node/link state sets
//! - [`type_map`]: URI ⇄ dense-id interning for cross-process identifiers
//! - [`id_map`]: sparse id-indexed storage with free-list reuse
//! - [`pod`]: tag-length-value structured values and the id-rewrite walker
//! - [`properties`]: ordered string dictionaries
//! - [`format`]: media formats and negotiation intersection
//! - [`mempool`]: fd-backed shareable memory blocks and cached mappings
//! - [`buffers`]: buffer/meta descriptions shared over links
//! - [`error`]: the error taxonomy

pub mod buffers;
pub mod error;
pub mod format;
pub mod id_map;
pub mod mempool;
pub mod pod;
pub mod properties;
pub mod type_map;
pub mod types;

// Convenience re-exports for the types nearly every consumer touches.

pub use error::{Error, ErrorCode, Result};

pub use types::{
    Completion, Direction, LinkState, NodeCommand, NodeState, ObjectId, PortState, SeqId,
};

pub use id_map::IdMap;
pub use type_map::{InterfaceTypes, TypeId, TypeMap};

pub use pod::{ChoiceKind, Pod};
pub use properties::Properties;

pub use format::{AudioRaw, FormatTypes, MediaFormat, SampleFormat, VideoRaw};

pub use buffers::{Buffer, BufferPool, DataChunk, Meta, MetaKind, SharedRange};
pub use mempool::{MemBlockId, MemFlags, MemKind, MemMap, MemPool};

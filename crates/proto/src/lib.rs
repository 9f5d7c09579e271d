// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Patchbay native protocol - length-prefixed binary messages over Unix
//! sockets with `SCM_RIGHTS` descriptor passing.
//!
//! - [`frame`]: the `u32 id, u8 opcode, u24 length` header codec
//! - [`connection`]: the framed, fd-carrying socket wrapper
//! - [`messages`]: opcodes and pod marshalling per resource class
//! - [`server`]: the accept loop and per-connection tasks

pub mod connection;
pub mod frame;
pub mod messages;
pub mod server;

pub use connection::{Connection, Message};
pub use frame::{FrameHeader, HEADER_LEN, MAX_PAYLOAD};
pub use messages::{
    class_for_event, demarshal_event, demarshal_request, marshal_event, marshal_request, Class,
};
pub use server::serve;

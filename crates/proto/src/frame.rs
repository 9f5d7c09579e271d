// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Wire frame header: `u32 resource_id, u8 opcode, u24 payload_length`.
//!
//! Several frames may share one socket read or write; the header is the only
//! framing. Payload lengths are capped by the 24-bit field.

use bytes::{Buf, BufMut, BytesMut};
use patchbay_core::{Error, Result};

pub const HEADER_LEN: usize = 8;

/// Largest payload the length field can carry.
pub const MAX_PAYLOAD: usize = 0x00FF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub id: u32,
    pub opcode: u8,
    pub length: usize,
}

impl FrameHeader {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        if self.length > MAX_PAYLOAD {
            return Err(Error::InvalidArgument(format!(
                "payload of {} bytes exceeds the frame limit",
                self.length
            )));
        }
        buf.put_u32_le(self.id);
        buf.put_u8(self.opcode);
        let len = u32::try_from(self.length).unwrap_or(u32::MAX);
        buf.put_u8((len & 0xff) as u8);
        buf.put_u8(((len >> 8) & 0xff) as u8);
        buf.put_u8(((len >> 16) & 0xff) as u8);
        Ok(())
    }

    /// Reads a header without consuming; `None` until 8 bytes are buffered.
    pub fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let opcode = buf[4];
        let length =
            usize::from(buf[5]) | (usize::from(buf[6]) << 8) | (usize::from(buf[7]) << 16);
        Some(Self { id, opcode, length })
    }

    /// Consumes the header from `buf`. Call after a successful `peek`.
    pub fn advance(buf: &mut BytesMut) {
        buf.advance(HEADER_LEN);
    }
}

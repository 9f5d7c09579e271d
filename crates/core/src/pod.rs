// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Tagged structured values ("pods") carried in protocol payloads.
//!
//! A pod is a tag-length-value tree: scalars, strings, raw bytes, and the
//! containers `Array`, `Struct`, `Object` (typed key/value properties),
//! `Sequence`, and `Choice`. File descriptors never appear inline; an `Fd`
//! pod holds the index of a descriptor travelling out-of-band next to the
//! message.
//!
//! [`Pod::rewrite_ids`] is the generic walker used when a value crosses from
//! one id space to another: it rewrites `Id` leaves and the type and property
//! keys of every `Object` node.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Payload type tags. Wire values are stable.
mod tag {
    pub const NONE: u32 = 1;
    pub const BOOL: u32 = 2;
    pub const ID: u32 = 3;
    pub const INT: u32 = 4;
    pub const LONG: u32 = 5;
    pub const FLOAT: u32 = 6;
    pub const DOUBLE: u32 = 7;
    pub const STRING: u32 = 8;
    pub const BYTES: u32 = 9;
    pub const RECTANGLE: u32 = 10;
    pub const FRACTION: u32 = 11;
    pub const BITMAP: u32 = 12;
    pub const ARRAY: u32 = 13;
    pub const STRUCT: u32 = 14;
    pub const OBJECT: u32 = 15;
    pub const SEQUENCE: u32 = 16;
    pub const POINTER: u32 = 17;
    pub const FD: u32 = 18;
    pub const CHOICE: u32 = 19;
}

/// How the alternatives of a [`Pod::Choice`] are to be interpreted.
/// The first alternative is always the preferred value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChoiceKind {
    None = 0,
    Range = 1,
    Step = 2,
    Enum = 3,
    Flags = 4,
}

impl ChoiceKind {
    fn from_raw(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Self::None,
            1 => Self::Range,
            2 => Self::Step,
            3 => Self::Enum,
            4 => Self::Flags,
            other => return Err(Error::Protocol(format!("unknown choice kind {other}"))),
        })
    }
}

/// A structured value.
#[derive(Debug, Clone, PartialEq)]
pub enum Pod {
    None,
    Bool(bool),
    /// A dense id from a [`crate::TypeMap`] or another id space.
    Id(u32),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Bytes),
    Rectangle { width: u32, height: u32 },
    Fraction { num: u32, denom: u32 },
    Bitmap(Bytes),
    Array(Vec<Pod>),
    Struct(Vec<Pod>),
    /// Typed property bag: `(key-id, value)` pairs under a type id.
    Object { type_id: u32, props: Vec<(u32, Pod)> },
    Sequence(Vec<Pod>),
    Pointer(u64),
    /// Index into the message's out-of-band fd list.
    Fd(u32),
    Choice { kind: ChoiceKind, alternatives: Vec<Pod> },
}

const MAX_DEPTH: usize = 32;

fn pad8(len: usize) -> usize {
    (8 - len % 8) % 8
}

impl Pod {
    /// Serializes the pod: `u32 tag, u32 size, payload` padded to 8 bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        let (t, body) = self.encode_body();
        buf.put_u32_le(t);
        buf.put_u32_le(u32::try_from(body.len()).unwrap_or(u32::MAX));
        buf.put_slice(&body);
        buf.put_bytes(0, pad8(body.len()));
    }

    fn encode_body(&self) -> (u32, BytesMut) {
        let mut body = BytesMut::new();
        let t = match self {
            Self::None => tag::NONE,
            Self::Bool(v) => {
                body.put_u32_le(u32::from(*v));
                tag::BOOL
            },
            Self::Id(v) => {
                body.put_u32_le(*v);
                tag::ID
            },
            Self::Int(v) => {
                body.put_i32_le(*v);
                tag::INT
            },
            Self::Long(v) => {
                body.put_i64_le(*v);
                tag::LONG
            },
            Self::Float(v) => {
                body.put_f32_le(*v);
                tag::FLOAT
            },
            Self::Double(v) => {
                body.put_f64_le(*v);
                tag::DOUBLE
            },
            Self::String(v) => {
                body.put_slice(v.as_bytes());
                body.put_u8(0);
                tag::STRING
            },
            Self::Bytes(v) => {
                body.put_slice(v);
                tag::BYTES
            },
            Self::Rectangle { width, height } => {
                body.put_u32_le(*width);
                body.put_u32_le(*height);
                tag::RECTANGLE
            },
            Self::Fraction { num, denom } => {
                body.put_u32_le(*num);
                body.put_u32_le(*denom);
                tag::FRACTION
            },
            Self::Bitmap(v) => {
                body.put_slice(v);
                tag::BITMAP
            },
            Self::Array(items) => {
                for item in items {
                    item.encode(&mut body);
                }
                tag::ARRAY
            },
            Self::Struct(fields) => {
                for field in fields {
                    field.encode(&mut body);
                }
                tag::STRUCT
            },
            Self::Object { type_id, props } => {
                body.put_u32_le(*type_id);
                body.put_u32_le(0); // reserved, keeps properties 8-aligned
                for (key, value) in props {
                    body.put_u32_le(*key);
                    body.put_u32_le(0);
                    value.encode(&mut body);
                }
                tag::OBJECT
            },
            Self::Sequence(items) => {
                for item in items {
                    item.encode(&mut body);
                }
                tag::SEQUENCE
            },
            Self::Pointer(v) => {
                body.put_u64_le(*v);
                tag::POINTER
            },
            Self::Fd(v) => {
                body.put_u32_le(*v);
                tag::FD
            },
            Self::Choice { kind, alternatives } => {
                body.put_u32_le(*kind as u32);
                body.put_u32_le(0);
                for alt in alternatives {
                    alt.encode(&mut body);
                }
                tag::CHOICE
            },
        };
        (t, body)
    }

    /// Deserializes one pod from the front of `buf`, consuming it and its
    /// padding.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        Self::decode_at_depth(buf, 0)
    }

    fn decode_at_depth(buf: &mut Bytes, depth: usize) -> Result<Self> {
        if depth > MAX_DEPTH {
            return Err(Error::Protocol("pod nesting too deep".into()));
        }
        if buf.remaining() < 8 {
            return Err(Error::Protocol("truncated pod header".into()));
        }
        let t = buf.get_u32_le();
        let size = buf.get_u32_le() as usize;
        if buf.remaining() < size {
            return Err(Error::Protocol(format!("truncated pod body ({size} bytes)")));
        }
        let mut body = buf.split_to(size);
        buf.advance(pad8(size).min(buf.remaining()));

        let pod = match t {
            tag::NONE => Self::None,
            tag::BOOL => Self::Bool(read_u32(&mut body)? != 0),
            tag::ID => Self::Id(read_u32(&mut body)?),
            tag::INT => Self::Int(read_u32(&mut body)? as i32),
            tag::LONG => Self::Long(read_u64(&mut body)? as i64),
            tag::FLOAT => Self::Float(f32::from_bits(read_u32(&mut body)?)),
            tag::DOUBLE => Self::Double(f64::from_bits(read_u64(&mut body)?)),
            tag::STRING => {
                let raw = body.as_ref();
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                let s = std::str::from_utf8(&raw[..end])
                    .map_err(|_| Error::Protocol("string pod is not UTF-8".into()))?;
                Self::String(s.to_string())
            },
            tag::BYTES => Self::Bytes(body.copy_to_bytes(body.remaining())),
            tag::RECTANGLE => {
                Self::Rectangle { width: read_u32(&mut body)?, height: read_u32(&mut body)? }
            },
            tag::FRACTION => {
                Self::Fraction { num: read_u32(&mut body)?, denom: read_u32(&mut body)? }
            },
            tag::BITMAP => Self::Bitmap(body.copy_to_bytes(body.remaining())),
            tag::ARRAY => Self::Array(decode_children(&mut body, depth)?),
            tag::STRUCT => Self::Struct(decode_children(&mut body, depth)?),
            tag::OBJECT => {
                let type_id = read_u32(&mut body)?;
                let _reserved = read_u32(&mut body)?;
                let mut props = Vec::new();
                while body.has_remaining() {
                    let key = read_u32(&mut body)?;
                    let _reserved = read_u32(&mut body)?;
                    props.push((key, Self::decode_at_depth(&mut body, depth + 1)?));
                }
                Self::Object { type_id, props }
            },
            tag::SEQUENCE => Self::Sequence(decode_children(&mut body, depth)?),
            tag::POINTER => Self::Pointer(read_u64(&mut body)?),
            tag::FD => Self::Fd(read_u32(&mut body)?),
            tag::CHOICE => {
                let kind = ChoiceKind::from_raw(read_u32(&mut body)?)?;
                let _reserved = read_u32(&mut body)?;
                Self::Choice { kind, alternatives: decode_children(&mut body, depth)? }
            },
            other => return Err(Error::Protocol(format!("unknown pod tag {other}"))),
        };
        Ok(pod)
    }

    /// Rewrites every id embedded in the value through `remap`: `Id` leaves,
    /// `Object` type ids, and `Object` property keys.
    pub fn rewrite_ids(&mut self, remap: &mut impl FnMut(u32) -> u32) {
        match self {
            Self::Id(id) => *id = remap(*id),
            Self::Object { type_id, props } => {
                *type_id = remap(*type_id);
                for (key, value) in props {
                    *key = remap(*key);
                    value.rewrite_ids(remap);
                }
            },
            Self::Array(items) | Self::Struct(items) | Self::Sequence(items) => {
                for item in items {
                    item.rewrite_ids(remap);
                }
            },
            Self::Choice { alternatives, .. } => {
                for alt in alternatives {
                    alt.rewrite_ids(remap);
                }
            },
            _ => {},
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<u32> {
        match self {
            Self::Id(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[Pod]> {
        match self {
            Self::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// Looks up a property on an `Object` pod.
    pub fn prop(&self, key: u32) -> Option<&Pod> {
        match self {
            Self::Object { props, .. } => {
                props.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
            },
            _ => None,
        }
    }

    /// Serializes into a standalone byte buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

fn decode_children(body: &mut Bytes, depth: usize) -> Result<Vec<Pod>> {
    let mut items = Vec::new();
    while body.has_remaining() {
        items.push(Pod::decode_at_depth(body, depth + 1)?);
    }
    Ok(items)
}

fn read_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::Protocol("truncated pod value".into()));
    }
    Ok(buf.get_u32_le())
}

fn read_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::Protocol("truncated pod value".into()));
    }
    Ok(buf.get_u64_le())
}

// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Typed messages: opcodes per resource class and the pod marshalling for
//! every request and event.

use bytes::Bytes;
use patchbay_core::format::FormatTypes;
use patchbay_core::{Direction, Error, ErrorCode, MediaFormat, ObjectId, Pod, Properties, Result};
use patchbay_graph::{EventPayload, Request};
use std::collections::VecDeque;
use std::os::fd::OwnedFd;

/// Which demarshal/event table a resource uses. Derived from the info events
/// a bind produces, mirroring how tables are installed on resource creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Core,
    Registry,
    Node,
    ClientNode,
    Client,
    Link,
}

/// Request opcodes, by resource class.
pub mod req {
    pub mod core {
        pub const CLIENT_UPDATE: u8 = 0;
        pub const SYNC: u8 = 1;
        pub const GET_REGISTRY: u8 = 2;
        pub const CREATE_NODE: u8 = 3;
        pub const CREATE_CLIENT_NODE: u8 = 4;
    }
    pub mod registry {
        pub const BIND: u8 = 0;
    }
    pub mod node {
        pub const REMOVE: u8 = 0;
    }
    pub mod client_node {
        pub const PORT_UPDATE: u8 = 0;
        pub const DESTROY: u8 = 1;
    }
}

/// Event opcodes, by resource class.
pub mod ev {
    pub mod core {
        pub const INFO: u8 = 0;
        pub const DONE: u8 = 1;
        pub const ERROR: u8 = 2;
        pub const REMOVE_ID: u8 = 3;
    }
    pub mod registry {
        pub const NOTIFY_GLOBAL: u8 = 0;
        pub const NOTIFY_GLOBAL_REMOVE: u8 = 1;
    }
    pub mod node {
        pub const INFO: u8 = 0;
    }
    pub mod link {
        pub const INFO: u8 = 0;
    }
    pub mod client {
        pub const INFO: u8 = 0;
    }
    pub mod client_node {
        pub const ADD_MEM: u8 = 0;
        pub const SET_FORMAT: u8 = 1;
        pub const USE_BUFFERS: u8 = 2;
        pub const NODE_COMMAND: u8 = 3;
    }
}

fn proto_err(what: &str) -> Error {
    Error::Protocol(format!("malformed {what}"))
}

fn fields(payload: &Bytes, what: &str) -> Result<Vec<Pod>> {
    let mut bytes = payload.clone();
    let pod = Pod::decode(&mut bytes)?;
    match pod {
        Pod::Struct(fields) => Ok(fields),
        _ => Err(proto_err(what)),
    }
}

fn as_u32(pod: &Pod, what: &str) -> Result<u32> {
    pod.as_int()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| proto_err(what))
}

fn as_string(pod: &Pod, what: &str) -> Result<String> {
    pod.as_str().map(str::to_string).ok_or_else(|| proto_err(what))
}

fn direction_pod(direction: Direction) -> Pod {
    Pod::String(direction.as_str().to_string())
}

fn parse_direction(pod: &Pod) -> Result<Direction> {
    match pod.as_str() {
        Some("input") => Ok(Direction::Input),
        Some("output") => Ok(Direction::Output),
        _ => Err(proto_err("direction")),
    }
}

// ---- requests -----------------------------------------------------------

/// Serializes a request for the wire. Used by clients.
pub fn marshal_request(request: &Request, types: &FormatTypes) -> Result<(u8, Bytes)> {
    let (opcode, pod) = match request {
        Request::ClientUpdate { props } => (req::core::CLIENT_UPDATE, props.to_pod()),
        Request::Sync { seq } => (req::core::SYNC, Pod::Struct(vec![Pod::Int(*seq as i32)])),
        Request::GetRegistry { new_id } => (
            req::core::GET_REGISTRY,
            Pod::Struct(vec![Pod::Int(new_id.0 as i32)]),
        ),
        Request::CreateNode { factory, name, props, new_id } => (
            req::core::CREATE_NODE,
            Pod::Struct(vec![
                Pod::String(factory.clone()),
                Pod::String(name.clone()),
                props.to_pod(),
                Pod::Int(new_id.0 as i32),
            ]),
        ),
        Request::CreateClientNode { name, props, new_id } => (
            req::core::CREATE_CLIENT_NODE,
            Pod::Struct(vec![
                Pod::String(name.clone()),
                props.to_pod(),
                Pod::Int(new_id.0 as i32),
            ]),
        ),
        Request::Bind { id, version, new_id } => (
            req::registry::BIND,
            Pod::Struct(vec![
                Pod::Int(id.0 as i32),
                Pod::Int(*version as i32),
                Pod::Int(new_id.0 as i32),
            ]),
        ),
        Request::NodeRemove => (req::node::REMOVE, Pod::Struct(Vec::new())),
        Request::PortUpdate { direction, port, formats } => (
            req::client_node::PORT_UPDATE,
            Pod::Struct(vec![
                direction_pod(*direction),
                Pod::Int(*port as i32),
                Pod::Struct(formats.iter().map(|f| f.to_pod(types)).collect()),
            ]),
        ),
        Request::Destroy => (req::client_node::DESTROY, Pod::Struct(Vec::new())),
    };
    Ok((opcode, pod.to_bytes()))
}

/// Parses a request against the resource's class table.
///
/// Unknown opcodes are reported as protocol errors; the caller logs and
/// drops the message.
pub fn demarshal_request(
    class: Class,
    opcode: u8,
    payload: &Bytes,
    types: &FormatTypes,
) -> Result<Request> {
    match (class, opcode) {
        (Class::Core, req::core::CLIENT_UPDATE) => {
            let mut bytes = payload.clone();
            let pod = Pod::decode(&mut bytes)?;
            Ok(Request::ClientUpdate { props: Properties::from_pod(&pod)? })
        },
        (Class::Core, req::core::SYNC) => {
            let f = fields(payload, "SYNC")?;
            Ok(Request::Sync { seq: as_u32(f.first().ok_or_else(|| proto_err("SYNC"))?, "SYNC")? })
        },
        (Class::Core, req::core::GET_REGISTRY) => {
            let f = fields(payload, "GET_REGISTRY")?;
            let new_id =
                as_u32(f.first().ok_or_else(|| proto_err("GET_REGISTRY"))?, "GET_REGISTRY")?;
            Ok(Request::GetRegistry { new_id: ObjectId(new_id) })
        },
        (Class::Core, req::core::CREATE_NODE) => {
            let f = fields(payload, "CREATE_NODE")?;
            if f.len() != 4 {
                return Err(proto_err("CREATE_NODE"));
            }
            Ok(Request::CreateNode {
                factory: as_string(&f[0], "CREATE_NODE factory")?,
                name: as_string(&f[1], "CREATE_NODE name")?,
                props: Properties::from_pod(&f[2])?,
                new_id: ObjectId(as_u32(&f[3], "CREATE_NODE id")?),
            })
        },
        (Class::Core, req::core::CREATE_CLIENT_NODE) => {
            let f = fields(payload, "CREATE_CLIENT_NODE")?;
            if f.len() != 3 {
                return Err(proto_err("CREATE_CLIENT_NODE"));
            }
            Ok(Request::CreateClientNode {
                name: as_string(&f[0], "CREATE_CLIENT_NODE name")?,
                props: Properties::from_pod(&f[1])?,
                new_id: ObjectId(as_u32(&f[2], "CREATE_CLIENT_NODE id")?),
            })
        },
        (Class::Registry, req::registry::BIND) => {
            let f = fields(payload, "BIND")?;
            if f.len() != 3 {
                return Err(proto_err("BIND"));
            }
            Ok(Request::Bind {
                id: ObjectId(as_u32(&f[0], "BIND id")?),
                version: as_u32(&f[1], "BIND version")?,
                new_id: ObjectId(as_u32(&f[2], "BIND new id")?),
            })
        },
        (Class::Node, req::node::REMOVE) => Ok(Request::NodeRemove),
        (Class::ClientNode, req::client_node::PORT_UPDATE) => {
            let f = fields(payload, "PORT_UPDATE")?;
            if f.len() != 3 {
                return Err(proto_err("PORT_UPDATE"));
            }
            let formats = f[2]
                .as_struct()
                .ok_or_else(|| proto_err("PORT_UPDATE formats"))?
                .iter()
                .map(|pod| MediaFormat::from_pod(pod, types))
                .collect::<Result<Vec<_>>>()?;
            Ok(Request::PortUpdate {
                direction: parse_direction(&f[0])?,
                port: as_u32(&f[1], "PORT_UPDATE port")?,
                formats,
            })
        },
        (Class::ClientNode, req::client_node::DESTROY) => Ok(Request::Destroy),
        (class, opcode) => Err(Error::Protocol(format!(
            "opcode {opcode} not implemented on {class:?} resources"
        ))),
    }
}

// ---- events -------------------------------------------------------------

/// Serializes an event; fd-carrying events hand their descriptors back for
/// the connection to attach.
pub fn marshal_event(
    payload: EventPayload,
    types: &FormatTypes,
) -> Result<(u8, Bytes, Vec<OwnedFd>)> {
    let (opcode, pod, fds) = match payload {
        EventPayload::CoreInfo { props, name, version, cookie } => (
            ev::core::INFO,
            Pod::Struct(vec![
                Pod::String(name),
                Pod::String(version),
                Pod::Int(cookie as i32),
                props.to_pod(),
            ]),
            Vec::new(),
        ),
        EventPayload::Done { seq } => {
            (ev::core::DONE, Pod::Struct(vec![Pod::Int(seq as i32)]), Vec::new())
        },
        EventPayload::Error { id, code, message } => (
            ev::core::ERROR,
            Pod::Struct(vec![
                Pod::Int(id.0 as i32),
                Pod::Int(code as i32),
                Pod::String(message),
            ]),
            Vec::new(),
        ),
        EventPayload::RemoveId { id } => {
            (ev::core::REMOVE_ID, Pod::Struct(vec![Pod::Int(id.0 as i32)]), Vec::new())
        },
        EventPayload::NotifyGlobal { id, type_uri } => (
            ev::registry::NOTIFY_GLOBAL,
            Pod::Struct(vec![Pod::Int(id.0 as i32), Pod::String(type_uri)]),
            Vec::new(),
        ),
        EventPayload::NotifyGlobalRemove { id } => (
            ev::registry::NOTIFY_GLOBAL_REMOVE,
            Pod::Struct(vec![Pod::Int(id.0 as i32)]),
            Vec::new(),
        ),
        EventPayload::NodeInfo { id, name, state, props } => (
            ev::node::INFO,
            Pod::Struct(vec![
                Pod::Int(id.0 as i32),
                Pod::String(name),
                Pod::String(state.as_str().to_string()),
                props.to_pod(),
            ]),
            Vec::new(),
        ),
        EventPayload::LinkInfo { id, output_node, output_port, input_node, input_port, state } => {
            (
                ev::link::INFO,
                Pod::Struct(vec![
                    Pod::Int(id.0 as i32),
                    Pod::Id(output_node.0),
                    Pod::Int(output_port as i32),
                    Pod::Id(input_node.0),
                    Pod::Int(input_port as i32),
                    Pod::String(state.as_str().to_string()),
                ]),
                Vec::new(),
            )
        },
        EventPayload::ClientInfo { id, props } => (
            ev::client::INFO,
            Pod::Struct(vec![Pod::Int(id.0 as i32), props.to_pod()]),
            Vec::new(),
        ),
        EventPayload::AddMem { mem_id, fd, size } => (
            ev::client_node::ADD_MEM,
            Pod::Struct(vec![
                Pod::Int(mem_id as i32),
                Pod::Fd(0),
                Pod::Int(size as i32),
            ]),
            vec![fd],
        ),
        EventPayload::SetFormat { direction, port, format } => (
            ev::client_node::SET_FORMAT,
            Pod::Struct(vec![
                direction_pod(direction),
                Pod::Int(port as i32),
                format.to_pod(types),
            ]),
            Vec::new(),
        ),
        EventPayload::UseBuffers { direction, port, buffers } => (
            ev::client_node::USE_BUFFERS,
            Pod::Struct(vec![direction_pod(direction), Pod::Int(port as i32), buffers]),
            Vec::new(),
        ),
        EventPayload::NodeCommand { command } => {
            (ev::client_node::NODE_COMMAND, Pod::Struct(vec![command]), Vec::new())
        },
    };
    Ok((opcode, pod.to_bytes(), fds))
}

/// Parses an event against the resource's class table. Used by clients;
/// `fds` is the connection's arrival-ordered descriptor queue.
pub fn demarshal_event(
    class: Class,
    opcode: u8,
    payload: &Bytes,
    types: &FormatTypes,
    fds: &mut VecDeque<OwnedFd>,
) -> Result<EventPayload> {
    let _ = types;
    match (class, opcode) {
        (Class::Core, ev::core::INFO) => {
            let f = fields(payload, "CORE_INFO")?;
            if f.len() != 4 {
                return Err(proto_err("CORE_INFO"));
            }
            Ok(EventPayload::CoreInfo {
                name: as_string(&f[0], "CORE_INFO name")?,
                version: as_string(&f[1], "CORE_INFO version")?,
                cookie: as_u32(&f[2], "CORE_INFO cookie")?,
                props: Properties::from_pod(&f[3])?,
            })
        },
        (Class::Core, ev::core::DONE) => {
            let f = fields(payload, "DONE")?;
            Ok(EventPayload::Done {
                seq: as_u32(f.first().ok_or_else(|| proto_err("DONE"))?, "DONE")?,
            })
        },
        (Class::Core, ev::core::ERROR) => {
            let f = fields(payload, "ERROR")?;
            if f.len() != 3 {
                return Err(proto_err("ERROR"));
            }
            Ok(EventPayload::Error {
                id: ObjectId(as_u32(&f[0], "ERROR id")?),
                code: ErrorCode::from_raw(as_u32(&f[1], "ERROR code")?),
                message: as_string(&f[2], "ERROR message")?,
            })
        },
        (Class::Core, ev::core::REMOVE_ID) => {
            let f = fields(payload, "REMOVE_ID")?;
            Ok(EventPayload::RemoveId {
                id: ObjectId(as_u32(f.first().ok_or_else(|| proto_err("REMOVE_ID"))?, "REMOVE_ID")?),
            })
        },
        (Class::Registry, ev::registry::NOTIFY_GLOBAL) => {
            let f = fields(payload, "NOTIFY_GLOBAL")?;
            if f.len() != 2 {
                return Err(proto_err("NOTIFY_GLOBAL"));
            }
            Ok(EventPayload::NotifyGlobal {
                id: ObjectId(as_u32(&f[0], "NOTIFY_GLOBAL id")?),
                type_uri: as_string(&f[1], "NOTIFY_GLOBAL type")?,
            })
        },
        (Class::Registry, ev::registry::NOTIFY_GLOBAL_REMOVE) => {
            let f = fields(payload, "NOTIFY_GLOBAL_REMOVE")?;
            Ok(EventPayload::NotifyGlobalRemove {
                id: ObjectId(as_u32(
                    f.first().ok_or_else(|| proto_err("NOTIFY_GLOBAL_REMOVE"))?,
                    "NOTIFY_GLOBAL_REMOVE",
                )?),
            })
        },
        (Class::Node | Class::ClientNode, ev::node::INFO) => {
            let f = fields(payload, "NODE_INFO")?;
            if f.len() != 4 {
                return Err(proto_err("NODE_INFO"));
            }
            let state = match f[2].as_str() {
                Some("creating") => patchbay_core::NodeState::Creating,
                Some("suspended") => patchbay_core::NodeState::Suspended,
                Some("idle") => patchbay_core::NodeState::Idle,
                Some("running") => patchbay_core::NodeState::Running,
                Some(other) => patchbay_core::NodeState::Error(other.to_string()),
                None => return Err(proto_err("NODE_INFO state")),
            };
            Ok(EventPayload::NodeInfo {
                id: ObjectId(as_u32(&f[0], "NODE_INFO id")?),
                name: as_string(&f[1], "NODE_INFO name")?,
                state,
                props: Properties::from_pod(&f[3])?,
            })
        },
        (Class::ClientNode, ev::client_node::ADD_MEM) => {
            let f = fields(payload, "ADD_MEM")?;
            if f.len() != 3 {
                return Err(proto_err("ADD_MEM"));
            }
            let fd = fds.pop_front().ok_or_else(|| proto_err("ADD_MEM descriptor"))?;
            Ok(EventPayload::AddMem {
                mem_id: as_u32(&f[0], "ADD_MEM id")?,
                fd,
                size: as_u32(&f[2], "ADD_MEM size")?,
            })
        },
        (class, opcode) => Err(Error::Protocol(format!(
            "event {opcode} not implemented on {class:?} resources"
        ))),
    }
}

/// The class a freshly bound resource acquires, learned from its first info
/// event.
pub const fn class_for_event(payload: &EventPayload) -> Option<Class> {
    match payload {
        EventPayload::NodeInfo { .. } => Some(Class::Node),
        EventPayload::LinkInfo { .. } => Some(Class::Link),
        EventPayload::ClientInfo { .. } => Some(Class::Client),
        EventPayload::CoreInfo { .. } => Some(Class::Core),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbay_core::TypeMap;

    fn types() -> FormatTypes {
        FormatTypes::register(&TypeMap::new())
    }

    #[test]
    fn requests_roundtrip() {
        let types = types();
        let requests = vec![
            Request::Sync { seq: 9 },
            Request::GetRegistry { new_id: ObjectId(1) },
            Request::Bind { id: ObjectId(12), version: 0, new_id: ObjectId(42) },
            Request::CreateNode {
                factory: "tone".into(),
                name: "beeper".into(),
                props: Properties::from([("media.role", "test")]),
                new_id: ObjectId(5),
            },
        ];
        for request in requests {
            let class = match request {
                Request::Bind { .. } => Class::Registry,
                _ => Class::Core,
            };
            let (opcode, payload) = marshal_request(&request, &types).unwrap();
            let back = demarshal_request(class, opcode, &payload, &types).unwrap();
            assert_eq!(format!("{request:?}"), format!("{back:?}"));
        }
    }

    #[test]
    fn unknown_opcode_is_a_protocol_error() {
        let types = types();
        let err = demarshal_request(Class::Registry, 99, &Bytes::new(), &types).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn error_event_roundtrips() {
        let types = types();
        let event = EventPayload::Error {
            id: ObjectId(1),
            code: ErrorCode::NoPermission,
            message: "no permission".into(),
        };
        let (opcode, payload, fds) = marshal_event(event, &types).unwrap();
        assert!(fds.is_empty());
        let mut queue = VecDeque::new();
        let back = demarshal_event(Class::Core, opcode, &payload, &types, &mut queue).unwrap();
        match back {
            EventPayload::Error { id, code, message } => {
                assert_eq!(id, ObjectId(1));
                assert_eq!(code, ErrorCode::NoPermission);
                assert_eq!(message, "no permission");
            },
            other => panic!("unexpected payload {other:?}"),
        }
    }
}

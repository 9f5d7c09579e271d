// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared vocabulary of the media graph: object ids, directions, and the
//! state sets of ports, nodes, and links.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable 32-bit identifier for a server object, assigned from a sparse map.
///
/// Id `0` is reserved for the core itself and `1` for the per-client registry
/// resource. The all-ones value is the invalid sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u32);

impl ObjectId {
    pub const CORE: Self = Self(0);
    pub const REGISTRY: Self = Self(1);
    pub const INVALID: Self = Self(u32::MAX);

    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for ObjectId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Sequence number identifying one in-flight asynchronous plugin operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqId(pub u32);

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of a plugin call that may complete asynchronously.
///
/// `Async` carries the sequence the plugin will later acknowledge through
/// `async_complete`; the work queue parks dependent items on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    Async(SeqId),
}

/// Direction of a port, seen from its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub const fn reverse(self) -> Self {
        match self {
            Self::Input => Self::Output,
            Self::Output => Self::Input,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

/// Negotiation state of a port. Only negotiation moves it up; it drops back
/// to `Configure` only when the format is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Configure,
    Ready,
    Paused,
    Streaming,
}

impl PortState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configure => "configure",
            Self::Ready => "ready",
            Self::Paused => "paused",
            Self::Streaming => "streaming",
        }
    }
}

/// Lifecycle state of a node.
///
/// `Error` is sticky: once entered, only destruction leaves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// The plugin has not finished initializing yet.
    Creating,
    /// No format configured; buffers released.
    Suspended,
    /// Configured but not processing; candidate for suspend on timeout.
    Idle,
    /// The data loop is running the node's process callback.
    Running,
    /// A transition failed. The message is owned by the node.
    Error(String),
}

impl NodeState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Suspended => "suspended",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Error(_) => "error",
        }
    }
}

/// State of a link between two ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Init,
    Negotiating,
    Allocating,
    Paused,
    Running,
    /// One of the ports went away; destruction is scheduled.
    Unlinked,
    Error(String),
}

impl LinkState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Negotiating => "negotiating",
            Self::Allocating => "allocating",
            Self::Paused => "paused",
            Self::Running => "running",
            Self::Unlinked => "unlinked",
            Self::Error(_) => "error",
        }
    }
}

/// Commands delivered to a node plugin through `send_command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCommand {
    Start,
    Pause,
    Suspend,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sentinel() {
        assert!(!ObjectId::INVALID.is_valid());
        assert!(ObjectId::CORE.is_valid());
        assert_eq!(ObjectId::INVALID.0, u32::MAX);
    }

    #[test]
    fn port_states_are_ordered() {
        assert!(PortState::Configure < PortState::Ready);
        assert!(PortState::Ready < PortState::Paused);
        assert!(PortState::Paused < PortState::Streaming);
    }

    #[test]
    fn direction_reverse() {
        assert_eq!(Direction::Input.reverse(), Direction::Output);
        assert_eq!(Direction::Output.reverse(), Direction::Input);
    }
}

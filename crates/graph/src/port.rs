// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Ports: directional endpoints on a node.

use patchbay_core::{BufferPool, Direction, MediaFormat, ObjectId, PortState};
use std::sync::Arc;

/// One endpoint of a node.
///
/// `buffers` may point at a pool the port allocated itself (`allocated` set)
/// or at one owned by a link or the peer port. The port only records the
/// attachment; ownership is the `Arc`.
pub struct Port {
    pub id: u32,
    pub direction: Direction,
    pub state: PortState,
    pub format: Option<MediaFormat>,
    pub buffers: Option<Arc<BufferPool>>,
    /// The pool in `buffers` was allocated by this port's own plugin.
    pub allocated: bool,
    /// Globals of the links attached here, in attach order.
    pub links: Vec<ObjectId>,
}

impl Port {
    pub fn new(id: u32, direction: Direction) -> Self {
        Self {
            id,
            direction,
            state: PortState::Configure,
            format: None,
            buffers: None,
            allocated: false,
            links: Vec::new(),
        }
    }

    pub fn detach_link(&mut self, link: ObjectId) {
        self.links.retain(|&l| l != link);
    }

    /// Drops the buffer attachment and falls back to `Ready`.
    ///
    /// The format stays; only a format clear returns the port to
    /// `Configure`.
    pub fn clear_buffers(&mut self) {
        self.buffers = None;
        self.allocated = false;
        if self.state > PortState::Ready {
            self.state = PortState::Ready;
        }
    }

    /// Clears the format, returning the port to `Configure`.
    pub fn clear_format(&mut self) {
        self.format = None;
        self.buffers = None;
        self.allocated = false;
        self.state = PortState::Configure;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_buffers_keeps_the_format_level() {
        let mut port = Port::new(0, Direction::Input);
        port.state = PortState::Streaming;
        port.clear_buffers();
        assert_eq!(port.state, PortState::Ready);

        port.state = PortState::Configure;
        port.clear_buffers();
        assert_eq!(port.state, PortState::Configure);
    }

    #[test]
    fn clear_format_resets_to_configure() {
        let mut port = Port::new(2, Direction::Output);
        port.state = PortState::Paused;
        port.allocated = true;
        port.clear_format();
        assert_eq!(port.state, PortState::Configure);
        assert!(!port.allocated);
        assert!(port.buffers.is_none());
    }
}

// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for patchbay.
//!
//! Errors are values: they travel through `state_changed` notifications on the
//! nearest stateful object (node or link) and through `ERROR` events on the
//! core resource. Nothing in the server unwinds.

use thiserror::Error;

/// Main error type for patchbay operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed message, unknown object id, or illegal state transition.
    ///
    /// Reported to the offending client; does not terminate the connection
    /// unless the wire framing itself is corrupted.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Refused by an access hook.
    #[error("no permission")]
    NoPermission,

    /// Allocation failure or resource limit.
    #[error("no memory: {0}")]
    NoMemory(String),

    /// A plugin completed an in-flight async sequence with a failure.
    #[error("async operation {seq} failed: {reason}")]
    AsyncFailed { seq: u32, reason: String },

    /// Format negotiation between two ports found no common ground.
    #[error("{0}")]
    Negotiation(String),

    /// Buffer allocation between two ports failed.
    #[error("{0}")]
    Allocation(String),

    /// Wire-level violation. Closes the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The referenced object no longer exists.
    #[error("unknown object {0}")]
    UnknownObject(u32),

    /// I/O error from the socket or the memory pool.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes carried by the core `ERROR` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    InvalidArgument = 1,
    NoPermission = 2,
    NoMemory = 3,
    Protocol = 4,
    Internal = 5,
}

impl ErrorCode {
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::InvalidArgument,
            2 => Self::NoPermission,
            3 => Self::NoMemory,
            4 => Self::Protocol,
            _ => Self::Internal,
        }
    }
}

impl Error {
    /// The wire code a client sees for this error.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) | Self::UnknownObject(_) => ErrorCode::InvalidArgument,
            Self::NoPermission => ErrorCode::NoPermission,
            Self::NoMemory(_) => ErrorCode::NoMemory,
            Self::Protocol(_) => ErrorCode::Protocol,
            Self::Negotiation(_) | Self::Allocation(_) | Self::AsyncFailed { .. } | Self::Io(_) => {
                ErrorCode::Internal
            },
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Io(errno.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_the_reason() {
        let err = Error::InvalidArgument("bad resource id 7".to_string());
        assert_eq!(err.to_string(), "invalid argument: bad resource id 7");

        let err = Error::AsyncFailed { seq: 3, reason: "format rejected".to_string() };
        assert!(err.to_string().contains("format rejected"));
    }

    #[test]
    fn wire_codes() {
        assert_eq!(Error::NoPermission.code(), ErrorCode::NoPermission);
        assert_eq!(Error::UnknownObject(42).code(), ErrorCode::InvalidArgument);
        assert_eq!(ErrorCode::from_raw(2), ErrorCode::NoPermission);
        assert_eq!(ErrorCode::from_raw(999), ErrorCode::Internal);
    }
}

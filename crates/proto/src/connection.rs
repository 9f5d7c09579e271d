// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! A framed message stream over a Unix socket, with `SCM_RIGHTS` descriptor
//! passing.
//!
//! Descriptors travel out-of-band with the frame that references them and
//! are queued on the connection in arrival order; payloads refer to them as
//! small indices, consumed in order through [`Connection::pop_fd`].

use crate::frame::{FrameHeader, HEADER_LEN};
use bytes::{Bytes, BytesMut};
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags};
use patchbay_core::{Error, Result};
use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use tokio::io::Interest;
use tokio::net::UnixStream;

const READ_CHUNK: usize = 64 * 1024;
const MAX_FDS_PER_MSG: usize = 16;

/// One demarshalled frame.
#[derive(Debug)]
pub struct Message {
    pub id: u32,
    pub opcode: u8,
    pub payload: Bytes,
}

/// Message-oriented wrapper around one connected socket.
pub struct Connection {
    stream: UnixStream,
    rbuf: BytesMut,
    fds: VecDeque<OwnedFd>,
    eof: bool,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream, rbuf: BytesMut::with_capacity(READ_CHUNK), fds: VecDeque::new(), eof: false }
    }

    /// Client-side connect.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::new(stream))
    }

    /// Client-side connect with the standard resolution: `PATCHBAY_REMOTE`,
    /// then `PATCHBAY_CORE`, then `patchbay-0`, under `$XDG_RUNTIME_DIR`.
    pub async fn connect_default() -> Result<Self> {
        let name = std::env::var("PATCHBAY_REMOTE")
            .or_else(|_| std::env::var("PATCHBAY_CORE"))
            .unwrap_or_else(|_| "patchbay-0".to_string());
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR").map_err(|_| {
            Error::InvalidArgument("XDG_RUNTIME_DIR not set in the environment".into())
        })?;
        Self::connect(std::path::Path::new(&runtime_dir).join(name)).await
    }

    /// Peer credentials, queried from the socket.
    pub fn peer_creds(&self) -> Result<patchbay_graph::Ucred> {
        let creds = self.stream.peer_cred()?;
        Ok(patchbay_graph::Ucred {
            uid: creds.uid(),
            gid: creds.gid(),
            pid: creds.pid().unwrap_or(0),
        })
    }

    /// Waits until the socket has data. Cancel-safe.
    pub async fn readable(&self) -> Result<()> {
        self.stream.readable().await?;
        Ok(())
    }

    /// Non-blocking read of whatever is available, descriptors included.
    ///
    /// Returns false once the peer hung up and the buffer is drained.
    pub fn fill(&mut self) -> Result<bool> {
        let mut space = [0u8; READ_CHUNK];
        loop {
            let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS_PER_MSG]);
            let result = self.stream.try_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(&mut space)];
                let msg = nix::sys::socket::recvmsg::<()>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_space),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(|errno| std::io::Error::from(errno))?;
                let mut fds = Vec::new();
                for cmsg in msg.cmsgs().map_err(std::io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(raw) = cmsg {
                        for fd in raw {
                            // SAFETY-free adoption: recvmsg transfers
                            // ownership of each right to us exactly once.
                            #[allow(unsafe_code)]
                            fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                }
                Ok((msg.bytes, fds))
            });
            match result {
                Ok((0, fds)) => {
                    self.fds.extend(fds);
                    self.eof = true;
                    return Ok(!self.rbuf.is_empty());
                },
                Ok((n, fds)) => {
                    self.rbuf.extend_from_slice(&space[..n]);
                    self.fds.extend(fds);
                },
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(true);
                },
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }

    /// Next fully buffered frame, if any.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let Some(header) = FrameHeader::peek(&self.rbuf) else {
            if self.eof && !self.rbuf.is_empty() {
                return Err(Error::Protocol("connection closed mid-frame".into()));
            }
            return Ok(None);
        };
        if self.rbuf.len() < HEADER_LEN + header.length {
            return Ok(None);
        }
        FrameHeader::advance(&mut self.rbuf);
        let payload = self.rbuf.split_to(header.length).freeze();
        Ok(Some(Message { id: header.id, opcode: header.opcode, payload }))
    }

    /// Takes the next queued descriptor, in arrival order.
    pub fn pop_fd(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front()
    }

    /// Waits for and returns the next frame. `None` on clean disconnect.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(message) = self.next_message()? {
                return Ok(Some(message));
            }
            if self.eof {
                return Ok(None);
            }
            self.readable().await?;
            if !self.fill()? && self.next_message()?.is_none() {
                return Ok(None);
            }
        }
    }

    /// Sends one frame; descriptors ride along with its first byte.
    pub async fn send(
        &mut self,
        id: u32,
        opcode: u8,
        payload: &[u8],
        fds: &[OwnedFd],
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        FrameHeader { id, opcode, length: payload.len() }.encode(&mut buf)?;
        buf.extend_from_slice(payload);

        let raw_fds: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        let mut offset = 0usize;
        while offset < buf.len() {
            self.stream.writable().await?;
            let first = offset == 0;
            let result = self.stream.try_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&buf[offset..])];
                let cmsgs: &[ControlMessage<'_>] = if first && !raw_fds.is_empty() {
                    &[ControlMessage::ScmRights(&raw_fds)]
                } else {
                    &[]
                };
                nix::sys::socket::sendmsg::<()>(
                    self.stream.as_raw_fd(),
                    &iov,
                    cmsgs,
                    MsgFlags::MSG_NOSIGNAL,
                    None,
                )
                .map_err(std::io::Error::from)
            });
            match result {
                Ok(written) => offset += written,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {},
                Err(err) => return Err(Error::Io(err)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbay_core::{MemFlags, MemPool};

    #[tokio::test]
    async fn frames_roundtrip_across_a_socketpair() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = Connection::new(a);
        let mut rx = Connection::new(b);

        tx.send(5, 2, b"hello", &[]).await.unwrap();
        tx.send(6, 3, b"", &[]).await.unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!((first.id, first.opcode, first.payload.as_ref()), (5, 2, b"hello".as_ref()));
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!((second.id, second.opcode, second.payload.len()), (6, 3, 0));
    }

    #[tokio::test]
    async fn descriptors_arrive_with_their_frame() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = Connection::new(a);
        let mut rx = Connection::new(b);

        let pool = MemPool::new();
        let block = pool
            .alloc(MemFlags::WITH_FD | MemFlags::MAP_READWRITE | MemFlags::SEAL, 4096)
            .unwrap();
        let map = pool.map(block, 0, 4096).unwrap();
        map.write_at(0, b"shared payload").unwrap();
        let fd = pool.dup_fd(block).unwrap();

        tx.send(1, 0, b"mem", &[fd]).await.unwrap();
        let message = rx.recv().await.unwrap().unwrap();
        assert_eq!(message.payload.as_ref(), b"mem");

        let received = rx.pop_fd().expect("descriptor was not delivered");
        // Mapping the received descriptor shows the same memory.
        let imported = pool.import(received, 4096, MemFlags::WITH_FD | MemFlags::MAP_READWRITE);
        let view = pool.map(imported, 0, 4096).unwrap();
        let mut back = [0u8; 14];
        view.read_at(0, &mut back).unwrap();
        assert_eq!(&back, b"shared payload");
    }

    #[tokio::test]
    async fn disconnect_yields_none() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut rx = Connection::new(b);
        drop(a);
        assert!(rx.recv().await.unwrap().is_none());
        let _ = rx; // silence unused warnings on some toolchains
    }

    #[tokio::test]
    async fn peer_creds_are_readable() {
        let (a, _b) = UnixStream::pair().unwrap();
        let conn = Connection::new(a);
        let creds = conn.peer_creds().unwrap();
        assert_eq!(creds.uid, nix::unistd::getuid().as_raw());
    }
}

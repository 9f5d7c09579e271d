// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Listening-socket bootstrap: runtime-dir placement, lockfile, stale-socket
//! cleanup.

use anyhow::{bail, Context as _};
use nix::fcntl::{Flock, FlockArg};
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;

pub const LOCK_SUFFIX: &str = ".lock";

/// Keeps the lock held and removes the socket and lock files when dropped.
pub struct SocketGuard {
    pub path: PathBuf,
    lock_path: PathBuf,
    _lock: Flock<std::fs::File>,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

/// The bound socket plus the held lock.
pub struct ServerSocket {
    pub listener: UnixListener,
    pub guard: SocketGuard,
}

impl ServerSocket {
    /// Creates `$XDG_RUNTIME_DIR/<name>` with its `.lock` companion.
    pub fn create(name: &str) -> anyhow::Result<Self> {
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .context("XDG_RUNTIME_DIR not set in the environment")?;
        Self::create_in(Path::new(&runtime_dir), name)
    }

    /// Same, rooted at an explicit directory.
    pub fn create_in(dir: &Path, name: &str) -> anyhow::Result<Self> {
        let path = dir.join(name);
        let lock_path = dir.join(format!("{name}{LOCK_SUFFIX}"));

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .mode(0o660)
            .open(&lock_path)
            .with_context(|| format!("unable to open lockfile {}", lock_path.display()))?;
        let lock = match Flock::lock(lock_file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_file, _errno)) => bail!(
                "unable to lock lockfile {}, maybe another daemon is running",
                lock_path.display()
            ),
        };

        // With the lock held, any leftover socket is stale.
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }

        let std_listener = std::os::unix::net::UnixListener::bind(&path)
            .with_context(|| format!("binding {}", path.display()))?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        tracing::info!(socket = %path.display(), "listening");
        Ok(Self { listener, guard: SocketGuard { path, lock_path, _lock: lock } })
    }

    /// Splits into the listener and the file guard.
    pub fn split(self) -> (UnixListener, SocketGuard) {
        (self.listener, self.guard)
    }
}

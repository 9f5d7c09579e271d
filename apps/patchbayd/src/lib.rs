// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The patchbay daemon: socket bootstrap, module wiring, builtin factories.

pub mod cli;
pub mod config;
pub mod idle;
pub mod logging;
pub mod nodes;
pub mod socket;

use anyhow::Context as _;
use patchbay_core::Properties;
use patchbay_graph::{GraphActor, GraphHandle, OwnerUidPolicy};
use std::time::Duration;

/// A daemon wired up and ready to accept clients. Mostly useful for tests;
/// [`serve`] is the production path.
pub struct Daemon {
    pub handle: GraphHandle,
    pub socket_guard: socket::SocketGuard,
    actor_task: tokio::task::JoinHandle<()>,
    serve_task: tokio::task::JoinHandle<()>,
}

impl Daemon {
    /// Builds the graph actor, loads the configured modules, and starts
    /// serving on the bound socket.
    pub async fn start(
        config: &config::Config,
        socket: socket::ServerSocket,
    ) -> anyhow::Result<Self> {
        let mut props = Properties::new();
        for (key, value) in &config.core.properties {
            props.set(key, value);
        }

        let (actor, handle) =
            GraphActor::new(config.socket_name(), props).context("starting the graph actor")?;
        let actor_task = tokio::spawn(actor.run());

        if config.modules.access {
            handle.add_access_policy(Box::new(OwnerUidPolicy))?;
        }
        if config.modules.suspend_on_idle {
            let timeout = Duration::from_secs(config.modules.idle_timeout_secs);
            tokio::spawn(idle::run(handle.clone(), timeout));
        }
        nodes::register_builtin(&handle).await.context("registering builtin factories")?;

        let (listener, socket_guard) = socket.split();
        let serve_handle = handle.clone();
        let serve_task = tokio::spawn(async move {
            if let Err(err) = patchbay_proto::serve(listener, serve_handle).await {
                tracing::error!(error = %err, "protocol server exited");
            }
        });

        Ok(Self { handle, socket_guard, actor_task, serve_task })
    }

    /// Stops serving and joins the tasks.
    pub async fn shutdown(self) {
        self.serve_task.abort();
        self.handle.shutdown();
        let _ = self.actor_task.await;
    }
}

/// Runs the daemon until interrupted.
pub async fn serve(config: config::Config) -> anyhow::Result<()> {
    let socket = socket::ServerSocket::create(&config.socket_name())?;
    let daemon = Daemon::start(&config, socket).await?;
    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    tracing::info!("interrupted, shutting down");
    daemon.shutdown().await;
    Ok(())
}

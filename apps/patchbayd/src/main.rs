// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use patchbayd::{cli, config, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    if let Some(cli::Commands::DefaultConfig) = args.command {
        println!("{}", toml::to_string_pretty(&config::Config::default())?);
        return Ok(());
    }

    let config = config::Config::load(&args.config)
        .map_err(|err| anyhow::anyhow!("loading {}: {err}", args.config))?;
    logging::init_logging(&config.log);
    tracing::info!(
        socket = %config.socket_name(),
        access = config.modules.access,
        suspend_on_idle = config.modules.suspend_on_idle,
        "starting patchbayd"
    );

    patchbayd::serve(config).await
}

// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "patchbay media routing daemon", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "patchbayd.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon (the default)
    Serve,
    /// Print the default configuration as TOML
    DefaultConfig,
}

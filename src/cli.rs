// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tinyclaw",
    about = "An autonomous personal-AI companion runtime",
    version
)]
pub struct Cli {
    /// Explicit config file (merged over the discovered layers)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node under the supervisor (default)
    Start,
    /// Run the node directly, without the supervisor
    Run,
    /// Print the merged configuration and exit
    ShowConfig,
}

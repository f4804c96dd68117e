// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "drover",
    version,
    about = "A fleet control plane for long-lived AI coding agents"
)]
pub struct Cli {
    /// Explicit config file, merged over the standard search paths.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the fleet: scheduler, chat connectors, webhook server.
    /// Runs until interrupted; Ctrl-C drains in-flight jobs.
    Start,

    /// Trigger one agent run and wait for it to finish.
    Trigger {
        /// Agent name from the config.
        agent: String,
        /// Named schedule whose prompt/resume settings apply.
        #[arg(long, short = 's')]
        schedule: Option<String>,
        /// Prompt override.
        #[arg(long, short = 'p')]
        prompt: Option<String>,
        /// Resume a specific backend session id.
        #[arg(long)]
        resume: Option<String>,
        /// Ignore the per-agent concurrency limit.
        #[arg(long)]
        bypass_concurrency: bool,
    },

    /// List recent jobs.
    Jobs {
        /// Maximum number of jobs to show.
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: usize,
        /// Show full records as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show fleet status: agents, schedules, session state.
    Status,

    /// Print the merged configuration and exit.
    ShowConfig,

    /// Load and validate the configuration, then exit.
    /// Exit code 0 when valid, 2 when not.
    Validate,
}

//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// GatherScatter - rendezvous barrier for a workload and its monitors
#[derive(Parser)]
#[command(
    name = "gs",
    about = "Gather-scatter rendezvous barrier for a workload and its monitors",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Path to the broker socket (overrides config)
    #[arg(short, long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the message broker on a Unix socket
    Broker,

    /// Run the gatherer, which opens the barrier once everyone is ready
    Gatherer {
        /// Participants that must report ready (whitelist)
        #[arg(value_name = "AGENT")]
        agents: Vec<String>,

        /// Without a whitelist, how many participants must report
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Run a monitor that reports ready and waits for go and stop
    Monitor {
        /// Identity reported to the gatherer
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Run a workload: announce ready, wait for go, hold, announce completed
    Workload {
        /// How long to hold the critical section
        #[arg(long, default_value = "1000")]
        hold_ms: u64,
    },

    /// Run one complete round in-process and print its report
    Demo {
        /// Monitors to start; each must report before go
        #[arg(value_name = "AGENT")]
        agents: Vec<String>,

        /// How long the workload holds its critical section
        #[arg(long, default_value = "100")]
        hold_ms: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

/// A fresh monitor identity
pub fn default_monitor_name() -> String {
    let id = uuid::Uuid::now_v7().simple().to_string();
    let name = format!("monitor-{}", &id[id.len() - 8..]);
    debug!(%name, "default_monitor_name: generated");
    name
}

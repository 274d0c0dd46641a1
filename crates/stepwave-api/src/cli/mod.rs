//! CLI command definitions for the `stepwave` binary.
//!
//! Uses clap derive macros. Commands are grouped by noun
//! (`stepwave definition register`, `stepwave instance create`).

pub mod definition;
pub mod instance;
pub mod maintenance;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Durable, wave-based workflow step execution.
#[derive(Parser)]
#[command(name = "stepwave", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "STEPWAVE_OTEL")]
    pub otel: bool,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server (runs recovery and periodic health scans).
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Manage step definitions.
    #[command(alias = "def")]
    Definition {
        #[command(subcommand)]
        action: definition::DefinitionCommand,
    },

    /// Create and inspect workflow instances.
    Instance {
        #[command(subcommand)]
        action: instance::InstanceCommand,
    },

    /// Re-adopt running instances left behind by a stopped server.
    ///
    /// Resets every in-flight step without checking heartbeats, so only run
    /// it while no `stepwave serve` is up. Use `health` next to a live server.
    Recover,

    /// Reset stale steps and revive instances with stale heartbeats.
    Health,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

//! CLI interface for Orca
//!
//! Commands and global flags, defined with clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Orca agentic task orchestrator
///
/// Runs tasks against self-hosted gpt-oss endpoints, waking them on demand
/// and routing tool calls to registered tool backends.
#[derive(Parser, Debug)]
#[command(name = "orca")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the engine in the foreground until SIGINT/SIGTERM
    Serve,

    /// Create a task, run it to completion and print the outcome
    Run {
        /// Short task title
        title: String,

        /// What the agent should do
        description: String,

        /// Target endpoint key
        #[arg(short, long, default_value = "20b")]
        model: String,

        /// Task priority (low, normal, high, critical)
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// Seconds to wait for the task to finish
        #[arg(long, default_value = "900")]
        timeout: u64,
    },

    /// Inspect and control model endpoints
    Endpoints {
        #[command(subcommand)]
        action: EndpointAction,
    },

    /// Inspect the tool catalog
    Tools {
        #[command(subcommand)]
        action: ToolAction,
    },

    /// Probe endpoints and tool backends
    Doctor,

    /// Manage credentials in the OS keyring
    Secrets {
        #[command(subcommand)]
        action: SecretAction,
    },
}

/// Endpoint control actions
#[derive(Subcommand, Debug)]
pub enum EndpointAction {
    /// Show lifecycle state of every endpoint (or one)
    Status {
        /// Endpoint key
        key: Option<String>,
    },

    /// Scale an endpoint up and wait until it is Running
    Wake {
        /// Endpoint key
        key: String,

        /// Seconds to wait for readiness
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// Scale an endpoint down
    Sleep {
        /// Endpoint key
        key: String,
    },
}

/// Tool catalog actions
#[derive(Subcommand, Debug)]
pub enum ToolAction {
    /// List every tool, or those of one backend
    List {
        /// Only tools of this backend
        #[arg(long)]
        backend: Option<String>,
    },

    /// Rank tools by relevance to a query
    Search {
        /// Search query
        query: String,
    },
}

/// Keyring actions
#[derive(Subcommand, Debug)]
pub enum SecretAction {
    /// Store a secret (prompted on stdin)
    Set {
        /// Secret name, e.g. the endpoint's api_key_env
        name: String,
    },

    /// Remove a secret
    Delete {
        /// Secret name
        name: String,
    },
}

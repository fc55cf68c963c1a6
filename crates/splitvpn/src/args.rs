//! CLI argument definitions.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

/// splitvpn operator CLI
#[derive(Parser, Debug)]
#[command(name = "splitvpn", version, about = "Per-app WireGuard tunnel manager")]
pub struct Args {
    /// Settings file (TOML). Built-in defaults when omitted.
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a config blob and print a redacted summary
    Check {
        /// Config blob (JSON), `-` for stdin
        config: PathBuf,
    },

    /// Render a config blob as wg-quick text
    Render {
        /// Config blob (JSON), `-` for stdin
        config: PathBuf,
    },

    /// Generate a key pair
    Keygen {
        /// Emit a complete config blob for this server endpoint
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// List selectable applications as JSON
    Apps,

    /// Run a session against the in-process simulated host and backend
    Simulate(SimulateArgs),
}

#[derive(ClapArgs, Debug)]
pub struct SimulateArgs {
    /// Config blob (JSON), `-` for stdin
    pub config: PathBuf,

    /// Application to route through the tunnel (repeatable). All apps when omitted.
    #[arg(long = "app")]
    pub apps: Vec<String>,

    /// Seconds to hold the session before disconnecting (Ctrl-C ends early)
    #[arg(long, default_value = "5")]
    pub hold_secs: u64,

    /// Number of initial interface requests the host refuses
    #[arg(long, default_value = "0")]
    pub refuse_interface: usize,

    /// Number of initial up requests that leave the tunnel down
    #[arg(long, default_value = "0")]
    pub fail_up: usize,
}

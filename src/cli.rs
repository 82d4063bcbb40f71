//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// keel - keeps remote issues in line with the ones you declare
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version)]
#[command(about = "Declarative reconciliation of tracked issues against a remote issue tracker")]
#[command(
    long_about = "keel watches TrackedIssue objects and makes sure each one has a matching, open issue on the remote tracker, closing it again when the object is deleted."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller until interrupted
    Run {
        /// Config file (TOML)
        #[arg(short, long, env = "KEEL_CONFIG")]
        config: Option<PathBuf>,

        /// Manifest with the secrets and issues to load (YAML)
        #[arg(short, long)]
        manifest: PathBuf,

        /// Use the in-memory tracker and serve its inspection endpoint
        #[arg(long, default_value_t = false)]
        fake_remote: bool,
    },

    /// Print the effective configuration
    Config {
        /// Config file (TOML)
        #[arg(short, long, env = "KEEL_CONFIG")]
        config: Option<PathBuf>,
    },
}

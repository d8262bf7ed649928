//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Production detection replay tool.
///
/// Feeds machine detection events (stamps, cycle begins and ends, sequence
/// ends) through the detection core and keeps the derived cycles, operation
/// slots and sequence slots in a local `SQLite` database.
#[derive(Debug, Parser)]
#[command(name = "pd", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create the database and print its location.
    Init,

    /// Load machines, operations, sequences and orders from a JSON document.
    Reference {
        /// The reference data document.
        file: PathBuf,
    },

    /// Replay JSON-lines detection events.
    Replay {
        /// The event stream; stdin when omitted.
        file: Option<PathBuf>,

        /// Only replay the events of this machine.
        #[arg(long)]
        machine: Option<i64>,
    },

    /// Show the detected timeline.
    Status {
        /// Only show this machine.
        #[arg(long)]
        machine: Option<i64>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

//! Production detection CLI library.
//!
//! This crate provides the `pd` command: it loads reference data, replays
//! detection events through the detection core and prints the resulting
//! production timeline.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands};
pub use config::Config;

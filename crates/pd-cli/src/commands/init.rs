//! Init command for creating the database.

use std::io::Write;

use anyhow::{Context, Result};

use pd_db::Database;

use crate::Config;

/// Runs the init command.
pub fn run<W: Write>(writer: &mut W, config: &Config) -> Result<()> {
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }
    Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;

    writeln!(writer, "Database: {}", config.database_path.display())?;
    Ok(())
}

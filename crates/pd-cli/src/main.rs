use std::io::{self, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pd_cli::commands::{init, reference, replay, status};
use pd_cli::{Cli, Commands, Config};
use pd_core::MachineId;

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(pd_db::Database, Config)> {
    let config = load_config(config_path)?;

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = pd_db::Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    Ok((db, config))
}

fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");
    Ok(config)
}

fn machine_id(id: Option<i64>) -> Result<Option<MachineId>> {
    id.map(MachineId::new)
        .transpose()
        .context("invalid --machine")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // try_init: tests may have installed a subscriber already
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let mut stdout = io::stdout().lock();
    match &cli.command {
        Some(Commands::Init) => {
            let config = load_config(cli.config.as_deref())?;
            init::run(&mut stdout, &config)?;
        }
        Some(Commands::Reference { file }) => {
            let (mut db, _config) = open_database(cli.config.as_deref())?;
            reference::run(&mut stdout, &mut db, file)?;
        }
        Some(Commands::Replay { file, machine }) => {
            let machine = machine_id(*machine)?;
            let (mut db, config) = open_database(cli.config.as_deref())?;
            let summary = match file {
                Some(path) => {
                    let file = std::fs::File::open(path)
                        .with_context(|| format!("failed to open {}", path.display()))?;
                    replay::run(BufReader::new(file), &mut db, &config, machine)?
                }
                None => replay::run(io::stdin().lock(), &mut db, &config, machine)?,
            };
            replay::print_summary(&mut stdout, &summary)?;
        }
        Some(Commands::Status { machine, json }) => {
            let machine = machine_id(*machine)?;
            let (db, _config) = open_database(cli.config.as_deref())?;
            status::run(&mut stdout, &db, machine, *json)?;
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}

//! Reference command for loading the data detection reads.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use pd_db::{Database, ReferenceData};

pub fn run<W: Write>(writer: &mut W, db: &mut Database, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let data: ReferenceData = serde_json::from_str(&content)
        .with_context(|| format!("invalid reference data in {}", path.display()))?;

    db.load_reference(&data)
        .context("failed to load reference data")?;
    tracing::debug!(
        machines = data.machines.len(),
        operations = data.operations.len(),
        sequences = data.sequences.len(),
        "reference data loaded"
    );

    writeln!(writer, "Machines:             {}", data.machines.len())?;
    writeln!(writer, "Operations:           {}", data.operations.len())?;
    writeln!(writer, "Sequences:            {}", data.sequences.len())?;
    writeln!(writer, "Components:           {}", data.components.len())?;
    writeln!(writer, "Work orders:          {}", data.work_orders.len())?;
    writeln!(
        writer,
        "Manufacturing orders: {}",
        data.manufacturing_orders.len()
    )?;
    Ok(())
}

//! Status command for showing the detected timeline of each machine.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use pd_core::{LogLevel, MachineId, MachineModuleId, Store, TimeRange};
use pd_db::Database;

/// How many detection logs are shown per machine.
const RECENT_LOGS: usize = 10;

#[derive(Debug, Serialize)]
pub struct MachineStatus {
    pub machine: MachineId,
    pub cycles: Vec<CycleView>,
    pub operation_slots: Vec<OperationSlotView>,
    pub sequence_slots: Vec<SequenceSlotView>,
    pub logs: Vec<LogView>,
}

#[derive(Debug, Serialize)]
pub struct CycleView {
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub full: bool,
    pub quantity: Option<i32>,
    pub operation_slot: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct OperationSlotView {
    pub id: i64,
    pub range: TimeRange,
    pub operation: Option<i64>,
    pub total_cycles: i32,
}

#[derive(Debug, Serialize)]
pub struct SequenceSlotView {
    pub module: MachineModuleId,
    pub range: TimeRange,
    pub sequence: Option<i64>,
    pub next_begin: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct LogView {
    pub date_time: DateTime<Utc>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &Database,
    machine: Option<MachineId>,
    json: bool,
) -> Result<()> {
    let statuses = collect(db, machine)?;

    if json {
        serde_json::to_writer_pretty(&mut *writer, &statuses)?;
        writeln!(writer)?;
        return Ok(());
    }

    if statuses.is_empty() {
        writeln!(writer, "No machines.")?;
        return Ok(());
    }
    for (idx, status) in statuses.iter().enumerate() {
        if idx > 0 {
            writeln!(writer)?;
        }
        write_status(writer, status)?;
    }
    Ok(())
}

fn collect(db: &Database, machine: Option<MachineId>) -> Result<Vec<MachineStatus>> {
    let machines = db.machines().context("failed to list machines")?;
    let mut statuses = Vec::new();
    for (id, modules) in machines {
        if machine.is_some_and(|machine| machine != id) {
            continue;
        }
        let cycles = db
            .cycles(id)?
            .into_iter()
            .map(|cycle| CycleView {
                begin: cycle.begin,
                end: cycle.end,
                full: cycle.full,
                quantity: cycle.quantity,
                operation_slot: cycle.operation_slot.map(i64::from),
            })
            .collect();
        let operation_slots = db
            .operation_slots(id)?
            .into_iter()
            .map(|slot| OperationSlotView {
                id: slot.id.get(),
                range: slot.range,
                operation: slot.operation.map(i64::from),
                total_cycles: slot.total_cycles,
            })
            .collect();
        let mut sequence_slots = Vec::new();
        for module in modules {
            sequence_slots.extend(db.sequence_slots(module)?.into_iter().map(|slot| {
                SequenceSlotView {
                    module,
                    range: slot.range,
                    sequence: slot.sequence.map(i64::from),
                    next_begin: slot.next_begin,
                }
            }));
        }
        let mut logs = db.detection_logs(id)?;
        let recent = logs.split_off(logs.len().saturating_sub(RECENT_LOGS));
        let logs = recent
            .into_iter()
            .map(|log| LogView {
                date_time: log.date_time,
                level: log.level,
                source: log.source,
                message: log.message,
            })
            .collect();

        statuses.push(MachineStatus {
            machine: id,
            cycles,
            operation_slots,
            sequence_slots,
            logs,
        });
    }
    if let Some(machine) = machine.filter(|_| statuses.is_empty()) {
        anyhow::bail!("unknown machine {machine}");
    }
    Ok(statuses)
}

fn write_status<W: Write>(writer: &mut W, status: &MachineStatus) -> Result<()> {
    writeln!(writer, "Machine {}", status.machine)?;

    writeln!(writer, "Cycles:")?;
    if status.cycles.is_empty() {
        writeln!(writer, "  (none)")?;
    }
    for cycle in &status.cycles {
        write!(
            writer,
            "- {} -> {}",
            format_time(cycle.begin),
            format_time(cycle.end)
        )?;
        if cycle.full {
            write!(writer, " full")?;
        }
        if let Some(quantity) = cycle.quantity {
            write!(writer, " x{quantity}")?;
        }
        if let Some(slot) = cycle.operation_slot {
            write!(writer, " slot {slot}")?;
        }
        writeln!(writer)?;
    }

    writeln!(writer, "Operation slots:")?;
    if status.operation_slots.is_empty() {
        writeln!(writer, "  (none)")?;
    }
    for slot in &status.operation_slots {
        writeln!(
            writer,
            "- #{} {} operation {} cycles {}",
            slot.id,
            slot.range,
            slot.operation.map_or_else(|| "-".to_string(), |op| op.to_string()),
            slot.total_cycles
        )?;
    }

    writeln!(writer, "Sequence slots:")?;
    if status.sequence_slots.is_empty() {
        writeln!(writer, "  (none)")?;
    }
    for slot in &status.sequence_slots {
        write!(
            writer,
            "- module {} {} sequence {}",
            slot.module,
            slot.range,
            slot.sequence.map_or_else(|| "-".to_string(), |seq| seq.to_string())
        )?;
        if let Some(next_begin) = slot.next_begin {
            write!(writer, " next {}", format_time(Some(next_begin)))?;
        }
        writeln!(writer)?;
    }

    writeln!(writer, "Detection logs:")?;
    if status.logs.is_empty() {
        writeln!(writer, "  (none)")?;
    }
    for log in &status.logs {
        writeln!(
            writer,
            "- {} {} [{}] {}",
            format_time(Some(log.date_time)),
            log.level,
            log.source,
            log.message
        )?;
    }
    Ok(())
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map_or_else(
        || "?".to_string(),
        |t| t.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;
    use insta::assert_snapshot;
    use pd_core::{Association, DetectionLog, Operation, OperationId};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        let machine = MachineId::new(1).unwrap();
        db.insert_machine(machine, Some("lathe")).unwrap();
        db.insert_machine_module(MachineModuleId::new(10).unwrap(), machine)
            .unwrap();
        db
    }

    #[test]
    fn status_of_idle_machine() {
        let db = setup();
        let mut output = Vec::new();
        run(&mut output, &db, None, false).unwrap();

        assert_snapshot!(String::from_utf8(output).unwrap(), @r"
        Machine 1
        Cycles:
          (none)
        Operation slots:
          (none)
        Sequence slots:
          (none)
        Detection logs:
          (none)
        ");
    }

    #[test]
    fn status_lists_slots_and_logs() {
        let mut db = setup();
        let machine = MachineId::new(1).unwrap();
        db.insert_operation(&Operation {
            id: OperationId::new(3).unwrap(),
            code: Some("OP3".to_string()),
            name: None,
            intermediate_work_pieces: Vec::new(),
        })
        .unwrap();
        db.apply_association(&Association::operation(
            machine,
            TimeRange::new(at(0), at(600)).unwrap(),
            OperationId::new(3).ok(),
        ))
        .unwrap();
        db.insert_detection_log(&DetectionLog {
            date_time: at(30),
            level: LogLevel::Warn,
            message: "late stamp".to_string(),
            machine,
            module: None,
            source: "OperationCycleDetection".to_string(),
        })
        .unwrap();

        let mut output = Vec::new();
        run(&mut output, &db, Some(machine), false).unwrap();

        assert_snapshot!(String::from_utf8(output).unwrap(), @r"
        Machine 1
        Cycles:
          (none)
        Operation slots:
        - #1 [2025-01-01T08:00:00.000Z, 2025-01-01T08:10:00.000Z) operation 3 cycles 0
        Sequence slots:
          (none)
        Detection logs:
        - 2025-01-01T08:00:30Z warn [OperationCycleDetection] late stamp
        ");
    }

    #[test]
    fn status_json_lists_machines() {
        let db = setup();
        let mut output = Vec::new();
        run(&mut output, &db, None, true).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(value[0]["machine"], 1);
        assert_eq!(value[0]["cycles"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn status_rejects_unknown_machine() {
        let db = setup();
        let err = run(&mut Vec::new(), &db, MachineId::new(7).ok(), false).unwrap_err();
        assert_eq!(err.to_string(), "unknown machine 7");
    }
}

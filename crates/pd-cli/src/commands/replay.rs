//! Replay command: feeds a JSON-lines event stream through the detection core.
//!
//! Each line is one event for a machine module:
//!
//! ```json
//! {"kind": "stamp", "module": 10, "date_time": "2025-01-01T08:00:00Z", "stamp": {"id": 1, "operation_cycle_begin": true}}
//! {"kind": "stop_cycle", "module": 10, "date_time": "2025-01-01T08:01:00Z", "quantity": 2}
//! ```
//!
//! Events are applied in file order, one [`MasterDetection`] per module.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use pd_core::{DetectionError, MachineId, MachineModuleId, SequenceId, Stamp, TxScope};
use pd_db::Database;
use pd_detect::{DetectionContext, MasterDetection};

use crate::Config;

/// A detection event of one machine module.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayEvent {
    Stamp {
        module: MachineModuleId,
        date_time: DateTime<Utc>,
        stamp: Stamp,
        #[serde(default)]
        quantity: Option<i32>,
    },
    StartCycle {
        module: MachineModuleId,
        date_time: DateTime<Utc>,
        #[serde(default)]
        operation_code: Option<String>,
    },
    StopCycle {
        module: MachineModuleId,
        date_time: DateTime<Utc>,
        #[serde(default)]
        quantity: Option<i32>,
        #[serde(default)]
        operation_code: Option<String>,
    },
    StartStopCycle {
        module: MachineModuleId,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    StopSequence {
        module: MachineModuleId,
        date_time: DateTime<Utc>,
    },
    /// Progress inside the running sequence.
    ///
    /// With `elapsed_seconds` the milestone is set; with only `sequence` the
    /// stored milestone is checked against it.
    Milestone {
        module: MachineModuleId,
        date_time: DateTime<Utc>,
        #[serde(default)]
        sequence: Option<SequenceId>,
        #[serde(default)]
        elapsed_seconds: Option<u32>,
    },
}

impl ReplayEvent {
    pub const fn module(&self) -> MachineModuleId {
        match self {
            Self::Stamp { module, .. }
            | Self::StartCycle { module, .. }
            | Self::StopCycle { module, .. }
            | Self::StartStopCycle { module, .. }
            | Self::StopSequence { module, .. }
            | Self::Milestone { module, .. } => *module,
        }
    }

    fn validate(&self) -> Result<()> {
        if let Self::Milestone {
            sequence: None,
            elapsed_seconds: None,
            ..
        } = self
        {
            anyhow::bail!("a milestone needs elapsed_seconds or a sequence");
        }
        Ok(())
    }
}

/// What a replay did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub applied: usize,
    /// Events of other machines than the requested one.
    pub skipped: usize,
    /// Extra attempts after a stale or transient failure.
    pub retried: usize,
}

/// Parses the event stream, skipping blank lines.
///
/// Returns `(line number, event)` pairs.
pub fn parse_events<R: BufRead>(reader: R) -> Result<Vec<(usize, ReplayEvent)>> {
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event: ReplayEvent = serde_json::from_str(trimmed)
            .map_err(anyhow::Error::from)
            .and_then(|event: ReplayEvent| event.validate().map(|()| event))
            .with_context(|| format!("invalid event on line {}", idx + 1))?;
        events.push((idx + 1, event));
    }
    Ok(events)
}

/// Replays `reader` into `db`.
///
/// A failed event aborts the replay, except stale and transient failures
/// which are retried up to `config.max_attempts` times.
pub fn run<R: BufRead>(
    reader: R,
    db: &mut Database,
    config: &Config,
    machine: Option<MachineId>,
) -> Result<ReplaySummary> {
    let events = parse_events(reader)?;
    let owners: HashMap<MachineModuleId, MachineId> = db
        .machines()
        .context("failed to list machines")?
        .into_iter()
        .flat_map(|(machine, modules)| modules.into_iter().map(move |module| (module, machine)))
        .collect();

    let mut detections: BTreeMap<MachineModuleId, MasterDetection> = BTreeMap::new();
    let mut summary = ReplaySummary::default();
    for (line, event) in &events {
        let module = event.module();
        let owner = *owners
            .get(&module)
            .with_context(|| format!("unknown machine module {module} on line {line}"))?;
        if machine.is_some_and(|machine| machine != owner) {
            summary.skipped += 1;
            continue;
        }

        let master = match detections.entry(module) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let context = DetectionContext::new(owner, module)
                    .with_config(config.detection.clone());
                let master = MasterDetection::new(context);
                master
                    .detection_process_start()
                    .with_context(|| format!("failed to start the detection of module {module}"))?;
                entry.insert(master)
            }
        };

        let mut attempt = 1;
        loop {
            match apply(master, db, event) {
                Ok(()) => break,
                Err(err) if err.kind().is_retryable() && attempt < config.max_attempts => {
                    tracing::warn!(line, attempt, error = %err, "retry the event");
                    attempt += 1;
                    summary.retried += 1;
                }
                Err(err) => {
                    return Err(
                        anyhow::Error::new(err).context(format!("event on line {line} failed"))
                    );
                }
            }
        }
        summary.applied += 1;
    }

    for (module, master) in &detections {
        master
            .detection_process_complete()
            .with_context(|| format!("failed to complete the detection of module {module}"))?;
    }
    tracing::info!(
        applied = summary.applied,
        skipped = summary.skipped,
        retried = summary.retried,
        "replay complete"
    );
    Ok(summary)
}

/// Prints the outcome of a replay.
pub fn print_summary<W: Write>(writer: &mut W, summary: &ReplaySummary) -> Result<()> {
    writeln!(writer, "Applied: {}", summary.applied)?;
    writeln!(writer, "Skipped: {}", summary.skipped)?;
    writeln!(writer, "Retried: {}", summary.retried)?;
    Ok(())
}

fn apply(
    master: &mut MasterDetection,
    db: &mut Database,
    event: &ReplayEvent,
) -> Result<(), DetectionError> {
    match event {
        ReplayEvent::Stamp {
            date_time,
            stamp,
            quantity,
            ..
        } => master.start_stamp(db, stamp, *quantity, *date_time),
        ReplayEvent::StartCycle {
            date_time,
            operation_code,
            ..
        } => match operation_code {
            Some(code) => master.start_cycle_with_operation_code(db, code, *date_time),
            None => master.start_cycle(db, *date_time),
        },
        ReplayEvent::StopCycle {
            date_time,
            quantity,
            operation_code,
            ..
        } => match operation_code {
            Some(code) => master.stop_cycle_with_operation_code(db, code, *quantity, *date_time),
            None => master.stop_cycle(db, *quantity, *date_time),
        },
        ReplayEvent::StartStopCycle { begin, end, .. } => master.start_stop_cycle(db, *begin, *end),
        ReplayEvent::StopSequence { date_time, .. } => master.stop_sequence(db, *date_time),
        ReplayEvent::Milestone {
            date_time,
            sequence,
            elapsed_seconds,
            ..
        } => {
            let milestone = master.milestone_detection();
            match (elapsed_seconds, sequence) {
                (Some(seconds), _) => milestone.set_milestone(
                    db,
                    TxScope::Own,
                    *date_time,
                    Duration::seconds(i64::from(*seconds)),
                    *sequence,
                ),
                (None, Some(sequence)) => milestone.check_sequence(db, TxScope::Own, *sequence),
                // rejected by parse_events
                (None, None) => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use insta::assert_snapshot;
    use pd_core::{LogLevel, Operation, OperationId, Sequence, Store};

    fn machine(id: i64) -> MachineId {
        MachineId::new(id).unwrap()
    }

    fn module(id: i64) -> MachineModuleId {
        MachineModuleId::new(id).unwrap()
    }

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.insert_machine(machine(1), Some("lathe")).unwrap();
        db.insert_machine_module(module(10), machine(1)).unwrap();
        db.insert_machine(machine(2), Some("mill")).unwrap();
        db.insert_machine_module(module(20), machine(2)).unwrap();
        db.insert_operation(&Operation {
            id: OperationId::new(1).unwrap(),
            code: Some("OP1".to_string()),
            name: None,
            intermediate_work_pieces: Vec::new(),
        })
        .unwrap();
        db.insert_sequence(&Sequence {
            id: SequenceId::new(5).unwrap(),
            operation: OperationId::new(1).unwrap(),
            name: None,
            auto_only: false,
        })
        .unwrap();
        db
    }

    fn config() -> Config {
        Config {
            database_path: ":memory:".into(),
            ..Config::default()
        }
    }

    // ========== Parse Tests ==========

    #[test]
    fn parse_events_skips_blank_lines() {
        let input = r#"
{"kind":"start_cycle","module":10,"date_time":"2025-01-01T08:00:00Z"}

{"kind":"stop_cycle","module":10,"date_time":"2025-01-01T08:01:00Z","quantity":2}
"#;
        let events = parse_events(Cursor::new(input)).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, 2);
        assert_eq!(events[1].0, 4);
        assert!(matches!(
            events[1].1,
            ReplayEvent::StopCycle {
                quantity: Some(2),
                operation_code: None,
                ..
            }
        ));
    }

    #[test]
    fn parse_events_reports_line_of_unknown_kind() {
        let input = "{\"kind\":\"start_cycle\",\"module\":10,\"date_time\":\"2025-01-01T08:00:00Z\"}\n{\"kind\":\"pause\",\"module\":10}";
        let err = parse_events(Cursor::new(input)).unwrap_err();
        assert_eq!(err.to_string(), "invalid event on line 2");
    }

    #[test]
    fn parse_events_rejects_empty_milestone() {
        let input = r#"{"kind":"milestone","module":10,"date_time":"2025-01-01T08:00:00Z"}"#;
        let err = parse_events(Cursor::new(input)).unwrap_err();
        assert_eq!(err.to_string(), "invalid event on line 1");
    }

    // ========== Replay Tests ==========

    #[test]
    fn replay_builds_cycles_and_slots() {
        let mut db = setup();
        let input = r#"
{"kind":"stamp","module":10,"date_time":"2025-01-01T08:00:00Z","stamp":{"id":1,"operation_cycle_begin":true,"sequence":5}}
{"kind":"stop_cycle","module":10,"date_time":"2025-01-01T08:01:00Z","quantity":1}
{"kind":"start_cycle","module":10,"date_time":"2025-01-01T08:01:10Z"}
"#;

        let summary = run(Cursor::new(input), &mut db, &config(), None).unwrap();

        assert_eq!(summary.applied, 3);
        let cycles = db.cycles(machine(1)).unwrap();
        assert_eq!(cycles.len(), 2);
        assert!(cycles[0].full);
        assert_eq!(cycles[0].quantity, Some(1));
        let slots = db.operation_slots(machine(1)).unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].operation, OperationId::new(1).ok());
        assert_eq!(slots[0].total_cycles, 2);
    }

    #[test]
    fn replay_skips_other_machines() {
        let mut db = setup();
        let input = r#"
{"kind":"start_cycle","module":10,"date_time":"2025-01-01T08:00:00Z"}
{"kind":"start_cycle","module":20,"date_time":"2025-01-01T08:00:00Z"}
"#;

        let summary = run(Cursor::new(input), &mut db, &config(), Some(machine(2))).unwrap();

        assert_eq!(summary.applied, 1);
        assert_eq!(summary.skipped, 1);
        assert!(db.cycles(machine(1)).unwrap().is_empty());
        assert_eq!(db.cycles(machine(2)).unwrap().len(), 1);
    }

    #[test]
    fn replay_aborts_on_incoherent_stamp() {
        let mut db = setup();
        let input = r#"
{"kind":"start_cycle","module":10,"date_time":"2025-01-01T08:00:00Z"}
{"kind":"stamp","module":10,"date_time":"2025-01-01T08:00:30Z","stamp":{"id":2,"operation_cycle_begin":true,"operation_cycle_end":true}}
{"kind":"stop_cycle","module":10,"date_time":"2025-01-01T08:01:00Z"}
"#;

        let err = run(Cursor::new(input), &mut db, &config(), None).unwrap_err();

        assert_eq!(err.to_string(), "event on line 3 failed");
        let cycles = db.cycles(machine(1)).unwrap();
        assert_eq!(cycles.len(), 1);
        assert!(cycles[0].end.is_none());
        let logs = db.detection_logs(machine(1)).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
    }

    #[test]
    fn replay_rejects_unknown_module() {
        let mut db = setup();
        let input = r#"{"kind":"stop_sequence","module":99,"date_time":"2025-01-01T08:00:00Z"}"#;

        let err = run(Cursor::new(input), &mut db, &config(), None).unwrap_err();

        assert_eq!(err.to_string(), "unknown machine module 99 on line 1");
    }

    #[test]
    fn milestone_event_records_elapsed_time() {
        let mut db = setup();
        let input = r#"
{"kind":"stamp","module":10,"date_time":"2025-01-01T08:00:00Z","stamp":{"id":1,"sequence":5}}
{"kind":"milestone","module":10,"date_time":"2025-01-01T08:00:30Z","elapsed_seconds":30,"sequence":5}
"#;

        run(Cursor::new(input), &mut db, &config(), None).unwrap();

        let milestone = db.sequence_milestone(module(10)).unwrap().unwrap();
        assert_eq!(milestone.milestone, Some(Duration::seconds(30)));
        assert_eq!(milestone.sequence, SequenceId::new(5).ok());
    }

    #[test]
    fn summary_output() {
        let summary = ReplaySummary {
            applied: 4,
            skipped: 1,
            retried: 0,
        };
        let mut output = Vec::new();
        print_summary(&mut output, &summary).unwrap();
        assert_snapshot!(String::from_utf8(output).unwrap(), @r"
        Applied: 4
        Skipped: 1
        Retried: 0
        ");
    }
}

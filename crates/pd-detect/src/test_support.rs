//! Fixtures shared by the unit tests of the detection components.

use chrono::{DateTime, TimeZone, Utc};
use pd_core::{
    Association, DetectionLog, MachineId, MachineModuleId, Operation, OperationId, Sequence,
    SequenceId, Store, TimeRange,
};
use pd_db::Database;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Seconds since the fixture epoch.
pub fn secs(t: DateTime<Utc>) -> i64 {
    (t - at(0)).num_seconds()
}

pub fn machine() -> MachineId {
    MachineId::new(1).unwrap()
}

pub fn module() -> MachineModuleId {
    MachineModuleId::new(10).unwrap()
}

pub fn op(id: i64) -> OperationId {
    OperationId::new(id).unwrap()
}

pub fn seq(id: i64) -> SequenceId {
    SequenceId::new(id).unwrap()
}

pub fn setup() -> Database {
    let db = Database::open_in_memory().expect("open in-memory db");
    db.insert_machine(machine(), Some("lathe")).unwrap();
    db.insert_machine_module(module(), machine()).unwrap();
    db
}

pub fn insert_operation(db: &Database, id: i64, code: &str) {
    db.insert_operation(&Operation {
        id: op(id),
        code: Some(code.to_string()),
        name: None,
        intermediate_work_pieces: Vec::new(),
    })
    .unwrap();
}

pub fn insert_sequence(db: &Database, id: i64, operation: i64, auto_only: bool) -> Sequence {
    let sequence = Sequence {
        id: seq(id),
        operation: op(operation),
        name: None,
        auto_only,
    };
    db.insert_sequence(&sequence).unwrap();
    sequence
}

pub fn associate(db: &mut Database, begin: i64, end: Option<i64>, operation: Option<i64>) {
    let range = TimeRange::clamped(at(begin), end.map(at));
    db.apply_association(&Association::operation(machine(), range, operation.map(op)))
        .expect("apply association");
}

/// `(begin, end, operation)` of every operation slot, in seconds.
pub fn slot_summary(db: &Database) -> Vec<(i64, Option<i64>, Option<i64>)> {
    db.operation_slots(machine())
        .unwrap()
        .iter()
        .map(|slot| {
            (
                secs(slot.range.begin),
                slot.range.end.map(secs),
                slot.operation.map(OperationId::get),
            )
        })
        .collect()
}

pub fn logs(db: &Database) -> Vec<DetectionLog> {
    db.detection_logs(machine()).unwrap()
}

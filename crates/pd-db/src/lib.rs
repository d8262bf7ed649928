//! Storage layer for production detection.
//!
//! Provides a `rusqlite` implementation of [`pd_core::Store`].
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! One `Database` serves one detection stream; machines processed in parallel
//! each open their own connection to the same file.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in RFC 3339 format with milliseconds
//! (e.g., `2024-01-15T10:30:00.000Z`), so lexicographic ordering matches
//! chronological ordering. A NULL `end_at` is an open (unbounded) end.
//!
//! ## Optimistic Locking
//!
//! Rows mutated by detection (`operation_cycles`, `sequence_slots`,
//! `auto_sequences`) carry a `version` column. Updates and deletes match on
//! the version they read; a change of zero rows is reported as a stale object.
//!
//! ## Transactions
//!
//! The outermost transaction is `BEGIN IMMEDIATE`; nested scopes are
//! savepoints. `synchronous_commit: false` lowers `PRAGMA synchronous` for the
//! duration of the transaction.

mod reference;
mod store;
mod timeline;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, Row, params};
use thiserror::Error;
use tracing::debug;

use pd_core::{
    Association, AssociationTarget, ErrorKind, IsoFileId, MachineId, MachineModuleId,
    StoreError, TimeRange, TransactionOptions, ValidationError,
};

pub use reference::{ComponentRecord, MachineRecord, ReferenceData, WorkOrderRecord};

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A versioned row changed since it was read.
    #[error("stale row {id} in {table}")]
    StaleRow { table: &'static str, id: i64 },
    /// A row was expected to have been persisted.
    #[error("{table} row has no id")]
    MissingId { table: &'static str },
    /// A cycle has neither a begin nor an end.
    #[error("operation cycle has no date/time")]
    CycleWithoutDateTime,
    /// No transaction is active.
    #[error("no active transaction")]
    NoTransaction,
    /// A stored value failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl DbError {
    /// Retry classification of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sqlite(err) => match err.sqlite_error_code() {
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
            Self::StaleRow { .. } => ErrorKind::StaleObject,
            Self::MissingId { .. }
            | Self::CycleWithoutDateTime
            | Self::NoTransaction
            | Self::Validation(_) => ErrorKind::Fatal,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        let kind = err.kind();
        let message = err.to_string();
        Self::with_source(kind, message, err)
    }
}

/// A pending association waiting for asynchronous processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAssociation {
    pub machine: MachineId,
    pub kind: String,
    pub range: TimeRange,
    pub value: Option<i64>,
    pub auto: bool,
}

/// An iso-file slot of a machine module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoFileSlot {
    pub module: MachineModuleId,
    pub range: TimeRange,
    pub iso_file: IsoFileId,
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
    /// Number of open transaction scopes.
    depth: usize,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn, depth: 0 };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn, depth: 0 };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS machines (
                id INTEGER PRIMARY KEY,
                name TEXT
            );

            CREATE TABLE IF NOT EXISTS machine_modules (
                id INTEGER PRIMARY KEY,
                machine_id INTEGER NOT NULL,
                name TEXT,
                FOREIGN KEY (machine_id) REFERENCES machines(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_machine_modules_machine ON machine_modules(machine_id);

            CREATE TABLE IF NOT EXISTS operations (
                id INTEGER PRIMARY KEY,
                code TEXT,
                name TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_operations_code ON operations(code);

            CREATE TABLE IF NOT EXISTS operation_work_pieces (
                operation_id INTEGER NOT NULL,
                work_piece_id INTEGER NOT NULL,
                PRIMARY KEY (operation_id, work_piece_id),
                FOREIGN KEY (operation_id) REFERENCES operations(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS sequences (
                id INTEGER PRIMARY KEY,
                operation_id INTEGER NOT NULL,
                name TEXT,
                auto_only INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (operation_id) REFERENCES operations(id)
            );

            CREATE TABLE IF NOT EXISTS components (
                id INTEGER PRIMARY KEY,
                name TEXT
            );

            CREATE TABLE IF NOT EXISTS component_work_pieces (
                component_id INTEGER NOT NULL,
                work_piece_id INTEGER NOT NULL,
                PRIMARY KEY (component_id, work_piece_id),
                FOREIGN KEY (component_id) REFERENCES components(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS work_orders (
                id INTEGER PRIMARY KEY,
                name TEXT
            );

            CREATE TABLE IF NOT EXISTS work_order_components (
                work_order_id INTEGER NOT NULL,
                component_id INTEGER NOT NULL,
                PRIMARY KEY (work_order_id, component_id),
                FOREIGN KEY (work_order_id) REFERENCES work_orders(id) ON DELETE CASCADE
            );

            -- Manufacturing orders: order_index is the position in a machine's queue
            CREATE TABLE IF NOT EXISTS manufacturing_orders (
                id INTEGER PRIMARY KEY,
                operation_id INTEGER NOT NULL,
                machine_id INTEGER,
                order_index INTEGER,
                work_order_id INTEGER,
                component_id INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_manufacturing_orders_operation ON manufacturing_orders(operation_id);

            CREATE TABLE IF NOT EXISTS operation_slots (
                id INTEGER PRIMARY KEY,
                machine_id INTEGER NOT NULL,
                begin_at TEXT NOT NULL,
                end_at TEXT,
                operation_id INTEGER,
                work_order_id INTEGER,
                component_id INTEGER,
                line_id INTEGER,
                manufacturing_order_id INTEGER,
                total_cycles INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_operation_slots_machine_begin ON operation_slots(machine_id, begin_at);

            -- Operation cycles: date_time is the reference instant cycles are ordered by
            CREATE TABLE IF NOT EXISTS operation_cycles (
                id INTEGER PRIMARY KEY,
                machine_id INTEGER NOT NULL,
                begin_at TEXT,
                end_at TEXT,
                status INTEGER NOT NULL DEFAULT 0,
                full INTEGER NOT NULL DEFAULT 0,
                quantity INTEGER,
                operation_slot_id INTEGER,
                date_time TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_operation_cycles_machine_date ON operation_cycles(machine_id, date_time);
            CREATE INDEX IF NOT EXISTS idx_operation_cycles_slot ON operation_cycles(operation_slot_id);

            CREATE TABLE IF NOT EXISTS between_cycles (
                id INTEGER PRIMARY KEY,
                machine_id INTEGER NOT NULL,
                previous_cycle_id INTEGER NOT NULL,
                next_cycle_id INTEGER NOT NULL,
                begin_at TEXT NOT NULL,
                end_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sequence_slots (
                id INTEGER PRIMARY KEY,
                machine_module_id INTEGER NOT NULL,
                begin_at TEXT NOT NULL,
                end_at TEXT,
                sequence_id INTEGER,
                next_begin TEXT,
                version INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_sequence_slots_module_begin ON sequence_slots(machine_module_id, begin_at);

            -- Auto-sequences: exactly one of sequence_id / operation_id is set
            CREATE TABLE IF NOT EXISTS auto_sequences (
                id INTEGER PRIMARY KEY,
                machine_module_id INTEGER NOT NULL,
                begin_at TEXT NOT NULL,
                end_at TEXT,
                sequence_id INTEGER,
                operation_id INTEGER,
                version INTEGER NOT NULL DEFAULT 1,
                CHECK ((sequence_id IS NULL) <> (operation_id IS NULL))
            );

            CREATE INDEX IF NOT EXISTS idx_auto_sequences_module_begin ON auto_sequences(machine_module_id, begin_at);

            CREATE TABLE IF NOT EXISTS sequence_milestones (
                machine_module_id INTEGER PRIMARY KEY,
                date_time TEXT NOT NULL,
                sequence_id INTEGER,
                milestone_ms INTEGER,
                completed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS iso_file_slots (
                id INTEGER PRIMARY KEY,
                machine_module_id INTEGER NOT NULL,
                begin_at TEXT NOT NULL,
                end_at TEXT,
                iso_file_id INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_iso_file_slots_module_begin ON iso_file_slots(machine_module_id, begin_at);

            -- Associations recorded for asynchronous processing
            CREATE TABLE IF NOT EXISTS pending_associations (
                id INTEGER PRIMARY KEY,
                machine_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                begin_at TEXT NOT NULL,
                end_at TEXT,
                value_id INTEGER,
                auto INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS detection_logs (
                id INTEGER PRIMARY KEY,
                date_time TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                machine_id INTEGER NOT NULL,
                machine_module_id INTEGER,
                source TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detection_logs_machine ON detection_logs(machine_id, date_time);
            ",
        )?;
        Ok(())
    }

    // ========== Transactions ==========

    fn begin(&mut self, label: &str, options: TransactionOptions) -> Result<(), DbError> {
        if self.depth == 0 {
            let synchronous = if options.synchronous_commit { "FULL" } else { "OFF" };
            self.conn
                .execute_batch(&format!("PRAGMA synchronous = {synchronous};"))?;
            self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        } else {
            self.conn
                .execute_batch(&format!("SAVEPOINT sp{};", self.depth))?;
        }
        self.depth += 1;
        debug!(label, depth = self.depth, isolation = %options.isolation, "transaction begun");
        Ok(())
    }

    fn end(&mut self, commit: bool) -> Result<(), DbError> {
        if self.depth == 0 {
            return Err(DbError::NoTransaction);
        }
        self.depth -= 1;
        let sql = match (self.depth, commit) {
            (0, true) => "COMMIT;".to_string(),
            (0, false) => "ROLLBACK;".to_string(),
            (depth, true) => format!("RELEASE sp{depth};"),
            (depth, false) => format!("ROLLBACK TO sp{depth}; RELEASE sp{depth};"),
        };
        self.conn.execute_batch(&sql)?;
        if self.depth == 0 {
            self.conn.execute_batch("PRAGMA synchronous = FULL;")?;
        }
        Ok(())
    }

    /// True while a transaction is open.
    pub const fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    // ========== Asynchronous associations ==========

    fn insert_pending_association(&self, association: &Association) -> Result<(), DbError> {
        let (kind, value) = match association.target {
            AssociationTarget::Operation { operation, .. } => {
                ("operation", operation.map(i64::from))
            }
            AssociationTarget::Component(component) => ("component", Some(component.get())),
            AssociationTarget::WorkOrder(work_order) => ("work_order", Some(work_order.get())),
            AssociationTarget::ManufacturingOrder {
                manufacturing_order,
                ..
            } => ("manufacturing_order", Some(manufacturing_order.get())),
        };
        self.conn.execute(
            "
            INSERT INTO pending_associations (machine_id, kind, begin_at, end_at, value_id, auto)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                association.machine.get(),
                kind,
                format_timestamp(association.range.begin),
                association.range.end.map(format_timestamp),
                value,
                association.auto,
            ],
        )?;
        Ok(())
    }

    /// Lists the associations waiting for asynchronous processing.
    pub fn pending_associations(
        &self,
        machine: MachineId,
    ) -> Result<Vec<PendingAssociation>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT machine_id, kind, begin_at, end_at, value_id, auto
            FROM pending_associations
            WHERE machine_id = ?
            ORDER BY id ASC
            ",
        )?;
        let rows = stmt.query_map([machine.get()], |row| {
            Ok(PendingAssociation {
                machine: id_column(row, 0)?,
                kind: row.get(1)?,
                range: range_columns(row, 2, 3)?,
                value: row.get(4)?,
                auto: row.get(5)?,
            })
        })?;
        let mut associations = Vec::new();
        for row in rows {
            associations.push(row?);
        }
        Ok(associations)
    }

    /// Lists the iso-file slots of a machine module.
    pub fn iso_file_slots(&self, module: MachineModuleId) -> Result<Vec<IsoFileSlot>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT machine_module_id, begin_at, end_at, iso_file_id
            FROM iso_file_slots
            WHERE machine_module_id = ?
            ORDER BY begin_at ASC
            ",
        )?;
        let rows = stmt.query_map([module.get()], |row| {
            Ok(IsoFileSlot {
                module: id_column(row, 0)?,
                range: range_columns(row, 1, 2)?,
                iso_file: id_column(row, 3)?,
            })
        })?;
        let mut slots = Vec::new();
        for row in rows {
            slots.push(row?);
        }
        Ok(slots)
    }

    /// Lists the machines with their modules.
    pub fn machines(&self) -> Result<Vec<(MachineId, Vec<MachineModuleId>)>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT m.id, mm.id
            FROM machines m
            LEFT JOIN machine_modules mm ON mm.machine_id = m.id
            ORDER BY m.id ASC, mm.id ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                id_column::<MachineId>(row, 0)?,
                optional_id_column::<MachineModuleId>(row, 1)?,
            ))
        })?;
        let mut machines: Vec<(MachineId, Vec<MachineModuleId>)> = Vec::new();
        for row in rows {
            let (machine, module) = row?;
            match machines.last_mut() {
                Some((last, modules)) if *last == machine => modules.extend(module),
                _ => machines.push((machine, module.into_iter().collect())),
            }
        }
        Ok(machines)
    }
}

// ========== Column helpers ==========

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(idx: usize, timestamp: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(idx, &raw)
}

fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| parse_timestamp(idx, &raw)).transpose()
}

fn range_columns(row: &Row<'_>, begin: usize, end: usize) -> rusqlite::Result<TimeRange> {
    Ok(TimeRange::clamped(
        timestamp_column(row, begin)?,
        optional_timestamp_column(row, end)?,
    ))
}

fn id_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: TryFrom<i64, Error = ValidationError>,
{
    let raw: i64 = row.get(idx)?;
    T::try_from(raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(err)))
}

fn optional_id_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: TryFrom<i64, Error = ValidationError>,
{
    let raw: Option<i64> = row.get(idx)?;
    raw.map(|raw| {
        T::try_from(raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(err))
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn open_in_memory_database() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn open_file_database_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("pd.db");
        drop(Database::open(&path).expect("first open"));
        let db = Database::open(&path).expect("second open");
        assert!(!db.in_transaction());
    }

    #[test]
    fn schema_has_detection_tables() {
        let db = Database::open_in_memory().expect("open in-memory db");
        let mut stmt = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
            .unwrap();
        let tables: HashSet<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        for table in [
            "operation_cycles",
            "between_cycles",
            "operation_slots",
            "sequence_slots",
            "auto_sequences",
            "sequence_milestones",
            "iso_file_slots",
            "pending_associations",
            "detection_logs",
        ] {
            assert!(tables.contains(table), "missing table {table}");
        }
    }

    #[test]
    fn nested_rollback_keeps_outer_changes() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        db.begin("outer", TransactionOptions::new()).unwrap();
        db.conn
            .execute("INSERT INTO machines (id, name) VALUES (1, 'outer')", [])
            .unwrap();
        db.begin("inner", TransactionOptions::new().asynchronous())
            .unwrap();
        db.conn
            .execute("INSERT INTO machines (id, name) VALUES (2, 'inner')", [])
            .unwrap();
        db.end(false).unwrap();
        db.end(true).unwrap();

        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM machines", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert!(!db.in_transaction());
    }

    #[test]
    fn ending_without_transaction_fails() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        assert!(matches!(db.end(true), Err(DbError::NoTransaction)));
    }

    #[test]
    fn stale_rows_classify_as_stale_objects() {
        let err = StoreError::from(DbError::StaleRow {
            table: "operation_cycles",
            id: 3,
        });
        assert_eq!(err.kind, ErrorKind::StaleObject);
        assert_eq!(
            err.to_string(),
            "stale object store error: stale row 3 in operation_cycles"
        );
    }

    #[test]
    fn timestamps_round_trip_with_milliseconds() {
        let t = DateTime::parse_from_rfc3339("2025-01-01T08:00:00.250Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(t), "2025-01-01T08:00:00.250Z");
        assert_eq!(parse_timestamp(0, "2025-01-01T08:00:00.250Z").unwrap(), t);
    }
}

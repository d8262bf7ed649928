//! [`Store`] implementation over the SQLite schema.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Params, Row, params};
use tracing::debug;

use pd_core::{
    Association, AutoSequence, AutoSequenceKind, BetweenCycles, ComponentId, CycleStatus,
    DetectionLog, IsoFileId, LogLevel, MachineId, MachineModuleId, ManufacturingOrder, Operation,
    OperationCycle, OperationCycleId, OperationId, OperationSlot, OperationSlotId, Sequence,
    SequenceId, SequenceMilestone, SequenceSlot, SlotContext, Store, StoreError, TimeRange,
    TransactionOptions, WorkOrderId,
};

use crate::timeline::{self, PlannedSlot};
use crate::{
    Database, DbError, format_timestamp, id_column, optional_id_column,
    optional_timestamp_column, range_columns, timestamp_column,
};

const CYCLE_COLUMNS: &str =
    "id, machine_id, begin_at, end_at, status, full, quantity, operation_slot_id, version";

const SLOT_COLUMNS: &str = "id, machine_id, begin_at, end_at, operation_id, work_order_id, \
                            component_id, line_id, manufacturing_order_id, total_cycles";

const SEQUENCE_SLOT_COLUMNS: &str =
    "id, machine_module_id, begin_at, end_at, sequence_id, next_begin, version";

const AUTO_SEQUENCE_COLUMNS: &str =
    "id, machine_module_id, begin_at, end_at, sequence_id, operation_id, version";

// ========== Row mapping ==========

fn cycle_from_row(row: &Row<'_>) -> rusqlite::Result<OperationCycle> {
    Ok(OperationCycle {
        id: Some(id_column(row, 0)?),
        machine: id_column(row, 1)?,
        begin: optional_timestamp_column(row, 2)?,
        end: optional_timestamp_column(row, 3)?,
        status: CycleStatus::from_bits_truncate(row.get(4)?),
        full: row.get(5)?,
        quantity: row.get(6)?,
        operation_slot: optional_id_column(row, 7)?,
        version: row.get(8)?,
    })
}

fn slot_from_row(row: &Row<'_>) -> rusqlite::Result<OperationSlot> {
    Ok(OperationSlot {
        id: id_column(row, 0)?,
        machine: id_column(row, 1)?,
        range: range_columns(row, 2, 3)?,
        operation: optional_id_column(row, 4)?,
        context: SlotContext {
            work_order: optional_id_column(row, 5)?,
            component: optional_id_column(row, 6)?,
            line: optional_id_column(row, 7)?,
            manufacturing_order: optional_id_column(row, 8)?,
        },
        total_cycles: row.get(9)?,
    })
}

fn between_from_row(row: &Row<'_>) -> rusqlite::Result<BetweenCycles> {
    Ok(BetweenCycles {
        id: Some(id_column(row, 0)?),
        machine: id_column(row, 1)?,
        previous_cycle: id_column(row, 2)?,
        next_cycle: id_column(row, 3)?,
        begin: timestamp_column(row, 4)?,
        end: timestamp_column(row, 5)?,
    })
}

fn sequence_slot_from_row(row: &Row<'_>) -> rusqlite::Result<SequenceSlot> {
    Ok(SequenceSlot {
        id: Some(id_column(row, 0)?),
        module: id_column(row, 1)?,
        range: range_columns(row, 2, 3)?,
        sequence: optional_id_column(row, 4)?,
        next_begin: optional_timestamp_column(row, 5)?,
        version: row.get(6)?,
    })
}

fn auto_sequence_from_row(row: &Row<'_>) -> rusqlite::Result<AutoSequence> {
    let sequence: Option<SequenceId> = optional_id_column(row, 4)?;
    let kind = match sequence {
        Some(sequence) => AutoSequenceKind::Sequence(sequence),
        None => AutoSequenceKind::Operation(id_column(row, 5)?),
    };
    Ok(AutoSequence {
        id: Some(id_column(row, 0)?),
        module: id_column(row, 1)?,
        range: range_columns(row, 2, 3)?,
        kind,
        version: row.get(6)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<DetectionLog> {
    let level: String = row.get(1)?;
    let level = level.parse::<LogLevel>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(DetectionLog {
        date_time: timestamp_column(row, 0)?,
        level,
        message: row.get(2)?,
        machine: id_column(row, 3)?,
        module: optional_id_column(row, 4)?,
        source: row.get(5)?,
    })
}

fn query_all<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn query_one<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Option<T>, DbError> {
    Ok(conn.query_row(sql, params, map).optional()?)
}

fn timestamp(t: DateTime<Utc>) -> String {
    format_timestamp(t)
}

fn optional_timestamp(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(format_timestamp)
}

fn raw<T: Into<i64>>(id: Option<T>) -> Option<i64> {
    id.map(Into::into)
}

/// The instant a cycle is attached to a slot by.
fn cycle_reference(cycle: &OperationCycle) -> Option<DateTime<Utc>> {
    cycle.begin.or(cycle.end)
}

/// True if the slot range holds the cycle's reference instant.
fn holds_cycle(range: &TimeRange, cycle: &OperationCycle) -> bool {
    match (cycle.begin, cycle.end) {
        (Some(begin), _) => range.contains(begin),
        (None, Some(end)) => range.begin < end && range.end.is_none_or(|slot_end| end <= slot_end),
        (None, None) => false,
    }
}

/// True if the cycle shares time with the slot range.
fn touches_cycle(range: &TimeRange, cycle: &OperationCycle) -> bool {
    let Some(reference) = cycle_reference(cycle) else {
        return false;
    };
    let span = TimeRange::clamped(reference, cycle.end);
    range.overlaps(&span) || range.contains_considering_end(reference)
}

impl Database {
    // ========== Operation cycles ==========

    fn find_last_cycle(&self, machine: MachineId) -> Result<Option<OperationCycle>, DbError> {
        query_one(
            &self.conn,
            &format!(
                "SELECT {CYCLE_COLUMNS} FROM operation_cycles
                 WHERE machine_id = ? ORDER BY date_time DESC, id DESC LIMIT 1"
            ),
            [machine.get()],
            cycle_from_row,
        )
    }

    fn has_cycle_after(&self, machine: MachineId, t: DateTime<Utc>) -> Result<bool, DbError> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM operation_cycles WHERE machine_id = ?1 AND date_time > ?2)",
            params![machine.get(), timestamp(t)],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn has_observed_cycle(&self, machine: MachineId, range: TimeRange) -> Result<bool, DbError> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM operation_cycles
                WHERE machine_id = ?1 AND begin_at = ?2 AND end_at IS ?3 AND status & ?4 = 0
            )",
            params![
                machine.get(),
                timestamp(range.begin),
                optional_timestamp(range.end),
                (CycleStatus::BEGIN_ESTIMATED | CycleStatus::END_ESTIMATED).bits(),
            ],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn add_cycle(&self, cycle: &mut OperationCycle) -> Result<(), DbError> {
        let date_time = cycle.date_time().ok_or(DbError::CycleWithoutDateTime)?;
        self.conn.execute(
            "
            INSERT INTO operation_cycles
                (machine_id, begin_at, end_at, status, full, quantity, operation_slot_id, date_time, version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
            ",
            params![
                cycle.machine.get(),
                optional_timestamp(cycle.begin),
                optional_timestamp(cycle.end),
                cycle.status.bits(),
                cycle.full,
                cycle.quantity,
                raw(cycle.operation_slot),
                timestamp(date_time),
            ],
        )?;
        cycle.id = Some(OperationCycleId::new(self.conn.last_insert_rowid())?);
        cycle.version = 1;
        if let Some(slot) = cycle.operation_slot {
            self.shift_total_cycles(slot, 1)?;
        }
        Ok(())
    }

    fn save_cycle(&self, cycle: &mut OperationCycle) -> Result<(), DbError> {
        let id = cycle.id.ok_or(DbError::MissingId {
            table: "operation_cycles",
        })?;
        let date_time = cycle.date_time().ok_or(DbError::CycleWithoutDateTime)?;
        let stale = DbError::StaleRow {
            table: "operation_cycles",
            id: id.get(),
        };
        let previous_slot: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT operation_slot_id FROM operation_cycles WHERE id = ?1 AND version = ?2",
                params![id.get(), cycle.version],
                |row| row.get(0),
            )
            .optional()?;
        let Some(previous_slot) = previous_slot else {
            return Err(stale);
        };
        let changed = self.conn.execute(
            "
            UPDATE operation_cycles
            SET begin_at = ?1, end_at = ?2, status = ?3, full = ?4, quantity = ?5,
                operation_slot_id = ?6, date_time = ?7, version = version + 1
            WHERE id = ?8 AND version = ?9
            ",
            params![
                optional_timestamp(cycle.begin),
                optional_timestamp(cycle.end),
                cycle.status.bits(),
                cycle.full,
                cycle.quantity,
                raw(cycle.operation_slot),
                timestamp(date_time),
                id.get(),
                cycle.version,
            ],
        )?;
        if changed == 0 {
            return Err(stale);
        }
        cycle.version += 1;
        let current_slot = raw(cycle.operation_slot);
        if previous_slot != current_slot {
            if let Some(previous) = previous_slot {
                self.shift_total_cycles(OperationSlotId::new(previous)?, -1)?;
            }
            if let Some(current) = cycle.operation_slot {
                self.shift_total_cycles(current, 1)?;
            }
        }
        Ok(())
    }

    fn shift_total_cycles(&self, slot: OperationSlotId, delta: i32) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE operation_slots SET total_cycles = total_cycles + ?1 WHERE id = ?2",
            params![delta, slot.get()],
        )?;
        Ok(())
    }

    fn list_cycles(&self, machine: MachineId) -> Result<Vec<OperationCycle>, DbError> {
        query_all(
            &self.conn,
            &format!(
                "SELECT {CYCLE_COLUMNS} FROM operation_cycles
                 WHERE machine_id = ? ORDER BY date_time ASC, id ASC"
            ),
            [machine.get()],
            cycle_from_row,
        )
    }

    fn add_between_cycles(&self, between: &mut BetweenCycles) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO between_cycles (machine_id, previous_cycle_id, next_cycle_id, begin_at, end_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                between.machine.get(),
                between.previous_cycle.get(),
                between.next_cycle.get(),
                timestamp(between.begin),
                timestamp(between.end),
            ],
        )?;
        between.id = Some(pd_core::BetweenCyclesId::new(
            self.conn.last_insert_rowid(),
        )?);
        Ok(())
    }

    fn list_between_cycles(&self, machine: MachineId) -> Result<Vec<BetweenCycles>, DbError> {
        query_all(
            &self.conn,
            "SELECT id, machine_id, previous_cycle_id, next_cycle_id, begin_at, end_at
             FROM between_cycles WHERE machine_id = ? ORDER BY begin_at ASC, id ASC",
            [machine.get()],
            between_from_row,
        )
    }

    // ========== Operation slots ==========

    fn slot_query(
        &self,
        filter: &str,
        order: &str,
        params: impl Params,
    ) -> Result<Option<OperationSlot>, DbError> {
        query_one(
            &self.conn,
            &format!("SELECT {SLOT_COLUMNS} FROM operation_slots WHERE {filter} ORDER BY {order} LIMIT 1"),
            params,
            slot_from_row,
        )
    }

    fn slots_overlapping(
        &self,
        machine: MachineId,
        range: TimeRange,
    ) -> Result<Vec<OperationSlot>, DbError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        query_all(
            &self.conn,
            &format!(
                "SELECT {SLOT_COLUMNS} FROM operation_slots
                 WHERE machine_id = ?1
                   AND (end_at IS NULL OR end_at > ?2)
                   AND (?3 IS NULL OR begin_at < ?3)
                 ORDER BY begin_at ASC"
            ),
            params![
                machine.get(),
                timestamp(range.begin),
                optional_timestamp(range.end)
            ],
            slot_from_row,
        )
    }

    /// Slots overlapping `range` plus the slots that end or begin at its bounds.
    fn slots_touching(
        &self,
        machine: MachineId,
        range: TimeRange,
    ) -> Result<Vec<OperationSlot>, DbError> {
        query_all(
            &self.conn,
            &format!(
                "SELECT {SLOT_COLUMNS} FROM operation_slots
                 WHERE machine_id = ?1
                   AND (end_at IS NULL OR end_at >= ?2)
                   AND (?3 IS NULL OR begin_at <= ?3)
                 ORDER BY begin_at ASC"
            ),
            params![
                machine.get(),
                timestamp(range.begin),
                optional_timestamp(range.end)
            ],
            slot_from_row,
        )
    }

    fn list_operation_slots(&self, machine: MachineId) -> Result<Vec<OperationSlot>, DbError> {
        query_all(
            &self.conn,
            &format!(
                "SELECT {SLOT_COLUMNS} FROM operation_slots WHERE machine_id = ? ORDER BY begin_at ASC"
            ),
            [machine.get()],
            slot_from_row,
        )
    }

    fn add_operation_slot(
        &self,
        machine: MachineId,
        piece: &PlannedSlot,
    ) -> Result<OperationSlotId, DbError> {
        let context = piece.values.context;
        self.conn.execute(
            "
            INSERT INTO operation_slots
                (machine_id, begin_at, end_at, operation_id, work_order_id, component_id, line_id,
                 manufacturing_order_id, total_cycles)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)
            ",
            params![
                machine.get(),
                timestamp(piece.range.begin),
                optional_timestamp(piece.range.end),
                raw(piece.values.operation),
                raw(context.work_order),
                raw(context.component),
                raw(context.line),
                raw(context.manufacturing_order),
            ],
        )?;
        Ok(OperationSlotId::new(self.conn.last_insert_rowid())?)
    }

    fn save_operation_slot(&self, id: OperationSlotId, piece: &PlannedSlot) -> Result<(), DbError> {
        let context = piece.values.context;
        self.conn.execute(
            "
            UPDATE operation_slots
            SET begin_at = ?1, end_at = ?2, operation_id = ?3, work_order_id = ?4,
                component_id = ?5, line_id = ?6, manufacturing_order_id = ?7
            WHERE id = ?8
            ",
            params![
                timestamp(piece.range.begin),
                optional_timestamp(piece.range.end),
                raw(piece.values.operation),
                raw(context.work_order),
                raw(context.component),
                raw(context.line),
                raw(context.manufacturing_order),
                id.get(),
            ],
        )?;
        Ok(())
    }

    fn recount_total_cycles(&self, slot: OperationSlotId) -> Result<(), DbError> {
        self.conn.execute(
            "
            UPDATE operation_slots
            SET total_cycles = (SELECT COUNT(*) FROM operation_cycles WHERE operation_slot_id = ?1)
            WHERE id = ?1
            ",
            [slot.get()],
        )?;
        Ok(())
    }

    /// Rewrites the slots around the association range and moves the affected cycles.
    fn associate(&self, association: &Association) -> Result<(), DbError> {
        let range = association.range;
        if range.is_empty() {
            return Ok(());
        }
        let machine = association.machine;
        let existing = self.slots_touching(machine, range)?;
        let planned = timeline::plan(&existing, range, &association.target);
        let before: HashMap<OperationSlotId, &OperationSlot> =
            existing.iter().map(|slot| (slot.id, slot)).collect();

        let mut result: Vec<(OperationSlotId, TimeRange)> = Vec::with_capacity(planned.len());
        let mut changed: HashSet<OperationSlotId> = HashSet::new();
        for piece in &planned {
            let id = match piece.id {
                Some(id) => {
                    let unchanged = before.get(&id).is_some_and(|slot| {
                        slot.range == piece.range
                            && slot.operation == piece.values.operation
                            && slot.context == piece.values.context
                    });
                    if !unchanged {
                        self.save_operation_slot(id, piece)?;
                        changed.insert(id);
                    }
                    id
                }
                None => {
                    let id = self.add_operation_slot(machine, piece)?;
                    changed.insert(id);
                    id
                }
            };
            result.push((id, piece.range));
        }
        let kept: HashSet<OperationSlotId> = result.iter().map(|(id, _)| *id).collect();
        let removed: Vec<OperationSlotId> = existing
            .iter()
            .map(|slot| slot.id)
            .filter(|id| !kept.contains(id))
            .collect();
        changed.extend(removed.iter().copied());

        let mut candidates = Vec::new();
        for id in &changed {
            if before.contains_key(id) {
                candidates.extend(self.cycles_of_slot(*id)?);
            }
        }
        candidates.extend(self.unlinked_cycles_in(machine, range)?);

        let mut relinked = 0_usize;
        for cycle in &candidates {
            let keeps_current = cycle.operation_slot.is_some_and(|current| {
                result
                    .iter()
                    .any(|(id, slot_range)| *id == current && touches_cycle(slot_range, cycle))
            });
            if keeps_current {
                continue;
            }
            let target = result
                .iter()
                .find(|(_, slot_range)| holds_cycle(slot_range, cycle))
                .map(|(id, _)| *id);
            if target != cycle.operation_slot {
                let Some(id) = cycle.id else { continue };
                self.conn.execute(
                    "UPDATE operation_cycles SET operation_slot_id = ?1, version = version + 1 WHERE id = ?2",
                    params![raw(target), id.get()],
                )?;
                relinked += 1;
            }
        }

        for id in &removed {
            self.conn
                .execute("DELETE FROM operation_slots WHERE id = ?", [id.get()])?;
        }
        for (id, _) in &result {
            self.recount_total_cycles(*id)?;
        }
        debug!(
            machine = %machine,
            range = %range,
            slots = result.len(),
            removed = removed.len(),
            relinked,
            "association applied"
        );
        Ok(())
    }

    fn cycles_of_slot(&self, slot: OperationSlotId) -> Result<Vec<OperationCycle>, DbError> {
        query_all(
            &self.conn,
            &format!("SELECT {CYCLE_COLUMNS} FROM operation_cycles WHERE operation_slot_id = ?"),
            [slot.get()],
            cycle_from_row,
        )
    }

    fn unlinked_cycles_in(
        &self,
        machine: MachineId,
        range: TimeRange,
    ) -> Result<Vec<OperationCycle>, DbError> {
        let cycles = query_all(
            &self.conn,
            &format!(
                "SELECT {CYCLE_COLUMNS} FROM operation_cycles
                 WHERE machine_id = ?1 AND operation_slot_id IS NULL
                   AND COALESCE(begin_at, end_at) >= ?2
                   AND (?3 IS NULL OR COALESCE(begin_at, end_at) <= ?3)"
            ),
            params![
                machine.get(),
                timestamp(range.begin),
                optional_timestamp(range.end)
            ],
            cycle_from_row,
        )?;
        Ok(cycles
            .into_iter()
            .filter(|cycle| holds_cycle(&range, cycle))
            .collect())
    }

    // ========== Sequence slots ==========

    fn sequence_slots_where(
        &self,
        filter: &str,
        params: impl Params,
    ) -> Result<Vec<SequenceSlot>, DbError> {
        query_all(
            &self.conn,
            &format!(
                "SELECT {SEQUENCE_SLOT_COLUMNS} FROM sequence_slots WHERE {filter} ORDER BY begin_at ASC"
            ),
            params,
            sequence_slot_from_row,
        )
    }

    fn last_sequence_slot_where(
        &self,
        filter: &str,
        params: impl Params,
    ) -> Result<Option<SequenceSlot>, DbError> {
        query_one(
            &self.conn,
            &format!(
                "SELECT {SEQUENCE_SLOT_COLUMNS} FROM sequence_slots WHERE {filter}
                 ORDER BY begin_at DESC LIMIT 1"
            ),
            params,
            sequence_slot_from_row,
        )
    }

    fn add_sequence_slot(&self, slot: &mut SequenceSlot) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO sequence_slots (machine_module_id, begin_at, end_at, sequence_id, next_begin, version)
            VALUES (?1, ?2, ?3, ?4, ?5, 1)
            ",
            params![
                slot.module.get(),
                timestamp(slot.range.begin),
                optional_timestamp(slot.range.end),
                raw(slot.sequence),
                optional_timestamp(slot.next_begin),
            ],
        )?;
        slot.id = Some(pd_core::SequenceSlotId::new(self.conn.last_insert_rowid())?);
        slot.version = 1;
        Ok(())
    }

    fn save_sequence_slot(&self, slot: &mut SequenceSlot) -> Result<(), DbError> {
        let id = slot.id.ok_or(DbError::MissingId {
            table: "sequence_slots",
        })?;
        let changed = self.conn.execute(
            "
            UPDATE sequence_slots
            SET begin_at = ?1, end_at = ?2, sequence_id = ?3, next_begin = ?4, version = version + 1
            WHERE id = ?5 AND version = ?6
            ",
            params![
                timestamp(slot.range.begin),
                optional_timestamp(slot.range.end),
                raw(slot.sequence),
                optional_timestamp(slot.next_begin),
                id.get(),
                slot.version,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::StaleRow {
                table: "sequence_slots",
                id: id.get(),
            });
        }
        slot.version += 1;
        Ok(())
    }

    fn remove_versioned(
        &self,
        table: &'static str,
        id: Option<i64>,
        version: i64,
    ) -> Result<(), DbError> {
        let id = id.ok_or(DbError::MissingId { table })?;
        let changed = self.conn.execute(
            &format!("DELETE FROM {table} WHERE id = ?1 AND version = ?2"),
            params![id, version],
        )?;
        if changed == 0 {
            return Err(DbError::StaleRow { table, id });
        }
        Ok(())
    }

    // ========== Auto-sequences ==========

    fn add_auto_sequence(&self, auto_sequence: &mut AutoSequence) -> Result<(), DbError> {
        let (sequence, operation) = match auto_sequence.kind {
            AutoSequenceKind::Sequence(sequence) => (Some(sequence.get()), None),
            AutoSequenceKind::Operation(operation) => (None, Some(operation.get())),
        };
        self.conn.execute(
            "
            INSERT INTO auto_sequences (machine_module_id, begin_at, end_at, sequence_id, operation_id, version)
            VALUES (?1, ?2, ?3, ?4, ?5, 1)
            ",
            params![
                auto_sequence.module.get(),
                timestamp(auto_sequence.range.begin),
                optional_timestamp(auto_sequence.range.end),
                sequence,
                operation,
            ],
        )?;
        auto_sequence.id = Some(pd_core::AutoSequenceId::new(
            self.conn.last_insert_rowid(),
        )?);
        auto_sequence.version = 1;
        Ok(())
    }

    fn save_auto_sequence(&self, auto_sequence: &mut AutoSequence) -> Result<(), DbError> {
        let id = auto_sequence.id.ok_or(DbError::MissingId {
            table: "auto_sequences",
        })?;
        let changed = self.conn.execute(
            "
            UPDATE auto_sequences
            SET begin_at = ?1, end_at = ?2, version = version + 1
            WHERE id = ?3 AND version = ?4
            ",
            params![
                timestamp(auto_sequence.range.begin),
                optional_timestamp(auto_sequence.range.end),
                id.get(),
                auto_sequence.version,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::StaleRow {
                table: "auto_sequences",
                id: id.get(),
            });
        }
        auto_sequence.version += 1;
        Ok(())
    }

    fn auto_sequences_where(
        &self,
        filter: &str,
        params: impl Params,
    ) -> Result<Vec<AutoSequence>, DbError> {
        query_all(
            &self.conn,
            &format!(
                "SELECT {AUTO_SEQUENCE_COLUMNS} FROM auto_sequences WHERE {filter} ORDER BY begin_at ASC"
            ),
            params,
            auto_sequence_from_row,
        )
    }

    fn has_auto_sequence_between(
        &self,
        machine: MachineId,
        range: TimeRange,
    ) -> Result<bool, DbError> {
        if range.is_empty() {
            return Ok(false);
        }
        let exists: bool = self.conn.query_row(
            "
            SELECT EXISTS (
                SELECT 1
                FROM auto_sequences a
                JOIN machine_modules mm ON mm.id = a.machine_module_id
                WHERE mm.machine_id = ?1
                  AND (a.end_at IS NULL OR a.end_at > ?2)
                  AND (?3 IS NULL OR a.begin_at < ?3)
            )
            ",
            params![
                machine.get(),
                timestamp(range.begin),
                optional_timestamp(range.end)
            ],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    // ========== Milestones ==========

    fn find_sequence_milestone(
        &self,
        module: MachineModuleId,
    ) -> Result<Option<SequenceMilestone>, DbError> {
        query_one(
            &self.conn,
            "SELECT machine_module_id, date_time, sequence_id, milestone_ms, completed
             FROM sequence_milestones WHERE machine_module_id = ?",
            [module.get()],
            |row| {
                let milestone: Option<i64> = row.get(3)?;
                Ok(SequenceMilestone {
                    module: id_column(row, 0)?,
                    date_time: timestamp_column(row, 1)?,
                    sequence: optional_id_column(row, 2)?,
                    milestone: milestone.map(Duration::milliseconds),
                    completed: row.get(4)?,
                })
            },
        )
    }

    fn upsert_sequence_milestone(&self, milestone: &SequenceMilestone) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO sequence_milestones (machine_module_id, date_time, sequence_id, milestone_ms, completed)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(machine_module_id) DO UPDATE SET
                date_time = excluded.date_time,
                sequence_id = excluded.sequence_id,
                milestone_ms = excluded.milestone_ms,
                completed = excluded.completed
            ",
            params![
                milestone.module.get(),
                timestamp(milestone.date_time),
                raw(milestone.sequence),
                milestone.milestone.map(|elapsed| elapsed.num_milliseconds()),
                milestone.completed,
            ],
        )?;
        Ok(())
    }

    // ========== Iso files ==========

    fn associate_iso_file(
        &self,
        module: MachineModuleId,
        t: DateTime<Utc>,
        iso_file: Option<IsoFileId>,
    ) -> Result<(), DbError> {
        let current: Option<(i64, Option<String>)> = self
            .conn
            .query_row(
                "
                SELECT iso_file_id, end_at FROM iso_file_slots
                WHERE machine_module_id = ?1 AND begin_at <= ?2 AND (end_at IS NULL OR end_at > ?2)
                ORDER BY begin_at DESC LIMIT 1
                ",
                params![module.get(), timestamp(t)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let unchanged = match (current, iso_file) {
            (Some((current, None)), Some(iso_file)) => current == iso_file.get(),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return Ok(());
        }
        self.conn.execute(
            "
            UPDATE iso_file_slots SET end_at = ?2
            WHERE machine_module_id = ?1 AND begin_at < ?2 AND (end_at IS NULL OR end_at > ?2)
            ",
            params![module.get(), timestamp(t)],
        )?;
        self.conn.execute(
            "DELETE FROM iso_file_slots WHERE machine_module_id = ?1 AND begin_at >= ?2",
            params![module.get(), timestamp(t)],
        )?;
        if let Some(iso_file) = iso_file {
            self.conn.execute(
                "INSERT INTO iso_file_slots (machine_module_id, begin_at, end_at, iso_file_id) VALUES (?1, ?2, NULL, ?3)",
                params![module.get(), timestamp(t), iso_file.get()],
            )?;
        }
        Ok(())
    }

    // ========== Detection logs ==========

    fn add_detection_log(&self, log: &DetectionLog) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO detection_logs (date_time, level, message, machine_id, machine_module_id, source)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                timestamp(log.date_time),
                log.level.as_str(),
                log.message,
                log.machine.get(),
                raw(log.module),
                log.source,
            ],
        )?;
        Ok(())
    }

    fn list_detection_logs(&self, machine: MachineId) -> Result<Vec<DetectionLog>, DbError> {
        query_all(
            &self.conn,
            "SELECT date_time, level, message, machine_id, machine_module_id, source
             FROM detection_logs WHERE machine_id = ? ORDER BY id ASC",
            [machine.get()],
            log_from_row,
        )
    }
}

impl Store for Database {
    // ========== Transactions ==========

    fn begin_transaction(
        &mut self,
        label: &str,
        options: TransactionOptions,
    ) -> Result<(), StoreError> {
        Ok(self.begin(label, options)?)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(self.end(true)?)
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        Ok(self.end(false)?)
    }

    // ========== Reference data ==========

    fn machine_modules(&self, machine: MachineId) -> Result<Vec<MachineModuleId>, StoreError> {
        Ok(self.find_machine_modules(machine)?)
    }

    fn operation(&self, id: OperationId) -> Result<Option<Operation>, StoreError> {
        Ok(self.find_operation(id)?)
    }

    fn operations_by_code(&self, code: &str) -> Result<Vec<Operation>, StoreError> {
        Ok(self.find_operations_by_code(code)?)
    }

    fn create_operation(&mut self, code: &str) -> Result<Operation, StoreError> {
        Ok(self.create_operation_with_code(code)?)
    }

    fn sequence(&self, id: SequenceId) -> Result<Option<Sequence>, StoreError> {
        Ok(self.find_sequence(id)?)
    }

    fn guess_component_from_operation(
        &self,
        operation: OperationId,
    ) -> Result<Option<ComponentId>, StoreError> {
        Ok(self.guess_component(operation)?)
    }

    fn guess_work_order_from_operation(
        &self,
        operation: OperationId,
    ) -> Result<Option<WorkOrderId>, StoreError> {
        Ok(self.guess_work_order(operation)?)
    }

    fn is_sequence_compatible_with_component(
        &self,
        sequence: SequenceId,
        component: ComponentId,
    ) -> Result<bool, StoreError> {
        let Some(sequence) = self.find_sequence(sequence)? else {
            return Ok(false);
        };
        Ok(self.operation_shares_work_piece(sequence.operation, component)?)
    }

    fn is_operation_compatible_with_component(
        &self,
        operation: OperationId,
        component: ComponentId,
    ) -> Result<bool, StoreError> {
        Ok(self.operation_shares_work_piece(operation, component)?)
    }

    fn next_manufacturing_orders(
        &self,
        machine: MachineId,
        operation: OperationId,
    ) -> Result<Vec<ManufacturingOrder>, StoreError> {
        Ok(self.find_next_manufacturing_orders(machine, operation)?)
    }

    // ========== Operation cycles ==========

    fn last_cycle(&self, machine: MachineId) -> Result<Option<OperationCycle>, StoreError> {
        Ok(self.find_last_cycle(machine)?)
    }

    fn exists_cycle_after(
        &self,
        machine: MachineId,
        t: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.has_cycle_after(machine, t)?)
    }

    fn exists_observed_cycle(
        &self,
        machine: MachineId,
        range: TimeRange,
    ) -> Result<bool, StoreError> {
        Ok(self.has_observed_cycle(machine, range)?)
    }

    fn insert_cycle(&mut self, cycle: &mut OperationCycle) -> Result<(), StoreError> {
        Ok(self.add_cycle(cycle)?)
    }

    fn update_cycle(&mut self, cycle: &mut OperationCycle) -> Result<(), StoreError> {
        Ok(self.save_cycle(cycle)?)
    }

    fn cycles(&self, machine: MachineId) -> Result<Vec<OperationCycle>, StoreError> {
        Ok(self.list_cycles(machine)?)
    }

    fn insert_between_cycles(&mut self, between: &mut BetweenCycles) -> Result<(), StoreError> {
        Ok(self.add_between_cycles(between)?)
    }

    fn between_cycles(&self, machine: MachineId) -> Result<Vec<BetweenCycles>, StoreError> {
        Ok(self.list_between_cycles(machine)?)
    }

    // ========== Operation slots ==========

    fn operation_slot(&self, id: OperationSlotId) -> Result<Option<OperationSlot>, StoreError> {
        Ok(self.slot_query("id = ?1", "id", [id.get()])?)
    }

    fn operation_slot_at(
        &self,
        machine: MachineId,
        t: DateTime<Utc>,
    ) -> Result<Option<OperationSlot>, StoreError> {
        Ok(self.slot_query(
            "machine_id = ?1 AND begin_at <= ?2 AND (end_at IS NULL OR end_at > ?2)",
            "begin_at DESC",
            params![machine.get(), timestamp(t)],
        )?)
    }

    fn operation_slot_at_considering_end(
        &self,
        machine: MachineId,
        t: DateTime<Utc>,
    ) -> Result<Option<OperationSlot>, StoreError> {
        Ok(self.slot_query(
            "machine_id = ?1 AND begin_at <= ?2 AND (end_at IS NULL OR end_at >= ?2)",
            "begin_at ASC",
            params![machine.get(), timestamp(t)],
        )?)
    }

    fn first_operation_slot_beginning_between(
        &self,
        machine: MachineId,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Option<OperationSlot>, StoreError> {
        Ok(self.slot_query(
            "machine_id = ?1 AND begin_at > ?2 AND begin_at < ?3",
            "begin_at ASC",
            params![machine.get(), timestamp(after), timestamp(before)],
        )?)
    }

    fn last_operation_slot_before(
        &self,
        machine: MachineId,
        t: DateTime<Utc>,
    ) -> Result<Option<OperationSlot>, StoreError> {
        Ok(self.slot_query(
            "machine_id = ?1 AND end_at IS NOT NULL AND end_at <= ?2",
            "end_at DESC",
            params![machine.get(), timestamp(t)],
        )?)
    }

    fn last_operation_slot_with_operation_before(
        &self,
        machine: MachineId,
        t: DateTime<Utc>,
    ) -> Result<Option<OperationSlot>, StoreError> {
        Ok(self.slot_query(
            "machine_id = ?1 AND operation_id IS NOT NULL AND begin_at < ?2",
            "begin_at DESC",
            params![machine.get(), timestamp(t)],
        )?)
    }

    fn first_different_operation_slot_after(
        &self,
        machine: MachineId,
        t: DateTime<Utc>,
        operation: Option<OperationId>,
    ) -> Result<Option<OperationSlot>, StoreError> {
        Ok(self.slot_query(
            "machine_id = ?1 AND (end_at IS NULL OR end_at > ?2) AND operation_id IS NOT ?3",
            "begin_at ASC",
            params![machine.get(), timestamp(t), raw(operation)],
        )?)
    }

    fn operation_slots_overlapping(
        &self,
        machine: MachineId,
        range: TimeRange,
    ) -> Result<Vec<OperationSlot>, StoreError> {
        Ok(self.slots_overlapping(machine, range)?)
    }

    fn operation_slots(&self, machine: MachineId) -> Result<Vec<OperationSlot>, StoreError> {
        Ok(self.list_operation_slots(machine)?)
    }

    fn apply_association(&mut self, association: &Association) -> Result<(), StoreError> {
        Ok(self.associate(association)?)
    }

    fn persist_association(&mut self, association: &Association) -> Result<(), StoreError> {
        Ok(self.insert_pending_association(association)?)
    }

    // ========== Sequence slots ==========

    fn sequence_slots_from(
        &self,
        module: MachineModuleId,
        t: DateTime<Utc>,
    ) -> Result<Vec<SequenceSlot>, StoreError> {
        Ok(self.sequence_slots_where(
            "machine_module_id = ?1 AND (end_at IS NULL OR end_at > ?2)",
            params![module.get(), timestamp(t)],
        )?)
    }

    fn sequence_slots_with_next_begin_from(
        &self,
        module: MachineModuleId,
        t: DateTime<Utc>,
    ) -> Result<Vec<SequenceSlot>, StoreError> {
        Ok(self.sequence_slots_where(
            "machine_module_id = ?1 AND next_begin IS NOT NULL AND next_begin >= ?2",
            params![module.get(), timestamp(t)],
        )?)
    }

    fn last_sequence_slot(
        &self,
        module: MachineModuleId,
    ) -> Result<Option<SequenceSlot>, StoreError> {
        Ok(self.last_sequence_slot_where("machine_module_id = ?1", [module.get()])?)
    }

    fn last_sequence_slot_before(
        &self,
        module: MachineModuleId,
        t: DateTime<Utc>,
    ) -> Result<Option<SequenceSlot>, StoreError> {
        Ok(self.last_sequence_slot_where(
            "machine_module_id = ?1 AND begin_at < ?2",
            params![module.get(), timestamp(t)],
        )?)
    }

    fn insert_sequence_slot(&mut self, slot: &mut SequenceSlot) -> Result<(), StoreError> {
        Ok(self.add_sequence_slot(slot)?)
    }

    fn update_sequence_slot(&mut self, slot: &mut SequenceSlot) -> Result<(), StoreError> {
        Ok(self.save_sequence_slot(slot)?)
    }

    fn delete_sequence_slot(&mut self, slot: &SequenceSlot) -> Result<(), StoreError> {
        Ok(self.remove_versioned("sequence_slots", raw(slot.id), slot.version)?)
    }

    fn sequence_slots(&self, module: MachineModuleId) -> Result<Vec<SequenceSlot>, StoreError> {
        Ok(self.sequence_slots_where("machine_module_id = ?1", [module.get()])?)
    }

    // ========== Auto-sequences ==========

    fn auto_sequences_from(
        &self,
        module: MachineModuleId,
        t: DateTime<Utc>,
    ) -> Result<Vec<AutoSequence>, StoreError> {
        Ok(self.auto_sequences_where(
            "machine_module_id = ?1 AND (end_at IS NULL OR end_at > ?2)",
            params![module.get(), timestamp(t)],
        )?)
    }

    fn exists_auto_sequence_between(
        &self,
        machine: MachineId,
        range: TimeRange,
    ) -> Result<bool, StoreError> {
        Ok(self.has_auto_sequence_between(machine, range)?)
    }

    fn insert_auto_sequence(&mut self, auto_sequence: &mut AutoSequence) -> Result<(), StoreError> {
        Ok(self.add_auto_sequence(auto_sequence)?)
    }

    fn update_auto_sequence(&mut self, auto_sequence: &mut AutoSequence) -> Result<(), StoreError> {
        Ok(self.save_auto_sequence(auto_sequence)?)
    }

    fn delete_auto_sequence(&mut self, auto_sequence: &AutoSequence) -> Result<(), StoreError> {
        Ok(self.remove_versioned(
            "auto_sequences",
            raw(auto_sequence.id),
            auto_sequence.version,
        )?)
    }

    fn auto_sequences(&self, module: MachineModuleId) -> Result<Vec<AutoSequence>, StoreError> {
        Ok(self.auto_sequences_where("machine_module_id = ?1", [module.get()])?)
    }

    // ========== Milestones ==========

    fn sequence_milestone(
        &self,
        module: MachineModuleId,
    ) -> Result<Option<SequenceMilestone>, StoreError> {
        Ok(self.find_sequence_milestone(module)?)
    }

    fn save_sequence_milestone(&mut self, milestone: &SequenceMilestone) -> Result<(), StoreError> {
        Ok(self.upsert_sequence_milestone(milestone)?)
    }

    fn delete_sequence_milestone(&mut self, module: MachineModuleId) -> Result<(), StoreError> {
        self.conn
            .execute(
                "DELETE FROM sequence_milestones WHERE machine_module_id = ?",
                [module.get()],
            )
            .map_err(DbError::from)?;
        Ok(())
    }

    // ========== Iso files ==========

    fn apply_iso_file_association(
        &mut self,
        module: MachineModuleId,
        t: DateTime<Utc>,
        iso_file: Option<IsoFileId>,
    ) -> Result<(), StoreError> {
        Ok(self.associate_iso_file(module, t, iso_file)?)
    }

    // ========== Detection logs ==========

    fn insert_detection_log(&mut self, log: &DetectionLog) -> Result<(), StoreError> {
        Ok(self.add_detection_log(log)?)
    }

    fn detection_logs(&self, machine: MachineId) -> Result<Vec<DetectionLog>, StoreError> {
        Ok(self.list_detection_logs(machine)?)
    }
}

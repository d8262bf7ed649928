//! The persistence contract the detection components run against.
//!
//! A [`Store`] exposes scoped transactions and the finders the detection
//! algorithms need. All ranges are half-open `[begin, end)` unless a method
//! says otherwise. Writes of versioned rows fail with
//! [`ErrorKind::StaleObject`](crate::ErrorKind::StaleObject) when the row
//! changed since it was read.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::StoreError;
use crate::model::{
    Association, AutoSequence, BetweenCycles, DetectionLog, ManufacturingOrder, Operation,
    OperationCycle, OperationSlot, Sequence, SequenceMilestone, SequenceSlot,
};
use crate::range::TimeRange;
use crate::types::{
    ComponentId, IsoFileId, MachineId, MachineModuleId, OperationId, OperationSlotId, SequenceId,
    ValidationError, WorkOrderId,
};

/// Requested isolation of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    Serializable,
}

impl IsolationLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "read_committed",
            Self::Serializable => "serializable",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read_committed" => Ok(Self::ReadCommitted),
            "serializable" => Ok(Self::Serializable),
            _ => Err(ValidationError::InvalidIsolationLevel {
                value: s.to_string(),
            }),
        }
    }
}

/// Options of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    /// When false the store may acknowledge the commit before it is durable.
    pub synchronous_commit: bool,
}

impl TransactionOptions {
    /// Read-committed, durable commit.
    pub const fn new() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            synchronous_commit: true,
        }
    }

    /// Serializable isolation.
    pub const fn serializable() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            synchronous_commit: true,
        }
    }

    /// Drops commit durability; detection events can be replayed from their source.
    #[must_use]
    pub const fn asynchronous(mut self) -> Self {
        self.synchronous_commit = false;
        self
    }
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a detection call opens its own transaction or joins the caller's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxScope {
    /// The callee begins and commits its own transaction.
    Own,
    /// The caller already holds an active transaction.
    Inherited,
}

/// Transactional access to the production timeline.
pub trait Store {
    // ========== Transactions ==========

    /// Begins a transaction, or a nested scope when one is already active.
    fn begin_transaction(
        &mut self,
        label: &str,
        options: TransactionOptions,
    ) -> Result<(), StoreError>;

    /// Commits the innermost active scope.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Rolls back the innermost active scope.
    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Writes pending changes so later inserts cannot collide with just-removed rows.
    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    // ========== Reference data ==========

    fn machine_modules(&self, machine: MachineId) -> Result<Vec<MachineModuleId>, StoreError>;

    fn operation(&self, id: OperationId) -> Result<Option<Operation>, StoreError>;

    fn operations_by_code(&self, code: &str) -> Result<Vec<Operation>, StoreError>;

    fn create_operation(&mut self, code: &str) -> Result<Operation, StoreError>;

    fn sequence(&self, id: SequenceId) -> Result<Option<Sequence>, StoreError>;

    /// The component all intermediate work pieces of the operation lead to, if unique.
    fn guess_component_from_operation(
        &self,
        operation: OperationId,
    ) -> Result<Option<ComponentId>, StoreError>;

    /// The work order of the guessed component, if unique.
    fn guess_work_order_from_operation(
        &self,
        operation: OperationId,
    ) -> Result<Option<WorkOrderId>, StoreError>;

    /// True if the sequence's operation and the component share an intermediate work piece.
    fn is_sequence_compatible_with_component(
        &self,
        sequence: SequenceId,
        component: ComponentId,
    ) -> Result<bool, StoreError>;

    /// True if the operation and the component share an intermediate work piece.
    fn is_operation_compatible_with_component(
        &self,
        operation: OperationId,
        component: ComponentId,
    ) -> Result<bool, StoreError>;

    /// Open manufacturing orders of `operation`, best candidate first.
    fn next_manufacturing_orders(
        &self,
        machine: MachineId,
        operation: OperationId,
    ) -> Result<Vec<ManufacturingOrder>, StoreError>;

    // ========== Operation cycles ==========

    /// The cycle with the latest reference date/time.
    fn last_cycle(&self, machine: MachineId) -> Result<Option<OperationCycle>, StoreError>;

    /// True if a cycle's reference date/time is strictly after `t`.
    fn exists_cycle_after(&self, machine: MachineId, t: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// True if a cycle with the observed begin `range.begin` and observed end
    /// `range.end` is already stored.
    fn exists_observed_cycle(&self, machine: MachineId, range: TimeRange)
    -> Result<bool, StoreError>;

    /// Persists a new cycle and assigns its id.
    fn insert_cycle(&mut self, cycle: &mut OperationCycle) -> Result<(), StoreError>;

    /// Updates a persisted cycle and bumps its version.
    fn update_cycle(&mut self, cycle: &mut OperationCycle) -> Result<(), StoreError>;

    fn cycles(&self, machine: MachineId) -> Result<Vec<OperationCycle>, StoreError>;

    fn insert_between_cycles(&mut self, between: &mut BetweenCycles) -> Result<(), StoreError>;

    fn between_cycles(&self, machine: MachineId) -> Result<Vec<BetweenCycles>, StoreError>;

    // ========== Operation slots ==========

    fn operation_slot(&self, id: OperationSlotId) -> Result<Option<OperationSlot>, StoreError>;

    /// The slot whose `[begin, end)` contains `t`.
    fn operation_slot_at(
        &self,
        machine: MachineId,
        t: DateTime<Utc>,
    ) -> Result<Option<OperationSlot>, StoreError>;

    /// The slot whose `[begin, end]` contains `t`, preferring the one ending at `t`.
    fn operation_slot_at_considering_end(
        &self,
        machine: MachineId,
        t: DateTime<Utc>,
    ) -> Result<Option<OperationSlot>, StoreError>;

    /// The first slot beginning strictly between `after` and `before`.
    fn first_operation_slot_beginning_between(
        &self,
        machine: MachineId,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Option<OperationSlot>, StoreError>;

    /// The latest slot ending at or before `t`.
    fn last_operation_slot_before(
        &self,
        machine: MachineId,
        t: DateTime<Utc>,
    ) -> Result<Option<OperationSlot>, StoreError>;

    /// The latest slot with an operation beginning strictly before `t`.
    fn last_operation_slot_with_operation_before(
        &self,
        machine: MachineId,
        t: DateTime<Utc>,
    ) -> Result<Option<OperationSlot>, StoreError>;

    /// The first slot overlapping `[t, ∞)` whose operation differs from `operation`.
    fn first_different_operation_slot_after(
        &self,
        machine: MachineId,
        t: DateTime<Utc>,
        operation: Option<OperationId>,
    ) -> Result<Option<OperationSlot>, StoreError>;

    /// Slots overlapping `range`, in chronological order.
    fn operation_slots_overlapping(
        &self,
        machine: MachineId,
        range: TimeRange,
    ) -> Result<Vec<OperationSlot>, StoreError>;

    /// True if a slot overlapping `range` differs from `reference` by operation,
    /// component or work order.
    fn exists_different_work_between(
        &self,
        machine: MachineId,
        range: TimeRange,
        reference: &OperationSlot,
    ) -> Result<bool, StoreError> {
        if range.is_empty() {
            return Ok(false);
        }
        let slots = self.operation_slots_overlapping(machine, range)?;
        Ok(slots.iter().any(|slot| !slot.same_work(reference)))
    }

    /// True if no slot overlapping `range` has an operation other than
    /// `operation` and, when `operation` is set, its slots chain from the
    /// beginning of `range` without holes.
    fn is_continuous_operation_in_range(
        &self,
        machine: MachineId,
        range: TimeRange,
        operation: Option<OperationId>,
    ) -> Result<bool, StoreError> {
        if range.is_empty() {
            return Ok(true);
        }
        let slots = self.operation_slots_overlapping(machine, range)?;
        let different = slots.iter().any(|slot| match operation {
            None => slot.operation.is_some(),
            Some(operation) => slot.operation.is_some_and(|other| other != operation),
        });
        if different {
            return Ok(false);
        }
        let Some(operation) = operation else {
            return Ok(true);
        };
        let mut matching = slots
            .iter()
            .filter(|slot| slot.operation == Some(operation))
            .peekable();
        if matching.peek().is_none() {
            return Ok(false);
        }
        let mut bound = Some(range.begin);
        for slot in matching {
            let Some(current) = bound else {
                return Ok(false);
            };
            if !slot.range.contains(current) {
                return Ok(false);
            }
            bound = slot.range.end;
        }
        Ok(true)
    }

    fn operation_slots(&self, machine: MachineId) -> Result<Vec<OperationSlot>, StoreError>;

    /// Applies an association to the operation-slot timeline now.
    fn apply_association(&mut self, association: &Association) -> Result<(), StoreError>;

    /// Records an association to be applied later by an asynchronous process.
    fn persist_association(&mut self, association: &Association) -> Result<(), StoreError>;

    // ========== Sequence slots ==========

    /// Slots ending after `t` (or open), in chronological order.
    fn sequence_slots_from(
        &self,
        module: MachineModuleId,
        t: DateTime<Utc>,
    ) -> Result<Vec<SequenceSlot>, StoreError>;

    /// Slots whose `next_begin` is at or after `t`, in chronological order.
    fn sequence_slots_with_next_begin_from(
        &self,
        module: MachineModuleId,
        t: DateTime<Utc>,
    ) -> Result<Vec<SequenceSlot>, StoreError>;

    fn last_sequence_slot(
        &self,
        module: MachineModuleId,
    ) -> Result<Option<SequenceSlot>, StoreError>;

    /// The latest slot beginning strictly before `t`.
    fn last_sequence_slot_before(
        &self,
        module: MachineModuleId,
        t: DateTime<Utc>,
    ) -> Result<Option<SequenceSlot>, StoreError>;

    fn insert_sequence_slot(&mut self, slot: &mut SequenceSlot) -> Result<(), StoreError>;

    fn update_sequence_slot(&mut self, slot: &mut SequenceSlot) -> Result<(), StoreError>;

    fn delete_sequence_slot(&mut self, slot: &SequenceSlot) -> Result<(), StoreError>;

    fn sequence_slots(&self, module: MachineModuleId) -> Result<Vec<SequenceSlot>, StoreError>;

    // ========== Auto-sequences ==========

    /// Records ending after `t` (or open), in chronological order.
    fn auto_sequences_from(
        &self,
        module: MachineModuleId,
        t: DateTime<Utc>,
    ) -> Result<Vec<AutoSequence>, StoreError>;

    /// True if an auto-sequence of any module of the machine overlaps `range`.
    fn exists_auto_sequence_between(
        &self,
        machine: MachineId,
        range: TimeRange,
    ) -> Result<bool, StoreError>;

    fn insert_auto_sequence(&mut self, auto_sequence: &mut AutoSequence) -> Result<(), StoreError>;

    fn update_auto_sequence(&mut self, auto_sequence: &mut AutoSequence) -> Result<(), StoreError>;

    fn delete_auto_sequence(&mut self, auto_sequence: &AutoSequence) -> Result<(), StoreError>;

    fn auto_sequences(&self, module: MachineModuleId) -> Result<Vec<AutoSequence>, StoreError>;

    // ========== Milestones ==========

    fn sequence_milestone(
        &self,
        module: MachineModuleId,
    ) -> Result<Option<SequenceMilestone>, StoreError>;

    /// Inserts or replaces the milestone of its module.
    fn save_sequence_milestone(&mut self, milestone: &SequenceMilestone) -> Result<(), StoreError>;

    fn delete_sequence_milestone(&mut self, module: MachineModuleId) -> Result<(), StoreError>;

    // ========== Iso files ==========

    /// Ends the current iso-file slot at `t` and opens one for `iso_file` when set.
    fn apply_iso_file_association(
        &mut self,
        module: MachineModuleId,
        t: DateTime<Utc>,
        iso_file: Option<IsoFileId>,
    ) -> Result<(), StoreError>;

    // ========== Detection logs ==========

    fn insert_detection_log(&mut self, log: &DetectionLog) -> Result<(), StoreError>;

    fn detection_logs(&self, machine: MachineId) -> Result<Vec<DetectionLog>, StoreError>;
}

/// Runs `f` inside a transaction when `scope` is [`TxScope::Own`].
///
/// The transaction commits when `f` returns `Ok` and rolls back otherwise. With
/// [`TxScope::Inherited`] `f` runs in the caller's transaction untouched.
pub fn with_transaction<S, T, E, F>(
    store: &mut S,
    scope: TxScope,
    label: &str,
    options: TransactionOptions,
    f: F,
) -> Result<T, E>
where
    S: Store + ?Sized,
    E: From<StoreError>,
    F: FnOnce(&mut S) -> Result<T, E>,
{
    if scope == TxScope::Inherited {
        return f(store);
    }
    store.begin_transaction(label, options)?;
    match f(store) {
        Ok(value) => {
            store.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = store.rollback() {
                warn!(label, error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_level_parses_storage_names() {
        assert_eq!(
            "serializable".parse::<IsolationLevel>(),
            Ok(IsolationLevel::Serializable)
        );
        assert_eq!(IsolationLevel::default().as_str(), "read_committed");
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn asynchronous_options_keep_isolation() {
        let options = TransactionOptions::serializable().asynchronous();
        assert_eq!(options.isolation, IsolationLevel::Serializable);
        assert!(!options.synchronous_commit);
        assert!(TransactionOptions::default().synchronous_commit);
    }
}

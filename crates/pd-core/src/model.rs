//! Persisted production entities derived by the detection components.

use bitflags::bitflags;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::range::TimeRange;
use crate::types::{
    AutoSequenceId, BetweenCyclesId, ComponentId, LineId, LogLevel, MachineId, MachineModuleId,
    ManufacturingOrderId, OperationCycleId, OperationId, OperationSlotId, SequenceId,
    SequenceSlotId, WorkOrderId, WorkPieceId,
};

bitflags! {
    /// Which bounds of an operation cycle are estimated rather than observed.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CycleStatus: u8 {
        const BEGIN_ESTIMATED = 0b01;
        const END_ESTIMATED = 0b10;
    }
}

/// One machining cycle of a machine.
///
/// A cycle is *full* once its end is observed. A *partial* cycle has no end
/// yet, or only an estimated one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationCycle {
    /// `None` until the cycle is persisted.
    pub id: Option<OperationCycleId>,
    pub machine: MachineId,
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub status: CycleStatus,
    pub full: bool,
    pub quantity: Option<i32>,
    pub operation_slot: Option<OperationSlotId>,
    /// Optimistic-lock version, bumped by the store on every update.
    pub version: i64,
}

impl OperationCycle {
    /// Creates an unsaved cycle with no bounds.
    pub const fn new(machine: MachineId) -> Self {
        Self {
            id: None,
            machine,
            begin: None,
            end: None,
            status: CycleStatus::empty(),
            full: false,
            quantity: None,
            operation_slot: None,
            version: 0,
        }
    }

    /// Creates an unsaved cycle starting at an observed begin.
    pub const fn starting_at(machine: MachineId, begin: DateTime<Utc>) -> Self {
        let mut cycle = Self::new(machine);
        cycle.begin = Some(begin);
        cycle
    }

    pub fn set_begin(&mut self, begin: DateTime<Utc>) {
        self.begin = Some(begin);
        self.status.remove(CycleStatus::BEGIN_ESTIMATED);
    }

    pub fn set_estimated_begin(&mut self, begin: DateTime<Utc>) {
        self.begin = Some(begin);
        self.status.insert(CycleStatus::BEGIN_ESTIMATED);
    }

    pub fn set_real_end(&mut self, end: DateTime<Utc>) {
        self.end = Some(end);
        self.status.remove(CycleStatus::END_ESTIMATED);
    }

    pub fn set_estimated_end(&mut self, end: DateTime<Utc>) {
        self.end = Some(end);
        self.status.insert(CycleStatus::END_ESTIMATED);
    }

    pub const fn has_real_begin(&self) -> bool {
        self.begin.is_some() && !self.status.contains(CycleStatus::BEGIN_ESTIMATED)
    }

    pub const fn has_real_end(&self) -> bool {
        self.end.is_some() && !self.status.contains(CycleStatus::END_ESTIMATED)
    }

    pub const fn has_estimated_end(&self) -> bool {
        self.end.is_some() && self.status.contains(CycleStatus::END_ESTIMATED)
    }

    /// The instant the cycle is ordered by.
    ///
    /// The real end for a full cycle, the real begin for a partial one, and an
    /// estimated bound only when nothing was observed.
    pub fn date_time(&self) -> Option<DateTime<Utc>> {
        if self.has_real_end() || (self.end.is_some() && self.full) {
            return self.end;
        }
        if self.has_real_begin() {
            return self.begin;
        }
        self.end.or(self.begin)
    }

    /// The default full-cycle rule: the end is known and observed.
    pub const fn is_full_by_end(&self) -> bool {
        self.has_real_end()
    }
}

/// The context a detection assigns to an operation slot besides its operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotContext {
    pub work_order: Option<WorkOrderId>,
    pub component: Option<ComponentId>,
    pub line: Option<LineId>,
    pub manufacturing_order: Option<ManufacturingOrderId>,
}

impl SlotContext {
    pub const fn is_empty(&self) -> bool {
        self.work_order.is_none()
            && self.component.is_none()
            && self.line.is_none()
            && self.manufacturing_order.is_none()
    }
}

/// A time range of a machine with a constant operation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSlot {
    pub id: OperationSlotId,
    pub machine: MachineId,
    pub range: TimeRange,
    pub operation: Option<OperationId>,
    pub context: SlotContext,
    /// Number of cycles linked to this slot.
    pub total_cycles: i32,
}

impl OperationSlot {
    /// Same operation, component and work order.
    pub fn same_work(&self, other: &Self) -> bool {
        self.operation == other.operation
            && self.context.component == other.context.component
            && self.context.work_order == other.context.work_order
    }
}

/// Idle gap between a full cycle and the next cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BetweenCycles {
    pub id: Option<BetweenCyclesId>,
    pub machine: MachineId,
    pub previous_cycle: OperationCycleId,
    pub next_cycle: OperationCycleId,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A directly tagged sequence execution on a machine module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSlot {
    pub id: Option<SequenceSlotId>,
    pub module: MachineModuleId,
    pub range: TimeRange,
    pub sequence: Option<SequenceId>,
    /// Earliest known begin of the activity that follows this slot.
    pub next_begin: Option<DateTime<Utc>>,
    pub version: i64,
}

impl SequenceSlot {
    pub const fn new(module: MachineModuleId, range: TimeRange, sequence: SequenceId) -> Self {
        Self {
            id: None,
            module,
            range,
            sequence: Some(sequence),
            next_begin: None,
            version: 0,
        }
    }
}

/// What an auto-sequence record was inferred for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoSequenceKind {
    Sequence(SequenceId),
    Operation(OperationId),
}

/// Inferred activity of an auto-only sequence or of an operation with no tagged sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoSequence {
    pub id: Option<AutoSequenceId>,
    pub module: MachineModuleId,
    pub range: TimeRange,
    pub kind: AutoSequenceKind,
    pub version: i64,
}

impl AutoSequence {
    pub const fn new(module: MachineModuleId, range: TimeRange, kind: AutoSequenceKind) -> Self {
        Self {
            id: None,
            module,
            range,
            kind,
            version: 0,
        }
    }
}

/// Progress marker of the sequence believed to run on a machine module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceMilestone {
    pub module: MachineModuleId,
    pub date_time: DateTime<Utc>,
    pub sequence: Option<SequenceId>,
    /// Time already spent in the sequence at `date_time`.
    pub milestone: Option<Duration>,
    pub completed: bool,
}

/// A persisted diagnostic for operators. Written by detection, never read back by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionLog {
    pub date_time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub machine: MachineId,
    pub module: Option<MachineModuleId>,
    /// Name of the detection component that wrote the log.
    pub source: String,
}

/// A machine module and the machine it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineModule {
    pub id: MachineModuleId,
    pub machine: MachineId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub code: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub intermediate_work_pieces: Vec<WorkPieceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    pub id: SequenceId,
    pub operation: OperationId,
    pub name: Option<String>,
    /// Sequences that are only auto-detected never produce sequence slots.
    #[serde(default)]
    pub auto_only: bool,
}

/// A manufacturing order candidate for the next operation of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturingOrder {
    pub id: ManufacturingOrderId,
    pub operation: OperationId,
    pub machine: Option<MachineId>,
    /// Position in the machine's planned queue.
    pub order: Option<i32>,
    pub work_order: Option<WorkOrderId>,
    pub component: Option<ComponentId>,
}

/// What an association assigns over its range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationTarget {
    /// Sets the operation (or removes it with `None`) and the given context fields.
    Operation {
        operation: Option<OperationId>,
        context: SlotContext,
    },
    Component(ComponentId),
    WorkOrder(WorkOrderId),
    ManufacturingOrder {
        manufacturing_order: ManufacturingOrderId,
        work_order: Option<WorkOrderId>,
    },
}

/// A change of the operation-slot timeline of a machine over a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    pub machine: MachineId,
    pub range: TimeRange,
    pub target: AssociationTarget,
    /// Set by automatic inference rather than by an operator.
    pub auto: bool,
    /// Set by a detection rather than by a manual input.
    pub detected: bool,
}

impl Association {
    pub const fn operation(
        machine: MachineId,
        range: TimeRange,
        operation: Option<OperationId>,
    ) -> Self {
        Self {
            machine,
            range,
            target: AssociationTarget::Operation {
                operation,
                context: SlotContext {
                    work_order: None,
                    component: None,
                    line: None,
                    manufacturing_order: None,
                },
            },
            auto: false,
            detected: true,
        }
    }
}

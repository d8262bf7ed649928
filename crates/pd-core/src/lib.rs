//! Domain model and store contract for production detection.
//!
//! This crate contains the types shared by the detection components and the
//! store implementations:
//! - Typed identifiers and time ranges
//! - Cycles, operation slots, sequence slots, auto-sequences, milestones and logs
//! - The [`Store`] trait and its transaction scopes
//! - Configuration snapshots, extension hooks and the liveness sink

pub mod config;
pub mod error;
pub mod extension;
pub mod liveness;
pub mod model;
mod range;
pub mod stamp;
pub mod store;
pub mod types;

pub use config::{ConfigProvider, DetectionConfig, PropagationOption};
pub use error::{DetectionError, ErrorKind, ExtensionError, StoreError};
pub use extension::{
    AfterCycleDetectionExtension, AfterOperationDetectionExtension,
    AfterSequenceDetectionExtension, CycleDetectionExtension, Extensions, HookResult,
    OperationDetectionExtension,
};
pub use liveness::{Liveness, NoLiveness};
pub use model::{
    Association, AssociationTarget, AutoSequence, AutoSequenceKind, BetweenCycles, CycleStatus,
    DetectionLog, MachineModule, ManufacturingOrder, Operation, OperationCycle, OperationSlot,
    Sequence, SequenceMilestone, SequenceSlot, SlotContext,
};
pub use range::TimeRange;
pub use stamp::Stamp;
pub use store::{IsolationLevel, Store, TransactionOptions, TxScope, with_transaction};
pub use types::{
    AutoSequenceId, BetweenCyclesId, ComponentId, IsoFileId, LineId, LogLevel, MachineId,
    MachineModuleId, ManufacturingOrderId, OperationCycleId, OperationId, OperationSlotId,
    SequenceId, SequenceSlotId, StampId, ValidationError, WorkOrderId, WorkPieceId,
};

//! Extension hooks invoked by the detection components.
//!
//! Hooks are plain trait objects registered once in an [`Extensions`] registry
//! and called in registration order. Every method has a no-op default so an
//! implementation only overrides what it needs.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::error;

use crate::error::{DetectionError, ExtensionError};
use crate::model::{OperationCycle, OperationSlot};
use crate::range::TimeRange;
use crate::types::{MachineId, OperationId, SequenceId};

/// Result of an extension hook.
pub type HookResult = Result<(), ExtensionError>;

/// Hooks run inside the cycle detection transaction.
pub trait CycleDetectionExtension: Send + Sync {
    fn start_cycle(&self, _cycle: &OperationCycle) -> HookResult {
        Ok(())
    }

    fn stop_cycle(&self, _cycle: &OperationCycle) -> HookResult {
        Ok(())
    }

    /// Called whenever a cycle follows a full cycle, whether a gap record was kept or not.
    fn create_between_cycle(&self, _previous: &OperationCycle, _next: &OperationCycle) -> HookResult {
        Ok(())
    }

    fn detection_process_start(&self) -> HookResult {
        Ok(())
    }

    fn detection_process_complete(&self) -> HookResult {
        Ok(())
    }

    fn detection_process_error(&self, _error: &DetectionError) -> HookResult {
        Ok(())
    }

    /// Overrides the full-cycle rule. `None` defers to the next extension.
    fn is_full(&self, _cycle: &OperationCycle) -> Option<bool> {
        None
    }
}

/// Hooks run after a cycle detection committed.
pub trait AfterCycleDetectionExtension: Send + Sync {
    fn start_cycle(&self, _date_time: DateTime<Utc>) -> HookResult {
        Ok(())
    }

    fn stop_cycle(&self, _quantity: Option<i32>, _date_time: DateTime<Utc>) -> HookResult {
        Ok(())
    }

    fn start_stop_cycle(&self, _begin: DateTime<Utc>, _end: DateTime<Utc>) -> HookResult {
        Ok(())
    }

    fn detection_process_error(&self, _error: &DetectionError) -> HookResult {
        Ok(())
    }
}

/// Hooks run inside the operation detection transaction.
pub trait OperationDetectionExtension: Send + Sync {
    /// True if `add_operation` needs the previous operation slot.
    fn is_previous_operation_slot_required(&self) -> bool {
        false
    }

    fn add_operation(
        &self,
        _machine: MachineId,
        _operation: OperationId,
        _range: &TimeRange,
        _effective_begin: DateTime<Utc>,
        _previous_slot: Option<&OperationSlot>,
    ) -> HookResult {
        Ok(())
    }
}

/// Hooks run after an operation detection committed.
pub trait AfterOperationDetectionExtension: Send + Sync {
    fn start_operation(&self, _operation: OperationId, _date_time: DateTime<Utc>) -> HookResult {
        Ok(())
    }

    fn extend_operation(
        &self,
        _operation: Option<OperationId>,
        _date_time: DateTime<Utc>,
    ) -> HookResult {
        Ok(())
    }

    fn stop_operation(&self, _date_time: DateTime<Utc>) -> HookResult {
        Ok(())
    }
}

/// Hooks run after a sequence detection committed.
pub trait AfterSequenceDetectionExtension: Send + Sync {
    fn start_sequence(&self, _sequence: SequenceId, _date_time: DateTime<Utc>) -> HookResult {
        Ok(())
    }

    fn start_auto_only_operation(
        &self,
        _operation: OperationId,
        _date_time: DateTime<Utc>,
    ) -> HookResult {
        Ok(())
    }

    fn stop_sequence(&self, _date_time: DateTime<Utc>) -> HookResult {
        Ok(())
    }
}

/// The hooks of one machine, resolved once when the detection is built.
#[derive(Default)]
pub struct Extensions {
    cycle: Vec<Box<dyn CycleDetectionExtension>>,
    after_cycle: Vec<Box<dyn AfterCycleDetectionExtension>>,
    operation: Vec<Box<dyn OperationDetectionExtension>>,
    after_operation: Vec<Box<dyn AfterOperationDetectionExtension>>,
    after_sequence: Vec<Box<dyn AfterSequenceDetectionExtension>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cycle(mut self, extension: impl CycleDetectionExtension + 'static) -> Self {
        self.cycle.push(Box::new(extension));
        self
    }

    #[must_use]
    pub fn with_after_cycle(
        mut self,
        extension: impl AfterCycleDetectionExtension + 'static,
    ) -> Self {
        self.after_cycle.push(Box::new(extension));
        self
    }

    #[must_use]
    pub fn with_operation(mut self, extension: impl OperationDetectionExtension + 'static) -> Self {
        self.operation.push(Box::new(extension));
        self
    }

    #[must_use]
    pub fn with_after_operation(
        mut self,
        extension: impl AfterOperationDetectionExtension + 'static,
    ) -> Self {
        self.after_operation.push(Box::new(extension));
        self
    }

    #[must_use]
    pub fn with_after_sequence(
        mut self,
        extension: impl AfterSequenceDetectionExtension + 'static,
    ) -> Self {
        self.after_sequence.push(Box::new(extension));
        self
    }

    pub fn cycle(&self) -> &[Box<dyn CycleDetectionExtension>] {
        &self.cycle
    }

    pub fn after_cycle(&self) -> &[Box<dyn AfterCycleDetectionExtension>] {
        &self.after_cycle
    }

    pub fn operation(&self) -> &[Box<dyn OperationDetectionExtension>] {
        &self.operation
    }

    pub fn after_operation(&self) -> &[Box<dyn AfterOperationDetectionExtension>] {
        &self.after_operation
    }

    pub fn after_sequence(&self) -> &[Box<dyn AfterSequenceDetectionExtension>] {
        &self.after_sequence
    }

    /// First full-cycle override of the cycle extensions.
    pub fn is_full(&self, cycle: &OperationCycle) -> Option<bool> {
        self.cycle.iter().find_map(|extension| extension.is_full(cycle))
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("cycle", &self.cycle.len())
            .field("after_cycle", &self.after_cycle.len())
            .field("operation", &self.operation.len())
            .field("after_operation", &self.after_operation.len())
            .field("after_sequence", &self.after_sequence.len())
            .finish()
    }
}

/// Calls `call` on every hook in order, stopping at the first failure.
pub fn run_hooks<T: ?Sized>(
    hooks: &[Box<T>],
    hook: &'static str,
    mut call: impl FnMut(&T) -> HookResult,
) -> Result<(), DetectionError> {
    for extension in hooks {
        if let Err(source) = call(&**extension) {
            error!(hook, error = %source, "extension hook failed");
            return Err(DetectionError::extension(hook, source));
        }
    }
    Ok(())
}

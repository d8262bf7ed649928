//! Entry point of the detection of one machine module.
//!
//! [`MasterDetection`] checks that the signals of a stamp fit together, then
//! hands each signal to the component that owns it, in a fixed order. Every
//! component call runs in its own transaction.

use chrono::{DateTime, Utc};

use pd_core::{
    DetectionConfig, DetectionError, LogLevel, OperationId, Sequence, Stamp, StampId, Store,
    TxScope, with_transaction,
};

use crate::context::{DetectionContext, replayable};
use crate::milestone::SequenceMilestoneDetection;
use crate::operation::OperationDetection;
use crate::operation_cycle::OperationCycleDetection;
use crate::sequence::SequenceDetection;

const SOURCE: &str = "MasterDetection";

/// Dispatches the detection events of a machine module.
///
/// One instance per machine module; it owns the chronology state of the
/// sequence detection, so events of a module must go through the same
/// instance, one at a time.
#[derive(Debug)]
pub struct MasterDetection {
    context: DetectionContext,
    operation: OperationDetection,
    cycle: OperationCycleDetection,
    sequence: SequenceDetection,
    /// Coherence verdict of the last stamp: `None` when coherent, the reason otherwise.
    last_coherence: Option<(StampId, Option<String>)>,
}

impl MasterDetection {
    pub fn new(context: DetectionContext) -> Self {
        Self {
            operation: OperationDetection::new(context.clone()),
            cycle: OperationCycleDetection::new(context.clone()),
            sequence: SequenceDetection::new(context.clone()),
            context,
            last_coherence: None,
        }
    }

    pub const fn context(&self) -> &DetectionContext {
        &self.context
    }

    pub const fn operation_detection(&self) -> &OperationDetection {
        &self.operation
    }

    pub const fn operation_cycle_detection(&self) -> &OperationCycleDetection {
        &self.cycle
    }

    pub const fn sequence_detection(&self) -> &SequenceDetection {
        &self.sequence
    }

    pub const fn milestone_detection(&self) -> &SequenceMilestoneDetection {
        self.sequence.milestone_detection()
    }

    /// Applies a stamp reached at `date_time`.
    ///
    /// An incoherent stamp is logged and rejected with
    /// [`DetectionError::IncoherentStamp`]. A standalone operation or component
    /// tag has no rule yet and fails with [`DetectionError::NotImplemented`].
    pub fn start_stamp<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        stamp: &Stamp,
        quantity: Option<i32>,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        self.guarded(store, "start_stamp", stamp.is_cycle_boundary(), |master, store| {
            master.apply_stamp(store, stamp, quantity, date_time)
        })
    }

    pub fn start_cycle<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        self.guarded(store, "start_cycle", true, |master, store| {
            master.cycle.start_cycle(store, TxScope::Own, date_time)
        })
    }

    /// Starts a cycle of the operation with `code`, starting that operation first.
    pub fn start_cycle_with_operation_code<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        code: &str,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        self.guarded(store, "start_cycle_with_operation_code", true, |master, store| {
            let config = master.context.config();
            if let Some(operation) = master.operation_from_code(store, &config, code, date_time)? {
                tracing::debug!(%operation, %date_time, "cycle begin with an operation, start it");
                master.start_operation(store, operation, date_time)?;
            }
            master.cycle.start_cycle(store, TxScope::Own, date_time)
        })
    }

    pub fn stop_cycle<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        quantity: Option<i32>,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        self.guarded(store, "stop_cycle", true, |master, store| {
            master
                .cycle
                .stop_cycle(store, TxScope::Own, quantity, date_time)
        })
    }

    /// Stops a cycle of the operation with `code`, extending that operation first.
    pub fn stop_cycle_with_operation_code<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        code: &str,
        quantity: Option<i32>,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        self.guarded(store, "stop_cycle_with_operation_code", true, |master, store| {
            let config = master.context.config();
            if let Some(operation) = master.operation_from_code(store, &config, code, date_time)? {
                tracing::debug!(%operation, %date_time, "cycle end with an operation, extend it");
                master
                    .operation
                    .extend_operation(store, TxScope::Own, Some(operation), date_time)?;
            }
            master
                .cycle
                .stop_cycle(store, TxScope::Own, quantity, date_time)
        })
    }

    pub fn start_stop_cycle<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        self.guarded(store, "start_stop_cycle", true, |master, store| {
            master
                .cycle
                .start_stop_cycle(store, TxScope::Own, begin, end)
        })
    }

    /// The running program ended: the current sequence stops at `date_time`.
    pub fn stop_sequence<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        self.guarded(store, "stop_sequence", false, |master, store| {
            master
                .sequence
                .stop_sequence(store, TxScope::Own, date_time)
        })
    }

    pub fn detection_process_start(&self) -> Result<(), DetectionError> {
        self.cycle.detection_process_start()
    }

    pub fn detection_process_complete(&self) -> Result<(), DetectionError> {
        self.cycle.detection_process_complete()
    }

    /// Runs `f`, tracing a failure at the level its kind deserves.
    ///
    /// Failures of cycle events also reach the cycle extensions; if those
    /// fail, their error is attached to the returned one.
    fn guarded<S, T, F>(
        &mut self,
        store: &mut S,
        call: &'static str,
        cycle_event: bool,
        f: F,
    ) -> Result<T, DetectionError>
    where
        S: Store + ?Sized,
        F: FnOnce(&mut Self, &mut S) -> Result<T, DetectionError>,
    {
        self.context.liveness().set_active();
        f(self, store).map_err(|err| {
            self.context.report_failure(call, &err);
            if !cycle_event {
                return err;
            }
            match self.cycle.detection_process_error(&err) {
                Ok(()) => err,
                Err(hook_err) => err.with_hook_error(hook_err),
            }
        })
    }

    fn apply_stamp<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        stamp: &Stamp,
        quantity: Option<i32>,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let module = self.context.module();
        let sequence = match stamp.sequence {
            Some(id) => Some(store.sequence(id)?.ok_or(DetectionError::UnknownReference {
                what: "sequence",
                id: id.get(),
            })?),
            None => None,
        };
        if let Some(reason) = self.check_coherence(store, stamp, sequence.as_ref(), quantity, date_time)? {
            tracing::error!(%module, stamp = %stamp.id, %reason, "stamp is not coherent");
            return Err(DetectionError::IncoherentStamp {
                stamp: stamp.id,
                reason,
            });
        }

        let iso_file = if stamp.iso_file_end {
            tracing::debug!(%module, stamp = %stamp.id, "iso file end");
            self.sequence
                .stop_sequence(store, TxScope::Own, date_time)?;
            None
        } else {
            stamp.iso_file
        };
        with_transaction(
            store,
            TxScope::Own,
            "Detection.Master.StartStampIsoFileAssociation",
            replayable(),
            |store| store.apply_iso_file_association(module, date_time, iso_file),
        )?;

        if stamp.operation_cycle_begin {
            let operation = stamp
                .operation
                .or_else(|| sequence.as_ref().map(|sequence| sequence.operation));
            if let Some(operation) = operation {
                tracing::debug!(%module, stamp = %stamp.id, %operation, "cycle begin with an operation, start it");
                self.start_operation(store, operation, date_time)?;
            }
        }
        if stamp.operation_cycle_end {
            self.operation
                .extend_operation(store, TxScope::Own, stamp.operation, date_time)?;
        }
        if let Some(sequence) = &sequence {
            tracing::debug!(%module, stamp = %stamp.id, sequence = %sequence.id, "sequence start");
            // serializable, may wait on the other modules of the machine
            self.context.liveness().pause_check();
            let started = self
                .sequence
                .start_sequence(store, TxScope::Own, sequence, date_time);
            self.context.liveness().resume_check();
            started?;
        }
        if stamp.operation.is_some() && !stamp.is_cycle_boundary() {
            tracing::error!(%module, stamp = %stamp.id, "operation stamp outside a cycle boundary");
            return Err(DetectionError::NotImplemented(
                "operation stamp outside a cycle boundary",
            ));
        }
        if stamp.component.is_some() {
            tracing::error!(%module, stamp = %stamp.id, "component stamp");
            return Err(DetectionError::NotImplemented("component stamp"));
        }
        if stamp.operation_cycle_begin {
            self.cycle.start_cycle(store, TxScope::Own, date_time)?;
        }
        if stamp.operation_cycle_end {
            self.cycle
                .stop_cycle(store, TxScope::Own, quantity, date_time)?;
        }
        Ok(())
    }

    fn start_operation<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        operation: OperationId,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        self.operation
            .start_operation(store, TxScope::Own, operation, date_time)?;
        self.sequence
            .start_auto_only_operation(store, TxScope::Own, operation, date_time)
    }

    /// The coherence verdict of `stamp`.
    ///
    /// Computed and logged once while the same stamp is re-driven.
    fn check_coherence<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        stamp: &Stamp,
        sequence: Option<&Sequence>,
        quantity: Option<i32>,
        date_time: DateTime<Utc>,
    ) -> Result<Option<String>, DetectionError> {
        if let Some((_, verdict)) = self
            .last_coherence
            .as_ref()
            .filter(|(id, _)| *id == stamp.id)
        {
            return Ok(verdict.clone());
        }
        let verdict = self.incoherence(store, stamp, sequence, quantity, date_time)?;
        self.last_coherence = Some((stamp.id, verdict.clone()));
        Ok(verdict)
    }

    fn incoherence<S: Store + ?Sized>(
        &self,
        store: &mut S,
        stamp: &Stamp,
        sequence: Option<&Sequence>,
        quantity: Option<i32>,
        date_time: DateTime<Utc>,
    ) -> Result<Option<String>, DetectionError> {
        if let Some(quantity) = quantity.filter(|_| !stamp.operation_cycle_end) {
            let message = format!(
                "Quantity {quantity} with a stamp {} that is not a cycle end",
                stamp.id
            );
            self.log(store, LogLevel::Warn, date_time, message)?;
        }

        let reason = if stamp.operation_cycle_begin && stamp.operation_cycle_end {
            Some(format!(
                "Stamp {} is both an operation cycle begin and end",
                stamp.id
            ))
        } else if let Some(sequence) = sequence {
            if stamp.iso_file_end {
                Some(format!(
                    "Sequence {} and IsoFileEnd in the same time",
                    sequence.id
                ))
            } else if let Some(operation) = stamp
                .operation
                .filter(|&operation| operation != sequence.operation)
            {
                Some(format!(
                    "Sequence {} and Operation {operation} not compatible",
                    sequence.id
                ))
            } else {
                match stamp.component {
                    Some(component)
                        if !store.is_sequence_compatible_with_component(sequence.id, component)? =>
                    {
                        Some(format!(
                            "Sequence {} and Component {component} not compatible",
                            sequence.id
                        ))
                    }
                    _ => None,
                }
            }
        } else {
            match (stamp.operation, stamp.component) {
                (Some(operation), Some(component))
                    if !store.is_operation_compatible_with_component(operation, component)? =>
                {
                    Some(format!(
                        "Operation {operation} and Component {component} not compatible"
                    ))
                }
                _ => None,
            }
        };

        if let Some(reason) = &reason {
            self.log(store, LogLevel::Error, date_time, reason.clone())?;
        }
        Ok(reason)
    }

    /// Resolves an operation code, creating the operation when allowed.
    fn operation_from_code<S: Store + ?Sized>(
        &self,
        store: &mut S,
        config: &DetectionConfig,
        code: &str,
        date_time: DateTime<Utc>,
    ) -> Result<Option<OperationId>, DetectionError> {
        if code.is_empty() {
            tracing::debug!("empty operation code");
            return Ok(None);
        }
        let operations = store.operations_by_code(code)?;
        match operations.as_slice() {
            [operation] => Ok(Some(operation.id)),
            [] if config.create_operation_from_code => {
                tracing::warn!(code, "no operation with this code, create it");
                let operation = with_transaction(
                    store,
                    TxScope::Own,
                    "Detection.CreateOperationFromCode",
                    replayable(),
                    |store| store.create_operation(code),
                )?;
                Ok(Some(operation.id))
            }
            [] => {
                let message = format!("operation code {code} does not exist, skip it");
                tracing::error!("{message}");
                self.log(store, LogLevel::Error, date_time, message)?;
                Ok(None)
            }
            _ => {
                let message = format!(
                    "there are {} operations with the same operation code {code}, give up",
                    operations.len()
                );
                tracing::error!("{message}");
                self.log(store, LogLevel::Error, date_time, message)?;
                Ok(None)
            }
        }
    }

    fn log<S: Store + ?Sized>(
        &self,
        store: &mut S,
        level: LogLevel,
        date_time: DateTime<Utc>,
        message: String,
    ) -> Result<(), DetectionError> {
        with_transaction(
            store,
            TxScope::Own,
            "Detection.Master.Log",
            replayable(),
            |store| self.context.log(store, SOURCE, level, date_time, message),
        )?;
        Ok(())
    }
}

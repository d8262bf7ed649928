//! Operation cycle detection.
//!
//! Builds the cycle timeline of a machine from cycle begin and end signals:
//! - a begin opens a partial cycle and closes the previous partial one with an estimated end
//! - an end closes the open cycle, or creates a full cycle whose begin is estimated
//! - a gap after a full cycle is recorded as a between-cycles record
//!
//! Cycles are linked to the operation slot they run in; the store keeps the
//! `total_cycles` count of each slot in line with these links.

use chrono::{DateTime, Utc};

use pd_core::{
    BetweenCycles, DetectionConfig, DetectionError, LogLevel, OperationCycle, OperationSlot,
    OperationSlotId, Store, StoreError, TimeRange, TxScope, extension::run_hooks,
    with_transaction,
};

use crate::context::{DetectionContext, after_commit, format_end, format_time, replayable};

const SOURCE: &str = "OperationCycleDetection";

/// Keeps the operation cycles of a machine.
#[derive(Debug, Clone)]
pub struct OperationCycleDetection {
    context: DetectionContext,
}

impl OperationCycleDetection {
    pub const fn new(context: DetectionContext) -> Self {
        Self { context }
    }

    pub const fn context(&self) -> &DetectionContext {
        &self.context
    }

    /// A cycle begins at `date_time`.
    ///
    /// Rejected with an ERROR log when a cycle already lies after `date_time`.
    pub fn start_cycle<S: Store + ?Sized>(
        &self,
        store: &mut S,
        scope: TxScope,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let config = self.context.config();
        self.context.liveness().set_active();
        let applied = with_transaction(store, scope, "Detection.StartCycle", replayable(), |store| {
            self.start(store, &config, date_time)
        })
        .inspect_err(|err| self.context.report_failure("start_cycle", err))?;
        if !applied {
            return Ok(());
        }
        after_commit(scope, || {
            run_hooks(
                self.context.extensions().after_cycle(),
                "start_cycle",
                |hook| hook.start_cycle(date_time),
            )
        })
    }

    /// A cycle ends at `date_time`, having produced `quantity` parts if known.
    pub fn stop_cycle<S: Store + ?Sized>(
        &self,
        store: &mut S,
        scope: TxScope,
        quantity: Option<i32>,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let config = self.context.config();
        self.context.liveness().set_active();
        let applied = with_transaction(store, scope, "Detection.StopCycle", replayable(), |store| {
            self.stop(store, &config, quantity, date_time)
        })
        .inspect_err(|err| self.context.report_failure("stop_cycle", err))?;
        if !applied {
            return Ok(());
        }
        after_commit(scope, || {
            run_hooks(
                self.context.extensions().after_cycle(),
                "stop_cycle",
                |hook| hook.stop_cycle(quantity, date_time),
            )
        })
    }

    /// A whole cycle from `begin` to `end` is reported at once.
    ///
    /// Falls back to a separate begin and end when `begin` lies well before the
    /// operation slot of `end` and the operation changes in between.
    pub fn start_stop_cycle<S: Store + ?Sized>(
        &self,
        store: &mut S,
        scope: TxScope,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let range = TimeRange::new(begin, end)?;
        let config = self.context.config();
        self.context.liveness().set_active();
        let machine = self.context.machine();
        let applied = with_transaction(
            store,
            scope,
            "Detection.StartStopCycle",
            replayable(),
            |store| -> Result<bool, DetectionError> {
                if store.exists_observed_cycle(machine, range)? {
                    tracing::debug!(%machine, %begin, %end, "cycle already recorded");
                    return Ok(false);
                }
                let last = store.last_cycle(machine)?;
                let slot = store.operation_slot_at_considering_end(machine, end)?;
                if let Some(slot) = &slot {
                    if self.splits(store, &config, slot, begin)? {
                        tracing::debug!(%machine, %begin, %end, slot = %slot.range, "split the cycle");
                        self.start(store, &config, begin)?;
                        self.stop(store, &config, None, end)?;
                        return Ok(true);
                    }
                }

                let mut cycle = OperationCycle::starting_at(machine, begin);
                cycle.set_real_end(end);
                cycle.full = self.is_full(&cycle);
                cycle.operation_slot = slot.map(|slot| slot.id);
                store.insert_cycle(&mut cycle)?;
                let hooks = self.context.extensions().cycle();
                run_hooks(hooks, "start_cycle", |hook| hook.start_cycle(&cycle))?;
                run_hooks(hooks, "stop_cycle", |hook| hook.stop_cycle(&cycle))?;
                if let Some(previous) = &last {
                    self.create_between_cycle(store, &config, previous, &cycle)?;
                }
                Ok(true)
            },
        )
        .inspect_err(|err| self.context.report_failure("start_stop_cycle", err))?;
        if !applied {
            return Ok(());
        }
        after_commit(scope, || {
            run_hooks(
                self.context.extensions().after_cycle(),
                "start_stop_cycle",
                |hook| hook.start_stop_cycle(begin, end),
            )
        })
    }

    pub fn detection_process_start(&self) -> Result<(), DetectionError> {
        run_hooks(
            self.context.extensions().cycle(),
            "detection_process_start",
            |hook| hook.detection_process_start(),
        )
    }

    pub fn detection_process_complete(&self) -> Result<(), DetectionError> {
        run_hooks(
            self.context.extensions().cycle(),
            "detection_process_complete",
            |hook| hook.detection_process_complete(),
        )
    }

    /// Tells the cycle extensions, then the after-extensions, that a detection failed.
    pub fn detection_process_error(&self, error: &DetectionError) -> Result<(), DetectionError> {
        let extensions = self.context.extensions();
        run_hooks(extensions.cycle(), "detection_process_error", |hook| {
            hook.detection_process_error(error)
        })?;
        run_hooks(extensions.after_cycle(), "detection_process_error", |hook| {
            hook.detection_process_error(error)
        })
    }

    fn is_full(&self, cycle: &OperationCycle) -> bool {
        self.context
            .extensions()
            .is_full(cycle)
            .unwrap_or_else(|| cycle.is_full_by_end())
    }

    /// Returns false if the begin was rejected or replayed.
    fn start<S: Store + ?Sized>(
        &self,
        store: &mut S,
        config: &DetectionConfig,
        date_time: DateTime<Utc>,
    ) -> Result<bool, DetectionError> {
        let machine = self.context.machine();
        if store.exists_cycle_after(machine, date_time)? {
            self.raise_invalid_date_time(store, date_time)?;
            return Ok(false);
        }
        let mut last = store.last_cycle(machine)?;
        if last.as_ref().is_some_and(|last| {
            last.begin == Some(date_time) && last.has_real_begin() && !last.has_real_end()
        }) {
            tracing::debug!(%machine, %date_time, "cycle begin already recorded");
            return Ok(false);
        }

        let mut cycle = OperationCycle::starting_at(machine, date_time);
        if let Some(slot) = store.operation_slot_at(machine, date_time)? {
            tracing::debug!(%machine, slot = %slot.range, "associate the new partial cycle to its slot");
            cycle.operation_slot = Some(slot.id);
            if let Some(end) = slot.range.end {
                cycle.set_estimated_end(end);
            }
        }

        if let Some(previous) = last.as_mut() {
            let original = previous.clone();
            if !previous.has_real_end() {
                match (previous.operation_slot, cycle.operation_slot) {
                    (None, None) => {
                        let end = match previous.begin {
                            Some(begin) => store
                                .first_operation_slot_beginning_between(machine, begin, date_time)?
                                .map_or(date_time, |slot| slot.range.begin),
                            None => date_time,
                        };
                        previous.set_estimated_end(end);
                    }
                    (Some(a), Some(b)) if a == b => previous.set_estimated_end(date_time),
                    _ => {}
                }
            }
            if previous.has_estimated_end() && previous.end.is_some_and(|end| date_time < end) {
                tracing::warn!(
                    %machine,
                    from = %format_end(previous.end),
                    to = %date_time,
                    "correct the estimated end of the last cycle"
                );
                previous.set_estimated_end(date_time);
            }

            let was_full = previous.full;
            previous.full = self.is_full(previous);
            if !was_full && previous.full {
                run_hooks(self.context.extensions().cycle(), "stop_cycle", |hook| {
                    hook.stop_cycle(&*previous)
                })?;
            } else if was_full && !previous.full {
                tracing::warn!(%machine, %date_time, "the last cycle was full and is not any more");
            }
            if *previous != original {
                store.update_cycle(previous)?;
            }
        }

        store.insert_cycle(&mut cycle)?;
        run_hooks(self.context.extensions().cycle(), "start_cycle", |hook| {
            hook.start_cycle(&cycle)
        })?;
        if let Some(previous) = &last {
            self.create_between_cycle(store, config, previous, &cycle)?;
        }
        Ok(true)
    }

    /// Returns false if the end was rejected or replayed.
    fn stop<S: Store + ?Sized>(
        &self,
        store: &mut S,
        config: &DetectionConfig,
        quantity: Option<i32>,
        date_time: DateTime<Utc>,
    ) -> Result<bool, DetectionError> {
        let machine = self.context.machine();
        let mut last = store.last_cycle(machine)?;

        if let Some(previous) = last.as_mut() {
            if previous.has_real_end() && previous.end == Some(date_time) {
                if quantity.is_none() || previous.quantity == quantity {
                    tracing::debug!(%machine, %date_time, "cycle end already recorded");
                    return Ok(false);
                }
                self.change_quantity(store, previous, quantity, date_time)?;
                previous.full = self.is_full(previous);
                store.update_cycle(previous)?;
                return Ok(true);
            }
            if !previous.has_real_end() && previous.begin.is_some_and(|begin| date_time < begin) {
                self.raise_invalid_date_time(store, date_time)?;
                return Ok(false);
            }
            match previous.end {
                None => {
                    previous.set_estimated_end(date_time);
                    previous.full = self.is_full(previous);
                    store.update_cycle(previous)?;
                }
                Some(end) if date_time < end => {
                    if !previous.has_estimated_end() {
                        self.raise_invalid_date_time(store, date_time)?;
                        return Ok(false);
                    }
                    tracing::info!(
                        %machine,
                        end = %end,
                        %date_time,
                        "shorten the last cycle, its estimated end is after the new cycle end"
                    );
                    previous.set_estimated_end(date_time);
                    previous.full = self.is_full(previous);
                    store.update_cycle(previous)?;
                }
                Some(_) => {}
            }
        }

        let slot = store.operation_slot_at_considering_end(machine, date_time)?;
        if config.extend_full_cycle_when_new_cycle_end {
            if let Some(previous) = last.as_mut().filter(|previous| previous.has_real_end()) {
                if self.is_same_continuous_operation(store, previous, date_time, slot.as_ref())? {
                    self.extend_full_cycle(store, previous, quantity, date_time)?;
                    return Ok(true);
                }
            }
        }

        let cycle = match last.as_mut() {
            Some(previous) if !previous.has_real_end() => {
                if self.is_same_continuous_operation(store, previous, date_time, slot.as_ref())? {
                    let slot = previous.operation_slot;
                    self.complete_partial_cycle(store, previous, slot, quantity, date_time)?
                } else {
                    self.stop_partial_cycle_in_other_slot(
                        store,
                        config,
                        previous,
                        slot.as_ref(),
                        quantity,
                        date_time,
                    )?
                }
            }
            previous => {
                self.new_full_cycle(store, previous.as_deref(), slot.as_ref(), quantity, date_time)?
            }
        };

        run_hooks(self.context.extensions().cycle(), "stop_cycle", |hook| {
            hook.stop_cycle(&cycle)
        })?;

        for module in store.machine_modules(machine)? {
            let Some(mut sequence_slot) = store.last_sequence_slot_before(module, date_time)? else {
                continue;
            };
            let original = sequence_slot.clone();
            if sequence_slot.range.end.is_none_or(|end| date_time < end) {
                tracing::warn!(
                    %module,
                    slot = %sequence_slot.range,
                    %date_time,
                    "the sequence slot ends after the cycle end, correct it"
                );
                sequence_slot.range.end = Some(date_time);
            }
            if sequence_slot
                .next_begin
                .is_none_or(|next_begin| date_time < next_begin)
            {
                sequence_slot.next_begin = Some(date_time);
            }
            if sequence_slot != original {
                store.update_sequence_slot(&mut sequence_slot)?;
            }
        }
        Ok(true)
    }

    /// True if a cycle from `begin` to the beginning of `slot` spans an operation change.
    fn splits<S: Store + ?Sized>(
        &self,
        store: &S,
        config: &DetectionConfig,
        slot: &OperationSlot,
        begin: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let slot_begin = slot.range.begin;
        if slot_begin <= begin || slot_begin - begin <= config.operation_cycle_association_margin {
            return Ok(false);
        }
        let continuous = store.is_continuous_operation_in_range(
            self.context.machine(),
            TimeRange::clamped(begin, Some(slot_begin)),
            slot.operation,
        )?;
        Ok(!continuous)
    }

    /// True if nothing but the same operation ran between `previous` and `date_time`.
    fn is_same_continuous_operation<S: Store + ?Sized>(
        &self,
        store: &S,
        previous: &OperationCycle,
        date_time: DateTime<Utc>,
        slot: Option<&OperationSlot>,
    ) -> Result<bool, StoreError> {
        let machine = self.context.machine();
        let Some(reference) = previous.date_time() else {
            return Ok(false);
        };
        let continuous = |store: &S, end: DateTime<Utc>, operation| {
            store.is_continuous_operation_in_range(
                machine,
                TimeRange::clamped(reference, Some(end)),
                operation,
            )
        };
        match (slot, previous.operation_slot) {
            (None, None) => continuous(store, date_time, None),
            (None, Some(previous_slot)) => {
                let operation = store
                    .operation_slot(previous_slot)?
                    .and_then(|slot| slot.operation);
                if operation.is_some() {
                    Ok(false)
                } else {
                    continuous(store, date_time, None)
                }
            }
            (Some(slot), None) => {
                if slot.operation.is_some() {
                    Ok(false)
                } else {
                    continuous(store, slot.range.begin, None)
                }
            }
            (Some(slot), Some(previous_slot)) => {
                if slot.id == previous_slot {
                    return Ok(true);
                }
                let operation = store
                    .operation_slot(previous_slot)?
                    .and_then(|slot| slot.operation);
                if operation != slot.operation {
                    Ok(false)
                } else {
                    continuous(store, slot.range.begin, slot.operation)
                }
            }
        }
    }

    /// Pushes the real end of the last full cycle to `date_time`.
    fn extend_full_cycle<S: Store + ?Sized>(
        &self,
        store: &mut S,
        cycle: &mut OperationCycle,
        quantity: Option<i32>,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let machine = self.context.machine();
        if let Some(end) = cycle.end {
            for module in store.machine_modules(machine)? {
                let mut slots = store.sequence_slots_with_next_begin_from(module, end)?;
                let next_begin = slots
                    .get(1)
                    .map(|next| next.range.begin)
                    .filter(|&begin| begin < date_time)
                    .unwrap_or(date_time);
                if let Some(slot) = slots
                    .first_mut()
                    .filter(|slot| slot.next_begin == Some(end))
                {
                    slot.next_begin = Some(next_begin);
                    store.update_sequence_slot(slot)?;
                }
            }
        }
        tracing::debug!(%machine, from = %format_end(cycle.end), to = %date_time, "extend the full cycle");
        cycle.set_real_end(date_time);
        self.change_quantity(store, cycle, quantity, date_time)?;
        cycle.full = self.is_full(cycle);
        store.update_cycle(cycle)?;
        Ok(())
    }

    /// Sets a new quantity on a full cycle, logging when it replaces a known one.
    fn change_quantity<S: Store + ?Sized>(
        &self,
        store: &mut S,
        cycle: &mut OperationCycle,
        quantity: Option<i32>,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let Some(quantity) = quantity.filter(|&quantity| cycle.quantity != Some(quantity)) else {
            return Ok(());
        };
        if let Some(previous) = cycle.quantity {
            let message = format!(
                "At {} the quantity of the full operation cycle is changed from {previous} to {quantity}",
                format_end(cycle.end)
            );
            tracing::warn!(machine = %self.context.machine(), "{message}");
            self.context
                .log_machine(store, SOURCE, LogLevel::Warn, date_time, message)?;
        }
        cycle.quantity = Some(quantity);
        Ok(())
    }

    /// Turns the open partial cycle into a full one ending at `date_time`.
    fn complete_partial_cycle<S: Store + ?Sized>(
        &self,
        store: &mut S,
        cycle: &mut OperationCycle,
        slot: Option<OperationSlotId>,
        quantity: Option<i32>,
        date_time: DateTime<Utc>,
    ) -> Result<OperationCycle, DetectionError> {
        cycle.quantity = quantity;
        cycle.set_real_end(date_time);
        cycle.operation_slot = slot;
        cycle.full = self.is_full(cycle);
        store.update_cycle(cycle)?;
        Ok(cycle.clone())
    }

    /// Closes the cycle when the open partial cycle started in another slot.
    ///
    /// The partial cycle is moved into `slot` when it began within the
    /// association margin before it, or when both slots hold the same work with
    /// nothing different in between. Otherwise it is left as is and a new full
    /// cycle is created.
    fn stop_partial_cycle_in_other_slot<S: Store + ?Sized>(
        &self,
        store: &mut S,
        config: &DetectionConfig,
        previous: &mut OperationCycle,
        slot: Option<&OperationSlot>,
        quantity: Option<i32>,
        date_time: DateTime<Utc>,
    ) -> Result<OperationCycle, DetectionError> {
        let machine = self.context.machine();
        if let Some(slot) = slot {
            if slot.total_cycles != 0 {
                tracing::error!(
                    %machine,
                    slot = %slot.range,
                    total_cycles = slot.total_cycles,
                    "the slot of the cycle end already has cycles"
                );
            }
            let slot_begin = slot.range.begin;
            let within_margin = previous.begin.is_some_and(|begin| {
                begin < slot_begin && slot_begin - begin < config.operation_cycle_association_margin
            });
            if within_margin {
                tracing::debug!(%machine, slot = %slot.range, "move the partial cycle into the slot within the margin");
                return self.complete_partial_cycle(store, previous, Some(slot.id), quantity, date_time);
            }
            if self.same_work_since(store, previous.operation_slot, slot)? {
                tracing::debug!(%machine, slot = %slot.range, "move the partial cycle into a slot of the same work");
                return self.complete_partial_cycle(store, previous, Some(slot.id), quantity, date_time);
            }
        }

        let mut cycle = OperationCycle::new(machine);
        cycle.quantity = quantity;
        cycle.set_real_end(date_time);
        if let Some(slot) = slot {
            cycle.set_estimated_begin(slot.range.begin);
            cycle.operation_slot = Some(slot.id);
        }
        cycle.full = self.is_full(&cycle);
        store.insert_cycle(&mut cycle)?;
        Ok(cycle)
    }

    /// True if `previous_slot` and `slot` hold the same work with no different work between them.
    fn same_work_since<S: Store + ?Sized>(
        &self,
        store: &S,
        previous_slot: Option<OperationSlotId>,
        slot: &OperationSlot,
    ) -> Result<bool, StoreError> {
        let Some(previous_slot) = previous_slot else {
            return Ok(false);
        };
        let Some(previous_slot) = store.operation_slot(previous_slot)? else {
            return Ok(false);
        };
        let Some(previous_end) = previous_slot.range.end.filter(|_| previous_slot.same_work(slot))
        else {
            return Ok(false);
        };
        let between = TimeRange::clamped(previous_end, Some(slot.range.begin));
        let different = store.exists_different_work_between(self.context.machine(), between, slot)?;
        Ok(!different)
    }

    /// Creates a full cycle ending at `date_time` when no partial cycle is open.
    fn new_full_cycle<S: Store + ?Sized>(
        &self,
        store: &mut S,
        previous: Option<&OperationCycle>,
        slot: Option<&OperationSlot>,
        quantity: Option<i32>,
        date_time: DateTime<Utc>,
    ) -> Result<OperationCycle, DetectionError> {
        let machine = self.context.machine();
        let mut cycle = OperationCycle::new(machine);
        cycle.quantity = quantity;
        cycle.set_real_end(date_time);
        match slot {
            Some(slot) => self.associate_new_full_cycle(store, previous, &mut cycle, slot)?,
            None => {
                if let Some(previous_end) = previous.and_then(|previous| previous.end) {
                    let slot_end = store
                        .last_operation_slot_before(machine, date_time)?
                        .and_then(|slot| slot.range.end);
                    let begin = match slot_end {
                        Some(slot_end) if previous_end < slot_end => slot_end,
                        _ => previous_end,
                    };
                    cycle.set_estimated_begin(begin);
                }
            }
        }
        cycle.full = self.is_full(&cycle);
        store.insert_cycle(&mut cycle)?;
        Ok(cycle)
    }

    fn associate_new_full_cycle<S: Store + ?Sized>(
        &self,
        store: &mut S,
        previous: Option<&OperationCycle>,
        cycle: &mut OperationCycle,
        slot: &OperationSlot,
    ) -> Result<(), DetectionError> {
        let date_time = cycle.end.unwrap_or(slot.range.begin);
        let first_of_slot = previous.is_none_or(|previous| {
            previous
                .date_time()
                .is_none_or(|reference| reference <= slot.range.begin)
        });
        if first_of_slot {
            if slot.total_cycles != 0 {
                let message = format!(
                    "The number of total cycles in operation slot {} is incoherent with the read operation cycles",
                    slot.id
                );
                self.raise(store, date_time, message)?;
            }
            cycle.set_estimated_begin(slot.range.begin);
        } else if let Some(previous_end) = previous.and_then(|previous| previous.end) {
            if slot.total_cycles < 1 {
                let message = format!(
                    "The previous cycle ending at {} was expected to be in operation slot {} but it was not, the average cycle time may be wrong",
                    format_time(previous_end),
                    slot.id
                );
                self.raise(store, date_time, message)?;
                if previous_end <= date_time {
                    cycle.set_estimated_begin(previous_end);
                } else {
                    cycle.set_estimated_begin(slot.range.begin);
                }
            } else {
                cycle.set_estimated_begin(previous_end);
            }
        }
        cycle.operation_slot = Some(slot.id);
        Ok(())
    }

    fn raise_invalid_date_time<S: Store + ?Sized>(
        &self,
        store: &mut S,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let message = format!("already an operation cycle after {}", format_time(date_time));
        self.raise(store, date_time, message)
    }

    fn raise<S: Store + ?Sized>(
        &self,
        store: &mut S,
        date_time: DateTime<Utc>,
        message: String,
    ) -> Result<(), DetectionError> {
        tracing::error!(machine = %self.context.machine(), "{message}");
        self.context
            .log_machine(store, SOURCE, LogLevel::Error, date_time, message)?;
        Ok(())
    }

    /// Records the gap between a full cycle and the next one.
    fn create_between_cycle<S: Store + ?Sized>(
        &self,
        store: &mut S,
        config: &DetectionConfig,
        previous: &OperationCycle,
        next: &OperationCycle,
    ) -> Result<(), DetectionError> {
        if !previous.full {
            return Ok(());
        }
        if let (Some(end), Some(begin), Some(previous_cycle), Some(next_cycle)) =
            (previous.end, next.begin, previous.id, next.id)
        {
            let record = if end < begin {
                true
            } else if end == begin {
                !config.skip_empty_between_cycles
                    && (previous.begin != Some(end) || !config.skip_empty_between_if_previous_empty)
            } else {
                false
            };
            if record {
                let mut between = BetweenCycles {
                    id: None,
                    machine: self.context.machine(),
                    previous_cycle,
                    next_cycle,
                    begin: end,
                    end: begin,
                };
                store.insert_between_cycles(&mut between)?;
            }
        }
        run_hooks(
            self.context.extensions().cycle(),
            "create_between_cycle",
            |hook| hook.create_between_cycle(previous, next),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::test_support::{associate, at, logs, machine, module, secs, seq, setup};
    use pd_core::{
        AfterCycleDetectionExtension, CycleStatus, Extensions, HookResult, SequenceSlot,
    };
    use pd_db::Database;

    fn detection() -> OperationCycleDetection {
        OperationCycleDetection::new(DetectionContext::new(machine(), module()))
    }

    fn detection_with(config: DetectionConfig) -> OperationCycleDetection {
        OperationCycleDetection::new(DetectionContext::new(machine(), module()).with_config(config))
    }

    /// `(begin, end, full)` of every cycle, in seconds.
    fn cycle_summary(db: &Database) -> Vec<(Option<i64>, Option<i64>, bool)> {
        db.cycles(machine())
            .unwrap()
            .iter()
            .map(|cycle| (cycle.begin.map(secs), cycle.end.map(secs), cycle.full))
            .collect()
    }

    fn between_summary(db: &Database) -> Vec<(i64, i64)> {
        db.between_cycles(machine())
            .unwrap()
            .iter()
            .map(|between| (secs(between.begin), secs(between.end)))
            .collect()
    }

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl AfterCycleDetectionExtension for Recorder {
        fn start_cycle(&self, date_time: DateTime<Utc>) -> HookResult {
            self.calls
                .lock()
                .unwrap()
                .push(format!("start at {}", secs(date_time)));
            Ok(())
        }

        fn stop_cycle(&self, quantity: Option<i32>, date_time: DateTime<Utc>) -> HookResult {
            self.calls
                .lock()
                .unwrap()
                .push(format!("stop {quantity:?} at {}", secs(date_time)));
            Ok(())
        }
    }

    // ========== Start Tests ==========

    #[test]
    fn start_then_stop_makes_one_full_cycle() {
        let mut db = setup();
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(0)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, None, at(10))
            .unwrap();

        assert_eq!(cycle_summary(&db), vec![(Some(0), Some(10), true)]);
        let cycles = db.cycles(machine()).unwrap();
        assert!(cycles[0].operation_slot.is_none());
        assert!(between_summary(&db).is_empty());
    }

    #[test]
    fn second_start_estimates_previous_end() {
        let mut db = setup();
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(0)).unwrap();
        detection.start_cycle(&mut db, TxScope::Own, at(30)).unwrap();

        assert_eq!(
            cycle_summary(&db),
            vec![(Some(0), Some(30), false), (Some(30), None, false)]
        );
        let cycles = db.cycles(machine()).unwrap();
        assert!(cycles[0].has_estimated_end());
    }

    #[test]
    fn replayed_start_is_noop() {
        let mut db = setup();
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(0)).unwrap();
        detection.start_cycle(&mut db, TxScope::Own, at(0)).unwrap();

        assert_eq!(cycle_summary(&db), vec![(Some(0), None, false)]);
    }

    #[test]
    fn start_before_existing_cycle_is_rejected() {
        let mut db = setup();
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(100)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, None, at(110))
            .unwrap();
        detection.start_cycle(&mut db, TxScope::Own, at(50)).unwrap();

        assert_eq!(cycle_summary(&db), vec![(Some(100), Some(110), true)]);
        let logs = logs(&db);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
        assert_eq!(logs[0].module, None);
        insta::assert_snapshot!(&logs[0].message, @"already an operation cycle after 2023-11-14T22:14:10.000Z");
    }

    #[test]
    fn start_in_slot_seeds_estimated_end() {
        let mut db = setup();
        associate(&mut db, 0, Some(100), Some(1));
        detection().start_cycle(&mut db, TxScope::Own, at(10)).unwrap();

        let cycles = db.cycles(machine()).unwrap();
        assert_eq!(cycles[0].end, Some(at(100)));
        assert!(cycles[0].status.contains(CycleStatus::END_ESTIMATED));
        assert!(!cycles[0].full);
        let slot = db.operation_slot_at(machine(), at(10)).unwrap().unwrap();
        assert_eq!(cycles[0].operation_slot, Some(slot.id));
        assert_eq!(slot.total_cycles, 1);
    }

    // ========== Between Cycles Tests ==========

    #[test]
    fn gap_after_full_cycle_is_recorded() {
        let mut db = setup();
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(0)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, None, at(10))
            .unwrap();
        detection.start_cycle(&mut db, TxScope::Own, at(20)).unwrap();

        assert_eq!(between_summary(&db), vec![(10, 20)]);
    }

    #[test]
    fn zero_gap_follows_skip_flags() {
        let mut db = setup();
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(0)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, None, at(10))
            .unwrap();
        detection.start_cycle(&mut db, TxScope::Own, at(10)).unwrap();
        assert_eq!(between_summary(&db), vec![(10, 10)]);

        let mut db = setup();
        let detection = detection_with(DetectionConfig {
            skip_empty_between_cycles: true,
            ..DetectionConfig::default()
        });
        detection.start_cycle(&mut db, TxScope::Own, at(0)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, None, at(10))
            .unwrap();
        detection.start_cycle(&mut db, TxScope::Own, at(10)).unwrap();
        assert!(between_summary(&db).is_empty());
    }

    // ========== Stop Tests ==========

    #[test]
    fn replayed_stop_is_noop() {
        let mut db = setup();
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(0)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, Some(5), at(10))
            .unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, Some(5), at(10))
            .unwrap();

        assert_eq!(cycle_summary(&db), vec![(Some(0), Some(10), true)]);
        assert!(logs(&db).is_empty());
    }

    #[test]
    fn stop_without_start_estimates_begin_from_previous_end() {
        let mut db = setup();
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(0)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, None, at(10))
            .unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, None, at(20))
            .unwrap();

        assert_eq!(
            cycle_summary(&db),
            vec![(Some(0), Some(10), true), (Some(10), Some(20), true)]
        );
        let cycles = db.cycles(machine()).unwrap();
        assert!(cycles[1].status.contains(CycleStatus::BEGIN_ESTIMATED));
    }

    #[test]
    fn stop_in_slot_counts_the_cycle() {
        let mut db = setup();
        associate(&mut db, 0, None, Some(1));
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(5)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, Some(1), at(15))
            .unwrap();

        assert_eq!(cycle_summary(&db), vec![(Some(5), Some(15), true)]);
        let slot = db.operation_slot_at(machine(), at(5)).unwrap().unwrap();
        assert_eq!(slot.total_cycles, 1);
        assert!(logs(&db).is_empty());
    }

    #[test]
    fn stop_in_other_operation_leaves_partial_cycle() {
        let mut db = setup();
        associate(&mut db, 0, Some(100), Some(1));
        associate(&mut db, 100, None, Some(2));
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(50)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, None, at(150))
            .unwrap();

        assert_eq!(
            cycle_summary(&db),
            vec![(Some(50), Some(100), false), (Some(100), Some(150), true)]
        );
        let first = db.operation_slot_at(machine(), at(50)).unwrap().unwrap();
        let second = db.operation_slot_at(machine(), at(150)).unwrap().unwrap();
        assert_eq!(first.total_cycles, 1);
        assert_eq!(second.total_cycles, 1);
    }

    #[test]
    fn stop_before_open_cycle_begin_changes_nothing() {
        let mut db = setup();
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(100)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, None, at(50))
            .unwrap();

        assert_eq!(cycle_summary(&db), vec![(Some(100), None, false)]);
        let logs = logs(&db);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
        insta::assert_snapshot!(&logs[0].message, @"already an operation cycle after 2023-11-14T22:14:10.000Z");
    }

    #[test]
    fn stop_before_open_cycle_begin_keeps_estimated_end() {
        let mut db = setup();
        associate(&mut db, 0, Some(200), Some(1));
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(100)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, None, at(50))
            .unwrap();

        assert_eq!(cycle_summary(&db), vec![(Some(100), Some(200), false)]);
        let cycles = db.cycles(machine()).unwrap();
        assert!(cycles[0].has_estimated_end());
        assert_eq!(logs(&db).len(), 1);
    }

    #[test]
    fn extending_full_cycle_logs_quantity_change() {
        let mut db = setup();
        let detection = detection_with(DetectionConfig {
            extend_full_cycle_when_new_cycle_end: true,
            ..DetectionConfig::default()
        });
        detection.start_cycle(&mut db, TxScope::Own, at(0)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, Some(1), at(10))
            .unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, Some(2), at(20))
            .unwrap();

        assert_eq!(cycle_summary(&db), vec![(Some(0), Some(20), true)]);
        assert_eq!(db.cycles(machine()).unwrap()[0].quantity, Some(2));
        let logs = logs(&db);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Warn);
        insta::assert_snapshot!(&logs[0].message, @"At 2023-11-14T22:13:40.000Z the quantity of the full operation cycle is changed from 1 to 2");
    }

    #[test]
    fn stop_cuts_running_sequence_slot() {
        let mut db = setup();
        let mut slot = SequenceSlot::new(module(), TimeRange::from(at(0)), seq(5));
        db.insert_sequence_slot(&mut slot).unwrap();
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(0)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, None, at(10))
            .unwrap();

        let slots = db.sequence_slots(module()).unwrap();
        assert_eq!(slots[0].range.end, Some(at(10)));
        assert_eq!(slots[0].next_begin, Some(at(10)));
    }

    // ========== Slot Change Tests ==========

    #[test]
    fn partial_cycle_moves_to_next_slot_within_margin() {
        let mut db = setup();
        associate(&mut db, 0, Some(100), Some(1));
        associate(&mut db, 100, None, Some(2));
        let detection = detection_with(DetectionConfig {
            operation_cycle_association_margin: chrono::Duration::seconds(10),
            ..DetectionConfig::default()
        });
        detection.start_cycle(&mut db, TxScope::Own, at(95)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, None, at(150))
            .unwrap();

        assert_eq!(cycle_summary(&db), vec![(Some(95), Some(150), true)]);
        let first = db.operation_slot_at(machine(), at(50)).unwrap().unwrap();
        let second = db.operation_slot_at(machine(), at(150)).unwrap().unwrap();
        assert_eq!(db.cycles(machine()).unwrap()[0].operation_slot, Some(second.id));
        assert_eq!(first.total_cycles, 0);
        assert_eq!(second.total_cycles, 1);
    }

    #[test]
    fn partial_cycle_moves_to_slot_of_same_work() {
        let mut db = setup();
        associate(&mut db, 0, Some(100), Some(1));
        associate(&mut db, 150, Some(180), Some(1));
        associate(&mut db, 200, None, Some(1));
        let detection = detection();
        detection.start_cycle(&mut db, TxScope::Own, at(50)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, None, at(250))
            .unwrap();

        assert_eq!(cycle_summary(&db), vec![(Some(50), Some(250), true)]);
        let first = db.operation_slot_at(machine(), at(50)).unwrap().unwrap();
        let last = db.operation_slot_at(machine(), at(250)).unwrap().unwrap();
        assert_eq!(db.cycles(machine()).unwrap()[0].operation_slot, Some(last.id));
        assert_eq!(first.total_cycles, 0);
        assert_eq!(last.total_cycles, 1);
        assert!(logs(&db).is_empty());
    }

    #[test]
    fn partial_cycle_moves_once_when_margin_and_same_work_match() {
        let mut db = setup();
        associate(&mut db, 0, Some(100), Some(1));
        associate(&mut db, 150, Some(180), Some(1));
        associate(&mut db, 200, None, Some(1));
        let detection = detection_with(DetectionConfig {
            operation_cycle_association_margin: chrono::Duration::seconds(300),
            ..DetectionConfig::default()
        });
        detection.start_cycle(&mut db, TxScope::Own, at(50)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, Some(2), at(250))
            .unwrap();

        let cycles = db.cycles(machine()).unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].quantity, Some(2));
        let last = db.operation_slot_at(machine(), at(250)).unwrap().unwrap();
        assert_eq!(cycles[0].operation_slot, Some(last.id));
        assert_eq!(last.total_cycles, 1);
        let total: i32 = db
            .operation_slots(machine())
            .unwrap()
            .iter()
            .map(|slot| slot.total_cycles)
            .sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn new_full_cycle_in_slot_with_unread_cycles_is_logged() {
        let mut db = setup();
        associate(&mut db, 0, None, Some(1));
        let slot = db.operation_slot_at(machine(), at(0)).unwrap().unwrap();
        let mut unread = OperationCycle::new(machine());
        unread.set_real_end(at(0));
        unread.full = true;
        unread.operation_slot = Some(slot.id);
        db.insert_cycle(&mut unread).unwrap();

        detection()
            .stop_cycle(&mut db, TxScope::Own, None, at(50))
            .unwrap();

        assert_eq!(
            cycle_summary(&db),
            vec![(None, Some(0), true), (Some(0), Some(50), true)]
        );
        let cycles = db.cycles(machine()).unwrap();
        assert_eq!(cycles[1].operation_slot, Some(slot.id));
        let logs = logs(&db);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
        assert_eq!(
            logs[0].message,
            format!(
                "The number of total cycles in operation slot {} is incoherent with the read operation cycles",
                slot.id
            )
        );
    }

    #[test]
    fn new_full_cycle_after_unlinked_cycle_is_logged() {
        let mut db = setup();
        associate(&mut db, 0, None, Some(1));
        let slot = db.operation_slot_at(machine(), at(0)).unwrap().unwrap();
        let mut unlinked = OperationCycle::starting_at(machine(), at(0));
        unlinked.set_real_end(at(10));
        unlinked.full = true;
        db.insert_cycle(&mut unlinked).unwrap();

        detection()
            .stop_cycle(&mut db, TxScope::Own, None, at(30))
            .unwrap();

        assert_eq!(
            cycle_summary(&db),
            vec![(Some(0), Some(10), true), (Some(10), Some(30), true)]
        );
        let cycles = db.cycles(machine()).unwrap();
        assert_eq!(cycles[1].operation_slot, Some(slot.id));
        assert!(cycles[1].status.contains(CycleStatus::BEGIN_ESTIMATED));
        let logs = logs(&db);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
        assert_eq!(
            logs[0].message,
            format!(
                "The previous cycle ending at 2023-11-14T22:13:30.000Z was expected to be in operation slot {} but it was not, the average cycle time may be wrong",
                slot.id
            )
        );
    }

    // ========== Start Stop Tests ==========

    #[test]
    fn start_stop_cycle_records_gap() {
        let mut db = setup();
        let detection = detection();
        detection
            .start_stop_cycle(&mut db, TxScope::Own, at(0), at(10))
            .unwrap();
        detection
            .start_stop_cycle(&mut db, TxScope::Own, at(20), at(30))
            .unwrap();

        assert_eq!(
            cycle_summary(&db),
            vec![(Some(0), Some(10), true), (Some(20), Some(30), true)]
        );
        assert_eq!(between_summary(&db), vec![(10, 20)]);
    }

    #[test]
    fn start_stop_cycle_splits_across_operation_change() {
        let mut db = setup();
        associate(&mut db, 0, Some(100), Some(1));
        associate(&mut db, 100, None, Some(2));
        detection()
            .start_stop_cycle(&mut db, TxScope::Own, at(50), at(150))
            .unwrap();

        assert_eq!(
            cycle_summary(&db),
            vec![(Some(50), Some(100), false), (Some(100), Some(150), true)]
        );
        let first = db.operation_slot_at(machine(), at(50)).unwrap().unwrap();
        let second = db.operation_slot_at(machine(), at(150)).unwrap().unwrap();
        let cycles = db.cycles(machine()).unwrap();
        assert_eq!(cycles[0].operation_slot, Some(first.id));
        assert_eq!(cycles[1].operation_slot, Some(second.id));
        assert_eq!(first.total_cycles, 1);
        assert_eq!(second.total_cycles, 1);
    }

    #[test]
    fn replayed_start_stop_cycle_is_noop() {
        let mut db = setup();
        let detection = detection();
        detection
            .start_stop_cycle(&mut db, TxScope::Own, at(0), at(10))
            .unwrap();
        detection
            .start_stop_cycle(&mut db, TxScope::Own, at(20), at(30))
            .unwrap();
        detection
            .start_stop_cycle(&mut db, TxScope::Own, at(0), at(10))
            .unwrap();
        detection
            .start_stop_cycle(&mut db, TxScope::Own, at(20), at(30))
            .unwrap();

        assert_eq!(
            cycle_summary(&db),
            vec![(Some(0), Some(10), true), (Some(20), Some(30), true)]
        );
        assert_eq!(between_summary(&db), vec![(10, 20)]);
        assert!(logs(&db).is_empty());
    }

    #[test]
    fn start_stop_cycle_rejects_reversed_range() {
        let mut db = setup();
        let err = detection()
            .start_stop_cycle(&mut db, TxScope::Own, at(10), at(0))
            .unwrap_err();
        assert!(matches!(err, DetectionError::Validation(_)));
        assert!(cycle_summary(&db).is_empty());
    }

    // ========== Hook Tests ==========

    #[test]
    fn after_hooks_skip_rejected_and_inherited_calls() {
        let mut db = setup();
        let recorder = Recorder::default();
        let context = DetectionContext::new(machine(), module())
            .with_extensions(Extensions::new().with_after_cycle(recorder.clone()));
        let detection = OperationCycleDetection::new(context);

        detection.start_cycle(&mut db, TxScope::Own, at(100)).unwrap();
        detection
            .stop_cycle(&mut db, TxScope::Own, Some(3), at(110))
            .unwrap();
        detection.start_cycle(&mut db, TxScope::Own, at(50)).unwrap();
        db.begin_transaction("test", pd_core::TransactionOptions::new())
            .unwrap();
        detection
            .start_cycle(&mut db, TxScope::Inherited, at(120))
            .unwrap();
        db.commit().unwrap();

        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["start at 100".to_string(), "stop Some(3) at 110".to_string()]
        );
        assert_eq!(cycle_summary(&db).len(), 2);
    }
}

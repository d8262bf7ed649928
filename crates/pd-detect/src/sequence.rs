//! Sequence detection: sequence slots and auto-sequences of a machine module.
//!
//! A tagged sequence opens a sequence slot and puts its operation on the
//! operation-slot timeline. Auto-only sequences and operations with no tagged
//! sequence only leave an auto-sequence record, which operation detection
//! reads as activity. Every start first cuts what lies after it, since a
//! sequence observed now wins over any assumed continuation.

use chrono::{DateTime, Duration, Utc};

use pd_core::{
    AutoSequence, AutoSequenceKind, DetectionConfig, DetectionError, LogLevel, OperationId,
    Sequence, SequenceSlot, Store, TimeRange, TransactionOptions, TxScope, extension::run_hooks,
    with_transaction,
};

use crate::context::{DetectionContext, after_commit, format_end, format_time};
use crate::milestone::SequenceMilestoneDetection;
use crate::operation::OperationDetection;

const SOURCE: &str = "SequenceDetection";

const fn main_options() -> TransactionOptions {
    TransactionOptions::serializable().asynchronous()
}

/// Keeps the sequence slots and auto-sequences of a machine module.
///
/// Calls must come in chronological order; an event older than the previous
/// one is logged and skipped.
#[derive(Debug, Clone)]
pub struct SequenceDetection {
    context: DetectionContext,
    operation: OperationDetection,
    milestone: SequenceMilestoneDetection,
    previous_date_time: Option<DateTime<Utc>>,
}

impl SequenceDetection {
    pub fn new(context: DetectionContext) -> Self {
        Self::with_components(
            OperationDetection::new(context.clone()),
            SequenceMilestoneDetection::new(context),
        )
    }

    /// Builds the detection on top of existing operation and milestone detections.
    pub fn with_components(
        operation: OperationDetection,
        milestone: SequenceMilestoneDetection,
    ) -> Self {
        Self {
            context: operation.context().clone(),
            operation,
            milestone,
            previous_date_time: None,
        }
    }

    pub const fn context(&self) -> &DetectionContext {
        &self.context
    }

    pub const fn operation_detection(&self) -> &OperationDetection {
        &self.operation
    }

    pub const fn milestone_detection(&self) -> &SequenceMilestoneDetection {
        &self.milestone
    }

    /// An operation runs on the module without any tagged sequence.
    pub fn start_auto_only_operation<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        scope: TxScope,
        operation: OperationId,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        if !self.check_chronology(store, || format!("Operation {operation}"), date_time)? {
            return Ok(());
        }
        self.milestone.cancel(store, scope, date_time)?;
        self.cut_different_operation_after(store, scope, operation, date_time)?;
        with_transaction(
            store,
            scope,
            "Detection.StartAutoOnlyOperation",
            main_options(),
            |store| self.start_auto_only(store, AutoSequenceKind::Operation(operation), date_time),
        )
        .inspect_err(|err| self.context.report_failure("start_auto_only_operation", err))?;
        after_commit(scope, || {
            run_hooks(
                self.context.extensions().after_sequence(),
                "start_auto_only_operation",
                |hook| hook.start_auto_only_operation(operation, date_time),
            )
        })
    }

    /// `sequence` starts on the module.
    pub fn start_sequence<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        scope: TxScope,
        sequence: &Sequence,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        if !self.check_chronology(store, || format!("Sequence {}", sequence.id), date_time)? {
            return Ok(());
        }
        let config = self.context.config();
        self.milestone
            .start_sequence(store, scope, date_time, sequence.id)?;
        self.cut_different_operation_after(store, scope, sequence.operation, date_time)?;
        if sequence.auto_only {
            with_transaction(
                store,
                scope,
                "Detection.StartAutoOnlySequence",
                main_options(),
                |store| {
                    self.start_auto_only(store, AutoSequenceKind::Sequence(sequence.id), date_time)
                },
            )
        } else {
            with_transaction(
                store,
                scope,
                "Detection.StartNotAutoSequence",
                main_options(),
                |store| self.start_not_auto(store, &config, sequence, date_time),
            )
        }
        .inspect_err(|err| self.context.report_failure("start_sequence", err))?;
        after_commit(scope, || {
            run_hooks(
                self.context.extensions().after_sequence(),
                "start_sequence",
                |hook| hook.start_sequence(sequence.id, date_time),
            )
        })
    }

    /// The running sequence ended; nothing is known to run after `date_time`.
    pub fn stop_sequence<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        scope: TxScope,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        if !self.check_chronology(store, || "Sequence end".to_string(), date_time)? {
            return Ok(());
        }
        self.milestone
            .tag_sequence_completed(store, scope, date_time)?;
        with_transaction(
            store,
            scope,
            "Detection.StopSequence",
            main_options(),
            |store| -> Result<(), DetectionError> {
                if self.remove_after(store, date_time)? > 0 {
                    self.operation.stop(store, date_time)?;
                }
                let module = self.context.module();
                for mut auto_sequence in store.auto_sequences_from(module, date_time)? {
                    self.truncate_or_remove_auto_sequence(store, &mut auto_sequence, date_time)?;
                }
                Ok(())
            },
        )
        .inspect_err(|err| self.context.report_failure("stop_sequence", err))?;
        after_commit(scope, || {
            run_hooks(
                self.context.extensions().after_sequence(),
                "stop_sequence",
                |hook| hook.stop_sequence(date_time),
            )
        })
    }

    /// Accepts `date_time` only if it does not precede the previous event.
    fn check_chronology<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        subject: impl FnOnce() -> String,
        date_time: DateTime<Utc>,
    ) -> Result<bool, DetectionError> {
        if let Some(previous) = self.previous_date_time.filter(|&previous| date_time < previous) {
            let message = format!(
                "{} is coming at {} after a previous operation or sequence at {}, skip it",
                subject(),
                format_time(date_time),
                format_time(previous)
            );
            tracing::error!(
                machine = %self.context.machine(),
                module = %self.context.module(),
                "{message}"
            );
            self.context
                .log(store, SOURCE, LogLevel::Fatal, date_time, message)?;
            return Ok(false);
        }
        self.previous_date_time = Some(date_time);
        Ok(true)
    }

    fn start_auto_only<S: Store + ?Sized>(
        &self,
        store: &mut S,
        kind: AutoSequenceKind,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let module = self.context.module();
        if self.remove_after(store, date_time)? > 0 {
            self.operation.stop(store, date_time)?;
        }

        let mut processed = false;
        for mut auto_sequence in store.auto_sequences_from(module, date_time)? {
            if auto_sequence.range.begin <= date_time && auto_sequence.kind == kind {
                if auto_sequence.range.end.is_some() {
                    tracing::debug!(%module, range = %auto_sequence.range, "extend auto-sequence to +oo");
                    auto_sequence.range.end = None;
                    store.update_auto_sequence(&mut auto_sequence)?;
                }
                processed = true;
            } else {
                self.truncate_or_remove_auto_sequence(store, &mut auto_sequence, date_time)?;
            }
        }

        if !processed {
            store.flush()?;
            tracing::debug!(%module, %date_time, ?kind, "new auto-sequence");
            let mut auto_sequence = AutoSequence::new(module, TimeRange::from(date_time), kind);
            store.insert_auto_sequence(&mut auto_sequence)?;
        }
        Ok(())
    }

    fn start_not_auto<S: Store + ?Sized>(
        &self,
        store: &mut S,
        config: &DetectionConfig,
        sequence: &Sequence,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let module = self.context.module();
        for mut auto_sequence in store.auto_sequences_from(module, date_time)? {
            self.truncate_or_remove_auto_sequence(store, &mut auto_sequence, date_time)?;
        }

        let slots = store.sequence_slots_from(module, date_time)?;
        if slots.len() > 1 {
            tracing::warn!(%module, count = slots.len(), %date_time, "several sequence slots at and after the sequence start");
        }
        let mut processed = false;
        let mut previous = None;
        for mut slot in slots {
            if slot.range.begin <= date_time && slot.sequence == Some(sequence.id) {
                self.make_sequence_slot_longer(
                    store,
                    config,
                    &mut slot,
                    None,
                    Some(sequence.operation),
                    date_time,
                )?;
                processed = true;
            } else if !self.truncate_or_remove_sequence_slot(store, &mut slot, date_time)? {
                previous = Some(slot);
            }
        }

        if !processed {
            let mut slot = SequenceSlot::new(module, TimeRange::from(date_time), sequence.id);
            store.insert_sequence_slot(&mut slot)?;
            self.operation
                .add(store, config, sequence.operation, slot.range, true)?;
            let previous = match previous {
                Some(previous) => Some(previous),
                None => store.last_sequence_slot_before(module, date_time)?,
            };
            if let Some(mut previous) = previous {
                adjust_next_begin(store, &mut previous, &slot)?;
            }
        }
        Ok(())
    }

    fn make_sequence_slot_longer<S: Store + ?Sized>(
        &self,
        store: &mut S,
        config: &DetectionConfig,
        slot: &mut SequenceSlot,
        new_end: Option<DateTime<Utc>>,
        operation: Option<OperationId>,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let Some(end) = slot.range.end.filter(|_| slot.range.end != new_end) else {
            tracing::warn!(
                module = %self.context.module(),
                slot = %slot.range,
                new_end = %format_end(new_end),
                "sequence slot already reaches its new end"
            );
            return Ok(());
        };

        let overrun = slot
            .next_begin
            .filter(|&next_begin| new_end.is_none_or(|new_end| next_begin < new_end));
        if let Some(next_begin) = overrun {
            let message = format!(
                "Extend a sequence slot to {} after NextBegin {}",
                format_end(new_end),
                format_time(next_begin)
            );
            tracing::warn!(module = %self.context.module(), "{message}");
            self.context
                .log(store, SOURCE, LogLevel::Warn, date_time, message)?;
        }
        if let Some(operation) = operation {
            self.operation
                .add(store, config, operation, TimeRange::clamped(end, new_end), false)?;
        }
        if overrun.is_some() {
            slot.next_begin = None;
        }
        slot.range.end = new_end;
        store.update_sequence_slot(slot)?;
        Ok(())
    }

    /// Truncates or removes every sequence slot from `date_time` on.
    ///
    /// Returns how many slots were touched.
    fn remove_after<S: Store + ?Sized>(
        &self,
        store: &mut S,
        date_time: DateTime<Utc>,
    ) -> Result<usize, DetectionError> {
        let module = self.context.module();
        let slots = store.sequence_slots_from(module, date_time)?;
        let count = slots.len();
        for mut slot in slots {
            self.truncate_or_remove_sequence_slot(store, &mut slot, date_time)?;
        }
        if let Some(mut last) = store.last_sequence_slot(module)? {
            if last.next_begin.is_some_and(|next_begin| date_time <= next_begin) {
                last.next_begin = None;
                store.update_sequence_slot(&mut last)?;
            }
        }
        Ok(count)
    }

    /// Returns true if the slot was removed.
    fn truncate_or_remove_sequence_slot<S: Store + ?Sized>(
        &self,
        store: &mut S,
        slot: &mut SequenceSlot,
        date_time: DateTime<Utc>,
    ) -> Result<bool, DetectionError> {
        if keeps_before(slot.range, date_time) {
            slot.range.end = Some(date_time);
            store.update_sequence_slot(slot)?;
            return Ok(false);
        }
        if date_time < slot.range.begin {
            self.log_replayed(store, "Sequence slot", slot.range, date_time)?;
        }
        store.delete_sequence_slot(slot)?;
        Ok(true)
    }

    fn truncate_or_remove_auto_sequence<S: Store + ?Sized>(
        &self,
        store: &mut S,
        auto_sequence: &mut AutoSequence,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        if keeps_before(auto_sequence.range, date_time) {
            auto_sequence.range.end = Some(date_time);
            store.update_auto_sequence(auto_sequence)?;
            return Ok(());
        }
        if date_time < auto_sequence.range.begin {
            self.log_replayed(store, "Auto-sequence", auto_sequence.range, date_time)?;
        }
        store.delete_auto_sequence(auto_sequence)?;
        Ok(())
    }

    fn log_replayed<S: Store + ?Sized>(
        &self,
        store: &mut S,
        what: &str,
        range: TimeRange,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let message = format!("{what} {range} in the future. Was the data replayed?");
        tracing::error!(module = %self.context.module(), %date_time, "{message}");
        self.context
            .log(store, SOURCE, LogLevel::Error, date_time, message)?;
        Ok(())
    }

    /// Removes the operations after `date_time` that differ from `operation`.
    fn cut_different_operation_after<S: Store + ?Sized>(
        &self,
        store: &mut S,
        scope: TxScope,
        operation: OperationId,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let machine = self.context.machine();
        with_transaction(
            store,
            scope,
            "Detection.CutDifferentOperationAfter",
            main_options(),
            |store| -> Result<(), DetectionError> {
                let Some(slot) =
                    store.first_different_operation_slot_after(machine, date_time, Some(operation))?
                else {
                    return Ok(());
                };
                let cut = slot.range.begin.max(date_time);
                let message = format!(
                    "Discontinue at {} the future operation slot at {} because of the sequence detection",
                    format_time(cut),
                    format_time(slot.range.begin)
                );
                tracing::info!(%machine, "{message}");
                self.context
                    .log(store, SOURCE, LogLevel::Info, date_time, message)?;
                self.operation.stop(store, cut)
            },
        )
    }
}

/// True if a record beginning before `date_time` keeps at least one second once cut there.
fn keeps_before(range: TimeRange, date_time: DateTime<Utc>) -> bool {
    range.begin < date_time && Duration::seconds(1) <= date_time - range.begin
}

fn adjust_next_begin<S: Store + ?Sized>(
    store: &mut S,
    previous: &mut SequenceSlot,
    next: &SequenceSlot,
) -> Result<(), DetectionError> {
    let begin = next.range.begin;
    if previous.next_begin.is_none_or(|next_begin| begin < next_begin) {
        previous.next_begin = Some(begin);
        store.update_sequence_slot(previous)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{associate, at, logs, machine, module, op, secs, seq, setup, slot_summary};
    use pd_core::SequenceId;
    use pd_db::Database;

    fn detection() -> SequenceDetection {
        SequenceDetection::new(DetectionContext::new(machine(), module()))
    }

    fn sequence(id: i64, operation: i64) -> Sequence {
        Sequence {
            id: seq(id),
            operation: op(operation),
            name: None,
            auto_only: false,
        }
    }

    /// `(begin, end, sequence, next_begin)` of every sequence slot, in seconds.
    fn sequence_summary(db: &Database) -> Vec<(i64, Option<i64>, Option<i64>, Option<i64>)> {
        db.sequence_slots(module())
            .unwrap()
            .iter()
            .map(|slot| {
                (
                    secs(slot.range.begin),
                    slot.range.end.map(secs),
                    slot.sequence.map(SequenceId::get),
                    slot.next_begin.map(secs),
                )
            })
            .collect()
    }

    fn auto_summary(db: &Database) -> Vec<(i64, Option<i64>, AutoSequenceKind)> {
        db.auto_sequences(module())
            .unwrap()
            .iter()
            .map(|auto| (secs(auto.range.begin), auto.range.end.map(secs), auto.kind))
            .collect()
    }

    // ========== Sequence Slot Tests ==========

    #[test]
    fn start_sequence_opens_slot_and_operation() {
        let mut db = setup();
        detection()
            .start_sequence(&mut db, TxScope::Own, &sequence(5, 1), at(0))
            .unwrap();

        assert_eq!(sequence_summary(&db), vec![(0, None, Some(5), None)]);
        assert_eq!(slot_summary(&db), vec![(0, None, Some(1))]);
        let milestone = db.sequence_milestone(module()).unwrap().expect("milestone");
        assert_eq!(milestone.sequence, Some(seq(5)));
    }

    #[test]
    fn next_sequence_truncates_previous_and_sets_next_begin() {
        let mut db = setup();
        let mut detection = detection();
        detection
            .start_sequence(&mut db, TxScope::Own, &sequence(5, 1), at(0))
            .unwrap();
        detection
            .start_sequence(&mut db, TxScope::Own, &sequence(6, 2), at(100))
            .unwrap();

        assert_eq!(
            sequence_summary(&db),
            vec![(0, Some(100), Some(5), Some(100)), (100, None, Some(6), None)]
        );
        assert_eq!(
            slot_summary(&db),
            vec![(0, Some(100), Some(1)), (100, None, Some(2))]
        );
        let messages: Vec<String> = logs(&db).into_iter().map(|log| log.message).collect();
        insta::assert_debug_snapshot!(messages, @r#"
        [
            "Discontinue at 2023-11-14T22:15:00.000Z the future operation slot at 2023-11-14T22:13:20.000Z because of the sequence detection",
        ]
        "#);
    }

    #[test]
    fn repeated_sequence_keeps_single_slot() {
        let mut db = setup();
        let mut detection = detection();
        detection
            .start_sequence(&mut db, TxScope::Own, &sequence(5, 1), at(0))
            .unwrap();
        detection
            .start_sequence(&mut db, TxScope::Own, &sequence(5, 1), at(50))
            .unwrap();

        assert_eq!(sequence_summary(&db), vec![(0, None, Some(5), None)]);
        assert_eq!(slot_summary(&db), vec![(0, None, Some(1))]);
    }

    #[test]
    fn extending_past_next_begin_is_logged() {
        let mut db = setup();
        let mut slot = SequenceSlot::new(module(), TimeRange::new(at(0), at(50)).unwrap(), seq(5));
        slot.next_begin = Some(at(40));
        db.insert_sequence_slot(&mut slot).unwrap();

        detection()
            .start_sequence(&mut db, TxScope::Own, &sequence(5, 1), at(45))
            .unwrap();

        assert_eq!(sequence_summary(&db), vec![(0, None, Some(5), None)]);
        assert_eq!(slot_summary(&db), vec![(50, None, Some(1))]);
        let logs = logs(&db);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Warn);
        insta::assert_snapshot!(&logs[0].message, @"Extend a sequence slot to +oo after NextBegin 2023-11-14T22:14:00.000Z");
    }

    // ========== Chronology Tests ==========

    #[test]
    fn older_event_is_skipped_and_logged() {
        let mut db = setup();
        let mut detection = detection();
        detection
            .start_sequence(&mut db, TxScope::Own, &sequence(5, 1), at(100))
            .unwrap();
        detection
            .start_sequence(&mut db, TxScope::Own, &sequence(6, 2), at(50))
            .unwrap();

        assert_eq!(sequence_summary(&db), vec![(100, None, Some(5), None)]);
        let logs = logs(&db);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Fatal);
        assert_eq!(logs[0].source, "SequenceDetection");
    }

    // ========== Auto-Sequence Tests ==========

    #[test]
    fn auto_only_operation_extends_matching_record() {
        let mut db = setup();
        let mut detection = detection();
        detection
            .start_auto_only_operation(&mut db, TxScope::Own, op(1), at(0))
            .unwrap();
        detection
            .start_auto_only_operation(&mut db, TxScope::Own, op(1), at(30))
            .unwrap();
        assert_eq!(
            auto_summary(&db),
            vec![(0, None, AutoSequenceKind::Operation(op(1)))]
        );

        detection
            .start_auto_only_operation(&mut db, TxScope::Own, op(2), at(60))
            .unwrap();
        assert_eq!(
            auto_summary(&db),
            vec![
                (0, Some(60), AutoSequenceKind::Operation(op(1))),
                (60, None, AutoSequenceKind::Operation(op(2))),
            ]
        );
    }

    #[test]
    fn auto_only_sequence_leaves_no_sequence_slot() {
        let mut db = setup();
        let mut detection = detection();
        detection
            .start_sequence(&mut db, TxScope::Own, &sequence(5, 1), at(0))
            .unwrap();
        let auto_only = Sequence {
            auto_only: true,
            ..sequence(7, 1)
        };
        detection
            .start_sequence(&mut db, TxScope::Own, &auto_only, at(100))
            .unwrap();

        assert_eq!(sequence_summary(&db), vec![(0, Some(100), Some(5), None)]);
        assert_eq!(
            auto_summary(&db),
            vec![(100, None, AutoSequenceKind::Sequence(seq(7)))]
        );
        assert_eq!(slot_summary(&db), vec![(0, Some(100), Some(1))]);
    }

    // ========== Stop Tests ==========

    #[test]
    fn stop_sequence_cuts_slot_and_operation() {
        let mut db = setup();
        let mut detection = detection();
        detection
            .start_sequence(&mut db, TxScope::Own, &sequence(5, 1), at(0))
            .unwrap();
        detection.stop_sequence(&mut db, TxScope::Own, at(100)).unwrap();

        assert_eq!(sequence_summary(&db), vec![(0, Some(100), Some(5), None)]);
        assert_eq!(slot_summary(&db), vec![(0, Some(100), Some(1))]);
        let milestone = db.sequence_milestone(module()).unwrap().expect("milestone");
        assert!(milestone.completed);
    }

    #[test]
    fn future_slot_is_removed_and_logged() {
        let mut db = setup();
        let mut slot = SequenceSlot::new(module(), TimeRange::from(at(200)), seq(5));
        db.insert_sequence_slot(&mut slot).unwrap();

        detection().stop_sequence(&mut db, TxScope::Own, at(100)).unwrap();

        assert!(sequence_summary(&db).is_empty());
        let logs = logs(&db);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
        assert!(logs[0].message.ends_with("in the future. Was the data replayed?"));
    }

    #[test]
    fn cut_keeps_operation_of_the_sequence() {
        let mut db = setup();
        associate(&mut db, 0, None, Some(1));
        detection()
            .start_sequence(&mut db, TxScope::Own, &sequence(5, 1), at(100))
            .unwrap();

        assert_eq!(slot_summary(&db), vec![(0, None, Some(1))]);
        assert!(logs(&db).is_empty());
    }
}

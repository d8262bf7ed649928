//! Operation detection: puts operations on the operation-slot timeline.
//!
//! An operation observed at `t` is first applied over `[t, t+1s)`. When it is
//! an auto-operation, the previous slot of the same operation is stretched
//! over a short quiet gap, and the work order, component, line and
//! manufacturing order of the previous slot are carried over when nothing
//! between the two contradicts them.

use chrono::{DateTime, Duration, Utc};

use pd_core::{
    Association, AssociationTarget, DetectionConfig, DetectionError, LogLevel, ManufacturingOrder,
    OperationId, OperationSlot, PropagationOption, SlotContext, Store, TimeRange, TxScope,
    extension::run_hooks, with_transaction,
};

use crate::context::{DetectionContext, after_commit, format_time, replayable};

pub(crate) const SOURCE: &str = "OperationDetection";
const MANUFACTURING_ORDER_SOURCE: &str = "ManufacturingOrderDetection";

/// Starts, extends and stops operations of a machine.
#[derive(Debug, Clone)]
pub struct OperationDetection {
    context: DetectionContext,
}

impl OperationDetection {
    pub const fn new(context: DetectionContext) -> Self {
        Self { context }
    }

    pub const fn context(&self) -> &DetectionContext {
        &self.context
    }

    /// Starts `operation` at `date_time` as an auto-operation.
    pub fn start_operation<S: Store + ?Sized>(
        &self,
        store: &mut S,
        scope: TxScope,
        operation: OperationId,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let config = self.context.config();
        let range = TimeRange::clamped(date_time, Some(date_time + Duration::seconds(1)));
        with_transaction(
            store,
            scope,
            "Detection.StartOperation",
            replayable(),
            |store| self.add(store, &config, operation, range, true),
        )
        .inspect_err(|err| self.context.report_failure("start_operation", err))?;
        after_commit(scope, || {
            run_hooks(
                self.context.extensions().after_operation(),
                "start_operation",
                |hook| hook.start_operation(operation, date_time),
            )
        })
    }

    /// Applies `operation` over `range`.
    pub fn add_operation<S: Store + ?Sized>(
        &self,
        store: &mut S,
        scope: TxScope,
        operation: OperationId,
        range: TimeRange,
        auto: bool,
    ) -> Result<(), DetectionError> {
        let config = self.context.config();
        with_transaction(
            store,
            scope,
            "Detection.AddOperation",
            replayable(),
            |store| self.add(store, &config, operation, range, auto),
        )
        .inspect_err(|err| self.context.report_failure("add_operation", err))
    }

    /// Stretches the last operation slot up to `date_time`.
    ///
    /// With `operation` set, only a last slot of that operation is extended.
    pub fn extend_operation<S: Store + ?Sized>(
        &self,
        store: &mut S,
        scope: TxScope,
        operation: Option<OperationId>,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let config = self.context.config();
        with_transaction(
            store,
            scope,
            "Detection.ExtendOperation",
            replayable(),
            |store| self.extend(store, &config, operation, date_time),
        )
        .inspect_err(|err| self.context.report_failure("extend_operation", err))?;
        after_commit(scope, || {
            run_hooks(
                self.context.extensions().after_operation(),
                "extend_operation",
                |hook| hook.extend_operation(operation, date_time),
            )
        })
    }

    /// Removes any operation from `date_time` on.
    pub fn stop_operation<S: Store + ?Sized>(
        &self,
        store: &mut S,
        scope: TxScope,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        with_transaction(
            store,
            scope,
            "Detection.StopOperation",
            replayable(),
            |store| self.stop(store, date_time),
        )
        .inspect_err(|err| self.context.report_failure("stop_operation", err))?;
        after_commit(scope, || {
            run_hooks(
                self.context.extensions().after_operation(),
                "stop_operation",
                |hook| hook.stop_operation(date_time),
            )
        })
    }

    pub(crate) fn stop<S: Store + ?Sized>(
        &self,
        store: &mut S,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        tracing::debug!(machine = %self.context.machine(), %date_time, "stop operation");
        store.apply_association(&Association::operation(
            self.context.machine(),
            TimeRange::from(date_time),
            None,
        ))?;
        Ok(())
    }

    pub(crate) fn add<S: Store + ?Sized>(
        &self,
        store: &mut S,
        config: &DetectionConfig,
        operation: OperationId,
        range: TimeRange,
        auto: bool,
    ) -> Result<(), DetectionError> {
        let machine = self.context.machine();
        let extensions = self.context.extensions();
        tracing::debug!(%machine, %operation, %range, auto, "add operation");

        let previous_required = auto
            || config.manufacturing_order_management
            || extensions
                .operation()
                .iter()
                .any(|extension| extension.is_previous_operation_slot_required());
        let previous = if previous_required {
            store.last_operation_slot_with_operation_before(machine, range.begin)?
        } else {
            None
        };

        let manufacturing_order = if config.manufacturing_order_management
            && previous
                .as_ref()
                .is_none_or(|previous| previous.operation != Some(operation))
        {
            self.guess_next_manufacturing_order(store, operation, previous.as_ref(), range.begin)?
        } else {
            None
        };

        let mut begin = range.begin;
        let mut carried = SlotContext::default();
        if let Some(previous) = previous.as_ref().filter(|_| auto) {
            if previous.operation == Some(operation) {
                match previous.range.end.filter(|&end| end < begin) {
                    None => carried = previous.context,
                    Some(end) => {
                        if begin - end < config.auto_operation_same
                            && !self.is_auto_sequence_activity(store, config, end, begin)?
                        {
                            begin = end;
                            carried = previous.context;
                        }
                    }
                }
            } else {
                carried = self.process_auto_component(store, config, previous, operation, begin)?;
            }
        }

        run_hooks(extensions.operation(), "add_operation", |hook| {
            hook.add_operation(machine, operation, &range, begin, previous.as_ref())
        })?;

        let mut context = SlotContext::default();
        if auto && config.auto_operation_propagation.is_active() && !carried.is_empty() {
            let between = match previous.as_ref() {
                Some(previous) if !previous.range.contains_range(&range) => {
                    match previous.range.end {
                        Some(end) => store
                            .operation_slots_overlapping(machine, TimeRange::clamped(end, range.end))?,
                        None => Vec::new(),
                    }
                }
                _ => Vec::new(),
            };
            context = propagate(config.auto_operation_propagation, carried, &between);
        }

        store.apply_association(&Association {
            machine,
            range: TimeRange::clamped(begin, range.end),
            target: AssociationTarget::Operation {
                operation: Some(operation),
                context,
            },
            auto,
            detected: true,
        })?;

        if let Some(order) = manufacturing_order {
            tracing::info!(%machine, manufacturing_order = %order.id, "apply manufacturing order");
            store.apply_association(&Association {
                machine,
                range: TimeRange::from(range.begin),
                target: AssociationTarget::ManufacturingOrder {
                    manufacturing_order: order.id,
                    work_order: order.work_order,
                },
                auto: true,
                detected: true,
            })?;
        }
        Ok(())
    }

    fn extend<S: Store + ?Sized>(
        &self,
        store: &mut S,
        config: &DetectionConfig,
        operation: Option<OperationId>,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let machine = self.context.machine();
        let name = operation.map_or_else(String::new, |operation| format!(" {operation}"));
        let Some(slot) = store.last_operation_slot_with_operation_before(machine, date_time)? else {
            tracing::warn!(%machine, %date_time, "no operation slot to extend");
            self.context.log(
                store,
                SOURCE,
                LogLevel::Warn,
                date_time,
                format!(
                    "Operation{name} could not be extended to {t} because there is no operation slot before {t}",
                    t = format_time(date_time)
                ),
            )?;
            return Ok(());
        };
        if operation.is_some_and(|operation| slot.operation != Some(operation)) {
            tracing::warn!(%machine, %date_time, "the previous operation slot did not match");
            self.context.log(
                store,
                SOURCE,
                LogLevel::Warn,
                date_time,
                format!(
                    "Operation{name} could not be extended to {} because the previous operation slot did not match",
                    format_time(date_time)
                ),
            )?;
            return Ok(());
        }
        let Some(end) = slot.range.end.filter(|&end| end < date_time) else {
            tracing::debug!(%machine, %date_time, "operation slot already long enough");
            return Ok(());
        };

        let mut context = SlotContext::default();
        if config.auto_operation_propagation.is_active() && !slot.context.is_empty() {
            let between = store
                .operation_slots_overlapping(machine, TimeRange::clamped(end, Some(date_time)))?;
            context = propagate(config.extend_operation_propagation, slot.context, &between);
        }
        tracing::debug!(%machine, slot = %slot.range, %date_time, "extend operation slot");
        store.apply_association(&Association {
            machine,
            range: TimeRange::clamped(slot.range.begin, Some(date_time)),
            target: AssociationTarget::Operation {
                operation: slot.operation,
                context,
            },
            auto: false,
            detected: true,
        })?;
        Ok(())
    }

    /// Component and work order of the previous slot that still fit `operation`.
    ///
    /// Across a gap, the carried values are also recorded over the gap itself.
    fn process_auto_component<S: Store + ?Sized>(
        &self,
        store: &mut S,
        config: &DetectionConfig,
        previous: &OperationSlot,
        operation: OperationId,
        begin: DateTime<Utc>,
    ) -> Result<SlotContext, DetectionError> {
        let previous_component = previous.context.component;
        let previous_work_order = previous.context.work_order;
        if previous_component.is_none() && previous_work_order.is_none() {
            return Ok(SlotContext::default());
        }

        let gap = previous.range.end.filter(|&end| end < begin);
        let (component_fits, work_order_fits) = match gap {
            None => (true, true),
            Some(end) => {
                if self.is_auto_sequence_activity(store, config, end, begin)? {
                    tracing::debug!(machine = %self.context.machine(), "auto-sequence activity in the gap");
                    return Ok(SlotContext::default());
                }
                (
                    begin - end < config.auto_component_same,
                    begin - end < config.auto_work_order_same,
                )
            }
        };

        let component = match previous_component.filter(|_| component_fits) {
            Some(component) => store
                .guess_component_from_operation(operation)?
                .filter(|&guess| guess == component),
            None => None,
        };
        let work_order = match previous_work_order.filter(|_| work_order_fits) {
            Some(work_order) => store
                .guess_work_order_from_operation(operation)?
                .filter(|&guess| guess == work_order),
            None => None,
        };

        if let Some(end) = gap {
            let machine = self.context.machine();
            let range = TimeRange::clamped(end, Some(begin));
            let targets = [
                component.map(AssociationTarget::Component),
                work_order.map(AssociationTarget::WorkOrder),
            ];
            for target in targets.into_iter().flatten() {
                store.persist_association(&Association {
                    machine,
                    range,
                    target,
                    auto: true,
                    detected: true,
                })?;
            }
        }

        Ok(SlotContext {
            work_order,
            component,
            ..SlotContext::default()
        })
    }

    /// True if an auto-sequence ran between `begin` and `end`, margins excluded.
    fn is_auto_sequence_activity<S: Store + ?Sized>(
        &self,
        store: &S,
        config: &DetectionConfig,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, DetectionError> {
        let from = begin + config.auto_operation_margin;
        let to = end - config.auto_operation_margin;
        if to <= from {
            return Ok(false);
        }
        let window = TimeRange::clamped(from, Some(to));
        Ok(store.exists_auto_sequence_between(self.context.machine(), window)?)
    }

    fn guess_next_manufacturing_order<S: Store + ?Sized>(
        &self,
        store: &mut S,
        operation: OperationId,
        previous: Option<&OperationSlot>,
        date_time: DateTime<Utc>,
    ) -> Result<Option<ManufacturingOrder>, DetectionError> {
        let candidates = store.next_manufacturing_orders(self.context.machine(), operation)?;
        match candidates.as_slice() {
            [] => {
                if previous.is_some_and(|previous| previous.context.manufacturing_order.is_some()) {
                    let message = format!("No next task found for operation {operation}");
                    tracing::info!(machine = %self.context.machine(), "{message}");
                    self.context.log(
                        store,
                        MANUFACTURING_ORDER_SOURCE,
                        LogLevel::Notice,
                        date_time,
                        message,
                    )?;
                }
                Ok(None)
            }
            [only] => Ok(Some(only.clone())),
            [first, second, ..] => {
                let determined = first.machine.is_some()
                    && first.order.is_some()
                    && second.order != first.order;
                if !determined {
                    let message =
                        format!("{} next possible tasks for operation {operation}", candidates.len());
                    tracing::info!(machine = %self.context.machine(), "{message}");
                    self.context.log(
                        store,
                        MANUFACTURING_ORDER_SOURCE,
                        LogLevel::Info,
                        date_time,
                        message,
                    )?;
                }
                Ok(Some(first.clone()))
            }
        }
    }
}

/// True if one of `between` holds a value for the field other than `value`.
fn conflicts<T: PartialEq + Copy>(
    value: Option<T>,
    between: &[OperationSlot],
    field: impl Fn(&SlotContext) -> Option<T>,
) -> bool {
    value.is_some_and(|value| {
        between
            .iter()
            .any(|slot| field(&slot.context).is_some_and(|other| other != value))
    })
}

/// The part of `carried` that may be propagated over the slots in `between`.
///
/// A conflicting line or manufacturing order also stops the work order.
fn propagate(
    option: PropagationOption,
    carried: SlotContext,
    between: &[OperationSlot],
) -> SlotContext {
    let line = option.contains(PropagationOption::LINE)
        && !conflicts(carried.line, between, |context| context.line);
    let manufacturing_order = option.contains(PropagationOption::MANUFACTURING_ORDER)
        && !conflicts(carried.manufacturing_order, between, |context| {
            context.manufacturing_order
        });
    let line_vetoes = option.contains(PropagationOption::LINE) && !line && carried.line.is_some();
    let order_vetoes = option.contains(PropagationOption::MANUFACTURING_ORDER)
        && !manufacturing_order
        && carried.manufacturing_order.is_some();
    let work_order = option.contains(PropagationOption::WORK_ORDER)
        && !conflicts(carried.work_order, between, |context| context.work_order)
        && !line_vetoes
        && !order_vetoes;
    let component = option.contains(PropagationOption::COMPONENT)
        && !conflicts(carried.component, between, |context| context.component);

    let propagated = SlotContext {
        work_order: carried.work_order.filter(|_| work_order),
        component: carried.component.filter(|_| component),
        line: carried.line.filter(|_| line),
        manufacturing_order: carried.manufacturing_order.filter(|_| manufacturing_order),
    };
    if propagated != carried {
        tracing::debug!(?carried, ?propagated, "propagation restricted by the slots in between");
    }
    propagated
}

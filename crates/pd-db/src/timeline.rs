//! Planning of association changes on the operation-slot timeline.
//!
//! [`plan`] takes the slots around an association range and returns the
//! slots that must exist afterwards. Pieces keep the id of the slot they come
//! from when they start where it started; split-off tails get new ids.
//! Adjacent pieces with identical values are merged back together.

use chrono::{DateTime, Utc};

use pd_core::{
    AssociationTarget, OperationId, OperationSlot, OperationSlotId, SlotContext, TimeRange,
};

/// The values a slot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotValues {
    pub operation: Option<OperationId>,
    pub context: SlotContext,
}

impl SlotValues {
    pub const fn is_empty(&self) -> bool {
        self.operation.is_none() && self.context.is_empty()
    }

    fn of(slot: &OperationSlot) -> Self {
        Self {
            operation: slot.operation,
            context: slot.context,
        }
    }
}

/// A slot of the planned timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSlot {
    pub id: Option<OperationSlotId>,
    pub range: TimeRange,
    pub values: SlotValues,
}

/// Values of a slot piece inside the association range.
///
/// `existing` is `None` for a gap in the timeline. `None` as a result means
/// the piece leaves the timeline empty.
fn apply_target(target: &AssociationTarget, existing: Option<SlotValues>) -> Option<SlotValues> {
    match *target {
        AssociationTarget::Operation { operation, context } => {
            let operation = operation?;
            let values = match existing {
                Some(existing) if existing.operation.is_none_or(|o| o == operation) => {
                    SlotValues {
                        operation: Some(operation),
                        context: overlay(existing.context, context),
                    }
                }
                _ => SlotValues {
                    operation: Some(operation),
                    context,
                },
            };
            Some(values)
        }
        AssociationTarget::Component(component) => existing.map(|mut values| {
            values.context.component = Some(component);
            values
        }),
        AssociationTarget::WorkOrder(work_order) => existing.map(|mut values| {
            values.context.work_order = Some(work_order);
            values
        }),
        AssociationTarget::ManufacturingOrder {
            manufacturing_order,
            work_order,
        } => existing.map(|mut values| {
            values.context.manufacturing_order = Some(manufacturing_order);
            if work_order.is_some() {
                values.context.work_order = work_order;
            }
            values
        }),
    }
}

/// Fields set in `top` win over `base`.
fn overlay(base: SlotContext, top: SlotContext) -> SlotContext {
    SlotContext {
        work_order: top.work_order.or(base.work_order),
        component: top.component.or(base.component),
        line: top.line.or(base.line),
        manufacturing_order: top.manufacturing_order.or(base.manufacturing_order),
    }
}

fn push(
    pieces: &mut Vec<PlannedSlot>,
    id: Option<OperationSlotId>,
    range: TimeRange,
    values: Option<SlotValues>,
) {
    if range.is_empty() {
        return;
    }
    if let Some(values) = values.filter(|values| !values.is_empty()) {
        pieces.push(PlannedSlot { id, range, values });
    }
}

/// `a < b` where `None` stands for the unbounded future.
fn before(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a < b,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Computes the timeline after applying `target` over `range`.
///
/// `existing` must hold every slot overlapping `range` plus the slots adjacent
/// to it, in chronological order.
pub fn plan(
    existing: &[OperationSlot],
    range: TimeRange,
    target: &AssociationTarget,
) -> Vec<PlannedSlot> {
    let mut pieces: Vec<PlannedSlot> = Vec::new();

    // `None` once the open end of the range is covered.
    let mut cursor = Some(range.begin);
    for slot in existing {
        let values = SlotValues::of(slot);
        let Some(middle) = slot.range.intersection(&range) else {
            push(&mut pieces, Some(slot.id), slot.range, Some(values));
            continue;
        };

        let mut id = Some(slot.id);
        if slot.range.begin < range.begin {
            push(
                &mut pieces,
                id.take(),
                TimeRange::clamped(slot.range.begin, Some(range.begin)),
                Some(values),
            );
        }
        if let Some(gap_begin) = cursor.filter(|&gap_begin| gap_begin < middle.begin) {
            push(
                &mut pieces,
                None,
                TimeRange::clamped(gap_begin, Some(middle.begin)),
                apply_target(target, None),
            );
        }
        push(&mut pieces, id, middle, apply_target(target, Some(values)));
        cursor = middle.end;
        if let Some(range_end) = range.end.filter(|&end| before(Some(end), slot.range.end)) {
            push(
                &mut pieces,
                None,
                TimeRange::clamped(range_end, slot.range.end),
                Some(values),
            );
        }
    }
    if let Some(gap_begin) = cursor.filter(|&gap_begin| before(Some(gap_begin), range.end)) {
        push(
            &mut pieces,
            None,
            TimeRange::clamped(gap_begin, range.end),
            apply_target(target, None),
        );
    }

    pieces.sort_by_key(|piece| piece.range.begin);
    merge(pieces)
}

fn merge(pieces: Vec<PlannedSlot>) -> Vec<PlannedSlot> {
    let mut merged: Vec<PlannedSlot> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        match merged.last_mut() {
            Some(last)
                if last.range.end == Some(piece.range.begin) && last.values == piece.values =>
            {
                last.range.end = piece.range.end;
                last.id = last.id.or(piece.id);
            }
            _ => merged.push(piece),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pd_core::{ComponentId, MachineId, ManufacturingOrderId, WorkOrderId};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn op(id: i64) -> OperationId {
        OperationId::new(id).unwrap()
    }

    fn slot(id: i64, begin: i64, end: Option<i64>, operation: i64) -> OperationSlot {
        OperationSlot {
            id: OperationSlotId::new(id).unwrap(),
            machine: MachineId::new(1).unwrap(),
            range: TimeRange::clamped(at(begin), end.map(at)),
            operation: Some(op(operation)),
            context: SlotContext::default(),
            total_cycles: 0,
        }
    }

    fn operation_target(operation: Option<i64>) -> AssociationTarget {
        AssociationTarget::Operation {
            operation: operation.map(op),
            context: SlotContext::default(),
        }
    }

    fn summary(planned: &[PlannedSlot]) -> Vec<(Option<i64>, i64, Option<i64>, Option<i64>)> {
        planned
            .iter()
            .map(|piece| {
                (
                    piece.id.map(OperationSlotId::get),
                    (piece.range.begin - at(0)).num_seconds(),
                    piece.range.end.map(|end| (end - at(0)).num_seconds()),
                    piece.values.operation.map(OperationId::get),
                )
            })
            .collect()
    }

    // ========== Operation Tests ==========

    #[test]
    fn empty_timeline_gets_new_slot() {
        let planned = plan(&[], TimeRange::from(at(10)), &operation_target(Some(1)));
        assert_eq!(summary(&planned), vec![(None, 10, None, Some(1))]);
    }

    #[test]
    fn same_operation_extends_existing_slot() {
        let existing = [slot(4, 0, Some(10), 1)];
        let range = TimeRange::new(at(0), at(25)).unwrap();
        let planned = plan(&existing, range, &operation_target(Some(1)));
        assert_eq!(summary(&planned), vec![(Some(4), 0, Some(25), Some(1))]);
    }

    #[test]
    fn different_operation_splits_open_slot() {
        let existing = [slot(4, 0, None, 1)];
        let range = TimeRange::new(at(10), at(20)).unwrap();
        let planned = plan(&existing, range, &operation_target(Some(2)));
        assert_eq!(
            summary(&planned),
            vec![
                (Some(4), 0, Some(10), Some(1)),
                (None, 10, Some(20), Some(2)),
                (None, 20, None, Some(1)),
            ]
        );
    }

    #[test]
    fn removing_operation_truncates_slot() {
        let existing = [slot(4, 0, None, 1), slot(5, 30, Some(40), 2)];
        let planned = plan(&existing, TimeRange::from(at(10)), &operation_target(None));
        assert_eq!(summary(&planned), vec![(Some(4), 0, Some(10), Some(1))]);
    }

    #[test]
    fn adjacent_equal_slots_merge_keeping_first_id() {
        let existing = [slot(4, 0, Some(10), 1), slot(5, 20, Some(30), 1)];
        let range = TimeRange::new(at(10), at(20)).unwrap();
        let planned = plan(&existing, range, &operation_target(Some(1)));
        assert_eq!(summary(&planned), vec![(Some(4), 0, Some(30), Some(1))]);
    }

    #[test]
    fn operation_keeps_context_of_same_operation() {
        let mut existing = slot(4, 0, Some(10), 1);
        existing.context.work_order = Some(WorkOrderId::new(9).unwrap());
        let target = AssociationTarget::Operation {
            operation: Some(op(1)),
            context: SlotContext {
                component: Some(ComponentId::new(3).unwrap()),
                ..SlotContext::default()
            },
        };
        let planned = plan(&[existing], TimeRange::new(at(0), at(10)).unwrap(), &target);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].values.context.work_order.map(WorkOrderId::get), Some(9));
        assert_eq!(planned[0].values.context.component.map(ComponentId::get), Some(3));
    }

    // ========== Context Tests ==========

    #[test]
    fn manufacturing_order_only_touches_existing_slots() {
        let existing = [slot(4, 0, Some(10), 1)];
        let target = AssociationTarget::ManufacturingOrder {
            manufacturing_order: ManufacturingOrderId::new(6).unwrap(),
            work_order: None,
        };
        let planned = plan(&existing, TimeRange::from(at(5)), &target);
        assert_eq!(
            summary(&planned),
            vec![(Some(4), 0, Some(5), Some(1)), (None, 5, Some(10), Some(1))]
        );
        assert_eq!(
            planned[1].values.context.manufacturing_order.map(ManufacturingOrderId::get),
            Some(6)
        );
    }
}

//! Progress marker of the sequence running on a machine module.

use chrono::{DateTime, Duration, Utc};

use pd_core::{
    DetectionError, SequenceId, SequenceMilestone, Store, TxScope, with_transaction,
};

use crate::context::{DetectionContext, replayable};

/// Keeps the single milestone record of a machine module.
#[derive(Debug, Clone)]
pub struct SequenceMilestoneDetection {
    context: DetectionContext,
}

impl SequenceMilestoneDetection {
    pub const fn new(context: DetectionContext) -> Self {
        Self { context }
    }

    pub const fn context(&self) -> &DetectionContext {
        &self.context
    }

    /// Anchors the milestone at the start of `sequence`.
    pub fn start_sequence<S: Store + ?Sized>(
        &self,
        store: &mut S,
        scope: TxScope,
        date_time: DateTime<Utc>,
        sequence: SequenceId,
    ) -> Result<(), DetectionError> {
        let module = self.context.module();
        with_transaction(
            store,
            scope,
            "SequenceMilestoneDetection.StartSequence",
            replayable(),
            |store| {
                save(
                    store,
                    SequenceMilestone {
                        module,
                        date_time,
                        sequence: Some(sequence),
                        milestone: Some(Duration::zero()),
                        completed: false,
                    },
                )
            },
        )
    }

    /// Records the time already spent in the current sequence.
    ///
    /// Without `sequence` the stored sequence is kept.
    pub fn set_milestone<S: Store + ?Sized>(
        &self,
        store: &mut S,
        scope: TxScope,
        date_time: DateTime<Utc>,
        elapsed: Duration,
        sequence: Option<SequenceId>,
    ) -> Result<(), DetectionError> {
        let module = self.context.module();
        with_transaction(
            store,
            scope,
            "SequenceMilestoneDetection.SetMilestone",
            replayable(),
            |store| -> Result<(), DetectionError> {
                let stored = store.sequence_milestone(module)?;
                let sequence = sequence.or_else(|| stored.and_then(|m| m.sequence));
                save(
                    store,
                    SequenceMilestone {
                        module,
                        date_time,
                        sequence,
                        milestone: Some(elapsed),
                        completed: false,
                    },
                )
            },
        )
    }

    /// Marks the current sequence as completed at `date_time`.
    pub fn tag_sequence_completed<S: Store + ?Sized>(
        &self,
        store: &mut S,
        scope: TxScope,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let module = self.context.module();
        with_transaction(
            store,
            scope,
            "SequenceMilestoneDetection.TagSequenceCompleted",
            replayable(),
            |store| -> Result<(), DetectionError> {
                let Some(mut milestone) = store.sequence_milestone(module)? else {
                    return Ok(());
                };
                if milestone.completed {
                    return Ok(());
                }
                milestone.date_time = date_time;
                milestone.completed = true;
                store.save_sequence_milestone(&milestone)?;
                Ok(())
            },
        )
    }

    /// Forgets the milestone; nothing is known about the running sequence any more.
    pub fn cancel<S: Store + ?Sized>(
        &self,
        store: &mut S,
        scope: TxScope,
        date_time: DateTime<Utc>,
    ) -> Result<(), DetectionError> {
        let module = self.context.module();
        with_transaction(
            store,
            scope,
            "SequenceMilestoneDetection.Cancel",
            replayable(),
            |store| -> Result<(), DetectionError> {
                if store.sequence_milestone(module)?.is_some() {
                    tracing::debug!(%module, %date_time, "cancel sequence milestone");
                    store.delete_sequence_milestone(module)?;
                }
                Ok(())
            },
        )
    }

    /// Deletes the milestone when it does not refer to `expected`.
    pub fn check_sequence<S: Store + ?Sized>(
        &self,
        store: &mut S,
        scope: TxScope,
        expected: SequenceId,
    ) -> Result<(), DetectionError> {
        let module = self.context.module();
        with_transaction(
            store,
            scope,
            "SequenceMilestoneDetection.CheckSequence",
            replayable(),
            |store| -> Result<(), DetectionError> {
                let Some(milestone) = store.sequence_milestone(module)? else {
                    return Ok(());
                };
                if milestone.sequence != Some(expected) {
                    tracing::debug!(
                        %module,
                        stored = ?milestone.sequence,
                        %expected,
                        "sequence milestone does not match, delete it"
                    );
                    store.delete_sequence_milestone(module)?;
                }
                Ok(())
            },
        )
    }
}

fn save<S: Store + ?Sized>(
    store: &mut S,
    milestone: SequenceMilestone,
) -> Result<(), DetectionError> {
    if store.sequence_milestone(milestone.module)?.as_ref() == Some(&milestone) {
        return Ok(());
    }
    store.save_sequence_milestone(&milestone)?;
    Ok(())
}

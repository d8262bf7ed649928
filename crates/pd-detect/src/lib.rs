//! Production detection for one machine module.
//!
//! The components turn raw machine events into the production timeline kept
//! by a [`pd_core::Store`]:
//! - [`OperationCycleDetection`] builds operation cycles and the gaps between them
//! - [`OperationDetection`] starts, extends and stops operations on the slot timeline
//! - [`SequenceDetection`] keeps sequence slots and auto-sequences
//! - [`SequenceMilestoneDetection`] tracks progress inside the current sequence
//! - [`MasterDetection`] turns stamps into calls to the other components
//!
//! Every public call takes a [`pd_core::TxScope`]. With `Own` the call runs in
//! its own transaction and the after-commit hooks fire once it committed; with
//! `Inherited` it joins the caller's transaction and leaves the after-commit
//! hooks to the caller.

mod context;
mod master;
mod milestone;
mod operation;
mod operation_cycle;
mod sequence;

pub use context::DetectionContext;
pub use master::MasterDetection;
pub use milestone::SequenceMilestoneDetection;
pub use operation::OperationDetection;
pub use operation_cycle::OperationCycleDetection;
pub use sequence::SequenceDetection;

#[cfg(test)]
mod test_support;

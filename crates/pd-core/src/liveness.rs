//! Liveness sink fed by long detection calls.
//!
//! A watchdog outside the detection decides what to do with these signals;
//! they never change the outcome of a call.

/// Receives activity signals from a running detection.
pub trait Liveness: Send + Sync {
    /// The caller is making progress.
    fn set_active(&self);

    /// Suspends the inactivity check around a call that may legitimately block.
    fn pause_check(&self);

    fn resume_check(&self);
}

/// A sink that ignores every signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLiveness;

impl Liveness for NoLiveness {
    fn set_active(&self) {}

    fn pause_check(&self) {}

    fn resume_check(&self) {}
}

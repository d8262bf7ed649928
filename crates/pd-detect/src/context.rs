//! What every detection component of a machine module shares.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use pd_core::{
    ConfigProvider, DetectionConfig, DetectionError, DetectionLog, ErrorKind, Extensions,
    Liveness, LogLevel, MachineId, MachineModuleId, NoLiveness, Store, StoreError,
    TransactionOptions, TxScope,
};

/// The machine module a detection runs for, with its hooks, settings and liveness sink.
#[derive(Clone)]
pub struct DetectionContext {
    machine: MachineId,
    module: MachineModuleId,
    extensions: Arc<Extensions>,
    config: Arc<dyn ConfigProvider>,
    liveness: Arc<dyn Liveness>,
}

impl DetectionContext {
    /// A context with no extension, the default settings and no liveness sink.
    pub fn new(machine: MachineId, module: MachineModuleId) -> Self {
        Self {
            machine,
            module,
            extensions: Arc::new(Extensions::new()),
            config: Arc::new(DetectionConfig::default()),
            liveness: Arc::new(NoLiveness),
        }
    }

    #[must_use]
    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = Arc::new(extensions);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: impl ConfigProvider + 'static) -> Self {
        self.config = Arc::new(config);
        self
    }

    #[must_use]
    pub fn with_liveness(mut self, liveness: impl Liveness + 'static) -> Self {
        self.liveness = Arc::new(liveness);
        self
    }

    pub const fn machine(&self) -> MachineId {
        self.machine
    }

    pub const fn module(&self) -> MachineModuleId {
        self.module
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Settings for one detection call.
    pub fn config(&self) -> DetectionConfig {
        self.config.snapshot()
    }

    pub fn liveness(&self) -> &dyn Liveness {
        &*self.liveness
    }

    /// Persists an operator-facing diagnostic for this module.
    pub(crate) fn log<S: Store + ?Sized>(
        &self,
        store: &mut S,
        source: &'static str,
        level: LogLevel,
        date_time: DateTime<Utc>,
        message: String,
    ) -> Result<(), StoreError> {
        store.insert_detection_log(&DetectionLog {
            date_time,
            level,
            message,
            machine: self.machine,
            module: Some(self.module),
            source: source.to_string(),
        })
    }

    /// Same as [`Self::log`] for a diagnostic about the whole machine.
    pub(crate) fn log_machine<S: Store + ?Sized>(
        &self,
        store: &mut S,
        source: &'static str,
        level: LogLevel,
        date_time: DateTime<Utc>,
        message: String,
    ) -> Result<(), StoreError> {
        store.insert_detection_log(&DetectionLog {
            date_time,
            level,
            message,
            machine: self.machine,
            module: None,
            source: source.to_string(),
        })
    }

    /// Traces a failed call at the level its kind deserves.
    pub(crate) fn report_failure(&self, call: &'static str, err: &DetectionError) {
        match err.kind() {
            ErrorKind::StaleObject | ErrorKind::Transient => tracing::warn!(
                machine = %self.machine,
                module = %self.module,
                call,
                kind = %err.kind(),
                error = %err,
                "detection call failed, the event may be replayed"
            ),
            ErrorKind::Fatal => tracing::error!(
                machine = %self.machine,
                module = %self.module,
                call,
                error = %err,
                "detection call failed"
            ),
        }
    }
}

/// Runs the after-commit hooks only when the call owned its transaction.
pub(crate) fn after_commit(
    scope: TxScope,
    hooks: impl FnOnce() -> Result<(), DetectionError>,
) -> Result<(), DetectionError> {
    match scope {
        TxScope::Own => hooks(),
        TxScope::Inherited => Ok(()),
    }
}

impl fmt::Debug for DetectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectionContext")
            .field("machine", &self.machine)
            .field("module", &self.module)
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

/// Options of the transactions whose events can be replayed from their source.
pub(crate) const fn replayable() -> TransactionOptions {
    TransactionOptions::new().asynchronous()
}

pub(crate) fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Formats an optional end, `+oo` standing for the open future.
pub(crate) fn format_end(end: Option<DateTime<Utc>>) -> String {
    end.map_or_else(|| "+oo".to_string(), format_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, machine, module, setup};

    #[test]
    fn log_targets_the_module() {
        let mut db = setup();
        let context = DetectionContext::new(machine(), module());
        context
            .log(&mut db, "OperationDetection", LogLevel::Warn, at(5), "late".to_string())
            .unwrap();

        let logs = db.detection_logs(machine()).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].module, Some(module()));
        assert_eq!(logs[0].source, "OperationDetection");
        assert_eq!(logs[0].date_time, at(5));
    }

    #[test]
    fn config_snapshot_comes_from_provider() {
        let config = DetectionConfig {
            manufacturing_order_management: true,
            ..DetectionConfig::default()
        };
        let context = DetectionContext::new(machine(), module()).with_config(config);
        assert!(context.config().manufacturing_order_management);
    }

    #[test]
    fn open_end_formats_as_infinity() {
        assert_eq!(format_end(None), "+oo");
        assert_eq!(format_end(Some(at(0))), "2023-11-14T22:13:20.000Z");
    }
}

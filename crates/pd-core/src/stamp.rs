//! Stamps: the detection events probes emit at instrumented program lines.

use serde::{Deserialize, Serialize};

use crate::types::{ComponentId, IsoFileId, OperationId, SequenceId, StampId};

/// A single detection marker with the signals it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub id: StampId,
    #[serde(default)]
    pub operation_cycle_begin: bool,
    #[serde(default)]
    pub operation_cycle_end: bool,
    #[serde(default)]
    pub sequence: Option<SequenceId>,
    #[serde(default)]
    pub operation: Option<OperationId>,
    #[serde(default)]
    pub component: Option<ComponentId>,
    #[serde(default)]
    pub iso_file: Option<IsoFileId>,
    #[serde(default)]
    pub iso_file_end: bool,
}

impl Stamp {
    /// A stamp carrying no signal.
    pub const fn new(id: StampId) -> Self {
        Self {
            id,
            operation_cycle_begin: false,
            operation_cycle_end: false,
            sequence: None,
            operation: None,
            component: None,
            iso_file: None,
            iso_file_end: false,
        }
    }

    /// True if the stamp marks a cycle boundary.
    pub const fn is_cycle_boundary(&self) -> bool {
        self.operation_cycle_begin || self.operation_cycle_end
    }
}

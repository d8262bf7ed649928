//! Core type definitions with validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// An identifier was zero or negative.
    #[error("{field} must be positive, got {value}")]
    NonPositiveId { field: &'static str, value: i64 },

    /// A range ended before it began.
    #[error("invalid range: end {end} is before begin {begin}")]
    InvertedRange { begin: String, end: String },

    /// Invalid log level value.
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },

    /// Invalid transaction isolation value.
    #[error("invalid isolation level: {value}")]
    InvalidIsolationLevel { value: String },
}

/// Generates a validated integer ID newtype with common trait implementations.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "i64", into = "i64")]
        pub struct $name(i64);

        impl $name {
            /// Creates a new ID after validation.
            pub const fn new(id: i64) -> Result<Self, ValidationError> {
                if id <= 0 {
                    return Err(ValidationError::NonPositiveId {
                        field: $field_name,
                        value: id,
                    });
                }
                Ok(Self(id))
            }

            /// Returns the raw identifier.
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl TryFrom<i64> for $name {
            type Error = ValidationError;

            fn try_from(value: i64) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// A monitored machine.
    MachineId, "machine ID"
);

define_id!(
    /// A machine module: one acquisition channel of a machine (spindle, path, pallet).
    ///
    /// Sequence slots, auto-sequences, milestones and iso-file slots are kept per module.
    MachineModuleId, "machine module ID"
);

define_id!(
    /// An operation (the unit of work a cycle produces).
    OperationId, "operation ID"
);

define_id!(
    /// A machining sequence, part of an operation.
    SequenceId, "sequence ID"
);

define_id!(
    /// A component (part number).
    ComponentId, "component ID"
);

define_id!(
    /// A work order.
    WorkOrderId, "work order ID"
);

define_id!(
    /// A production line.
    LineId, "line ID"
);

define_id!(
    /// A manufacturing order (also called a task).
    ManufacturingOrderId, "manufacturing order ID"
);

define_id!(
    /// An intermediate work piece, linking operations to components.
    WorkPieceId, "work piece ID"
);

define_id!(
    /// An iso (NC program) file.
    IsoFileId, "iso file ID"
);

define_id!(
    /// A stamp, the marker a probe emits when it crosses an instrumented program line.
    StampId, "stamp ID"
);

define_id!(
    /// A persisted operation slot.
    OperationSlotId, "operation slot ID"
);

define_id!(
    /// A persisted operation cycle.
    OperationCycleId, "operation cycle ID"
);

define_id!(
    /// A persisted between-cycles gap record.
    BetweenCyclesId, "between cycles ID"
);

define_id!(
    /// A persisted sequence slot.
    SequenceSlotId, "sequence slot ID"
);

define_id!(
    /// A persisted auto-sequence record.
    AutoSequenceId, "auto sequence ID"
);

/// Severity of a persisted detection log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// String representation for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "notice" => Ok(Self::Notice),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            _ => Err(ValidationError::InvalidLogLevel {
                value: s.to_string(),
            }),
        }
    }
}

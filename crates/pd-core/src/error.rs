//! Error taxonomy shared by the store and the detection components.
//!
//! Every failure carries an [`ErrorKind`] so a caller can decide whether to
//! re-drive the same event (stale or transient) or give up on it.

use std::fmt;

use crate::types::{StampId, ValidationError};

/// Retry classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An optimistic lock lost a race; replaying the event is expected to succeed.
    StaleObject,
    /// A serialization failure or a busy store; replaying is expected to succeed.
    Transient,
    /// Anything else.
    Fatal,
}

impl ErrorKind {
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::StaleObject | Self::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StaleObject => "stale object",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Boxed error returned by extension hooks.
pub type ExtensionError = Box<dyn std::error::Error + Send + Sync>;

/// Error raised by a [`Store`](crate::Store) implementation.
#[derive(Debug, thiserror::Error)]
#[error("{kind} store error: {message}")]
pub struct StoreError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn stale(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StaleObject, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }
}

/// Errors surfaced by the detection components.
#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The signals of a stamp contradict each other.
    #[error("stamp {stamp} is not coherent: {reason}")]
    IncoherentStamp { stamp: StampId, reason: String },

    /// A stamp or event references an entity the store does not know.
    #[error("unknown {what} {id}")]
    UnknownReference { what: &'static str, id: i64 },

    /// A signal combination with no detection rule yet.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// An extension hook failed.
    #[error("extension hook {hook} failed: {source}")]
    Extension {
        hook: &'static str,
        #[source]
        source: ExtensionError,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A detection failed and the hooks told about it failed too.
    #[error("{error} (then the error hook failed: {hook_error})")]
    ErrorHook {
        #[source]
        error: Box<DetectionError>,
        hook_error: Box<DetectionError>,
    },
}

impl DetectionError {
    /// Retry classification; only store errors may be retryable.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(err) => err.kind,
            Self::IncoherentStamp { .. }
            | Self::UnknownReference { .. }
            | Self::NotImplemented(_)
            | Self::Extension { .. }
            | Self::Validation(_)
            | Self::ErrorHook { .. } => ErrorKind::Fatal,
        }
    }

    pub fn extension(hook: &'static str, source: ExtensionError) -> Self {
        Self::Extension { hook, source }
    }

    /// Attaches the failure of the error hooks to the failure they were told about.
    pub fn with_hook_error(self, hook_error: Self) -> Self {
        Self::ErrorHook {
            error: Box::new(self),
            hook_error: Box::new(hook_error),
        }
    }
}

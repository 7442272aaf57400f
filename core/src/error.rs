//! Structured error types for the tool-operation lifecycle engine.
//!
//! Every failure mode named in the design is its own variant with the
//! fields needed to act on it, rather than a string. Callers match on
//! `CoreError` to decide retry, surface-to-user, or abort.

use thiserror::Error;

use crate::model::{ItemId, OperationId, ScheduleId, SessionId};

/// Primary error type for the lifecycle engine.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The persistence driver could not complete a read or write.
    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },

    /// An operation or item was asked to make a transition not present
    /// in the legal-transition table. State is left untouched.
    #[error("illegal state transition for operation {operation_id}: {from} -> {to}")]
    IllegalStateTransition {
        operation_id: OperationId,
        from: String,
        to: String,
    },

    /// A session already has a non-terminal operation in flight.
    #[error("session {session_id} already has an active operation {operation_id}")]
    ConflictingOperation {
        session_id: SessionId,
        operation_id: OperationId,
    },

    /// The approval classifier returned output that didn't match the
    /// expected schema.
    #[error("could not classify approval reply for operation {operation_id}: {reason}")]
    ClassificationMalformed {
        operation_id: OperationId,
        reason: String,
    },

    /// A tool body failed to execute an item.
    #[error("tool execution failed for item {item_id} ({kind}): {message}")]
    ToolExecutionFailed {
        item_id: ItemId,
        kind: ToolFailureKind,
        message: String,
    },

    /// A monitoring schedule's deadline passed before its condition fired.
    #[error("schedule {schedule_id} expired before its condition fired")]
    ScheduleExpired { schedule_id: ScheduleId },

    /// No tool is registered under the requested type.
    #[error("unknown tool type: {tool_type}")]
    UnknownTool { tool_type: String },

    /// An operation id was not found in the store.
    #[error("operation not found: {operation_id}")]
    OperationNotFound { operation_id: OperationId },

    /// A schedule id was not found in the store.
    #[error("schedule not found: {schedule_id}")]
    ScheduleNotFound { schedule_id: ScheduleId },

    /// A tool body does not implement a capability the caller required
    /// of it (e.g. calling `check_condition` on a non-monitor tool).
    #[error("tool {tool_type} does not support capability: {capability}")]
    UnsupportedCapability {
        tool_type: String,
        capability: &'static str,
    },
}

/// Whether a tool execution failure should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFailureKind {
    Transient,
    Permanent,
}

impl std::fmt::Display for ToolFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolFailureKind::Transient => write!(f, "transient"),
            ToolFailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

//! Data model: the five entities the rest of the crate operates on.
//!
//! Timestamps are UTC (`chrono::DateTime<Utc>`); ids are newtyped UUIDs so
//! an `ItemId` can never be passed where an `OperationId` is expected.

mod ids;
mod item;
mod message;
mod operation;
mod schedule;

pub use ids::{ItemId, OperationId, ScheduleId, SessionId};
pub use item::{ItemState, ItemStatus, ToolItem};
pub use message::{InteractionType, Message, MessageRole};
pub use operation::{
    EndStatus, HistoryEntry, InputEnvelope, OperationState, OperationStatus, OutputEnvelope, ToolOperation,
};
pub use schedule::{
    MonitoringParams, Schedule, ScheduleState, ScheduleType, TimingParams,
};

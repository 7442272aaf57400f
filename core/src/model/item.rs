use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ItemId, OperationId, ScheduleId, SessionId};
pub use super::operation::OperationState as ItemState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Approved,
    Rejected,
    Scheduled,
    /// Conditional update `SCHEDULED -> EXECUTING_CLAIMED` claims an item
    /// for a single executor worker; this is not a user-visible status in
    /// the design's `Status` enum but is the lease state of `Scheduled`.
    ExecutingClaimed,
    Executed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Executed | ItemStatus::Rejected | ItemStatus::Failed)
    }
}

/// One artifact produced by an operation (a tweet draft, a swap quote, ...).
/// Content is opaque `serde_json::Value` to the core — tool bodies own its shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolItem {
    pub item_id: ItemId,
    pub operation_id: OperationId,
    pub session_id: SessionId,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<ScheduleId>,

    pub state: ItemState,
    pub status: ItemStatus,

    pub content: serde_json::Value,
    pub raw_content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_time: Option<DateTime<Utc>>,

    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_response: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ToolItem {
    pub fn new(
        operation_id: OperationId,
        session_id: SessionId,
        content_type: impl Into<String>,
        content: serde_json::Value,
        raw_content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            item_id: ItemId::new(),
            operation_id,
            session_id,
            content_type: content_type.into(),
            schedule_id: None,
            state: ItemState::Collecting,
            status: ItemStatus::Pending,
            content,
            raw_content: raw_content.into(),
            scheduled_time: None,
            executed_time: None,
            posted_time: None,
            retry_count: 0,
            last_error: None,
            api_response: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Invariant 4 (§3): once terminal, an item is immutable except for
    /// `last_error` on replay-safe re-reporting.
    pub fn is_immutable(&self) -> bool {
        self.status.is_terminal()
    }
}

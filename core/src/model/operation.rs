use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ItemId, OperationId, ScheduleId, SessionId};

/// Operation-level (and item-level, which reuses this enum per §3) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Inactive,
    Collecting,
    Approving,
    Executing,
    Completed,
    Cancelled,
    Error,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Cancelled | OperationState::Error
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationState::Inactive => "inactive",
            OperationState::Collecting => "collecting",
            OperationState::Approving => "approving",
            OperationState::Executing => "executing",
            OperationState::Completed => "completed",
            OperationState::Cancelled => "cancelled",
            OperationState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Rolling outcome label, orthogonal to `OperationState` (an operation can
/// be EXECUTING with status still PENDING while items trickle in).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Approved,
    Rejected,
    Scheduled,
    Executed,
    Failed,
}

/// Terminal status passed to `end_operation`, distinct from `OperationStatus`
/// in that it names the *reason* the caller is ending the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStatus {
    Approved,
    Rejected,
    Failed,
}

impl EndStatus {
    pub fn terminal_state(self) -> OperationState {
        match self {
            EndStatus::Approved => OperationState::Completed,
            EndStatus::Rejected => OperationState::Cancelled,
            EndStatus::Failed => OperationState::Error,
        }
    }

    /// `output.status` recorded when a caller doesn't supply a more
    /// specific aggregate (see `ToolStateManager::aggregate_status`).
    pub fn default_output_status(self) -> OperationStatus {
        match self {
            EndStatus::Approved => OperationStatus::Approved,
            EndStatus::Rejected => OperationStatus::Rejected,
            EndStatus::Failed => OperationStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: OperationState,
    pub step: String,
    pub timestamp: DateTime<Utc>,
}

/// Original command and parsed parameters that started the operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputEnvelope {
    pub command: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub schedule_id: Option<ScheduleId>,
}

impl InputEnvelope {
    pub fn new(command: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            command: command.into(),
            parameters,
            schedule_id: None,
        }
    }
}

/// Rolling rosters and final result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputEnvelope {
    pub pending_item_ids: Vec<ItemId>,
    pub approved_item_ids: Vec<ItemId>,
    pub rejected_item_ids: Vec<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_response: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<OperationStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOperation {
    pub operation_id: OperationId,
    pub session_id: SessionId,
    pub tool_type: String,
    pub content_type: String,

    pub state: OperationState,
    pub step: String,

    pub input: InputEnvelope,
    pub output: OutputEnvelope,

    pub history: Vec<HistoryEntry>,
    pub requires_approval: bool,
    pub requires_scheduling: bool,
    /// Number of `APPROVING -> COLLECTING` regeneration cycles so far (§4.4).
    #[serde(default)]
    pub regeneration_rounds: u32,
    /// Consecutive malformed classification replies (§4.4 classification contract).
    #[serde(default)]
    pub malformed_classifications: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ToolOperation {
    pub fn new(
        session_id: SessionId,
        tool_type: impl Into<String>,
        content_type: impl Into<String>,
        input: InputEnvelope,
        requires_approval: bool,
        requires_scheduling: bool,
    ) -> Self {
        let now = Utc::now();
        let state = OperationState::Inactive;
        Self {
            operation_id: OperationId::new(),
            session_id,
            tool_type: tool_type.into(),
            content_type: content_type.into(),
            state,
            step: "created".to_string(),
            input,
            output: OutputEnvelope::default(),
            history: vec![HistoryEntry {
                state,
                step: "created".to_string(),
                timestamp: now,
            }],
            requires_approval,
            requires_scheduling,
            regeneration_rounds: 0,
            malformed_classifications: 0,
            end_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Roster partition invariant (§8 "Roster partition"): pending,
    /// approved, and rejected are disjoint, and their union is exactly
    /// `owned_item_ids` — the item set this operation owns.
    pub fn roster_is_partitioned(&self, owned_item_ids: &[ItemId]) -> bool {
        let mut seen = std::collections::HashSet::new();
        for id in self
            .output
            .pending_item_ids
            .iter()
            .chain(&self.output.approved_item_ids)
            .chain(&self.output.rejected_item_ids)
        {
            if !seen.insert(*id) {
                return false;
            }
        }
        let owned: std::collections::HashSet<_> = owned_item_ids.iter().copied().collect();
        seen == owned
    }
}

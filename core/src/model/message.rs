use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SessionId;

/// Append-only audit log entry for a session's conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub session_id: SessionId,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub interaction_type: InteractionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    pub fn new(
        session_id: SessionId,
        role: MessageRole,
        content: impl Into<String>,
        interaction_type: InteractionType,
    ) -> Self {
        Self {
            session_id,
            role,
            content: content.into(),
            timestamp: Utc::now(),
            interaction_type,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// What kind of turn produced this message, for downstream routing and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Chat,
    ToolTrigger,
    ApprovalReply,
    SystemNotice,
}

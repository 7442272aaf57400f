//! Consumed contracts (§6): everything this crate requires of collaborators
//! it does not implement itself. Each is an `async_trait` trait, grounded
//! in the teacher's `Capability` pattern (`agent/runtime/capability.rs`) —
//! pure interfaces with no decision logic baked in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::model::{Schedule, ScheduleType, ToolItem};

/// `complete(messages, model, options) -> string`. Must not reorder
/// concurrent calls; honors temperature/max-tokens knobs.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        model: &str,
        options: LlmOptions,
    ) -> Result<String, LlmError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("llm error: {0}")]
pub struct LlmError(pub String);

/// `detect(text) -> tool_type?`. Consulted only while the agent state is
/// `NormalChat` (§4.7).
pub trait TriggerDetector: Send + Sync {
    fn detect(&self, text: &str) -> Option<String>;
}

/// The Approval Manager's LLM-classification boundary (§4.4). Kept
/// separate from `LlmClient` because the classifier owns prompt
/// construction and strict-JSON parsing; a caller may implement it as a
/// thin wrapper around an `LlmClient`, or (in tests) as a fixed responder,
/// mirroring the teacher's `AutoApproveCapability` test double.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: ClassificationRequest) -> Result<ClassificationReply, LlmError>;
}

#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    /// 1-indexed items currently under approval, each with `raw_content`.
    pub items: Vec<(u32, String)>,
    pub user_reply: String,
}

/// Strict-JSON classification result: `{action, approved_indices?, regenerate_indices?, rationale}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationReply {
    pub action: ClassifiedAction,
    #[serde(default)]
    pub approved_indices: Vec<u32>,
    #[serde(default)]
    pub regenerate_indices: Vec<u32>,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifiedAction {
    FullApproval,
    PartialApproval,
    RegenerateAll,
    Cancel,
    AwaitInput,
    Error,
}

/// Tool body capability surface: `Run`, `GenerateContent`,
/// `ExecuteScheduled`, `CheckCondition`. A tool that doesn't support a
/// capability returns `UnsupportedCapability` rather than panicking — the
/// design note's "nil entries tested before invocation", realized as
/// a `Result` the caller checks instead of an `Option` method table.
#[async_trait]
pub trait ToolBody: Send + Sync {
    /// Registry row this tool declares (§4.2).
    fn registration(&self) -> ToolRegistration;

    /// Starting a fresh operation from a user message: parses parameters,
    /// generates the initial item batch, and optionally describes the
    /// schedule to initialize.
    async fn run(&self, input: ToolRunInput) -> CoreResult<ToolRunOutput>;

    /// Generates exactly `count` replacement items during the approval
    /// regeneration loop.
    async fn generate_content(
        &self,
        parameters: &serde_json::Value,
        count: u32,
    ) -> CoreResult<Vec<GeneratedItem>>;

    /// Executes one approved, due item. Must be idempotent, keyed by
    /// `item.item_id`, since the executor guarantees at-least-once.
    async fn execute_scheduled_operation(&self, item: &ToolItem) -> CoreResult<ExecutionOutcome>;

    /// Evaluates a monitoring schedule's condition. Default: unsupported.
    async fn check_condition(&self, schedule: &Schedule) -> CoreResult<bool> {
        let _ = schedule;
        Err(CoreError::UnsupportedCapability {
            tool_type: self.registration().tool_type,
            capability: "check_condition",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ToolRegistration {
    pub tool_type: String,
    pub content_type: String,
    pub requires_approval: bool,
    pub requires_scheduling: bool,
    pub required_collaborators: Vec<&'static str>,
}

#[derive(Debug, Clone)]
pub struct ToolRunInput {
    pub command: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ToolRunOutput {
    /// Parsed parameters to persist on the operation's input envelope.
    pub parameters: serde_json::Value,
    pub items: Vec<GeneratedItem>,
    pub schedule_request: Option<ScheduleRequest>,
}

#[derive(Debug, Clone)]
pub struct GeneratedItem {
    pub content: serde_json::Value,
    pub raw_content: String,
}

/// What the tool wants the Schedule Manager to set up, if anything.
#[derive(Debug, Clone)]
pub enum ScheduleRequest {
    OneTime {
        start_time: chrono::DateTime<chrono::Utc>,
    },
    Multiple {
        start_time: chrono::DateTime<chrono::Utc>,
        interval_secs: i64,
        total_items: u32,
    },
    Recurring {
        start_time: chrono::DateTime<chrono::Utc>,
        interval_secs: i64,
    },
    Monitoring {
        check_interval_secs: i64,
        expiration_timestamp: chrono::DateTime<chrono::Utc>,
        condition: serde_json::Value,
    },
}

impl ScheduleRequest {
    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            ScheduleRequest::OneTime { .. } => ScheduleType::OneTime,
            ScheduleRequest::Multiple { .. } => ScheduleType::Multiple,
            ScheduleRequest::Recurring { .. } => ScheduleType::Recurring,
            ScheduleRequest::Monitoring { .. } => ScheduleType::Monitoring,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub api_response: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Whether a failed execution is worth retrying.
    pub transient: bool,
}

impl ExecutionOutcome {
    pub fn ok(api_response: serde_json::Value) -> Self {
        Self {
            success: true,
            api_response: Some(api_response),
            error: None,
            transient: false,
        }
    }

    pub fn failed(error: impl Into<String>, transient: bool) -> Self {
        Self {
            success: false,
            api_response: None,
            error: Some(error.into()),
            transient,
        }
    }
}

/// Always classifies as full approval. Useful for tests and for
/// integrators who want unattended operation, in the same spirit as the
/// teacher's `AutoApproveCapability` test double.
pub struct AutoApproveClassifier;

#[async_trait]
impl Classifier for AutoApproveClassifier {
    async fn classify(&self, _request: ClassificationRequest) -> Result<ClassificationReply, LlmError> {
        Ok(ClassificationReply {
            action: ClassifiedAction::FullApproval,
            approved_indices: vec![],
            regenerate_indices: vec![],
            rationale: "auto-approved".into(),
        })
    }
}

//! Agent State Manager (§4.7): the session-level router between free chat
//! and an active tool operation.
//!
//! Grounded in the teacher's `agent::cognition::state::AgentState` (a pure,
//! immutable-snapshot state) combined with
//! `agent::session::session::Session::translate_input`'s job of mapping
//! an external message onto an internal event before dispatch.

use serde::{Deserialize, Serialize};

use crate::contracts::TriggerDetector;
use crate::orchestrator::OrchestratorStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    NormalChat,
    ToolOperation,
}

/// Per-session routing state: which mode the session is in, and which
/// tool it's bound to while `ToolOperation`.
#[derive(Debug, Clone)]
pub struct AgentSessionState {
    pub state: AgentState,
    pub bound_tool_type: Option<String>,
}

impl Default for AgentSessionState {
    fn default() -> Self {
        Self {
            state: AgentState::NormalChat,
            bound_tool_type: None,
        }
    }
}

/// What the Agent State Manager decided to do with an inbound message.
pub enum RoutingDecision {
    /// Stay in `NORMAL_CHAT`; no tool was triggered.
    NormalReply,
    /// Dispatch to the Orchestrator for this `tool_type`.
    Dispatch { tool_type: String },
}

impl AgentSessionState {
    /// Consults the trigger detector only while `NORMAL_CHAT`; in
    /// `TOOL_OPERATION`, always redispatches to the bound tool.
    pub fn route(&mut self, message: &str, trigger_detector: &dyn TriggerDetector) -> RoutingDecision {
        match self.state {
            AgentState::NormalChat => match trigger_detector.detect(message) {
                Some(tool_type) => {
                    self.state = AgentState::ToolOperation;
                    self.bound_tool_type = Some(tool_type.clone());
                    RoutingDecision::Dispatch { tool_type }
                }
                None => RoutingDecision::NormalReply,
            },
            AgentState::ToolOperation => {
                let tool_type = self
                    .bound_tool_type
                    .clone()
                    .expect("TOOL_OPERATION state always carries a bound tool_type");
                RoutingDecision::Dispatch { tool_type }
            }
        }
    }

    /// Applies the Orchestrator's reported status, transitioning back to
    /// `NORMAL_CHAT` on completion, cancellation, or exit; `error` also
    /// returns to `NORMAL_CHAT` per the `Any --error--> NORMAL_CHAT` rule.
    pub fn apply_outcome(&mut self, status: OrchestratorStatus) {
        match status {
            OrchestratorStatus::Completed | OrchestratorStatus::Cancelled | OrchestratorStatus::Exit | OrchestratorStatus::Error => {
                self.state = AgentState::NormalChat;
                self.bound_tool_type = None;
            }
            OrchestratorStatus::InProgress => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysTrigger(&'static str);
    impl TriggerDetector for AlwaysTrigger {
        fn detect(&self, _text: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    struct NeverTrigger;
    impl TriggerDetector for NeverTrigger {
        fn detect(&self, _text: &str) -> Option<String> {
            None
        }
    }

    #[test]
    fn normal_chat_without_trigger_stays_normal_chat() {
        let mut session = AgentSessionState::default();
        let decision = session.route("hi", &NeverTrigger);
        assert!(matches!(decision, RoutingDecision::NormalReply));
        assert_eq!(session.state, AgentState::NormalChat);
    }

    #[test]
    fn trigger_moves_to_tool_operation_and_binds_type() {
        let mut session = AgentSessionState::default();
        let decision = session.route("schedule a tweet", &AlwaysTrigger("tweet"));
        assert!(matches!(decision, RoutingDecision::Dispatch { .. }));
        assert_eq!(session.state, AgentState::ToolOperation);
        assert_eq!(session.bound_tool_type.as_deref(), Some("tweet"));
    }

    #[test]
    fn completion_returns_to_normal_chat() {
        let mut session = AgentSessionState::default();
        session.route("schedule a tweet", &AlwaysTrigger("tweet"));
        session.apply_outcome(OrchestratorStatus::Completed);
        assert_eq!(session.state, AgentState::NormalChat);
        assert!(session.bound_tool_type.is_none());
    }
}

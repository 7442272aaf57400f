//! Stub collaborators for the demo binary: a canned LLM client, a
//! keyword-based trigger detector, and a keyword-based classifier. Stand
//! in for the real chat transport/LLM/classification integrations named
//! as out-of-scope collaborators.

use async_trait::async_trait;

use agentflow_core::contracts::{
    ClassificationReply, ClassificationRequest, Classifier, ClassifiedAction, LlmClient, LlmError, LlmMessage,
    LlmOptions, TriggerDetector,
};

/// Replies with a fixed line rather than calling out to a real model.
pub struct EchoLlmClient;

#[async_trait]
impl LlmClient for EchoLlmClient {
    async fn complete(&self, messages: &[LlmMessage], _model: &str, _options: LlmOptions) -> Result<String, LlmError> {
        let last_user = messages.iter().rev().find(|m| m.role == "user").map(|m| m.content.as_str()).unwrap_or("");
        Ok(format!("I heard you say: \"{}\". Ask me to tweet, deposit, or swap to start a tool.", last_user))
    }
}

/// Recognizes the three demo tool types by keyword.
pub struct KeywordTriggerDetector;

impl TriggerDetector for KeywordTriggerDetector {
    fn detect(&self, text: &str) -> Option<String> {
        let lower = text.to_lowercase();
        if lower.contains("tweet") || lower.contains("post") {
            Some("tweet".to_string())
        } else if lower.contains("deposit") {
            Some("near_deposit".to_string())
        } else if lower.contains("swap") {
            Some("near_swap".to_string())
        } else {
            None
        }
    }
}

/// Classifies approval replies by keyword instead of an LLM round-trip:
/// "approve"/"yes" -> full approval, "cancel"/"no" -> cancel, "redo"/
/// "regenerate" -> regenerate all, anything else -> await clarification.
pub struct KeywordClassifier;

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, request: ClassificationRequest) -> Result<ClassificationReply, LlmError> {
        let lower = request.user_reply.to_lowercase();
        let action = if lower.contains("cancel") || lower == "no" {
            ClassifiedAction::Cancel
        } else if lower.contains("redo") || lower.contains("regenerate") {
            ClassifiedAction::RegenerateAll
        } else if lower.contains("approve") || lower.contains("yes") || lower.contains("ok") {
            ClassifiedAction::FullApproval
        } else {
            ClassifiedAction::AwaitInput
        };
        Ok(ClassificationReply {
            action,
            approved_indices: vec![],
            regenerate_indices: vec![],
            rationale: "keyword match".into(),
        })
    }
}

//! Approval Manager (§4.4): drives the `APPROVING` state, classifying
//! free-text user replies into an `ApprovalAction` and applying it.
//!
//! Grounded in the teacher's `ApprovalCapability` trait
//! (`agent/runtime/approval.rs`, `impls/terminal_approval.rs`): approval is
//! a pending request with a single resolver, here generalized from one
//! yes/no gate to a full classification with partition indices.

use std::sync::Arc;

use tracing::warn;

use crate::config::RuntimeConfig;
use crate::contracts::{ClassificationReply, ClassificationRequest, ClassifiedAction, Classifier, ToolBody};
use crate::error::{CoreError, CoreResult};
use crate::model::{EndStatus, ItemId, ItemState, ItemStatus, OperationState, OperationId, ToolItem, ToolOperation};
use crate::persistence::PersistenceStore;
use crate::tool_state::{ContentUpdates, ToolStateManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalAction {
    FullApproval,
    PartialApproval {
        approved_indices: Vec<u32>,
        regenerate_indices: Vec<u32>,
    },
    RegenerateAll,
    Cancel,
    AwaitInput,
    Error,
}

#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    /// Items are presented (1-indexed) and awaiting the user's reply.
    AwaitingApproval { items: Vec<ToolItem> },
    /// Operation moved to `EXECUTING`; caller hands off to the Schedule
    /// Manager (if `requires_scheduling`) or executes immediately.
    Proceeding,
    Cancelled,
    Failed { reason: String },
    ClarificationNeeded { message: String },
}

pub struct ApprovalManager {
    store: Arc<dyn PersistenceStore>,
}

impl ApprovalManager {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self { store }
    }

    /// Step 1 of the protocol: on entry to APPROVING, persist the
    /// operation's collecting items as `state=APPROVING, status=PENDING`
    /// and return them in presentation order.
    pub async fn enter_approving(
        &self,
        tool_state: &ToolStateManager,
        operation: &mut ToolOperation,
    ) -> CoreResult<ApprovalOutcome> {
        let ok = tool_state
            .transition(operation, OperationState::Approving, "approving")
            .await?;
        if !ok {
            return Err(CoreError::IllegalStateTransition {
                operation_id: operation.operation_id,
                from: operation.state.to_string(),
                to: OperationState::Approving.to_string(),
            });
        }

        let items = self.collecting_items(operation.operation_id).await?;
        let ids: Vec<_> = items.iter().map(|i| i.item_id).collect();
        self.store
            .update_items_state(&ids, ItemState::Approving, ItemStatus::Pending)
            .await?;

        Ok(ApprovalOutcome::AwaitingApproval {
            items: self.collecting_items(operation.operation_id).await?,
        })
    }

    /// Step 2+3: classify the reply, then apply the resulting action.
    pub async fn handle_reply(
        &self,
        tool_state: &ToolStateManager,
        operation: &mut ToolOperation,
        user_reply: &str,
        classifier: &dyn Classifier,
        tool: &dyn ToolBody,
        config: &RuntimeConfig,
    ) -> CoreResult<ApprovalOutcome> {
        let items = self.approving_items(operation.operation_id).await?;
        let request = ClassificationRequest {
            items: items
                .iter()
                .enumerate()
                .map(|(i, item)| (i as u32 + 1, item.raw_content.clone()))
                .collect(),
            user_reply: user_reply.to_string(),
        };

        let reply = match classifier.classify(request).await {
            Ok(reply) => reply,
            Err(err) => return self.on_malformed(tool_state, operation, err.0).await,
        };

        let n = items.len() as u32;
        let action = match self.to_action(&reply, n) {
            Ok(action) => action,
            Err(reason) => return self.on_malformed(tool_state, operation, reason).await,
        };

        operation.malformed_classifications = 0;
        self.apply_action(tool_state, operation, action, &items, tool, config).await
    }

    async fn on_malformed(
        &self,
        tool_state: &ToolStateManager,
        operation: &mut ToolOperation,
        reason: String,
    ) -> CoreResult<ApprovalOutcome> {
        operation.malformed_classifications += 1;
        if operation.malformed_classifications >= 2 {
            tool_state
                .end_operation(operation.operation_id, EndStatus::Failed, Some(reason.clone()), None)
                .await?;
            return Ok(ApprovalOutcome::Failed { reason });
        }
        Ok(ApprovalOutcome::ClarificationNeeded {
            message: format!("I couldn't understand that reply ({reason}); could you clarify?"),
        })
    }

    fn to_action(&self, reply: &ClassificationReply, n: u32) -> Result<ApprovalAction, String> {
        match reply.action {
            ClassifiedAction::FullApproval => Ok(ApprovalAction::FullApproval),
            ClassifiedAction::RegenerateAll => Ok(ApprovalAction::RegenerateAll),
            ClassifiedAction::Cancel => Ok(ApprovalAction::Cancel),
            ClassifiedAction::AwaitInput => Ok(ApprovalAction::AwaitInput),
            ClassifiedAction::Error => Ok(ApprovalAction::Error),
            ClassifiedAction::PartialApproval => {
                let approved = reply.approved_indices.clone();
                let regenerate = reply.regenerate_indices.clone();
                let mut union: Vec<u32> = approved.iter().chain(regenerate.iter()).copied().collect();
                union.sort_unstable();
                let mut seen = std::collections::HashSet::new();
                for idx in &union {
                    if !seen.insert(*idx) {
                        return Err(format!("index {idx} appears in both approved and regenerate sets"));
                    }
                }
                let expected: Vec<u32> = (1..=n).collect();
                if union != expected {
                    return Err(format!("approved/regenerate indices must partition 1..{n}"));
                }
                Ok(ApprovalAction::PartialApproval {
                    approved_indices: approved,
                    regenerate_indices: regenerate,
                })
            }
        }
    }

    /// Applies a classified action to the operation.
    pub async fn apply_action(
        &self,
        tool_state: &ToolStateManager,
        operation: &mut ToolOperation,
        action: ApprovalAction,
        items: &[ToolItem],
        tool: &dyn ToolBody,
        config: &RuntimeConfig,
    ) -> CoreResult<ApprovalOutcome> {
        match action {
            ApprovalAction::FullApproval => {
                let ids: Vec<_> = items.iter().map(|i| i.item_id).collect();
                self.store
                    .update_items_state(&ids, ItemState::Executing, ItemStatus::Approved)
                    .await?;
                tool_state
                    .transition(operation, OperationState::Executing, "executing")
                    .await?;
                self.update_roster(tool_state, operation, &ids, &[], &[]).await?;
                Ok(ApprovalOutcome::Proceeding)
            }
            ApprovalAction::PartialApproval {
                approved_indices,
                regenerate_indices,
            } => {
                self.apply_partial_approval(tool_state, operation, &approved_indices, &regenerate_indices, items, tool, config)
                    .await
            }
            ApprovalAction::RegenerateAll => {
                let all: Vec<u32> = (1..=items.len() as u32).collect();
                self.apply_partial_approval(tool_state, operation, &[], &all, items, tool, config)
                    .await
            }
            ApprovalAction::Cancel => {
                let ids: Vec<_> = items
                    .iter()
                    .filter(|i| !i.status.is_terminal())
                    .map(|i| i.item_id)
                    .collect();
                self.store
                    .update_items_state(&ids, ItemState::Cancelled, ItemStatus::Rejected)
                    .await?;
                tool_state
                    .end_operation(operation.operation_id, EndStatus::Rejected, Some("user_cancel".into()), None)
                    .await?;
                self.update_roster(tool_state, operation, &[], &ids, &[]).await?;
                Ok(ApprovalOutcome::Cancelled)
            }
            ApprovalAction::AwaitInput => Ok(ApprovalOutcome::ClarificationNeeded {
                message: "I didn't catch a decision in that reply — approve, reject, or ask for changes?".into(),
            }),
            ApprovalAction::Error => {
                tool_state
                    .end_operation(operation.operation_id, EndStatus::Failed, Some("classified_error".into()), None)
                    .await?;
                Ok(ApprovalOutcome::Failed {
                    reason: "classified_error".into(),
                })
            }
        }
    }

    async fn apply_partial_approval(
        &self,
        tool_state: &ToolStateManager,
        operation: &mut ToolOperation,
        approved_indices: &[u32],
        regenerate_indices: &[u32],
        items: &[ToolItem],
        tool: &dyn ToolBody,
        config: &RuntimeConfig,
    ) -> CoreResult<ApprovalOutcome> {
        if operation.regeneration_rounds >= config.max_regeneration_rounds {
            let ids: Vec<_> = items.iter().map(|i| i.item_id).collect();
            self.store
                .update_items_state(&ids, ItemState::Cancelled, ItemStatus::Rejected)
                .await?;
            tool_state
                .end_operation(
                    operation.operation_id,
                    EndStatus::Rejected,
                    Some("max_regeneration_rounds_exceeded".into()),
                    None,
                )
                .await?;
            self.update_roster(tool_state, operation, &[], &ids, &[]).await?;
            return Ok(ApprovalOutcome::Cancelled);
        }

        let approved_ids: Vec<_> = approved_indices
            .iter()
            .filter_map(|i| items.get(*i as usize - 1))
            .map(|i| i.item_id)
            .collect();
        let regenerate_ids: Vec<_> = regenerate_indices
            .iter()
            .filter_map(|i| items.get(*i as usize - 1))
            .map(|i| i.item_id)
            .collect();

        self.store
            .update_items_state(&approved_ids, ItemState::Executing, ItemStatus::Approved)
            .await?;
        self.store
            .update_items_state(&regenerate_ids, ItemState::Completed, ItemStatus::Rejected)
            .await?;

        // Regeneration loop: APPROVING -> COLLECTING -> APPROVING.
        tool_state
            .transition(operation, OperationState::Collecting, "regenerating")
            .await?;
        operation.regeneration_rounds += 1;

        let replacements = tool
            .generate_content(&operation.input.parameters, regenerate_ids.len() as u32)
            .await?;
        let new_items: Vec<ToolItem> = replacements
            .into_iter()
            .map(|g| ToolItem::new(operation.operation_id, operation.session_id, &operation.content_type, g.content, g.raw_content))
            .collect();
        let new_ids: Vec<_> = new_items.iter().map(|i| i.item_id).collect();
        self.store.insert_items(new_items).await?;

        tool_state
            .transition(operation, OperationState::Approving, "approving")
            .await?;
        // Roster update deferred to here, after every transition that
        // touches other operation fields (`regeneration_rounds`, `state`)
        // has already persisted — `update_roster` overwrites the in-memory
        // operation with a fresh fetch, so doing it earlier would discard
        // those unpersisted mutations.
        self.update_roster(tool_state, operation, &approved_ids, &regenerate_ids, &new_ids).await?;
        let fresh = self.collecting_items(operation.operation_id).await?;
        let ids: Vec<_> = fresh
            .iter()
            .filter(|i| i.status == ItemStatus::Pending && i.state == ItemState::Collecting)
            .map(|i| i.item_id)
            .collect();
        self.store
            .update_items_state(&ids, ItemState::Approving, ItemStatus::Pending)
            .await?;

        // Originally-approved items are not re-shown (§4.4).
        let presented = self
            .store
            .get_items(operation.operation_id, Some(ItemState::Approving), Some(ItemStatus::Pending))
            .await?;
        Ok(ApprovalOutcome::AwaitingApproval { items: presented })
    }

    /// Moves item ids between the output envelope's pending/approved/
    /// rejected partitions as the approval protocol resolves them, keeping
    /// §3 invariant 3 (the three rosters are disjoint and their union is
    /// exactly the item set the operation owns) true after every round.
    async fn update_roster(
        &self,
        tool_state: &ToolStateManager,
        operation: &mut ToolOperation,
        approved_add: &[ItemId],
        rejected_add: &[ItemId],
        pending_add: &[ItemId],
    ) -> CoreResult<()> {
        if approved_add.is_empty() && rejected_add.is_empty() && pending_add.is_empty() {
            return Ok(());
        }
        let moved: std::collections::HashSet<ItemId> = approved_add.iter().chain(rejected_add).copied().collect();
        let pending: Vec<ItemId> = operation
            .output
            .pending_item_ids
            .iter()
            .copied()
            .filter(|id| !moved.contains(id))
            .chain(pending_add.iter().copied())
            .collect();
        let approved: Vec<ItemId> = operation
            .output
            .approved_item_ids
            .iter()
            .copied()
            .chain(approved_add.iter().copied())
            .collect();
        let rejected: Vec<ItemId> = operation
            .output
            .rejected_item_ids
            .iter()
            .copied()
            .chain(rejected_add.iter().copied())
            .collect();

        *operation = tool_state
            .update_operation(
                operation.operation_id,
                None,
                None,
                Some(ContentUpdates {
                    pending_item_ids: Some(pending),
                    approved_item_ids: Some(approved),
                    rejected_item_ids: Some(rejected),
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn collecting_items(&self, operation_id: OperationId) -> CoreResult<Vec<ToolItem>> {
        self.store.get_items(operation_id, None, None).await
    }

    async fn approving_items(&self, operation_id: OperationId) -> CoreResult<Vec<ToolItem>> {
        let mut items = self
            .store
            .get_items(operation_id, Some(ItemState::Approving), None)
            .await?;
        items.sort_by_key(|i| (i.created_at, i.item_id));
        if items.is_empty() {
            warn!(%operation_id, "approval reply received with no items in APPROVING");
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ExecutionOutcome, GeneratedItem, LlmError, ToolRegistration, ToolRunInput, ToolRunOutput};
    use crate::model::{InputEnvelope, SessionId};
    use crate::persistence::InMemoryStore;
    use async_trait::async_trait;

    struct StubTool;

    #[async_trait]
    impl ToolBody for StubTool {
        fn registration(&self) -> ToolRegistration {
            ToolRegistration {
                tool_type: "tweet".into(),
                content_type: "tweet_draft".into(),
                requires_approval: true,
                requires_scheduling: true,
                required_collaborators: vec![],
            }
        }

        async fn run(&self, input: ToolRunInput) -> CoreResult<ToolRunOutput> {
            Ok(ToolRunOutput {
                parameters: input.parameters,
                items: vec![],
                schedule_request: None,
            })
        }

        async fn generate_content(&self, _parameters: &serde_json::Value, count: u32) -> CoreResult<Vec<GeneratedItem>> {
            Ok((0..count)
                .map(|i| GeneratedItem {
                    content: serde_json::json!({ "i": i }),
                    raw_content: format!("regenerated draft {i}"),
                })
                .collect())
        }

        async fn execute_scheduled_operation(&self, _item: &ToolItem) -> CoreResult<ExecutionOutcome> {
            Ok(ExecutionOutcome::ok(serde_json::json!({})))
        }
    }

    struct FixedClassifier(ClassificationReply);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _request: ClassificationRequest) -> Result<ClassificationReply, LlmError> {
            Ok(self.0.clone())
        }
    }

    fn reply(action: ClassifiedAction, approved_indices: Vec<u32>, regenerate_indices: Vec<u32>) -> ClassificationReply {
        ClassificationReply {
            action,
            approved_indices,
            regenerate_indices,
            rationale: "test".into(),
        }
    }

    async fn setup(n: u32) -> (Arc<InMemoryStore>, ToolStateManager, ApprovalManager, ToolOperation) {
        let store = Arc::new(InMemoryStore::new());
        let tool_state = ToolStateManager::new(store.clone());
        let approval = ApprovalManager::new(store.clone());
        let session = SessionId::new();
        let op = tool_state
            .start_operation(session, "tweet", "tweet_draft", InputEnvelope::new("go", serde_json::json!({})), true, true)
            .await
            .unwrap();
        let items: Vec<ToolItem> = (0..n)
            .map(|i| ToolItem::new(op.operation_id, session, "tweet_draft", serde_json::json!({ "i": i }), format!("draft {i}")))
            .collect();
        store.insert_items(items).await.unwrap();
        (store, tool_state, approval, op)
    }

    #[tokio::test]
    async fn enter_approving_presents_collecting_items_in_approving_state() {
        let (store, tool_state, approval, mut op) = setup(3).await;
        let outcome = approval.enter_approving(&tool_state, &mut op).await.unwrap();
        match outcome {
            ApprovalOutcome::AwaitingApproval { items } => assert_eq!(items.len(), 3),
            other => panic!("expected AwaitingApproval, got {other:?}"),
        }
        assert_eq!(op.state, OperationState::Approving);
        let items = store.get_items(op.operation_id, None, None).await.unwrap();
        assert!(items.iter().all(|i| i.state == ItemState::Approving && i.status == ItemStatus::Pending));
    }

    #[tokio::test]
    async fn full_approval_moves_items_to_executing_and_operation_proceeds() {
        let (store, tool_state, approval, mut op) = setup(2).await;
        approval.enter_approving(&tool_state, &mut op).await.unwrap();
        let config = RuntimeConfig::default();
        let classifier = FixedClassifier(reply(ClassifiedAction::FullApproval, vec![], vec![]));
        let outcome = approval
            .handle_reply(&tool_state, &mut op, "approve all", &classifier, &StubTool, &config)
            .await
            .unwrap();
        assert!(matches!(outcome, ApprovalOutcome::Proceeding));
        assert_eq!(op.state, OperationState::Executing);
        let items = store.get_items(op.operation_id, None, None).await.unwrap();
        assert!(items.iter().all(|i| i.state == ItemState::Executing && i.status == ItemStatus::Approved));
    }

    #[tokio::test]
    async fn partial_approval_regenerates_exactly_the_requested_count() {
        let (store, tool_state, approval, mut op) = setup(3).await;
        approval.enter_approving(&tool_state, &mut op).await.unwrap();
        let config = RuntimeConfig::default();
        let classifier = FixedClassifier(reply(ClassifiedAction::PartialApproval, vec![1], vec![2, 3]));
        let outcome = approval
            .handle_reply(&tool_state, &mut op, "approve 1, redo 2 and 3", &classifier, &StubTool, &config)
            .await
            .unwrap();
        match outcome {
            ApprovalOutcome::AwaitingApproval { items } => assert_eq!(items.len(), 2),
            other => panic!("expected AwaitingApproval, got {other:?}"),
        }
        assert_eq!(op.regeneration_rounds, 1);
        assert_eq!(op.state, OperationState::Approving);

        let all_items = store.get_items(op.operation_id, None, None).await.unwrap();
        assert_eq!(all_items.len(), 5, "3 original + 2 regenerated");
        let approved = all_items
            .iter()
            .filter(|i| i.state == ItemState::Executing && i.status == ItemStatus::Approved)
            .count();
        let rejected = all_items
            .iter()
            .filter(|i| i.state == ItemState::Completed && i.status == ItemStatus::Rejected)
            .count();
        assert_eq!(approved, 1);
        assert_eq!(rejected, 2);
    }

    #[tokio::test]
    async fn overlapping_partition_indices_are_rejected_as_malformed() {
        let (_store, tool_state, approval, mut op) = setup(3).await;
        approval.enter_approving(&tool_state, &mut op).await.unwrap();
        let config = RuntimeConfig::default();
        let classifier = FixedClassifier(reply(ClassifiedAction::PartialApproval, vec![1, 2], vec![2, 3]));
        let outcome = approval
            .handle_reply(&tool_state, &mut op, "weird reply", &classifier, &StubTool, &config)
            .await
            .unwrap();
        assert!(matches!(outcome, ApprovalOutcome::ClarificationNeeded { .. }));
        assert_eq!(op.malformed_classifications, 1);
        assert_eq!(op.state, OperationState::Approving, "a malformed reply must not move state");
    }

    #[tokio::test]
    async fn two_consecutive_malformed_replies_end_the_operation_in_error() {
        let (store, tool_state, approval, mut op) = setup(2).await;
        approval.enter_approving(&tool_state, &mut op).await.unwrap();
        let config = RuntimeConfig::default();
        let bad = FixedClassifier(reply(ClassifiedAction::PartialApproval, vec![1, 2], vec![2]));

        let first = approval.handle_reply(&tool_state, &mut op, "?", &bad, &StubTool, &config).await.unwrap();
        assert!(matches!(first, ApprovalOutcome::ClarificationNeeded { .. }));

        let second = approval.handle_reply(&tool_state, &mut op, "?", &bad, &StubTool, &config).await.unwrap();
        assert!(matches!(second, ApprovalOutcome::Failed { .. }));

        let stored = store.get_operation_by_id(op.operation_id).await.unwrap().unwrap();
        assert_eq!(stored.state, OperationState::Error);
    }

    #[tokio::test]
    async fn cancel_marks_items_cancelled_and_ends_operation() {
        let (store, tool_state, approval, mut op) = setup(2).await;
        approval.enter_approving(&tool_state, &mut op).await.unwrap();
        let config = RuntimeConfig::default();
        let classifier = FixedClassifier(reply(ClassifiedAction::Cancel, vec![], vec![]));
        let outcome = approval
            .handle_reply(&tool_state, &mut op, "cancel", &classifier, &StubTool, &config)
            .await
            .unwrap();
        assert!(matches!(outcome, ApprovalOutcome::Cancelled));

        let stored = store.get_operation_by_id(op.operation_id).await.unwrap().unwrap();
        assert_eq!(stored.state, OperationState::Cancelled);
        assert_eq!(stored.end_reason.as_deref(), Some("user_cancel"));
        let items = store.get_items(op.operation_id, None, None).await.unwrap();
        assert!(items.iter().all(|i| i.state == ItemState::Cancelled && i.status == ItemStatus::Rejected));
    }

    #[tokio::test]
    async fn max_regeneration_rounds_forces_cancel() {
        let (_store, tool_state, approval, mut op) = setup(2).await;
        approval.enter_approving(&tool_state, &mut op).await.unwrap();
        let mut config = RuntimeConfig::default();
        config.max_regeneration_rounds = 1;
        let classifier = FixedClassifier(reply(ClassifiedAction::RegenerateAll, vec![], vec![]));

        let first = approval
            .handle_reply(&tool_state, &mut op, "redo", &classifier, &StubTool, &config)
            .await
            .unwrap();
        assert!(matches!(first, ApprovalOutcome::AwaitingApproval { .. }));
        assert_eq!(op.regeneration_rounds, 1);

        let second = approval
            .handle_reply(&tool_state, &mut op, "redo", &classifier, &StubTool, &config)
            .await
            .unwrap();
        assert!(matches!(second, ApprovalOutcome::Cancelled));
    }
}

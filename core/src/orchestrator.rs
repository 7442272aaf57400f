//! Orchestrator (§4.8): the per-message entry point for tool flow.
//!
//! Grounded in the teacher's `agent::session::session::Session::run`
//! dispatch loop, generalized from driving one cognitive engine to
//! registry-driven tool dispatch with collaborator injection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::approval::{ApprovalManager, ApprovalOutcome};
use crate::config::RuntimeConfig;
use crate::contracts::{Classifier, ToolBody, ToolRunInput};
use crate::error::{CoreError, CoreResult};
use crate::model::{InputEnvelope, ItemState, ItemStatus, OperationState, SessionId, ToolItem};
use crate::persistence::PersistenceStore;
use crate::registry::ToolRegistry;
use crate::schedule_manager::ScheduleManager;
use crate::tool_state::{ContentUpdates, ToolStateManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorStatus {
    InProgress,
    Completed,
    Cancelled,
    Error,
    Exit,
}

/// Standard reply envelope marshaled back to the agent integrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub status: OrchestratorReplyStatus,
    pub state: OperationState,
    pub response: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorReplyStatus {
    AwaitingApproval,
    InProgress,
    Completed,
    Cancelled,
    Error,
}

impl OrchestratorReplyStatus {
    pub fn to_agent_status(self) -> OrchestratorStatus {
        match self {
            OrchestratorReplyStatus::Completed => OrchestratorStatus::Completed,
            OrchestratorReplyStatus::Cancelled => OrchestratorStatus::Cancelled,
            OrchestratorReplyStatus::Error => OrchestratorStatus::Error,
            OrchestratorReplyStatus::AwaitingApproval | OrchestratorReplyStatus::InProgress => {
                OrchestratorStatus::InProgress
            }
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn PersistenceStore>,
    registry: Arc<ToolRegistry>,
    tool_state: Arc<ToolStateManager>,
    approval_manager: Arc<ApprovalManager>,
    schedule_manager: Arc<ScheduleManager>,
    config: RuntimeConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        registry: Arc<ToolRegistry>,
        tool_state: Arc<ToolStateManager>,
        approval_manager: Arc<ApprovalManager>,
        schedule_manager: Arc<ScheduleManager>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            registry,
            tool_state,
            approval_manager,
            schedule_manager,
            config,
        }
    }

    pub async fn handle_message(
        &self,
        session_id: SessionId,
        tool_type: &str,
        message: &str,
        classifier: &dyn Classifier,
    ) -> CoreResult<ReplyEnvelope> {
        let registration = self.registry.registration(tool_type)?;
        let tool = self.registry.get(tool_type)?;

        let existing = self.store.get_operation_by_session(session_id).await?;
        match existing {
            None => self.start_fresh(session_id, tool_type, &registration, tool.as_ref(), message).await,
            Some(mut operation) => match operation.state {
                OperationState::Approving => {
                    let outcome = self
                        .approval_manager
                        .handle_reply(&self.tool_state, &mut operation, message, classifier, tool.as_ref(), &self.config)
                        .await?;
                    self.reply_for_approval_outcome(&mut operation, outcome, tool.as_ref()).await
                }
                OperationState::Collecting => self.continue_collecting(&mut operation, tool.as_ref(), message).await,
                OperationState::Executing => Ok(ReplyEnvelope {
                    status: OrchestratorReplyStatus::InProgress,
                    state: operation.state,
                    response: "Still working on that — I'll let you know when it's done.".into(),
                    data: serde_json::Value::Null,
                }),
                other => Err(CoreError::IllegalStateTransition {
                    operation_id: operation.operation_id,
                    from: other.to_string(),
                    to: "dispatch".into(),
                }),
            },
        }
    }

    async fn start_fresh(
        &self,
        session_id: SessionId,
        tool_type: &str,
        registration: &crate::contracts::ToolRegistration,
        tool: &dyn ToolBody,
        message: &str,
    ) -> CoreResult<ReplyEnvelope> {
        let run_output = tool
            .run(ToolRunInput {
                command: message.to_string(),
                parameters: serde_json::Value::Null,
            })
            .await?;

        let mut operation = self
            .tool_state
            .start_operation(
                session_id,
                tool_type,
                registration.content_type.clone(),
                InputEnvelope::new(message, run_output.parameters),
                registration.requires_approval,
                registration.requires_scheduling,
            )
            .await?;

        let items: Vec<ToolItem> = run_output
            .items
            .into_iter()
            .map(|g| ToolItem::new(operation.operation_id, session_id, &operation.content_type, g.content, g.raw_content))
            .collect();
        let pending_ids: Vec<_> = items.iter().map(|i| i.item_id).collect();
        self.store.insert_items(items).await?;
        self.tool_state
            .update_operation(
                operation.operation_id,
                None,
                None,
                Some(ContentUpdates {
                    pending_item_ids: Some(pending_ids),
                    ..Default::default()
                }),
            )
            .await?;
        operation = self
            .store
            .get_operation_by_id(operation.operation_id)
            .await?
            .ok_or(CoreError::OperationNotFound {
                operation_id: operation.operation_id,
            })?;

        let outcome = self.approval_manager.enter_approving(&self.tool_state, &mut operation).await?;

        if !registration.requires_approval {
            // Auto-approve: the state machine still passes through
            // APPROVING, but no user round-trip is required.
            let items = self
                .tool_state
                .get_operation_items(operation.operation_id, Some(ItemState::Approving), None)
                .await?;
            let approved = self
                .approval_manager
                .apply_action(
                    &self.tool_state,
                    &mut operation,
                    crate::approval::ApprovalAction::FullApproval,
                    &items,
                    tool,
                    &self.config,
                )
                .await?;
            return self.reply_for_approval_outcome(&mut operation, approved, tool).await;
        }

        self.reply_for_approval_outcome(&mut operation, outcome, tool).await
    }

    async fn continue_collecting(
        &self,
        operation: &mut crate::model::ToolOperation,
        tool: &dyn ToolBody,
        message: &str,
    ) -> CoreResult<ReplyEnvelope> {
        let run_output = tool
            .run(ToolRunInput {
                command: message.to_string(),
                parameters: operation.input.parameters.clone(),
            })
            .await?;
        operation.input.parameters = run_output.parameters;

        let new_items: Vec<ToolItem> = run_output
            .items
            .into_iter()
            .map(|g| ToolItem::new(operation.operation_id, operation.session_id, &operation.content_type, g.content, g.raw_content))
            .collect();
        let new_ids: Vec<_> = new_items.iter().map(|i| i.item_id).collect();
        if !new_items.is_empty() {
            self.store.insert_items(new_items).await?;
        }

        let outcome = self.approval_manager.enter_approving(&self.tool_state, operation).await?;
        if !new_ids.is_empty() {
            // Deferred until after `enter_approving`'s transition has persisted
            // the in-memory `input.parameters` update above — `update_operation`
            // re-fetches from the store and would otherwise clobber it.
            let pending: Vec<_> = operation.output.pending_item_ids.iter().copied().chain(new_ids).collect();
            *operation = self
                .tool_state
                .update_operation(
                    operation.operation_id,
                    None,
                    None,
                    Some(ContentUpdates {
                        pending_item_ids: Some(pending),
                        ..Default::default()
                    }),
                )
                .await?;
        }
        self.reply_for_approval_outcome(operation, outcome, tool).await
    }

    async fn reply_for_approval_outcome(
        &self,
        operation: &mut crate::model::ToolOperation,
        outcome: ApprovalOutcome,
        tool: &dyn ToolBody,
    ) -> CoreResult<ReplyEnvelope> {
        match outcome {
            ApprovalOutcome::AwaitingApproval { items } => Ok(ReplyEnvelope {
                status: OrchestratorReplyStatus::AwaitingApproval,
                state: operation.state,
                response: present_items(&items),
                data: serde_json::json!({ "items": items }),
            }),
            ApprovalOutcome::Proceeding => self.finalize_execution(operation, tool).await,
            ApprovalOutcome::Cancelled => Ok(ReplyEnvelope {
                status: OrchestratorReplyStatus::Cancelled,
                state: operation.state,
                response: "Cancelled.".into(),
                data: serde_json::Value::Null,
            }),
            ApprovalOutcome::Failed { reason } => Ok(ReplyEnvelope {
                status: OrchestratorReplyStatus::Error,
                state: operation.state,
                response: format!("I couldn't continue with that: {reason}"),
                data: serde_json::Value::Null,
            }),
            ApprovalOutcome::ClarificationNeeded { message } => Ok(ReplyEnvelope {
                status: OrchestratorReplyStatus::AwaitingApproval,
                state: operation.state,
                response: message,
                data: serde_json::Value::Null,
            }),
        }
    }

    /// Operation is `EXECUTING` with approved items; hands off to the
    /// Schedule Manager or executes synchronously.
    async fn finalize_execution(
        &self,
        operation: &mut crate::model::ToolOperation,
        tool: &dyn ToolBody,
    ) -> CoreResult<ReplyEnvelope> {
        let registration = self.registry.registration(&operation.tool_type)?;

        if registration.requires_scheduling {
            let run_output = tool
                .run(ToolRunInput {
                    command: operation.input.command.clone(),
                    parameters: operation.input.parameters.clone(),
                })
                .await?;
            let Some(request) = run_output.schedule_request else {
                return Err(CoreError::UnsupportedCapability {
                    tool_type: operation.tool_type.clone(),
                    capability: "schedule_request",
                });
            };
            let schedule_id = self
                .schedule_manager
                .initialize_schedule(operation.operation_id, operation.session_id, &operation.content_type, request)
                .await?;
            self.schedule_manager
                .activate_schedule(&self.tool_state, operation.operation_id, schedule_id)
                .await?;
            return Ok(ReplyEnvelope {
                status: OrchestratorReplyStatus::InProgress,
                state: operation.state,
                response: "Scheduled.".into(),
                data: serde_json::json!({ "schedule_id": schedule_id }),
            });
        }

        let items = self
            .tool_state
            .get_operation_items(operation.operation_id, Some(ItemState::Executing), Some(ItemStatus::Approved))
            .await?;
        let mut last_response = None;
        for item in &items {
            let outcome = tool.execute_scheduled_operation(item).await;
            match outcome {
                Ok(outcome) if outcome.success => {
                    last_response = outcome.api_response.clone();
                    self.schedule_manager
                        .update_item_execution_status(
                            &self.tool_state,
                            &self.config,
                            item.item_id,
                            ItemStatus::Executed,
                            outcome.api_response,
                            None,
                            false,
                        )
                        .await?;
                }
                Ok(outcome) => {
                    let transient = outcome.transient;
                    self.schedule_manager
                        .update_item_execution_status(
                            &self.tool_state,
                            &self.config,
                            item.item_id,
                            ItemStatus::Failed,
                            None,
                            outcome.error,
                            transient,
                        )
                        .await?;
                }
                Err(err) => {
                    self.schedule_manager
                        .update_item_execution_status(
                            &self.tool_state,
                            &self.config,
                            item.item_id,
                            ItemStatus::Failed,
                            None,
                            Some(err.to_string()),
                            true,
                        )
                        .await?;
                }
            }
        }

        let refreshed = self.tool_state.list_operation_items(operation.operation_id).await?;
        let aggregate = ToolStateManager::aggregate_status(&refreshed);
        let end_status = match aggregate {
            crate::model::OperationStatus::Executed => crate::model::EndStatus::Approved,
            crate::model::OperationStatus::Failed => crate::model::EndStatus::Failed,
            _ => return Ok(ReplyEnvelope {
                status: OrchestratorReplyStatus::InProgress,
                state: operation.state,
                response: "Working on it.".into(),
                data: serde_json::Value::Null,
            }),
        };
        *operation = self
            .tool_state
            .end_operation_with_status(operation.operation_id, end_status, Some(aggregate), None, last_response.clone())
            .await?;

        Ok(ReplyEnvelope {
            status: if end_status == crate::model::EndStatus::Approved {
                OrchestratorReplyStatus::Completed
            } else {
                OrchestratorReplyStatus::Error
            },
            state: operation.state,
            response: "Done.".into(),
            data: last_response.unwrap_or(serde_json::Value::Null),
        })
    }
}

fn present_items(items: &[ToolItem]) -> String {
    let mut out = String::from("Please review:\n");
    for (i, item) in items.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, item.raw_content));
    }
    out
}

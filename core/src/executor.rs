//! Schedule Executor (§4.6): a single long-lived background worker with
//! two independent-cadence duties, a due-time sweeper and a monitor
//! sweeper. Grounded in the teacher's `scheduler/daemon.rs::SchedulerDaemon`
//! tick loop (`start_loop`/`tick`/`is_due`), generalized from one
//! interval-job runner into two concurrent sweeps plus stale-claim
//! reclaim.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::CoreResult;
use crate::model::{EndStatus, ItemState, ItemStatus};
use crate::persistence::PersistenceStore;
use crate::registry::ToolRegistry;
use crate::schedule_manager::ScheduleManager;
use crate::tool_state::ToolStateManager;

pub struct ScheduleExecutor {
    store: Arc<dyn PersistenceStore>,
    registry: Arc<ToolRegistry>,
    tool_state: Arc<ToolStateManager>,
    schedule_manager: Arc<ScheduleManager>,
    config: RuntimeConfig,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ScheduleExecutor {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        registry: Arc<ToolRegistry>,
        tool_state: Arc<ToolStateManager>,
        schedule_manager: Arc<ScheduleManager>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            tool_state,
            schedule_manager,
            config,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Starts the due-time sweeper and monitor sweeper as independent
    /// background tasks. Idempotent only in the sense that calling it
    /// twice spawns a second pair of loops — callers own the lifecycle.
    pub async fn start(self: &Arc<Self>) {
        let due = {
            let this = self.clone();
            tokio::spawn(async move { this.due_sweep_loop().await })
        };
        let monitor = {
            let this = self.clone();
            tokio::spawn(async move { this.monitor_sweep_loop().await })
        };
        self.handles.lock().await.extend([due, monitor]);
        info!("schedule executor started");
    }

    /// Signals both loops to stop and waits for them to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        info!("schedule executor stopped");
    }

    async fn due_sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval.as_duration());
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.due_sweep_tick().await {
                        error!(%err, "due-time sweep failed");
                    }
                    if let Err(err) = self.reclaim_stale_claims().await {
                        error!(%err, "stale-claim reclaim failed");
                    }
                }
            }
        }
    }

    async fn monitor_sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval.as_duration());
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.monitor_sweep_tick().await {
                        error!(%err, "monitor sweep failed");
                    }
                }
            }
        }
    }

    /// One due-time sweep: claim, execute, report — atomic per item.
    async fn due_sweep_tick(&self) -> CoreResult<()> {
        let due = self.store.list_due_items(Utc::now()).await?;
        for item in due {
            let claimed = self
                .store
                .compare_and_swap_item_status(item.item_id, ItemStatus::Scheduled, ItemStatus::ExecutingClaimed)
                .await?;
            if !claimed {
                continue;
            }

            let tool = match self.tool_for_operation(item.operation_id).await {
                Ok(tool) => tool,
                Err(err) => {
                    warn!(item_id = %item.item_id, %err, "no tool for claimed item");
                    continue;
                }
            };

            let outcome = tool.execute_scheduled_operation(&item).await;
            match outcome {
                Ok(outcome) if outcome.success => {
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
        Ok(())
    }

    /// Reclaims `EXECUTING_CLAIMED` items whose claim has outlived
    /// `claim_timeout` back to `SCHEDULED` so another tick can retry them.
    async fn reclaim_stale_claims(&self) -> CoreResult<()> {
        let stale = self.store.list_items_by_status(ItemStatus::ExecutingClaimed).await?;
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.claim_timeout.as_duration()).unwrap_or_default();
        for item in stale {
            if item.updated_at <= cutoff {
                self.store
                    .compare_and_swap_item_status(item.item_id, ItemStatus::ExecutingClaimed, ItemStatus::Scheduled)
                    .await?;
            }
        }
        Ok(())
    }

    /// Checks each active monitoring schedule's condition, and separately
    /// its deadline.
    async fn monitor_sweep_tick(&self) -> CoreResult<()> {
        let monitors = self.store.list_active_monitors().await?;
        let now = Utc::now();
        for schedule in monitors {
            let Some(expiration_timestamp) = schedule.monitoring.as_ref().map(|m| m.expiration_timestamp) else {
                continue;
            };

            if now >= expiration_timestamp {
                let items = self.tool_state.list_operation_items(schedule.operation_id).await?;
                let pending: Vec<_> = items
                    .iter()
                    .filter(|i| !i.status.is_terminal())
                    .map(|i| i.item_id)
                    .collect();
                self.tool_state
                    .update_operation_items(&pending, ItemState::Error, ItemStatus::Failed)
                    .await?;
                self.tool_state
                    .end_operation(
                        schedule.operation_id,
                        EndStatus::Failed,
                        Some("expired".into()),
                        None,
                    )
                    .await?;
                let mut schedule = schedule;
                schedule.state = crate::model::ScheduleState::Completed;
                self.store.update_schedule(schedule).await?;
                continue;
            }

            let tool = match self.tool_for_operation(schedule.operation_id).await {
                Ok(tool) => tool,
                Err(_) => continue,
            };
            let fires = tool.check_condition(&schedule).await.unwrap_or(false);
            if !fires {
                continue;
            }

            let items = self.tool_state.list_operation_items(schedule.operation_id).await?;
            let Some(next) = items.into_iter().find(|i| !i.status.is_terminal()) else {
                continue;
            };
            let outcome = tool.execute_scheduled_operation(&next).await;
            match outcome {
                Ok(outcome) if outcome.success => {
                    self.schedule_manager
                        .update_item_execution_status(
                            &self.tool_state,
                            &self.config,
                            next.item_id,
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
                            next.item_id,
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
                            next.item_id,
                            ItemStatus::Failed,
                            None,
                            Some(err.to_string()),
                            true,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }
}

impl ScheduleExecutor {
    async fn tool_for_operation(&self, operation_id: crate::model::OperationId) -> CoreResult<Arc<dyn crate::contracts::ToolBody>> {
        let operation = self
            .store
            .get_operation_by_id(operation_id)
            .await?
            .ok_or(crate::error::CoreError::OperationNotFound { operation_id })?;
        self.registry.get(&operation.tool_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurationSecs;
    use crate::contracts::{ExecutionOutcome, GeneratedItem, ToolRegistration, ToolRunInput, ToolRunOutput};
    use crate::model::{InputEnvelope, OperationId, OperationState, Schedule, ScheduleState, SessionId, TimingParams, ToolItem};
    use crate::persistence::InMemoryStore;
    use async_trait::async_trait;

    struct FixedOutcomeTool {
        succeed: bool,
        /// Ignored when `succeed`; otherwise threaded into the failed
        /// `ExecutionOutcome` to drive retry-vs-terminal handling.
        transient: bool,
    }

    #[async_trait]
    impl crate::contracts::ToolBody for FixedOutcomeTool {
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

        async fn generate_content(&self, _parameters: &serde_json::Value, _count: u32) -> CoreResult<Vec<GeneratedItem>> {
            Ok(vec![])
        }

        async fn execute_scheduled_operation(&self, _item: &ToolItem) -> CoreResult<ExecutionOutcome> {
            if self.succeed {
                Ok(ExecutionOutcome::ok(serde_json::json!({"posted": true})))
            } else {
                Ok(ExecutionOutcome::failed("rate limited", self.transient))
            }
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        executor: Arc<ScheduleExecutor>,
        operation_id: OperationId,
    }

    async fn fixture(tool: FixedOutcomeTool, claim_timeout: DurationSecs) -> (Fixture, crate::model::ItemId) {
        let store = Arc::new(InMemoryStore::new());
        let tool_state = Arc::new(ToolStateManager::new(store.clone()));
        let schedule_manager = Arc::new(ScheduleManager::new(store.clone()));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(tool));
        let mut config = RuntimeConfig::default();
        config.claim_timeout = claim_timeout;
        let executor = ScheduleExecutor::new(store.clone(), Arc::new(registry), tool_state.clone(), schedule_manager.clone(), config);

        let session = SessionId::new();
        let mut op = tool_state
            .start_operation(session, "tweet", "tweet_draft", InputEnvelope::new("go", serde_json::json!({})), true, true)
            .await
            .unwrap();
        tool_state.transition(&mut op, OperationState::Approving, "approving").await.unwrap();
        tool_state.transition(&mut op, OperationState::Executing, "executing").await.unwrap();

        let item = ToolItem::new(op.operation_id, session, "tweet_draft", serde_json::json!({}), "draft");
        let item_id = item.item_id;
        store.insert_items(vec![item]).await.unwrap();
        store
            .update_items_state(&[item_id], ItemState::Executing, ItemStatus::Approved)
            .await
            .unwrap();

        let mut schedule = Schedule::new_timed(
            op.operation_id,
            session,
            "tweet_draft",
            crate::model::ScheduleType::OneTime,
            TimingParams {
                start_time: Utc::now(),
                interval_secs: None,
                total_items: None,
            },
        );
        schedule.state = ScheduleState::Active;
        let schedule_id = schedule.schedule_id;
        store.create_schedule(schedule).await.unwrap();
        store
            .schedule_item(item_id, schedule_id, Utc::now() - chrono::Duration::seconds(5))
            .await
            .unwrap();

        (
            Fixture {
                store,
                executor,
                operation_id: op.operation_id,
            },
            item_id,
        )
    }

    #[tokio::test]
    async fn due_sweep_claims_executes_and_completes_a_single_item_operation() {
        let (fx, item_id) = fixture(FixedOutcomeTool { succeed: true, transient: false }, DurationSecs::from_secs(60)).await;
        fx.executor.due_sweep_tick().await.unwrap();

        let item = fx.store.get_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Executed);
        assert_eq!(item.state, ItemState::Completed);

        let operation = fx.store.get_operation_by_id(fx.operation_id).await.unwrap().unwrap();
        assert_eq!(operation.state, OperationState::Completed);
        assert_eq!(operation.output.status, Some(crate::model::OperationStatus::Executed));
    }

    #[tokio::test]
    async fn due_sweep_reschedules_a_failed_item_within_the_retry_budget() {
        let (fx, item_id) = fixture(FixedOutcomeTool { succeed: false, transient: true }, DurationSecs::from_secs(60)).await;
        fx.executor.due_sweep_tick().await.unwrap();

        let item = fx.store.get_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Scheduled, "transient failure retries rather than terminating");
        assert_eq!(item.retry_count, 1);
        assert!(item.scheduled_time.unwrap() > Utc::now());

        let operation = fx.store.get_operation_by_id(fx.operation_id).await.unwrap().unwrap();
        assert_eq!(operation.state, OperationState::Executing, "operation stays open while retries remain");
    }

    #[tokio::test]
    async fn due_sweep_terminates_a_permanent_failure_without_retry() {
        let (fx, item_id) = fixture(FixedOutcomeTool { succeed: false, transient: false }, DurationSecs::from_secs(60)).await;
        fx.executor.due_sweep_tick().await.unwrap();

        let item = fx.store.get_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed, "a permanent failure must not be rescheduled");
        assert_eq!(item.state, ItemState::Error);
        assert_eq!(item.retry_count, 0, "no retry attempt is consumed for a permanent failure");

        let operation = fx.store.get_operation_by_id(fx.operation_id).await.unwrap().unwrap();
        assert_eq!(operation.state, OperationState::Error);
        assert_eq!(operation.output.status, Some(crate::model::OperationStatus::Failed));
    }

    #[tokio::test]
    async fn reclaim_stale_claims_returns_expired_claims_to_scheduled() {
        let (fx, item_id) = fixture(FixedOutcomeTool { succeed: true, transient: false }, DurationSecs::from_secs(0)).await;
        let claimed = fx
            .store
            .compare_and_swap_item_status(item_id, ItemStatus::Scheduled, ItemStatus::ExecutingClaimed)
            .await
            .unwrap();
        assert!(claimed);

        fx.executor.reclaim_stale_claims().await.unwrap();

        let item = fx.store.get_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Scheduled, "an immediately-expired claim_timeout reclaims on the next sweep");
    }
}

//! Schedule Manager (§4.5): plans and tracks time/condition-based
//! realization of approved items.
//!
//! Time assignment and backoff math are grounded in the teacher's
//! `agent/runtime/impls/retry.rs::RetryConfig::delay_for_attempt`
//! (via [`crate::config::RuntimeConfig::backoff_for_attempt`]); the
//! tick/daemon shape this feeds is the Schedule Executor
//! ([`crate::executor`]), grounded in `scheduler/daemon.rs`.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::RuntimeConfig;
use crate::contracts::ScheduleRequest;
use crate::error::{CoreError, CoreResult};
use crate::model::{
    EndStatus, ItemState, ItemStatus, MonitoringParams, OperationId, OperationState, Schedule,
    ScheduleId, ScheduleState, SessionId, TimingParams,
};
use crate::persistence::PersistenceStore;
use crate::tool_state::ToolStateManager;

pub struct ScheduleManager {
    store: Arc<dyn PersistenceStore>,
}

impl ScheduleManager {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self { store }
    }

    /// Validates `schedule_info` and persists a `PENDING` schedule.
    pub async fn initialize_schedule(
        &self,
        operation_id: OperationId,
        session_id: SessionId,
        content_type: impl Into<String>,
        request: ScheduleRequest,
    ) -> CoreResult<ScheduleId> {
        let content_type = content_type.into();
        let schedule = match request {
            ScheduleRequest::OneTime { start_time } => Schedule::new_timed(
                operation_id,
                session_id,
                content_type,
                crate::model::ScheduleType::OneTime,
                TimingParams {
                    start_time,
                    interval_secs: None,
                    total_items: None,
                },
            ),
            ScheduleRequest::Multiple {
                start_time,
                interval_secs,
                total_items,
            } => Schedule::new_timed(
                operation_id,
                session_id,
                content_type,
                crate::model::ScheduleType::Multiple,
                TimingParams {
                    start_time,
                    interval_secs: Some(interval_secs),
                    total_items: Some(total_items),
                },
            ),
            ScheduleRequest::Recurring { start_time, interval_secs } => Schedule::new_timed(
                operation_id,
                session_id,
                content_type,
                crate::model::ScheduleType::Recurring,
                TimingParams {
                    start_time,
                    interval_secs: Some(interval_secs),
                    total_items: None,
                },
            ),
            ScheduleRequest::Monitoring {
                check_interval_secs,
                expiration_timestamp,
                condition,
            } => Schedule::new_monitoring(
                operation_id,
                session_id,
                content_type,
                MonitoringParams {
                    check_interval_secs,
                    expiration_timestamp,
                    condition,
                },
            ),
        };

        let schedule_id = schedule.schedule_id;
        self.store.create_schedule(schedule).await?;
        Ok(schedule_id)
    }

    /// Preconditions: operation `EXECUTING`, all items `EXECUTING/APPROVED`.
    /// Effects: schedule `ACTIVE`, items `SCHEDULED` with assigned times.
    pub async fn activate_schedule(
        &self,
        tool_state: &ToolStateManager,
        operation_id: OperationId,
        schedule_id: ScheduleId,
    ) -> CoreResult<bool> {
        let operation = self
            .store
            .get_operation_by_id(operation_id)
            .await?
            .ok_or(CoreError::OperationNotFound { operation_id })?;
        if operation.state != OperationState::Executing {
            return Ok(false);
        }

        let mut schedule = self
            .store
            .get_schedule(schedule_id)
            .await?
            .ok_or(CoreError::ScheduleNotFound { schedule_id })?;

        let mut items = tool_state
            .get_operation_items(operation_id, Some(ItemState::Executing), Some(ItemStatus::Approved))
            .await?;
        if items.is_empty() {
            return Ok(false);
        }
        // Deterministic ordering: creation order, then item id.
        items.sort_by_key(|i| (i.created_at, i.item_id));

        match (&schedule.timing, &schedule.monitoring) {
            (Some(timing), None) => {
                let interval = ChronoDuration::seconds(timing.interval_secs.unwrap_or(0));
                for (i, item) in items.iter().enumerate() {
                    let scheduled_time = timing.start_time + interval * i as i32;
                    self.store.schedule_item(item.item_id, schedule_id, scheduled_time).await?;
                }
            }
            (None, Some(monitoring)) => {
                for item in &items {
                    self.store
                        .schedule_item(item.item_id, schedule_id, monitoring.expiration_timestamp)
                        .await?;
                }
            }
            _ => return Ok(false),
        }

        schedule.state = ScheduleState::Active;
        schedule.approved_items = items.iter().map(|i| i.item_id).collect();
        schedule.pending_items.clear();
        schedule.updated_at = Utc::now();
        self.store.update_schedule(schedule).await?;
        Ok(true)
    }

    /// Records the outcome of one execution attempt and, on failure,
    /// reschedules with exponential backoff or marks the item terminal.
    ///
    /// `transient` distinguishes `ToolExecutionFailed(transient|permanent)`
    /// (§7): a transient failure retries per the backoff budget, a
    /// permanent one is marked `FAILED` immediately regardless of
    /// `retry_count`.
    pub async fn update_item_execution_status(
        &self,
        tool_state: &ToolStateManager,
        config: &RuntimeConfig,
        item_id: crate::model::ItemId,
        status: ItemStatus,
        api_response: Option<serde_json::Value>,
        error: Option<String>,
        transient: bool,
    ) -> CoreResult<()> {
        match status {
            ItemStatus::Executed => {
                self.store
                    .update_item_execution(item_id, ItemStatus::Executed, api_response, error)
                    .await?;
            }
            ItemStatus::Failed => {
                let item = self
                    .store
                    .get_item(item_id)
                    .await?
                    .ok_or(CoreError::StorageUnavailable {
                        message: format!("item {item_id} not found"),
                    })?;
                let retry_count = item.retry_count + 1;
                if transient && retry_count <= config.max_retries {
                    let delay = config.backoff_for_attempt(retry_count);
                    let next_time = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
                    self.store
                        .update_item_execution(item_id, ItemStatus::Scheduled, None, error)
                        .await?;
                    self.bump_retry_and_reschedule(item_id, retry_count, next_time).await?;
                } else {
                    self.store
                        .update_item_execution(item_id, ItemStatus::Failed, None, error)
                        .await?;
                }
            }
            other => {
                self.store.update_item_execution(item_id, other, api_response, error).await?;
            }
        }

        self.recompute_schedule_for_item(tool_state, item_id).await
    }

    async fn bump_retry_and_reschedule(
        &self,
        item_id: crate::model::ItemId,
        retry_count: u32,
        next_time: DateTime<Utc>,
    ) -> CoreResult<()> {
        // `update_item_execution` above set status; here we set the
        // retry-specific fields the trait doesn't expose directly.
        if let Some(mut item) = self.store.get_item(item_id).await? {
            item.retry_count = retry_count;
            item.scheduled_time = Some(next_time);
            item.status = ItemStatus::Scheduled;
            item.state = ItemState::Executing;
            self.store.insert_items(vec![item]).await?;
        }
        Ok(())
    }

    /// After an item update, recomputes the owning schedule's state via
    /// the §4.3 aggregate rule; completes the schedule and operation when
    /// every item has reached a terminal status.
    async fn recompute_schedule_for_item(&self, tool_state: &ToolStateManager, item_id: crate::model::ItemId) -> CoreResult<()> {
        let Some(item) = self.store.get_item(item_id).await? else {
            return Ok(());
        };
        let Some(schedule_id) = item.schedule_id else {
            return Ok(());
        };
        let Some(mut schedule) = self.store.get_schedule(schedule_id).await? else {
            return Ok(());
        };

        let items = tool_state.list_operation_items(item.operation_id).await?;
        let owned: Vec<_> = items.into_iter().filter(|i| i.schedule_id == Some(schedule_id)).collect();
        if owned.iter().all(|i| i.status.is_terminal()) {
            schedule.state = ScheduleState::Completed;
            schedule.updated_at = Utc::now();
            self.store.update_schedule(schedule).await?;

            let aggregate = ToolStateManager::aggregate_status(&owned);
            let end_status = match aggregate {
                crate::model::OperationStatus::Executed => EndStatus::Approved,
                crate::model::OperationStatus::Failed => EndStatus::Failed,
                _ => EndStatus::Rejected,
            };
            tool_state
                .end_operation_with_status(item.operation_id, end_status, Some(aggregate), None, None)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InputEnvelope, ScheduleType};
    use crate::persistence::InMemoryStore;

    fn managers() -> (Arc<InMemoryStore>, ToolStateManager, ScheduleManager) {
        let store = Arc::new(InMemoryStore::new());
        let tool_state = ToolStateManager::new(store.clone());
        let schedule_manager = ScheduleManager::new(store.clone());
        (store, tool_state, schedule_manager)
    }

    #[tokio::test]
    async fn activation_assigns_times_spaced_by_interval() {
        let (store, tool_state, schedule_manager) = managers();
        let session = SessionId::new();
        let mut op = tool_state
            .start_operation(
                session,
                "tweet",
                "tweet_draft",
                InputEnvelope::new("go", serde_json::json!({})),
                true,
                true,
            )
            .await
            .unwrap();

        let item1 = crate::model::ToolItem::new(op.operation_id, session, "tweet_draft", serde_json::json!({}), "a");
        let item2 = crate::model::ToolItem::new(op.operation_id, session, "tweet_draft", serde_json::json!({}), "b");
        let ids = vec![item1.item_id, item2.item_id];
        store.insert_items(vec![item1, item2]).await.unwrap();
        store
            .update_items_state(&ids, ItemState::Executing, ItemStatus::Approved)
            .await
            .unwrap();

        tool_state
            .transition(&mut op, OperationState::Approving, "approving")
            .await
            .unwrap();
        tool_state
            .transition(&mut op, OperationState::Executing, "executing")
            .await
            .unwrap();

        let start = Utc::now();
        let schedule_id = schedule_manager
            .initialize_schedule(
                op.operation_id,
                session,
                "tweet_draft",
                ScheduleRequest::Multiple {
                    start_time: start,
                    interval_secs: 30,
                    total_items: 2,
                },
            )
            .await
            .unwrap();

        let activated = schedule_manager
            .activate_schedule(&tool_state, op.operation_id, schedule_id)
            .await
            .unwrap();
        assert!(activated);

        let schedule = store.get_schedule(schedule_id).await.unwrap().unwrap();
        assert_eq!(schedule.state, ScheduleState::Active);
        assert_eq!(schedule.schedule_type, ScheduleType::Multiple);

        let items = tool_state.list_operation_items(op.operation_id).await.unwrap();
        let mut times: Vec<_> = items.iter().filter_map(|i| i.scheduled_time).collect();
        times.sort();
        assert_eq!(times.len(), 2);
        assert_eq!((times[1] - times[0]).num_seconds(), 30);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retry_and_terminates_immediately() {
        let (store, tool_state, schedule_manager) = managers();
        let session = SessionId::new();
        let op = tool_state
            .start_operation(session, "tweet", "tweet_draft", InputEnvelope::new("go", serde_json::json!({})), true, true)
            .await
            .unwrap();
        let item = crate::model::ToolItem::new(op.operation_id, session, "tweet_draft", serde_json::json!({}), "a");
        let item_id = item.item_id;
        store.insert_items(vec![item]).await.unwrap();

        let config = RuntimeConfig::default();
        schedule_manager
            .update_item_execution_status(
                &tool_state,
                &config,
                item_id,
                ItemStatus::Failed,
                None,
                Some("invalid parameters".into()),
                false,
            )
            .await
            .unwrap();

        let item = store.get_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.state, ItemState::Error);
        assert_eq!(item.retry_count, 0, "a permanent failure never consumes a retry attempt");
    }

    #[tokio::test]
    async fn transient_failure_reschedules_within_retry_budget() {
        let (store, tool_state, schedule_manager) = managers();
        let session = SessionId::new();
        let op = tool_state
            .start_operation(session, "tweet", "tweet_draft", InputEnvelope::new("go", serde_json::json!({})), true, true)
            .await
            .unwrap();
        let item = crate::model::ToolItem::new(op.operation_id, session, "tweet_draft", serde_json::json!({}), "a");
        let item_id = item.item_id;
        store.insert_items(vec![item]).await.unwrap();

        let config = RuntimeConfig::default();
        schedule_manager
            .update_item_execution_status(
                &tool_state,
                &config,
                item_id,
                ItemStatus::Failed,
                None,
                Some("rate limited".into()),
                true,
            )
            .await
            .unwrap();

        let item = store.get_item(item_id).await.unwrap().unwrap();
        assert_eq!(
            item.status,
            ItemStatus::Scheduled,
            "a transient failure within budget reschedules instead of terminating"
        );
        assert_eq!(item.retry_count, 1);
        assert!(item.scheduled_time.is_some());
    }
}

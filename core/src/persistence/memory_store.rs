//! In-process implementation of `PersistenceStore`.
//!
//! Grounded in the same `Arc<RwLock<HashMap<...>>>` shape the runtime uses
//! for its other shared, process-owned state (pending approvals, tool
//! registries): no disk I/O, just a guarded map, since no concrete
//! database driver is in scope for this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::model::{
    ItemId, ItemState, ItemStatus, Message, OperationId, OperationState, Schedule, ScheduleId,
    ScheduleState, ScheduleType, SessionId, ToolItem, ToolOperation,
};

use super::PersistenceStore;

#[derive(Default)]
struct Tables {
    messages: Vec<Message>,
    operations: HashMap<OperationId, ToolOperation>,
    items: HashMap<ItemId, ToolItem>,
    schedules: HashMap<ScheduleId, Schedule>,
}

/// Default, fully functional `PersistenceStore`. Safe to share across
/// tasks via `Arc`; internally guarded by a single `RwLock`.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn insert_message(&self, message: Message) -> CoreResult<()> {
        self.write().messages.push(message);
        Ok(())
    }

    async fn list_session_messages(&self, session_id: SessionId, limit: usize) -> CoreResult<Vec<Message>> {
        let tables = self.read();
        let mut out: Vec<Message> = tables
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        if out.len() > limit {
            out = out.split_off(out.len() - limit);
        }
        Ok(out)
    }

    async fn create_tool_operation(&self, operation: ToolOperation) -> CoreResult<()> {
        self.write().operations.insert(operation.operation_id, operation);
        Ok(())
    }

    async fn get_operation_by_session(&self, session_id: SessionId) -> CoreResult<Option<ToolOperation>> {
        Ok(self
            .read()
            .operations
            .values()
            .find(|op| op.session_id == session_id && !op.state.is_terminal())
            .cloned())
    }

    async fn get_operation_by_id(&self, operation_id: OperationId) -> CoreResult<Option<ToolOperation>> {
        Ok(self.read().operations.get(&operation_id).cloned())
    }

    async fn update_operation(
        &self,
        operation: ToolOperation,
        expected_state: Option<OperationState>,
    ) -> CoreResult<bool> {
        let mut tables = self.write();
        if let Some(expected) = expected_state {
            match tables.operations.get(&operation.operation_id) {
                Some(current) if current.state != expected => return Ok(false),
                None => {
                    return Err(CoreError::OperationNotFound {
                        operation_id: operation.operation_id,
                    })
                }
                _ => {}
            }
        }
        tables.operations.insert(operation.operation_id, operation);
        Ok(true)
    }

    async fn insert_items(&self, items: Vec<ToolItem>) -> CoreResult<()> {
        let mut tables = self.write();
        for item in items {
            tables.items.insert(item.item_id, item);
        }
        Ok(())
    }

    async fn get_items(
        &self,
        operation_id: OperationId,
        state: Option<ItemState>,
        status: Option<ItemStatus>,
    ) -> CoreResult<Vec<ToolItem>> {
        let tables = self.read();
        Ok(tables
            .items
            .values()
            .filter(|item| item.operation_id == operation_id)
            .filter(|item| state.map_or(true, |s| item.state == s))
            .filter(|item| status.map_or(true, |s| item.status == s))
            .cloned()
            .collect())
    }

    async fn get_item(&self, item_id: ItemId) -> CoreResult<Option<ToolItem>> {
        Ok(self.read().items.get(&item_id).cloned())
    }

    async fn update_items_state(
        &self,
        ids: &[ItemId],
        state: ItemState,
        status: ItemStatus,
    ) -> CoreResult<()> {
        let mut tables = self.write();
        for id in ids {
            if let Some(item) = tables.items.get_mut(id) {
                if item.is_immutable() {
                    continue;
                }
                item.state = state;
                item.status = status;
                item.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn update_item_execution(
        &self,
        item_id: ItemId,
        status: ItemStatus,
        api_response: Option<serde_json::Value>,
        error: Option<String>,
    ) -> CoreResult<ToolItem> {
        let mut tables = self.write();
        let item = tables
            .items
            .get_mut(&item_id)
            .ok_or(CoreError::StorageUnavailable {
                message: format!("item {item_id} not found"),
            })?;

        // Invariant 4: terminal items are immutable except `last_error`.
        if item.is_immutable() {
            if let Some(err) = error {
                item.last_error = Some(err);
            }
            return Ok(item.clone());
        }

        item.status = status;
        if let ItemStatus::Executed = status {
            item.state = ItemState::Completed;
            item.executed_time = Some(Utc::now());
        }
        if let ItemStatus::Failed = status {
            item.state = ItemState::Error;
        }
        if let Some(resp) = api_response {
            item.api_response = Some(resp);
        }
        if let Some(err) = error {
            item.last_error = Some(err);
        }
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn schedule_item(
        &self,
        item_id: ItemId,
        schedule_id: ScheduleId,
        scheduled_time: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut tables = self.write();
        if let Some(item) = tables.items.get_mut(&item_id) {
            item.schedule_id = Some(schedule_id);
            item.scheduled_time = Some(scheduled_time);
            item.status = ItemStatus::Scheduled;
            item.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn compare_and_swap_item_status(
        &self,
        item_id: ItemId,
        expected: ItemStatus,
        new: ItemStatus,
    ) -> CoreResult<bool> {
        let mut tables = self.write();
        match tables.items.get_mut(&item_id) {
            Some(item) if item.status == expected => {
                item.status = new;
                item.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CoreError::StorageUnavailable {
                message: format!("item {item_id} not found"),
            }),
        }
    }

    async fn list_items_by_status(&self, status: ItemStatus) -> CoreResult<Vec<ToolItem>> {
        Ok(self
            .read()
            .items
            .values()
            .filter(|item| item.status == status)
            .cloned()
            .collect())
    }

    async fn create_schedule(&self, schedule: Schedule) -> CoreResult<()> {
        self.write().schedules.insert(schedule.schedule_id, schedule);
        Ok(())
    }

    async fn get_schedule(&self, schedule_id: ScheduleId) -> CoreResult<Option<Schedule>> {
        Ok(self.read().schedules.get(&schedule_id).cloned())
    }

    async fn update_schedule(&self, schedule: Schedule) -> CoreResult<()> {
        self.write().schedules.insert(schedule.schedule_id, schedule);
        Ok(())
    }

    async fn list_due_items(&self, now: DateTime<Utc>) -> CoreResult<Vec<ToolItem>> {
        let tables = self.read();
        let mut due: Vec<ToolItem> = tables
            .items
            .values()
            .filter(|item| item.status == ItemStatus::Scheduled)
            .filter(|item| item.scheduled_time.is_some_and(|t| t <= now))
            .filter(|item| {
                item.schedule_id
                    .and_then(|sid| tables.schedules.get(&sid))
                    .is_some_and(|s| s.state == ScheduleState::Active)
            })
            .cloned()
            .collect();
        // §5 ordering: scheduled_time order, then item id within a tick.
        due.sort_by_key(|item| (item.scheduled_time, item.item_id));
        Ok(due)
    }

    async fn list_active_monitors(&self) -> CoreResult<Vec<Schedule>> {
        Ok(self
            .read()
            .schedules
            .values()
            .filter(|s| s.state == ScheduleState::Active && s.schedule_type == ScheduleType::Monitoring)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InputEnvelope, OperationState, Schedule, TimingParams, ToolOperation};

    fn op(session: SessionId) -> ToolOperation {
        ToolOperation::new(session, "tweet", "tweet_draft", InputEnvelope::new("go", serde_json::json!({})), true, true)
    }

    #[tokio::test]
    async fn update_operation_rejects_mismatched_expected_state() {
        let store = InMemoryStore::new();
        let mut operation = op(SessionId::new());
        operation.state = OperationState::Collecting;
        store.create_tool_operation(operation.clone()).await.unwrap();

        operation.state = OperationState::Approving;
        let applied = store
            .update_operation(operation.clone(), Some(OperationState::Executing))
            .await
            .unwrap();
        assert!(!applied, "stale expected_state must be rejected");

        let stored = store.get_operation_by_id(operation.operation_id).await.unwrap().unwrap();
        assert_eq!(stored.state, OperationState::Collecting, "rejected write must not mutate the row");

        let applied = store
            .update_operation(operation.clone(), Some(OperationState::Collecting))
            .await
            .unwrap();
        assert!(applied);
    }

    #[tokio::test]
    async fn terminal_item_is_immutable_except_last_error() {
        let store = InMemoryStore::new();
        let session = SessionId::new();
        let operation_id = OperationId::new();
        let mut item = ToolItem::new(operation_id, session, "tweet_draft", serde_json::json!({}), "hi");
        item.status = ItemStatus::Executed;
        item.state = ItemState::Completed;
        let item_id = item.item_id;
        store.insert_items(vec![item]).await.unwrap();

        store
            .update_items_state(&[item_id], ItemState::Cancelled, ItemStatus::Rejected)
            .await
            .unwrap();
        let unchanged = store.get_item(item_id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, ItemStatus::Executed);
        assert_eq!(unchanged.state, ItemState::Completed);

        let reported = store
            .update_item_execution(item_id, ItemStatus::Failed, None, Some("replay error".into()))
            .await
            .unwrap();
        assert_eq!(reported.status, ItemStatus::Executed, "status stays terminal");
        assert_eq!(reported.last_error.as_deref(), Some("replay error"));
    }

    #[tokio::test]
    async fn compare_and_swap_item_status_only_succeeds_on_match() {
        let store = InMemoryStore::new();
        let session = SessionId::new();
        let operation_id = OperationId::new();
        let mut item = ToolItem::new(operation_id, session, "tweet_draft", serde_json::json!({}), "hi");
        item.status = ItemStatus::Scheduled;
        let item_id = item.item_id;
        store.insert_items(vec![item]).await.unwrap();

        let ok = store
            .compare_and_swap_item_status(item_id, ItemStatus::Scheduled, ItemStatus::ExecutingClaimed)
            .await
            .unwrap();
        assert!(ok);

        let retry = store
            .compare_and_swap_item_status(item_id, ItemStatus::Scheduled, ItemStatus::ExecutingClaimed)
            .await
            .unwrap();
        assert!(!retry, "a second claim against the stale expected status must fail");

        let stored = store.get_item(item_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::ExecutingClaimed);
    }

    #[tokio::test]
    async fn list_due_items_filters_by_time_and_active_schedule() {
        let store = InMemoryStore::new();
        let session = SessionId::new();
        let operation_id = OperationId::new();
        let now = Utc::now();

        let mut active_schedule = Schedule::new_timed(
            operation_id,
            session,
            "tweet_draft",
            crate::model::ScheduleType::OneTime,
            TimingParams {
                start_time: now,
                interval_secs: None,
                total_items: None,
            },
        );
        active_schedule.state = ScheduleState::Active;
        let active_schedule_id = active_schedule.schedule_id;
        store.create_schedule(active_schedule).await.unwrap();

        let mut paused_schedule = Schedule::new_timed(
            operation_id,
            session,
            "tweet_draft",
            crate::model::ScheduleType::OneTime,
            TimingParams {
                start_time: now,
                interval_secs: None,
                total_items: None,
            },
        );
        paused_schedule.state = ScheduleState::Paused;
        let paused_schedule_id = paused_schedule.schedule_id;
        store.create_schedule(paused_schedule).await.unwrap();

        let mut due = ToolItem::new(operation_id, session, "tweet_draft", serde_json::json!({}), "due");
        due.status = ItemStatus::Scheduled;
        due.schedule_id = Some(active_schedule_id);
        due.scheduled_time = Some(now - chrono::Duration::seconds(5));

        let mut future = ToolItem::new(operation_id, session, "tweet_draft", serde_json::json!({}), "future");
        future.status = ItemStatus::Scheduled;
        future.schedule_id = Some(active_schedule_id);
        future.scheduled_time = Some(now + chrono::Duration::seconds(60));

        let mut under_paused = ToolItem::new(operation_id, session, "tweet_draft", serde_json::json!({}), "paused");
        under_paused.status = ItemStatus::Scheduled;
        under_paused.schedule_id = Some(paused_schedule_id);
        under_paused.scheduled_time = Some(now - chrono::Duration::seconds(5));

        let due_id = due.item_id;
        store.insert_items(vec![due, future, under_paused]).await.unwrap();

        let results = store.list_due_items(now).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item_id, due_id);
    }
}

//! Persistence Contract (§4.1): the durable-store interface every other
//! component depends on. Expressed as a trait so a caller can back it with
//! whatever store they run in production; this crate ships `InMemoryStore`,
//! a fully functional in-process implementation used by tests and by
//! callers who don't need durability across restarts.

mod memory_store;

pub use memory_store::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::model::{
    ItemId, ItemState, ItemStatus, Message, OperationId, OperationState, Schedule, ScheduleId,
    SessionId, ToolItem, ToolOperation,
};

/// Durable store of messages, operations, items, and schedules.
///
/// Implementations must support atomic find-and-update by primary key so
/// callers can guard state transitions with an expected-current-state
/// check (`update_operation`, `compare_and_swap_item_status`).
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    // ---- messages ----
    async fn insert_message(&self, message: Message) -> CoreResult<()>;
    async fn list_session_messages(&self, session_id: SessionId, limit: usize) -> CoreResult<Vec<Message>>;

    // ---- operations ----
    async fn create_tool_operation(&self, operation: ToolOperation) -> CoreResult<()>;

    /// Returns the session's operation only if it is non-terminal.
    async fn get_operation_by_session(&self, session_id: SessionId) -> CoreResult<Option<ToolOperation>>;

    async fn get_operation_by_id(&self, operation_id: OperationId) -> CoreResult<Option<ToolOperation>>;

    /// Replaces the stored operation. If `expected_state` is `Some`, the
    /// write is rejected (returns `Ok(false)`) unless the stored state
    /// still matches — the conditional-update primitive the design
    /// requires for guarding transitions.
    async fn update_operation(
        &self,
        operation: ToolOperation,
        expected_state: Option<OperationState>,
    ) -> CoreResult<bool>;

    // ---- items ----
    async fn insert_items(&self, items: Vec<ToolItem>) -> CoreResult<()>;

    async fn get_items(
        &self,
        operation_id: OperationId,
        state: Option<ItemState>,
        status: Option<ItemStatus>,
    ) -> CoreResult<Vec<ToolItem>>;

    async fn get_item(&self, item_id: ItemId) -> CoreResult<Option<ToolItem>>;

    async fn update_items_state(
        &self,
        ids: &[ItemId],
        state: ItemState,
        status: ItemStatus,
    ) -> CoreResult<()>;

    async fn update_item_execution(
        &self,
        item_id: ItemId,
        status: ItemStatus,
        api_response: Option<serde_json::Value>,
        error: Option<String>,
    ) -> CoreResult<ToolItem>;

    /// Sets `schedule_id`/`scheduled_time` on an item and moves it to `Scheduled`.
    async fn schedule_item(
        &self,
        item_id: ItemId,
        schedule_id: ScheduleId,
        scheduled_time: DateTime<Utc>,
    ) -> CoreResult<()>;

    /// Conditional update used by the executor's claim step
    /// (`SCHEDULED -> EXECUTING_CLAIMED`). Returns `true` iff the item was
    /// in `expected` status and the swap happened.
    async fn compare_and_swap_item_status(
        &self,
        item_id: ItemId,
        expected: ItemStatus,
        new: ItemStatus,
    ) -> CoreResult<bool>;

    /// All items across all operations currently in the given status,
    /// used by the executor to reclaim stale claims.
    async fn list_items_by_status(&self, status: ItemStatus) -> CoreResult<Vec<ToolItem>>;

    // ---- schedules ----
    async fn create_schedule(&self, schedule: Schedule) -> CoreResult<()>;
    async fn get_schedule(&self, schedule_id: ScheduleId) -> CoreResult<Option<Schedule>>;
    async fn update_schedule(&self, schedule: Schedule) -> CoreResult<()>;

    /// Items with `status = Scheduled`, `scheduled_time <= now`, and an
    /// owning schedule in `Active` state.
    async fn list_due_items(&self, now: DateTime<Utc>) -> CoreResult<Vec<ToolItem>>;

    /// All schedules in `Active` state whose type is `Monitoring`.
    async fn list_active_monitors(&self) -> CoreResult<Vec<Schedule>>;
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ItemId, OperationId, ScheduleId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    Pending,
    Active,
    Paused,
    Completed,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    OneTime,
    Multiple,
    Recurring,
    Monitoring,
}

/// Timing parameters for `one_time` / `multiple` / `recurring` schedules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingParams {
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub interval_secs: Option<i64>,
    #[serde(default)]
    pub total_items: Option<u32>,
}

/// Parameters for `monitoring` schedules: a condition, checked on its own
/// cadence, with an upper-bound deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringParams {
    pub check_interval_secs: i64,
    pub expiration_timestamp: DateTime<Utc>,
    /// Tool-interpreted descriptor, opaque to the core (e.g. `{"op": "gte", "value": 3.0}`).
    pub condition: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: ScheduleId,
    pub operation_id: OperationId,
    pub session_id: SessionId,
    pub content_type: String,

    pub state: ScheduleState,
    pub schedule_type: ScheduleType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringParams>,

    pub pending_items: Vec<ItemId>,
    pub approved_items: Vec<ItemId>,
    pub rejected_items: Vec<ItemId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new_timed(
        operation_id: OperationId,
        session_id: SessionId,
        content_type: impl Into<String>,
        schedule_type: ScheduleType,
        timing: TimingParams,
    ) -> Self {
        let now = Utc::now();
        Self {
            schedule_id: ScheduleId::new(),
            operation_id,
            session_id,
            content_type: content_type.into(),
            state: ScheduleState::Pending,
            schedule_type,
            timing: Some(timing),
            monitoring: None,
            pending_items: Vec::new(),
            approved_items: Vec::new(),
            rejected_items: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_monitoring(
        operation_id: OperationId,
        session_id: SessionId,
        content_type: impl Into<String>,
        monitoring: MonitoringParams,
    ) -> Self {
        let now = Utc::now();
        Self {
            schedule_id: ScheduleId::new(),
            operation_id,
            session_id,
            content_type: content_type.into(),
            state: ScheduleState::Pending,
            schedule_type: ScheduleType::Monitoring,
            timing: None,
            monitoring: Some(monitoring),
            pending_items: Vec::new(),
            approved_items: Vec::new(),
            rejected_items: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

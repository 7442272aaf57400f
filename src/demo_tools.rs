//! Stub tool bodies exercising the lifecycle engine end to end: a
//! schedulable content tool (`tweet`) and a synchronous/monitoring
//! financial tool (`near_swap`). These stand in for the real outbound
//! integrations named as out-of-scope collaborators — they return
//! canned data instead of calling a network API.

use std::sync::atomic::{AtomicU32, Ordering};

use agentflow_core::contracts::{
    ExecutionOutcome, GeneratedItem, ScheduleRequest, ToolBody, ToolRegistration, ToolRunInput, ToolRunOutput,
};
use agentflow_core::error::CoreResult;
use agentflow_core::model::{Schedule, ToolItem};
use async_trait::async_trait;
use chrono::Utc;

/// Drafts N short posts, optionally spaced out over a schedule.
pub struct TweetTool;

#[async_trait]
impl ToolBody for TweetTool {
    fn registration(&self) -> ToolRegistration {
        ToolRegistration {
            tool_type: "tweet".into(),
            content_type: "tweet_draft".into(),
            requires_approval: true,
            requires_scheduling: true,
            required_collaborators: vec!["llm"],
        }
    }

    async fn run(&self, input: ToolRunInput) -> CoreResult<ToolRunOutput> {
        let (count, interval_secs) = parse_tweet_command(&input.command);
        let items = (0..count)
            .map(|i| GeneratedItem {
                content: serde_json::json!({ "topic": input.command, "index": i }),
                raw_content: format!("Draft #{} about: {}", i + 1, input.command),
            })
            .collect();
        Ok(ToolRunOutput {
            parameters: serde_json::json!({ "command": input.command, "interval_secs": interval_secs }),
            items,
            schedule_request: Some(ScheduleRequest::Multiple {
                start_time: Utc::now(),
                interval_secs,
                total_items: count,
            }),
        })
    }

    async fn generate_content(&self, parameters: &serde_json::Value, count: u32) -> CoreResult<Vec<GeneratedItem>> {
        let topic = parameters.get("command").and_then(|v| v.as_str()).unwrap_or("your topic");
        Ok((0..count)
            .map(|i| GeneratedItem {
                content: serde_json::json!({ "topic": topic, "regenerated": true, "index": i }),
                raw_content: format!("Revised draft #{} about: {}", i + 1, topic),
            })
            .collect())
    }

    async fn execute_scheduled_operation(&self, item: &ToolItem) -> CoreResult<ExecutionOutcome> {
        Ok(ExecutionOutcome::ok(serde_json::json!({
            "posted_item_id": item.item_id,
            "posted_at": Utc::now(),
        })))
    }
}

fn parse_tweet_command(command: &str) -> (u32, i64) {
    let count = command
        .split_whitespace()
        .find_map(|w| w.parse::<u32>().ok())
        .unwrap_or(1);
    let interval_secs = if command.contains("minute") { 30 } else { 3600 };
    (count.max(1), interval_secs)
}

/// Synchronous, single-item deposit: no approval, no schedule.
pub struct NearDepositTool;

#[async_trait]
impl ToolBody for NearDepositTool {
    fn registration(&self) -> ToolRegistration {
        ToolRegistration {
            tool_type: "near_deposit".into(),
            content_type: "near_deposit_order".into(),
            requires_approval: false,
            requires_scheduling: false,
            required_collaborators: vec![],
        }
    }

    async fn run(&self, input: ToolRunInput) -> CoreResult<ToolRunOutput> {
        let item = GeneratedItem {
            content: serde_json::json!({ "command": input.command }),
            raw_content: input.command.clone(),
        };
        Ok(ToolRunOutput {
            parameters: serde_json::json!({ "command": input.command }),
            items: vec![item],
            schedule_request: None,
        })
    }

    async fn generate_content(&self, _parameters: &serde_json::Value, _count: u32) -> CoreResult<Vec<GeneratedItem>> {
        Ok(vec![])
    }

    async fn execute_scheduled_operation(&self, item: &ToolItem) -> CoreResult<ExecutionOutcome> {
        Ok(ExecutionOutcome::ok(serde_json::json!({
            "item_id": item.item_id,
            "executed_at": Utc::now(),
        })))
    }
}

/// Price-threshold monitoring swap: no approval, a monitoring schedule.
pub struct NearSwapMonitorTool {
    observed_price: AtomicU32,
}

impl NearSwapMonitorTool {
    pub fn new() -> Self {
        Self {
            observed_price: AtomicU32::new(0),
        }
    }

    /// Test/demo hook: advances the observed price the monitor checks against.
    pub fn set_observed_price(&self, price_times_100: u32) {
        self.observed_price.store(price_times_100, Ordering::Relaxed);
    }
}

impl Default for NearSwapMonitorTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolBody for NearSwapMonitorTool {
    fn registration(&self) -> ToolRegistration {
        ToolRegistration {
            tool_type: "near_swap".into(),
            content_type: "near_swap_order".into(),
            requires_approval: false,
            requires_scheduling: true,
            required_collaborators: vec![],
        }
    }

    async fn run(&self, input: ToolRunInput) -> CoreResult<ToolRunOutput> {
        let raw = input.command.clone();
        let item = GeneratedItem {
            content: serde_json::json!({ "command": raw }),
            raw_content: raw.clone(),
        };
        let schedule_request = ScheduleRequest::Monitoring {
            check_interval_secs: 5,
            expiration_timestamp: Utc::now() + chrono::Duration::minutes(10),
            condition: serde_json::json!({ "op": "gte", "threshold_times_100": parse_threshold(&raw) }),
        };
        Ok(ToolRunOutput {
            parameters: serde_json::json!({ "command": raw }),
            items: vec![item],
            schedule_request: Some(schedule_request),
        })
    }

    async fn generate_content(&self, _parameters: &serde_json::Value, _count: u32) -> CoreResult<Vec<GeneratedItem>> {
        Ok(vec![])
    }

    async fn execute_scheduled_operation(&self, item: &ToolItem) -> CoreResult<ExecutionOutcome> {
        Ok(ExecutionOutcome::ok(serde_json::json!({
            "item_id": item.item_id,
            "executed_at": Utc::now(),
        })))
    }

    async fn check_condition(&self, schedule: &Schedule) -> CoreResult<bool> {
        let Some(monitoring) = &schedule.monitoring else { return Ok(false) };
        let threshold = monitoring
            .condition
            .get("threshold_times_100")
            .and_then(|v| v.as_u64())
            .unwrap_or(u64::MAX) as u32;
        Ok(self.observed_price.load(Ordering::Relaxed) >= threshold)
    }
}

fn parse_threshold(command: &str) -> u32 {
    command
        .split_whitespace()
        .find_map(|w| w.trim_start_matches(['>', '=', '\u{2265}']).parse::<f64>().ok())
        .map(|v| (v * 100.0) as u32)
        .unwrap_or(0)
}

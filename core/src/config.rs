//! Runtime configuration.
//!
//! Mirrors the recognized options in the design's `Config` section.
//! All fields have defaults so a caller can override only what matters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Executor due-time sweep cadence.
    pub tick_interval: DurationSecs,
    /// How long an `EXECUTING-CLAIMED` item may sit before it is reclaimed.
    pub claim_timeout: DurationSecs,
    /// Retry cap for a failed scheduled item before it becomes terminal.
    pub max_retries: u32,
    /// Base delay for exponential backoff (`base_delay * 2^retry_count`).
    pub base_delay: DurationSecs,
    /// Backoff ceiling.
    pub max_delay: DurationSecs,
    /// APPROVING -> COLLECTING cycles allowed before a forced cancel.
    pub max_regeneration_rounds: u32,
    /// Per-call timeout for outbound tool network calls.
    pub tool_call_timeout: DurationSecs,
    /// Default model name passed to the LLM client when a tool doesn't
    /// request a specific one.
    pub llm_default_model: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval: DurationSecs::from_secs(1),
            claim_timeout: DurationSecs::from_secs(60),
            max_retries: 3,
            base_delay: DurationSecs::from_secs(2),
            max_delay: DurationSecs::from_secs(60),
            max_regeneration_rounds: 3,
            tool_call_timeout: DurationSecs::from_secs(30),
            llm_default_model: "default".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Exponential backoff for the given retry attempt, capped at `max_delay`.
    pub fn backoff_for_attempt(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.0.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << retry_count.min(32));
        Duration::from_millis(delay_ms).min(self.max_delay.0)
    }
}

/// A `Duration` newtype that (de)serializes as whole seconds, matching
/// how the design's config table expresses every timing knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationSecs(#[serde(with = "duration_secs")] pub Duration);

impl DurationSecs {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(self) -> Duration {
        self.0
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

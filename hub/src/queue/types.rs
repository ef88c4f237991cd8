use crate::config::QueueConfig;
use crate::db::models::{TaskKind, TaskState, TaskType};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;

/// A durable unit of queued work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub record_id: String,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub available_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl TaskRecord {
    /// Decode the payload into the shape its kind expects
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            crate::HubError::InvalidArgument(format!(
                "Malformed {} payload for record {}: {}",
                self.kind, self.record_id, e
            ))
        })
    }
}

/// Exclusive, time-bounded claim on a task record
#[derive(Debug, Clone)]
pub struct Lease {
    pub record: TaskRecord,
    pub lease_id: String,
    pub worker_id: String,
    pub expires_at_ms: i64,
}

impl Lease {
    pub fn record_id(&self) -> &str {
        &self.record.record_id
    }

    pub fn kind(&self) -> TaskKind {
        self.record.kind
    }

    /// 1-based number of the delivery this lease represents
    pub fn attempt(&self) -> u32 {
        self.record.attempt_count + 1
    }
}

/// Outcome of a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatStatus {
    pub expires_at_ms: i64,
    pub cancel_requested: bool,
}

/// Payload of a `MERGE` record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergePayload {
    pub upload_task_id: String,
}

/// Payload of a `CONVERT` record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvertPayload {
    pub version_id: i64,
    #[serde(default = "default_target_format")]
    pub target_format: String,
}

fn default_target_format() -> String {
    "onnx".to_string()
}

/// Payload of an `INFER` record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferPayload {
    pub model_name: String,
    /// Latest version when absent
    #[serde(default)]
    pub version: Option<String>,
    pub task_type: TaskType,
    pub input_path: String,
}

/// Exponential backoff between retries
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay added as random jitter (0.0 disables)
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            jitter: 0.1,
        }
    }

    /// Delay before delivery `attempt + 1`, after `attempt` failures:
    /// `min(base * 2^(attempt-1) + jitter, max)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);

        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = delay.mul_f64(self.jitter * rand::random::<f64>());
        delay.saturating_add(extra).min(self.max)
    }
}

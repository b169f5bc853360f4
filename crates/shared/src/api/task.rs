use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ContextId, DeviceId, TaskId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreateRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Value,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default, alias = "idempotencyKey")]
    pub idempotency_key: Option<String>,
    #[serde(default, alias = "executionContextKey")]
    pub execution_context_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreateResponse {
    pub id: TaskId,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_context_id: Option<ContextId>,
    pub idempotency_key: Option<String>,
}

/// A claimed task handed to a device poller. The `lease_token` is the
/// capability to renew or complete this lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPollItem {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub execution_context_id: Option<ContextId>,
    pub lease_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteRequest {
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "leaseToken")]
    pub lease_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteResponse {
    pub id: TaskId,
    pub status: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRenewResponse {
    pub id: TaskId,
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancelResponse {
    pub id: TaskId,
    pub status: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextHeartbeatRequest {
    #[serde(alias = "contextKey")]
    pub context_key: String,
    pub capabilities: Value,
    #[serde(default)]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextHeartbeatResponse {
    pub id: ContextId,
    pub context_key: String,
    pub last_seen_at: DateTime<Utc>,
}

/// The owner's view of the currently leased task, if any. Only a short
/// prefix of the lease token is ever exposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentTaskResponse {
    pub has_active_lease: bool,
    pub device_id: DeviceId,
    pub task_id: Option<TaskId>,
    pub task_type: Option<String>,
    pub task_status: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub lease_seconds_remaining: Option<i64>,
    pub lease_token_hint: Option<String>,
    pub context_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistoryItem {
    pub task_id: TaskId,
    pub task_type: String,
    pub task_status: String,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

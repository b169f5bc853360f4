use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AuditId, DeviceId, EffectId, SnapshotId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionCreateRequest {
    pub key: String,
    pub scope: String,
    #[serde(alias = "valueType")]
    pub value_type: String,
    #[serde(default, alias = "defaultValue")]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default, alias = "minValue")]
    pub min_value: Option<f64>,
    #[serde(default, alias = "maxValue")]
    pub max_value: Option<f64>,
    #[serde(default, alias = "enumValues")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default, alias = "isSecret")]
    pub is_secret: bool,
    #[serde(default, alias = "isReadonly")]
    pub is_readonly: bool,
    #[serde(default = "default_true", alias = "userWritable")]
    pub user_writable: bool,
    #[serde(default, alias = "deviceWritable")]
    pub device_writable: bool,
    #[serde(default = "default_true", alias = "allowDeviceOverride")]
    pub allow_device_override: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionView {
    pub key: String,
    pub scope: String,
    pub value_type: String,
    pub default_value: Option<Value>,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub enum_values: Option<Vec<String>>,
    pub regex: Option<String>,
    pub is_secret: bool,
    pub is_readonly: bool,
    pub user_writable: bool,
    pub device_writable: bool,
    pub allow_device_override: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueWriteRequest {
    pub key: String,
    pub scope: String,
    #[serde(default, alias = "deviceUid")]
    pub device_uid: Option<String>,
    pub value: Value,
    #[serde(default, alias = "expectedVersion")]
    pub expected_version: Option<i32>,
}

/// The `set` operation: either principal kind, with a `force` escape
/// hatch past the busy/pairing-active guards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetValueRequest {
    pub key: String,
    pub scope: String,
    #[serde(default, alias = "deviceUid")]
    pub device_uid: Option<String>,
    pub value: Value,
    #[serde(default, alias = "expectedVersion")]
    pub expected_version: Option<i32>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueView {
    pub key: String,
    pub scope: String,
    pub device_uid: Option<String>,
    pub value: Option<Value>,
    pub version: Option<i32>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_secret: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceVariablesResponse {
    pub device_uid: String,
    pub globals: Vec<ValueView>,
    pub device: Vec<ValueView>,
}

/// One resolved entry of the layered effective view.
/// `precedence`: default (0) < global (1) < user (2) < device (3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveItem {
    pub key: String,
    pub value: Option<Value>,
    pub scope: String,
    pub version: Option<i32>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_secret: bool,
    pub masked: bool,
    pub source: String,
    pub precedence: i32,
    pub resolved_type: String,
    pub constraints: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveResponse {
    pub device_uid: String,
    pub computed_at: DateTime<Utc>,
    pub effective_version: String,
    pub items: Vec<EffectiveItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub snapshot_id: SnapshotId,
    pub device_uid: String,
    pub resolved_at: DateTime<Utc>,
    pub effective_version: String,
    pub effective_rev: Option<i64>,
    pub items: Vec<EffectiveItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedEntry {
    pub key: String,
    #[serde(default)]
    pub version: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEntry {
    pub key: String,
    #[serde(default)]
    pub version: Option<i32>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedRequest {
    #[serde(alias = "snapshotId")]
    pub snapshot_id: SnapshotId,
    #[serde(default, alias = "deviceUid")]
    pub device_uid: Option<String>,
    #[serde(default)]
    pub applied: Vec<AppliedEntry>,
    #[serde(default)]
    pub failed: Vec<FailedEntry>,
}

/// Counts of newly-accepted entries; duplicates are silently ignored
/// and do not count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedResponse {
    pub applied: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedAckView {
    pub snapshot_id: SnapshotId,
    pub key: String,
    pub version: Option<i32>,
    pub status: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditView {
    pub variable_key: String,
    pub scope: String,
    pub device_uid: Option<String>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub old_version: Option<i32>,
    pub new_version: Option<i32>,
    pub actor_type: String,
    pub actor_user_id: Option<UserId>,
    pub actor_device_id: Option<DeviceId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectView {
    pub id: EffectId,
    pub status: String,
    pub kind: String,
    pub scope: String,
    pub device_uid: Option<String>,
    pub trigger_audit_id: Option<AuditId>,
    pub payload: Option<Value>,
    pub error: Option<Value>,
    pub attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectRunRequest {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default, alias = "lockedBy")]
    pub locked_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectRunResponse {
    pub processed: i64,
    pub done: i64,
    pub failed: i64,
}

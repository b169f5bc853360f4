//! Row types for the relational schema. Relationships are graphs of rows
//! navigated via indexed queries; none of these hold back-pointers.

use chrono::{DateTime, Utc};
use serde_json::Value;

use hubex_shared::ids::{
    AuditId, ContextId, DeviceId, EffectId, SnapshotId, TaskId, TelemetryId, UserId,
};

/// Column lists for `query_as` selects, kept next to the row types they
/// hydrate.
pub const DEVICE_COLUMNS: &str = "id, device_uid, name, firmware_version, capabilities, \
     last_seen_at, owner_user_id, is_claimed, created_at";

pub const TASK_COLUMNS: &str = "id, client_id, execution_context_id, type, payload, status, \
     priority, idempotency_key, claimed_at, lease_expires_at, lease_token, created_at, \
     completed_at, result, error";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Device {
    pub id: DeviceId,
    pub device_uid: String,
    pub name: Option<String>,
    pub firmware_version: Option<String>,
    pub capabilities: Option<Value>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub owner_user_id: Option<UserId>,
    pub is_claimed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PairingSession {
    pub id: uuid::Uuid,
    pub device_uid: String,
    pub pairing_code: String,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExecutionContext {
    pub id: ContextId,
    pub client_id: DeviceId,
    pub context_key: String,
    pub capabilities: Value,
    pub meta: Value,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Task {
    pub id: TaskId,
    pub client_id: DeviceId,
    pub execution_context_id: Option<ContextId>,
    #[sqlx(rename = "type")]
    pub task_type: String,
    pub payload: Value,
    pub status: String,
    pub priority: i32,
    pub idempotency_key: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub lease_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceTelemetry {
    pub id: TelemetryId,
    pub device_id: DeviceId,
    pub received_at: DateTime<Utc>,
    pub event_type: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VariableDefinition {
    pub key: String,
    pub scope: String,
    pub value_type: String,
    pub default_value: Option<Value>,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub enum_values: Option<Value>,
    pub regex: Option<String>,
    pub is_secret: bool,
    pub is_readonly: bool,
    pub user_writable: bool,
    pub device_writable: bool,
    pub allow_device_override: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VariableDefinition {
    /// The enum constraint as a string list, if one is configured.
    pub fn enum_list(&self) -> Option<Vec<String>> {
        let values = self.enum_values.as_ref()?.as_array()?;
        Some(
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VariableValue {
    pub id: uuid::Uuid,
    pub variable_key: String,
    pub scope: String,
    pub device_id: Option<DeviceId>,
    pub user_id: Option<UserId>,
    pub value_json: Option<Value>,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
    pub updated_by_user_id: Option<UserId>,
    pub updated_by_device_id: Option<DeviceId>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VariableAudit {
    pub id: AuditId,
    pub created_at: DateTime<Utc>,
    pub variable_key: String,
    pub scope: String,
    pub device_id: Option<DeviceId>,
    pub old_value_json: Option<Value>,
    pub new_value_json: Option<Value>,
    pub old_version: Option<i32>,
    pub new_version: Option<i32>,
    pub actor_type: String,
    pub actor_user_id: Option<UserId>,
    pub actor_device_id: Option<DeviceId>,
    pub request_id: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VariableSnapshot {
    pub id: SnapshotId,
    pub device_id: Option<DeviceId>,
    pub user_id: Option<UserId>,
    pub resolved_at: DateTime<Utc>,
    pub effective_version: String,
    pub effective_rev: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VariableSnapshotItem {
    pub id: uuid::Uuid,
    pub snapshot_id: SnapshotId,
    pub variable_key: String,
    pub scope: String,
    pub device_id: Option<DeviceId>,
    pub source: String,
    pub value_json: Option<Value>,
    pub masked: bool,
    pub is_secret: bool,
    pub version: Option<i32>,
    pub updated_at: Option<DateTime<Utc>>,
    pub precedence: i32,
    pub resolved_type: Option<String>,
    pub constraints: Option<Value>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VariableAppliedAck {
    pub id: uuid::Uuid,
    pub snapshot_id: SnapshotId,
    pub device_id: DeviceId,
    pub variable_key: String,
    pub version: Option<i32>,
    pub status: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VariableEffect {
    pub id: EffectId,
    pub status: String,
    pub kind: String,
    pub scope: String,
    pub device_id: Option<DeviceId>,
    pub device_uid: Option<String>,
    pub trigger_audit_id: Option<AuditId>,
    pub payload: Option<Value>,
    pub error: Option<Value>,
    pub attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceRuntimeSetting {
    pub device_id: DeviceId,
    pub telemetry_interval_ms: Option<i32>,
    pub last_effective_rev: Option<i64>,
    pub last_applied_rev: Option<i64>,
    pub last_acked_rev: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition_with_enum(enum_values: Option<Value>) -> VariableDefinition {
        VariableDefinition {
            key: "k".into(),
            scope: "global".into(),
            value_type: "string".into(),
            default_value: None,
            description: None,
            unit: None,
            min_value: None,
            max_value: None,
            enum_values,
            regex: None,
            is_secret: false,
            is_readonly: false,
            user_writable: true,
            device_writable: false,
            allow_device_override: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn enum_list_parses_string_array() {
        let def = definition_with_enum(Some(serde_json::json!(["a", "b"])));
        assert_eq!(def.enum_list().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn enum_list_none_when_unset() {
        assert!(definition_with_enum(None).enum_list().is_none());
    }
}

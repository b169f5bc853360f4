use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{DeviceId, UserId};

/// Unauthenticated registration heartbeat from a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    #[serde(alias = "deviceUid")]
    pub device_uid: String,
    #[serde(default, alias = "firmwareVersion")]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    pub device_id: DeviceId,
    pub claimed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoamiResponse {
    pub id: DeviceId,
    pub device_uid: String,
    pub owner_user_id: Option<UserId>,
}

/// Summary row for the owner's device list. `health` is a freshness tag
/// (`ok` ≤ 30 s, `stale` ≤ 120 s, else `dead`); `state` is the derived
/// lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceListItem {
    pub id: DeviceId,
    pub device_uid: String,
    pub claimed: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub online: bool,
    pub health: String,
    pub last_seen_age_seconds: Option<i64>,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDetail {
    pub id: DeviceId,
    pub device_uid: String,
    pub name: Option<String>,
    pub firmware_version: Option<String>,
    pub capabilities: Option<Value>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub owner_user_id: Option<UserId>,
    pub is_claimed: bool,
    pub created_at: DateTime<Utc>,
    pub health: String,
    pub last_seen_age_seconds: Option<i64>,
    pub state: String,
    /// Coarse activity tag: seen within the configured active window.
    pub active: bool,
}

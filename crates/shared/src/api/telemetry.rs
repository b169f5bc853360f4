use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::TelemetryId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryIngestRequest {
    #[serde(default, alias = "eventType")]
    pub event_type: Option<String>,
    pub payload: Value,
    #[serde(default, alias = "deviceTimestamp")]
    pub device_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryIngestResponse {
    pub telemetry_id: TelemetryId,
    pub received_at: DateTime<Utc>,
}

/// One persisted telemetry record. Also the frame shape broadcast to
/// telemetry WebSocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: TelemetryId,
    pub received_at: DateTime<Utc>,
    pub event_type: Option<String>,
    pub payload: Value,
}

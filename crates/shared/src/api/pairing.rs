use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingStartRequest {
    #[serde(alias = "deviceUid")]
    pub device_uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingStartResponse {
    pub device_uid: String,
    pub pairing_code: String,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

/// Device-side confirm. Accepts camelCase payloads from frontend clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfirmRequest {
    #[serde(alias = "deviceUid")]
    pub device_uid: String,
    #[serde(alias = "pairingCode")]
    pub pairing_code: String,
}

/// The `device_token` is plaintext and is emitted exactly once here;
/// storage keeps only its SHA-256 hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfirmResponse {
    pub device_id: DeviceId,
    pub owner_user_id: UserId,
    pub device_uid: String,
    pub device_token: String,
    pub claimed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_request_accepts_camel_case_aliases() {
        let req: PairingConfirmRequest =
            serde_json::from_str(r#"{"deviceUid": "D1", "pairingCode": "ABCD2345"}"#).unwrap();
        assert_eq!(req.device_uid, "D1");
        assert_eq!(req.pairing_code, "ABCD2345");
    }

    #[test]
    fn confirm_request_accepts_snake_case() {
        let req: PairingConfirmRequest =
            serde_json::from_str(r#"{"device_uid": "D1", "pairing_code": "P"}"#).unwrap();
        assert_eq!(req.device_uid, "D1");
    }
}

//! Derived device lifecycle state and freshness tagging.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use hubex_shared::ids::DeviceId;

use crate::models::Device;

pub const HEALTH_OK_SECONDS: i64 = 30;
pub const HEALTH_STALE_SECONDS: i64 = 120;

/// Freshness tag and age from `last_seen_at`:
/// `ok` ≤ 30 s, `stale` ≤ 120 s, else `dead`.
pub fn health_for(
    last_seen_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (&'static str, Option<i64>) {
    match last_seen_at {
        None => ("dead", None),
        Some(seen) => {
            let age = (now - seen).num_seconds().max(0);
            let health = if age <= HEALTH_OK_SECONDS {
                "ok"
            } else if age <= HEALTH_STALE_SECONDS {
                "stale"
            } else {
                "dead"
            };
            (health, Some(age))
        }
    }
}

/// Coarse activity tag: seen within `window_seconds`. A window of zero
/// or less disables the tag.
pub fn is_active(
    last_seen_at: Option<DateTime<Utc>>,
    window_seconds: i64,
    now: DateTime<Utc>,
) -> bool {
    if window_seconds <= 0 {
        return false;
    }
    last_seen_at.is_some_and(|seen| (now - seen).num_seconds() <= window_seconds)
}

/// Lifecycle state from the row plus the two live flags.
pub fn derive_state(device: &Device, pairing_active: bool, busy: bool) -> &'static str {
    let claimed = device.owner_user_id.is_some() || device.is_claimed;
    if device.last_seen_at.is_none() {
        return "unprovisioned";
    }
    if busy {
        return "busy";
    }
    if claimed {
        return "claimed";
    }
    if pairing_active {
        return "pairing_active";
    }
    "provisioned_unclaimed"
}

/// Device uids with an unexpired, unused pairing session.
pub async fn fetch_pairing_active_uids<'e>(
    executor: impl PgExecutor<'e>,
    device_uids: &[String],
    now: DateTime<Utc>,
) -> Result<HashSet<String>, sqlx::Error> {
    if device_uids.is_empty() {
        return Ok(HashSet::new());
    }
    let rows: Vec<String> = sqlx::query_scalar(
        "SELECT device_uid FROM pairing_sessions \
         WHERE device_uid = ANY($1) AND is_used = false AND expires_at > $2",
    )
    .bind(device_uids)
    .bind(now)
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().collect())
}

/// Devices holding an in-flight task with a live lease.
pub async fn fetch_busy_device_ids<'e>(
    executor: impl PgExecutor<'e>,
    device_ids: &[DeviceId],
    now: DateTime<Utc>,
) -> Result<HashSet<DeviceId>, sqlx::Error> {
    if device_ids.is_empty() {
        return Ok(HashSet::new());
    }
    let rows: Vec<DeviceId> = sqlx::query_scalar(
        "SELECT client_id FROM tasks \
         WHERE client_id = ANY($1) AND status = 'in_flight' \
           AND lease_expires_at IS NOT NULL AND lease_expires_at > $2 \
           AND lease_token IS NOT NULL",
    )
    .bind(device_ids)
    .bind(now)
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().collect())
}

/// Single-device variant of the busy check.
pub async fn device_busy<'e>(
    executor: impl PgExecutor<'e>,
    device_id: DeviceId,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let found: Option<DeviceId> = sqlx::query_scalar(
        "SELECT client_id FROM tasks \
         WHERE client_id = $1 AND status = 'in_flight' \
           AND lease_expires_at IS NOT NULL AND lease_expires_at > $2 \
           AND lease_token IS NOT NULL \
         LIMIT 1",
    )
    .bind(device_id)
    .bind(now)
    .fetch_optional(executor)
    .await?;
    Ok(found.is_some())
}

/// Single-device variant of the pairing-active check.
pub async fn pairing_active<'e>(
    executor: impl PgExecutor<'e>,
    device_uid: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let found: Option<uuid::Uuid> = sqlx::query_scalar(
        "SELECT id FROM pairing_sessions \
         WHERE device_uid = $1 AND is_used = false AND expires_at > $2 \
         LIMIT 1",
    )
    .bind(device_uid)
    .bind(now)
    .fetch_optional(executor)
    .await?;
    Ok(found.is_some())
}

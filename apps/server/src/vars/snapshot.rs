//! Layered resolution into immutable snapshots, with a short-lived
//! in-process cache to absorb read bursts.
//!
//! Precedence: default (0) < global (1) < user (2) < device (3). Each
//! definition resolves against the single layer its scope names; the
//! stored value wins over the definition default.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use hubex_shared::api::variable::EffectiveItem;
use hubex_shared::ids::{DeviceId, SnapshotId, UserId};

use crate::error::ServerError;
use crate::models::{Device, VariableDefinition, VariableValue};
use crate::vars::coerce::{constraints_json, effective_value};
use crate::vars::store::{load_effective_inputs, EffectiveInputs};

const CACHE_TTL: Duration = Duration::from_secs(2);

/// A resolved snapshot as returned to callers and cached in-process.
#[derive(Debug, Clone)]
pub struct ResolvedSnapshot {
    pub snapshot_id: SnapshotId,
    pub resolved_at: DateTime<Utc>,
    pub effective_version: String,
    pub effective_rev: Option<i64>,
    pub items: Vec<EffectiveItem>,
}

type CacheKey = (UserId, String, bool);

/// Snapshot read cache keyed by (user, device uid, include_secrets).
/// Any write to a definition or value invalidates the whole cache.
pub struct SnapshotCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, (Instant, ResolvedSnapshot)>>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(
        &self,
        user_id: UserId,
        device_uid: &str,
        include_secrets: bool,
    ) -> Option<ResolvedSnapshot> {
        let key = (user_id, device_uid.to_owned(), include_secrets);
        let mut entries = self.entries.lock().expect("snapshot cache lock poisoned");
        match entries.get(&key) {
            Some((at, snapshot)) if at.elapsed() <= self.ttl => Some(snapshot.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn set(
        &self,
        user_id: UserId,
        device_uid: &str,
        include_secrets: bool,
        snapshot: ResolvedSnapshot,
    ) {
        let key = (user_id, device_uid.to_owned(), include_secrets);
        self.entries
            .lock()
            .expect("snapshot cache lock poisoned")
            .insert(key, (Instant::now(), snapshot));
    }

    pub fn invalidate_all(&self) {
        self.entries
            .lock()
            .expect("snapshot cache lock poisoned")
            .clear();
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(CACHE_TTL)
    }
}

fn layer<'a>(
    inputs: &'a EffectiveInputs,
) -> Vec<(
    &'a VariableDefinition,
    Option<&'a VariableValue>,
    &'static str,
    i32,
)> {
    inputs
        .definitions
        .iter()
        .map(|definition| {
            let (stored, source, precedence) = match definition.scope.as_str() {
                "global" => (inputs.global_values.get(&definition.key), "global", 1),
                "user" => (inputs.user_values.get(&definition.key), "user", 2),
                "device" => (inputs.device_values.get(&definition.key), "device", 3),
                _ => (None, "default", 0),
            };
            match stored {
                Some(value) => (definition, Some(value), source, precedence),
                None => (definition, None, "default", 0),
            }
        })
        .collect()
}

/// Build the effective view. Secrets are reported as null unless
/// `include_secrets`; `masked` records the definition flag either way.
/// The second element is the version timestamp: the max `updated_at`
/// across contributors, falling back to `now`.
pub fn build_effective_items(
    inputs: &EffectiveInputs,
    include_secrets: bool,
    now: DateTime<Utc>,
) -> (Vec<EffectiveItem>, DateTime<Utc>) {
    let mut items = Vec::with_capacity(inputs.definitions.len());
    let mut timestamps: Vec<DateTime<Utc>> = Vec::with_capacity(inputs.definitions.len());

    for (definition, stored, source, precedence) in layer(inputs) {
        let effective = effective_value(definition, stored.and_then(|v| v.value_json.as_ref()));
        let masked = definition.is_secret;
        let value = if masked && !include_secrets {
            None
        } else {
            effective
        };

        items.push(EffectiveItem {
            key: definition.key.clone(),
            value,
            scope: definition.scope.clone(),
            version: stored.map(|v| v.version),
            updated_at: stored.map(|v| v.updated_at),
            is_secret: definition.is_secret,
            masked,
            source: source.to_string(),
            precedence,
            resolved_type: definition.value_type.clone(),
            constraints: constraints_json(definition),
        });

        timestamps.push(
            stored
                .map(|v| v.updated_at)
                .unwrap_or(definition.updated_at),
        );
    }

    let effective_dt = timestamps.into_iter().max().unwrap_or(now);
    (items, effective_dt)
}

/// Non-persisting effective view for one (device, user) pair.
pub async fn compute_effective(
    conn: &mut PgConnection,
    device_id: DeviceId,
    user_id: UserId,
    include_secrets: bool,
) -> Result<(DateTime<Utc>, String, Vec<EffectiveItem>), ServerError> {
    let inputs = load_effective_inputs(conn, device_id, user_id).await?;
    let now = Utc::now();
    let (items, effective_dt) = build_effective_items(&inputs, include_secrets, now);
    Ok((now, effective_dt.to_rfc3339(), items))
}

/// Resolve and persist a snapshot for (device, user), bumping the
/// device's `effective_rev` watermark in the same transaction. The
/// resolver is the single writer of that watermark. Cached briefly so a
/// read burst yields one snapshot row.
pub async fn resolve_effective_snapshot(
    db: &PgPool,
    cache: &SnapshotCache,
    device: &Device,
    user_id: UserId,
    include_secrets: bool,
) -> Result<ResolvedSnapshot, ServerError> {
    if let Some(cached) = cache.get(user_id, &device.device_uid, include_secrets) {
        return Ok(cached);
    }

    let mut tx = db.begin().await?;

    let inputs = load_effective_inputs(&mut tx, device.id, user_id).await?;
    let resolved_at = Utc::now();
    let (items, effective_dt) = build_effective_items(&inputs, include_secrets, resolved_at);
    let effective_version = effective_dt.to_rfc3339();
    let snapshot_id = SnapshotId::generate();

    let effective_rev: i64 = sqlx::query_scalar(
        "INSERT INTO device_runtime_settings (device_id, last_effective_rev, updated_at) \
         VALUES ($1, 1, now()) \
         ON CONFLICT (device_id) DO UPDATE \
         SET last_effective_rev = COALESCE(device_runtime_settings.last_effective_rev, 0) + 1, \
             updated_at = now() \
         RETURNING last_effective_rev",
    )
    .bind(device.id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO variable_snapshots \
             (id, device_id, user_id, resolved_at, effective_version, effective_rev) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&snapshot_id)
    .bind(device.id)
    .bind(user_id)
    .bind(resolved_at)
    .bind(&effective_version)
    .bind(effective_rev)
    .execute(&mut *tx)
    .await?;

    for item in &items {
        // Persisted items never hold secret plaintext, whatever the
        // caller's include_secrets flag.
        let persisted_value = if item.masked { None } else { item.value.clone() };
        sqlx::query(
            "INSERT INTO variable_snapshot_items \
                 (id, snapshot_id, variable_key, scope, device_id, source, value_json, masked, \
                  is_secret, version, updated_at, precedence, resolved_type, constraints) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&snapshot_id)
        .bind(&item.key)
        .bind(&item.scope)
        .bind(if item.scope == "device" {
            Some(device.id)
        } else {
            None
        })
        .bind(&item.source)
        .bind(&persisted_value)
        .bind(item.masked)
        .bind(item.is_secret)
        .bind(item.version)
        .bind(item.updated_at)
        .bind(item.precedence)
        .bind(&item.resolved_type)
        .bind(&item.constraints)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    let resolved = ResolvedSnapshot {
        snapshot_id,
        resolved_at,
        effective_version,
        effective_rev: Some(effective_rev),
        items,
    };
    cache.set(user_id, &device.device_uid, include_secrets, resolved.clone());
    Ok(resolved)
}

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::jwt::JwtService;
use crate::rate_limit::{FixedWindowLimiter, SlidingWindowLimiter};
use crate::telemetry_hub::TelemetryHub;
use crate::vars::snapshot::SnapshotCache;

/// Shared application state passed to all handlers via Axum's State extractor.
///
/// `PgPool` is internally Arc-wrapped; everything else is wrapped in `Arc`
/// so cloning `AppState` is cheap. The in-process singletons (telemetry hub,
/// rate limiters, snapshot cache) live here so handlers receive them as
/// explicit dependencies.
#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub config: Arc<ServerConfig>,
    pub jwt: Arc<JwtService>,
    pub hub: Arc<TelemetryHub>,
    pub telemetry_limiter: Arc<SlidingWindowLimiter>,
    pub request_limiter: Arc<FixedWindowLimiter>,
    pub snapshot_cache: Arc<SnapshotCache>,
}

impl AppState {
    pub fn new(db: sqlx::PgPool, config: ServerConfig) -> Self {
        let jwt = Arc::new(JwtService::new(&config.jwt));
        let telemetry_limiter = Arc::new(SlidingWindowLimiter::per_minute(
            config.telemetry.rate_per_minute as usize,
        ));
        Self {
            db,
            config: Arc::new(config),
            jwt,
            hub: Arc::new(TelemetryHub::new()),
            telemetry_limiter,
            request_limiter: Arc::new(FixedWindowLimiter::new()),
            snapshot_cache: Arc::new(SnapshotCache::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_state_implements_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}

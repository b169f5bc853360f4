pub mod config;
pub mod device_state;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod revocation;
pub mod router;
pub mod shutdown;
pub mod state;
pub mod telemetry_hub;
pub mod validation;
pub mod vars;

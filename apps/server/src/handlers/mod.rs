pub mod auth;
pub mod devices;
pub mod pairing;
pub mod tasks;
pub mod telemetry;
pub mod variables;

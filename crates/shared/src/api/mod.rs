pub mod auth;
pub mod device;
pub mod pairing;
pub mod task;
pub mod telemetry;
pub mod variable;

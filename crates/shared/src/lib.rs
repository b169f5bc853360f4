//! Hubex shared library — typed IDs, the API error contract, capability
//! names, and request/response types shared between server and clients.

pub mod api;
pub mod caps;
pub mod error;
pub mod ids;

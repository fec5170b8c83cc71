//! Runtime glue that wires configuration, telemetry, and the engine.

pub mod config;
pub mod engine;
pub(crate) mod panic;
pub mod telemetry;

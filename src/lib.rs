//! Dimflow Library
//!
//! Versioned customer dimensions (SCD Type 2) and point-in-time transaction
//! facts, exposed for the `dimflow` binary and integration tests.

pub mod scd;

pub use scd::{EngineConfig, PipelineDriver};

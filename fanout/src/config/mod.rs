//! Configuration objects for fan-out batches.
//!
//! This module contains re-exported configurations that are needed by the engine.

// Re-exports.
pub use fanout_config::shared::*;

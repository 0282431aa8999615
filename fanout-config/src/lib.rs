//! Configuration for fan-out batches.
//!
//! Holds the [`shared::FanOutConfig`] consumed by the `fanout` engine and the hierarchical
//! loader used by binaries to read it from files and environment variables.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{LoadConfigError, load_config, load_config_from};

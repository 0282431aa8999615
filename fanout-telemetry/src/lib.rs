//! Logging setup shared by the fan-out binaries and tests.

pub mod tracing;

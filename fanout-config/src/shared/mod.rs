//! Shared configuration types for fan-out batches.

mod base;
mod fan_out;

pub use base::ValidationError;
pub use fan_out::{FailurePolicy, FanOutConfig, InFlightPolicy, MergeStrategy};

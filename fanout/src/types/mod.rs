//! Common types used throughout a fan-out batch.
//!
//! Re-exports the work item bound, per-item outcomes, and the aggregate that a batch resolves to.

mod aggregate;
mod item;
mod outcome;

pub use aggregate::*;
pub use item::*;
pub use outcome::*;

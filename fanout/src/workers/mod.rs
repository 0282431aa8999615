//! Workers resolving the items of a batch.

pub mod fetch;
pub(crate) mod pool;

pub use fetch::FetchTask;

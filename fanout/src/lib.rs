//! Concurrent fan-out / fan-in of independent fetches.
//!
//! A batch takes a set of work items, fetches each of them concurrently through a [`Fetcher`],
//! merges every outcome into one [`types::AggregateResult`] and resolves exactly once when the
//! last item resolved. Failures of single items are recorded, not propagated.
//!
//! ```rust,no_run
//! use fanout::config::{FanOutConfig, MergeStrategy};
//! use fanout::fan_out::FanOut;
//! use fanout::fetcher::memory::MemoryFetcher;
//!
//! # #[tokio::main]
//! # async fn main() -> fanout::error::FanOutResult<()> {
//! let fetcher = MemoryFetcher::new().with_success(1, "one").with_success(2, "two");
//! let fan_out = FanOut::builder()
//!     .fetcher(fetcher)
//!     .merge_strategy(MergeStrategy::Locked)
//!     .build()?;
//!
//! let result = fan_out.fetch_all([1, 2]).await?;
//! assert_eq!(result.into_successes(), vec!["one", "two"]);
//! # Ok(())
//! # }
//! ```
//!
//! [`Fetcher`]: fetcher::Fetcher

pub mod concurrency;
pub mod config;
pub mod error;
pub mod fan_out;
pub mod fetcher;
mod macros;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;

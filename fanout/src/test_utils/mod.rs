//! Utilities for testing fan-out batches.
//!
//! - [`fetcher`] provides a [`fetcher::ControlledFetcher`] whose items succeed, fail, panic,
//!   hang or wait at a gate on demand, and which reports when fetches start.
//! - [`notify`] provides notifications with a deadline, so tests fail instead of hanging.

pub mod fetcher;
pub mod notify;

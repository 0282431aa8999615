//! Fetcher abstractions for fan-out batches.
//!
//! This module provides the [`Fetcher`] trait, the single capability a batch depends on, and an
//! in-memory implementation with scripted outcomes for tests and demos. Transports such as HTTP
//! live outside of the engine and only need to implement [`Fetcher`].

mod base;
pub mod memory;

pub use base::Fetcher;

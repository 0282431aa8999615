use std::future::Future;
use std::sync::Arc;

use crate::error::FetchError;
use crate::types::WorkItem;

/// Capability that resolves one work item into a value.
///
/// [`Fetcher`] is the only external collaborator of a batch: the engine hands it one item at a
/// time, possibly from many tasks concurrently, and records whatever it returns. Implementations
/// report failures through [`FetchError`]; they must not panic for expected failures, although a
/// panic is contained and reported as [`FetchError::Unknown`].
///
/// The transport is entirely up to the implementation (HTTP, files, an in-memory map).
pub trait Fetcher: Send + Sync + 'static {
    /// Identifier of the work to fetch.
    type Item: WorkItem;

    /// Decoded value produced for an item.
    type Output: Send + 'static;

    /// Returns the name of the fetcher, used in logs.
    fn name() -> &'static str;

    /// Fetches a single item.
    ///
    /// Called at most once per item of a batch.
    fn fetch(
        &self,
        item: Self::Item,
    ) -> impl Future<Output = Result<Self::Output, FetchError>> + Send;
}

impl<F> Fetcher for Arc<F>
where
    F: Fetcher,
{
    type Item = F::Item;
    type Output = F::Output;

    fn name() -> &'static str {
        F::name()
    }

    fn fetch(
        &self,
        item: Self::Item,
    ) -> impl Future<Output = Result<Self::Output, FetchError>> + Send {
        self.as_ref().fetch(item)
    }
}

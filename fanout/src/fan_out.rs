//! Coordinator of fan-out batches.
//!
//! [`FanOut`] issues one [`FetchTask`] per item, merges every outcome into a single aggregate
//! and resolves exactly once when the last item resolved. A failing item never aborts the
//! batch: its failure is recorded next to the successes. Only invalid configuration, malformed
//! input and broken internal contracts surface as [`FanOutError`](crate::error::FanOutError).

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span};

use crate::bail;
use crate::concurrency::cancel::{CancelRx, CancelTx, create_cancel_channel};
use crate::concurrency::merge::{AggregateCollector, Delivery};
use crate::concurrency::signal::CompletionSignal;
use crate::config::{FailurePolicy, FanOutConfig, InFlightPolicy, MergeStrategy};
use crate::error::{ErrorKind, FanOutResult};
use crate::fetcher::Fetcher;
use crate::types::{AggregateResult, OutcomeKind, WorkItem};
use crate::workers::FetchTask;
use crate::workers::pool::FetchWorkerPool;

/// Aggregate produced by a batch over fetcher `F`.
pub type FanOutAggregate<F> = AggregateResult<<F as Fetcher>::Item, <F as Fetcher>::Output>;

/// Coordinator running batches of fetches against a single [`Fetcher`].
///
/// A [`FanOut`] is cheap to clone and can run any number of batches, sequentially or at the
/// same time; batches share nothing but the fetcher.
pub struct FanOut<F> {
    config: Arc<FanOutConfig>,
    fetcher: Arc<F>,
}

impl<F> Clone for FanOut<F> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            fetcher: self.fetcher.clone(),
        }
    }
}

impl<F> fmt::Debug for FanOut<F>
where
    F: Fetcher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanOut")
            .field("fetcher", &F::name())
            .field("config", &self.config)
            .finish()
    }
}

impl<F> FanOut<F>
where
    F: Fetcher,
{
    /// Creates a coordinator.
    ///
    /// The configuration is validated when a batch starts, not here.
    pub fn new(config: FanOutConfig, fetcher: F) -> Self {
        Self {
            config: Arc::new(config),
            fetcher: Arc::new(fetcher),
        }
    }

    pub fn builder() -> FanOutBuilder<F> {
        FanOutBuilder::new()
    }

    pub fn config(&self) -> &FanOutConfig {
        &self.config
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Fetches every item and resolves once all of them resolved.
    ///
    /// The aggregate holds the entries in input order. An empty input resolves immediately to
    /// an empty aggregate without spawning anything.
    pub async fn fetch_all<T>(&self, items: T) -> FanOutResult<FanOutAggregate<F>>
    where
        T: IntoIterator<Item = F::Item>,
    {
        self.fetch_all_with_cancel(items, CancelRx::never()).await
    }

    /// Like [`FanOut::fetch_all`], stopping early when `cancel_rx` is cancelled.
    ///
    /// Items that did not start fetching resolve as cancelled; items being fetched follow the
    /// configured [`InFlightPolicy`]. The batch still resolves exactly once, with one entry per
    /// item.
    pub async fn fetch_all_with_cancel<T>(
        &self,
        items: T,
        cancel_rx: CancelRx,
    ) -> FanOutResult<FanOutAggregate<F>>
    where
        T: IntoIterator<Item = F::Item>,
    {
        self.config.validate()?;

        let items: Vec<F::Item> = items.into_iter().collect();
        if items.is_empty() {
            debug!(fetcher = F::name(), "empty batch, nothing to fetch");
            return Ok(AggregateResult::empty());
        }
        ensure_unique(&items)?;

        let requested = items.len();
        info!(
            fetcher = F::name(),
            items = requested,
            max_concurrency = self.config.max_concurrency,
            strategy = ?self.config.merge_strategy,
            "starting fan-out batch"
        );

        // We enter every item before spawning anything, otherwise an item finishing early could
        // fire the signal while later items are still being spawned.
        let signal = CompletionSignal::new();
        let guards = (0..requested)
            .map(|_| signal.enter())
            .collect::<FanOutResult<Vec<_>>>()?;

        let (mut collector, sink) =
            AggregateCollector::new(self.config.merge_strategy, items.clone());
        let permits = Arc::new(Semaphore::new(
            self.config.max_concurrency.min(Semaphore::MAX_PERMITS),
        ));

        let mut pool = FetchWorkerPool::new();
        for ((slot, item), guard) in items.into_iter().enumerate().zip(guards) {
            let task = FetchTask::new(
                slot,
                item,
                self.fetcher.clone(),
                permits.clone(),
                self.config.item_timeout(),
                self.config.in_flight_on_cancel,
                cancel_rx.clone(),
            );
            let sink = sink.clone();

            pool.spawn(slot, async move {
                let outcome = task.run().await;
                sink.deliver(Delivery {
                    slot,
                    outcome,
                    guard,
                })
            });
        }
        debug!(workers = pool.len(), "spawned every fetch worker");

        pool.wait_all(&mut collector).await?;
        signal.fired().await;

        let result = collector.seal(self.config.failure_policy).await?;

        info!(
            fetcher = F::name(),
            requested,
            succeeded = result.count(OutcomeKind::Success),
            failed = result.count(OutcomeKind::Failure),
            cancelled = result.count(OutcomeKind::Cancelled),
            dropped_failures = result.dropped_failures(),
            "fan-out batch completed"
        );

        Ok(result)
    }

    /// Runs a batch in the background and hands its result to `on_complete`.
    ///
    /// `on_complete` is called exactly once, on a runtime worker thread, unless the returned
    /// handle's task is aborted. Must be called from within a tokio runtime.
    pub fn spawn_fetch_all<T, C>(&self, items: T, on_complete: C) -> BatchHandle
    where
        T: IntoIterator<Item = F::Item>,
        C: FnOnce(FanOutResult<FanOutAggregate<F>>) + Send + 'static,
    {
        let items: Vec<F::Item> = items.into_iter().collect();
        let (cancel_tx, cancel_rx) = create_cancel_channel();
        let fan_out = self.clone();

        let batch_span = info_span!("fan_out_batch", fetcher = F::name());
        let join = tokio::spawn(
            async move {
                let result = fan_out.fetch_all_with_cancel(items, cancel_rx).await;
                on_complete(result);
            }
            .instrument(batch_span),
        );

        BatchHandle { cancel_tx, join }
    }
}

/// Rejects batches holding the same item twice.
fn ensure_unique<I>(items: &[I]) -> FanOutResult<()>
where
    I: WorkItem,
{
    let mut seen = HashSet::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        if !seen.insert(item) {
            bail!(
                ErrorKind::InvalidInput,
                "Batch contains duplicate items",
                format!("item {item:?} repeated at position {index}")
            );
        }
    }

    Ok(())
}

/// Handle of a batch started with [`FanOut::spawn_fetch_all`].
#[derive(Debug)]
pub struct BatchHandle {
    cancel_tx: CancelTx,
    join: JoinHandle<()>,
}

impl BatchHandle {
    /// Cancels the batch. Its completion callback still runs.
    pub fn cancel(&self) {
        self.cancel_tx.cancel();
    }

    /// Waits until the batch resolved and its completion callback returned.
    ///
    /// Fails with [`ErrorKind::WorkerPanic`] if the completion callback panicked.
    pub async fn wait(self) -> FanOutResult<()> {
        self.join.await?;

        Ok(())
    }
}

/// Builder for [`FanOut`].
#[derive(Debug)]
pub struct FanOutBuilder<F> {
    config: FanOutConfig,
    fetcher: Option<F>,
}

impl<F> FanOutBuilder<F>
where
    F: Fetcher,
{
    pub fn new() -> Self {
        Self {
            config: FanOutConfig::default(),
            fetcher: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: FanOutConfig) -> Self {
        self.config = config;
        self
    }

    pub fn fetcher(mut self, fetcher: F) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    pub fn item_timeout(mut self, item_timeout: Duration) -> Self {
        let item_timeout_ms = u64::try_from(item_timeout.as_millis()).unwrap_or(u64::MAX);
        self.config.item_timeout_ms = Some(item_timeout_ms);
        self
    }

    pub fn merge_strategy(mut self, merge_strategy: MergeStrategy) -> Self {
        self.config.merge_strategy = merge_strategy;
        self
    }

    pub fn failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.config.failure_policy = failure_policy;
        self
    }

    pub fn in_flight_on_cancel(mut self, in_flight_on_cancel: InFlightPolicy) -> Self {
        self.config.in_flight_on_cancel = in_flight_on_cancel;
        self
    }

    /// Builds the coordinator.
    ///
    /// Fails with [`ErrorKind::FetcherUnavailable`] when no fetcher was supplied and with
    /// [`ErrorKind::ConfigError`] when the configuration is invalid.
    pub fn build(self) -> FanOutResult<FanOut<F>> {
        let Some(fetcher) = self.fetcher else {
            bail!(
                ErrorKind::FetcherUnavailable,
                "No fetcher was supplied to the coordinator"
            );
        };
        self.config.validate()?;

        Ok(FanOut::new(self.config, fetcher))
    }
}

impl<F> Default for FanOutBuilder<F>
where
    F: Fetcher,
{
    fn default() -> Self {
        Self::new()
    }
}

use std::future::Future;

use tokio::task::JoinSet;
use tracing::{Instrument, debug, debug_span, error};

use crate::concurrency::merge::{AggregateCollector, Delivery};
use crate::error::{ErrorKind, FanOutResult};
use crate::fanout_error;
use crate::types::WorkItem;

/// Pool owning the worker tasks of a single batch.
///
/// Every worker yields the delivery of its item when the merge strategy hands outcomes back to
/// the coordinator, or `None` when it merged on its own. Dropping the pool aborts every worker
/// still running; their completion guards are dropped with them.
#[derive(Debug)]
pub(crate) struct FetchWorkerPool<T> {
    join_set: JoinSet<Option<Delivery<T>>>,
}

impl<T> FetchWorkerPool<T>
where
    T: Send + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            join_set: JoinSet::new(),
        }
    }

    /// Spawns the worker resolving `slot` into the pool.
    pub(crate) fn spawn<W>(&mut self, slot: usize, worker: W)
    where
        W: Future<Output = Option<Delivery<T>>> + Send + 'static,
    {
        self.join_set
            .spawn(worker.instrument(debug_span!("fetch_worker", slot)));

        debug!(slot, "spawned fetch worker in pool");
    }

    pub(crate) fn len(&self) -> usize {
        self.join_set.len()
    }

    /// Waits for every worker, merging deliveries handed back through `collector`.
    ///
    /// A worker that panicked outside of its fetch is collected as
    /// [`ErrorKind::WorkerPanic`]; the remaining workers still run to completion.
    pub(crate) async fn wait_all<I>(
        &mut self,
        collector: &mut AggregateCollector<I, T>,
    ) -> FanOutResult<()>
    where
        I: WorkItem,
    {
        let mut errors = Vec::new();

        while let Some(result) = self.join_set.join_next().await {
            match result {
                Ok(Some(delivery)) => {
                    let slot = delivery.slot;
                    if let Err(err) = collector.merge_returned(delivery) {
                        error!(slot, error = %err, "failed to merge returned outcome");
                        errors.push(err);
                    }
                }
                Ok(None) => {}
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        debug!("fetch worker was cancelled");
                    } else {
                        error!(error = %join_err, "fetch worker panicked");
                        errors.push(fanout_error!(
                            ErrorKind::WorkerPanic,
                            "Fetch worker panicked",
                            join_err
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::signal::CompletionSignal;
    use crate::config::{FailurePolicy, MergeStrategy};
    use crate::types::FetchOutcome;

    fn explode() -> Option<Delivery<u32>> {
        panic!("worker failure");
    }

    #[tokio::test]
    async fn test_wait_all_merges_returned_deliveries() {
        let signal = CompletionSignal::new();
        let (mut collector, sink) =
            AggregateCollector::<u32, u32>::new(MergeStrategy::Structured, vec![10, 20]);
        let mut pool = FetchWorkerPool::new();

        for slot in 0..2 {
            let guard = signal.enter().unwrap();
            let sink = sink.clone();
            pool.spawn(slot, async move {
                sink.deliver(Delivery {
                    slot,
                    outcome: FetchOutcome::Success(slot as u32),
                    guard,
                })
            });
        }
        assert_eq!(pool.len(), 2);

        pool.wait_all(&mut collector).await.unwrap();
        signal.fired().await;

        let result = collector.seal(FailurePolicy::Record).await.unwrap();
        assert_eq!(result.into_successes(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_panicking_worker_is_reported_and_still_leaves() {
        let signal = CompletionSignal::new();
        let (mut collector, _sink) =
            AggregateCollector::<u32, u32>::new(MergeStrategy::Structured, vec![1]);
        let mut pool = FetchWorkerPool::new();

        let guard = signal.enter().unwrap();
        pool.spawn(0, async move {
            let _guard = guard;
            explode()
        });

        let err = pool.wait_all(&mut collector).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkerPanic);
        assert!(signal.is_fired());
    }
}

//! Mutual exclusion over a batch aggregate.
//!
//! Outcomes finish on arbitrary worker threads, but the aggregate must only ever see one merge
//! at a time. Each [`MergeStrategy`] realizes that differently:
//!
//! - [`MergeStrategy::Serialized`]: every merge is sent to a single collector task that owns
//!   the aggregate, the equivalent of funneling work through a serial queue.
//! - [`MergeStrategy::Locked`]: the finishing task merges under a mutex that is held only for
//!   the merge itself and never across an `.await`.
//! - [`MergeStrategy::Structured`]: the finishing task hands its outcome back to the
//!   coordinator through the join set, and the coordinator merges sequentially.
//!
//! In all cases the [`CompletionGuard`] of an item leaves only after its outcome was merged,
//! and no merge ever holds the aggregate lock and the signal lock at the same time.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::concurrency::signal::CompletionGuard;
use crate::config::{FailurePolicy, MergeStrategy};
use crate::error::{ErrorKind, FanOutError, FanOutResult};
use crate::fanout_error;
use crate::types::{AggregateResult, AggregateSlots, FetchOutcome, WorkItem};

/// Outcome of one item on its way into the aggregate.
#[derive(Debug)]
pub(crate) struct Delivery<T> {
    pub(crate) slot: usize,
    pub(crate) outcome: FetchOutcome<T>,
    pub(crate) guard: CompletionGuard,
}

/// Handle given to every worker of a batch to deliver its outcome.
pub(crate) enum OutcomeSink<I, T> {
    Locked(LockedAggregate<I, T>),
    Serialized(SerializedMerger<I, T>),
    Structured,
}

impl<I, T> Clone for OutcomeSink<I, T> {
    fn clone(&self) -> Self {
        match self {
            OutcomeSink::Locked(aggregate) => OutcomeSink::Locked(aggregate.clone()),
            OutcomeSink::Serialized(merger) => OutcomeSink::Serialized(merger.clone()),
            OutcomeSink::Structured => OutcomeSink::Structured,
        }
    }
}

impl<I, T> OutcomeSink<I, T>
where
    I: WorkItem,
    T: Send + 'static,
{
    /// Delivers an outcome.
    ///
    /// Returns the delivery back when the strategy expects the coordinator to merge it.
    pub(crate) fn deliver(&self, delivery: Delivery<T>) -> Option<Delivery<T>> {
        match self {
            OutcomeSink::Locked(aggregate) => {
                aggregate.merge(delivery);
                None
            }
            OutcomeSink::Serialized(merger) => {
                merger.merge(delivery);
                None
            }
            OutcomeSink::Structured => Some(delivery),
        }
    }
}

/// Coordinator side of a batch aggregate, used to obtain the final result.
pub(crate) enum AggregateCollector<I, T> {
    Locked(LockedAggregate<I, T>),
    Serialized(SerializedCollector<I, T>),
    Structured(AggregateSlots<I, T>),
}

impl<I, T> AggregateCollector<I, T>
where
    I: WorkItem,
    T: Send + 'static,
{
    /// Creates both sides of the aggregate for `items` under `strategy`.
    pub(crate) fn new(strategy: MergeStrategy, items: Vec<I>) -> (Self, OutcomeSink<I, T>) {
        match strategy {
            MergeStrategy::Locked => {
                let aggregate = LockedAggregate::new(items);
                (
                    AggregateCollector::Locked(aggregate.clone()),
                    OutcomeSink::Locked(aggregate),
                )
            }
            MergeStrategy::Serialized => {
                let (collector, merger) = SerializedCollector::spawn(items);
                (
                    AggregateCollector::Serialized(collector),
                    OutcomeSink::Serialized(merger),
                )
            }
            MergeStrategy::Structured => (
                AggregateCollector::Structured(AggregateSlots::new(items)),
                OutcomeSink::Structured,
            ),
        }
    }

    /// Merges a delivery handed back to the coordinator, then leaves its guard.
    ///
    /// Only the structured strategy hands deliveries back; for the others this is a contract
    /// violation.
    pub(crate) fn merge_returned(&mut self, delivery: Delivery<T>) -> FanOutResult<()> {
        let Delivery {
            slot,
            outcome,
            guard,
        } = delivery;

        let result = match self {
            AggregateCollector::Structured(slots) => slots.merge(slot, outcome),
            _ => Err(fanout_error!(
                ErrorKind::AggregateMergeConflict,
                "Outcome handed back to the coordinator under a self-merging strategy",
                format!("slot {slot}")
            )),
        };
        guard.leave();

        result
    }

    /// Seals the aggregate and returns the final result.
    pub(crate) async fn seal(self, policy: FailurePolicy) -> FanOutResult<AggregateResult<I, T>> {
        match self {
            AggregateCollector::Locked(aggregate) => aggregate.seal(policy),
            AggregateCollector::Serialized(collector) => collector.seal(policy).await,
            AggregateCollector::Structured(mut slots) => slots.seal(policy),
        }
    }
}

#[derive(Debug)]
struct LockedInner<I, T> {
    slots: AggregateSlots<I, T>,
    conflicts: Vec<FanOutError>,
}

/// Aggregate shared by all workers behind a mutex.
#[derive(Debug)]
pub(crate) struct LockedAggregate<I, T> {
    inner: Arc<Mutex<LockedInner<I, T>>>,
}

impl<I, T> Clone for LockedAggregate<I, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I, T> LockedAggregate<I, T>
where
    I: WorkItem,
{
    fn new(items: Vec<I>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LockedInner {
                slots: AggregateSlots::new(items),
                conflicts: Vec::new(),
            })),
        }
    }

    fn merge(&self, delivery: Delivery<T>) {
        let Delivery {
            slot,
            outcome,
            guard,
        } = delivery;

        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = inner.slots.merge(slot, outcome) {
                error!(slot, error = %err, "failed to merge outcome");
                inner.conflicts.push(err);
            }
        }

        // The aggregate lock is released before the signal is touched.
        guard.leave();
    }

    fn seal(&self, policy: FailurePolicy) -> FanOutResult<AggregateResult<I, T>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.conflicts.is_empty() {
            return Err(std::mem::take(&mut inner.conflicts).into());
        }

        inner.slots.seal(policy)
    }
}

enum MergeMessage<I, T> {
    Merge(Delivery<T>),
    Seal {
        policy: FailurePolicy,
        reply: oneshot::Sender<FanOutResult<AggregateResult<I, T>>>,
    },
}

/// Worker side of a serialized aggregate.
pub(crate) struct SerializedMerger<I, T> {
    tx: mpsc::UnboundedSender<MergeMessage<I, T>>,
}

impl<I, T> Clone for SerializedMerger<I, T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<I, T> SerializedMerger<I, T> {
    fn merge(&self, delivery: Delivery<T>) {
        if let Err(mpsc::error::SendError(message)) = self.tx.send(MergeMessage::Merge(delivery)) {
            // The collector is gone, so the batch was sealed or abandoned. Dropping the message
            // drops its guard, which still resolves the item on the signal.
            error!("outcome delivered after the serialized aggregate stopped");
            drop(message);
        }
    }
}

/// Coordinator side of a serialized aggregate.
pub(crate) struct SerializedCollector<I, T> {
    tx: mpsc::UnboundedSender<MergeMessage<I, T>>,
    handle: JoinHandle<()>,
}

impl<I, T> SerializedCollector<I, T>
where
    I: WorkItem,
    T: Send + 'static,
{
    fn spawn(items: Vec<I>) -> (Self, SerializedMerger<I, T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_collector(AggregateSlots::new(items), rx));

        (
            Self {
                tx: tx.clone(),
                handle,
            },
            SerializedMerger { tx },
        )
    }

    async fn seal(self, policy: FailurePolicy) -> FanOutResult<AggregateResult<I, T>> {
        let (reply, reply_rx) = oneshot::channel();

        if self.tx.send(MergeMessage::Seal { policy, reply }).is_err() {
            return Err(stopped_collector_error(self.handle).await);
        }

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(stopped_collector_error(self.handle).await),
        }
    }
}

/// Builds the error for a collector that stopped before answering, keeping its panic if any.
async fn stopped_collector_error(handle: JoinHandle<()>) -> FanOutError {
    match handle.await {
        Err(join_err) => join_err.into(),
        Ok(()) => fanout_error!(
            ErrorKind::InvalidState,
            "Serialized aggregate stopped before it was sealed"
        ),
    }
}

/// Owns the aggregate and applies merges one at a time until it is sealed.
async fn run_collector<I, T>(
    mut slots: AggregateSlots<I, T>,
    mut rx: mpsc::UnboundedReceiver<MergeMessage<I, T>>,
) where
    I: WorkItem,
{
    let mut conflicts = Vec::new();

    while let Some(message) = rx.recv().await {
        match message {
            MergeMessage::Merge(Delivery {
                slot,
                outcome,
                guard,
            }) => {
                if let Err(err) = slots.merge(slot, outcome) {
                    error!(slot, error = %err, "failed to merge outcome");
                    conflicts.push(err);
                }
                guard.leave();
            }
            MergeMessage::Seal { policy, reply } => {
                debug!(merged = slots.merged(), "sealing serialized aggregate");

                let result = if conflicts.is_empty() {
                    slots.seal(policy)
                } else {
                    Err(std::mem::take(&mut conflicts).into())
                };
                let _ = reply.send(result);

                // Dropping the receiver makes any later delivery fail on send.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::signal::CompletionSignal;
    use crate::error::FetchError;

    fn delivery(signal: &CompletionSignal, slot: usize, outcome: FetchOutcome<u32>) -> Delivery<u32> {
        Delivery {
            slot,
            outcome,
            guard: signal.enter().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_locked_merge_leaves_after_merging() {
        let signal = CompletionSignal::new();
        let (collector, sink) = AggregateCollector::new(MergeStrategy::Locked, vec!["a", "b"]);

        assert!(sink.deliver(delivery(&signal, 1, FetchOutcome::Success(2))).is_none());
        assert!(sink
            .deliver(delivery(&signal, 0, FetchOutcome::Failure(FetchError::EmptyData)))
            .is_none());

        assert!(signal.is_fired());
        let result = collector.seal(FailurePolicy::Record).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.entries()[0].item, "a");
    }

    #[tokio::test]
    async fn test_locked_conflict_surfaces_on_seal() {
        let signal = CompletionSignal::new();
        let (collector, sink) = AggregateCollector::new(MergeStrategy::Locked, vec![1u8]);

        sink.deliver(delivery(&signal, 0, FetchOutcome::Success(1)));
        sink.deliver(delivery(&signal, 0, FetchOutcome::Success(2)));

        let err = collector.seal(FailurePolicy::Record).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AggregateMergeConflict);
    }

    #[tokio::test]
    async fn test_serialized_merge_then_seal() {
        let signal = CompletionSignal::new();
        let (collector, sink) = AggregateCollector::new(MergeStrategy::Serialized, vec![1u8, 2, 3]);

        for slot in [2, 0, 1] {
            sink.deliver(delivery(&signal, slot, FetchOutcome::Success(slot as u32)));
        }
        signal.fired().await;

        let result = collector.seal(FailurePolicy::Record).await.unwrap();
        let values: Vec<_> = result.successes().map(|(_, value)| *value).collect();
        assert_eq!(values, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_serialized_delivery_after_seal_still_leaves() {
        let signal = CompletionSignal::new();
        let (collector, sink) = AggregateCollector::new(MergeStrategy::Serialized, vec![1u8]);
        let late = signal.enter().unwrap();
        let first = delivery(&signal, 0, FetchOutcome::Cancelled);

        sink.deliver(first);
        collector.seal(FailurePolicy::Record).await.unwrap();

        sink.deliver(Delivery {
            slot: 0,
            outcome: FetchOutcome::Success(1),
            guard: late,
        });
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_structured_returns_delivery_to_coordinator() {
        let signal = CompletionSignal::new();
        let (mut collector, sink) = AggregateCollector::new(MergeStrategy::Structured, vec![7u8]);

        let returned = sink
            .deliver(delivery(&signal, 0, FetchOutcome::Success(7)))
            .unwrap();
        assert!(!signal.is_fired());

        collector.merge_returned(returned).unwrap();
        assert!(signal.is_fired());
        assert_eq!(collector.seal(FailurePolicy::Record).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_returned_delivery_is_rejected_by_self_merging_strategy() {
        let signal = CompletionSignal::new();
        let (mut collector, _sink) =
            AggregateCollector::<u8, u32>::new(MergeStrategy::Locked, vec![1]);

        let err = collector
            .merge_returned(delivery(&signal, 0, FetchOutcome::Cancelled))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AggregateMergeConflict);
        assert!(signal.is_fired());
    }
}

use std::mem;

use tracing::warn;

use crate::bail;
use crate::config::FailurePolicy;
use crate::error::{ErrorKind, FanOutResult, FetchError};
use crate::types::{FetchOutcome, OutcomeKind};

/// Outcome of one item, tagged with its position in the input.
#[derive(Debug, Clone)]
pub struct AggregateEntry<I, T> {
    /// Position of the item in the sequence handed to the batch.
    pub index: usize,
    pub item: I,
    pub outcome: FetchOutcome<T>,
}

/// Final result of a batch, handed to the caller once every item resolved.
///
/// Entries are ordered by input position regardless of completion order. With
/// [`FailurePolicy::Record`] there is exactly one entry per requested item; with
/// [`FailurePolicy::Drop`] failed items are left out and only counted.
#[derive(Debug, Clone)]
pub struct AggregateResult<I, T> {
    entries: Vec<AggregateEntry<I, T>>,
    requested: usize,
    dropped_failures: usize,
}

impl<I, T> AggregateResult<I, T> {
    /// Creates the aggregate of a batch without items.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            requested: 0,
            dropped_failures: 0,
        }
    }

    /// Number of entries kept in the aggregate.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of items the batch was started with.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Number of failed items left out because of [`FailurePolicy::Drop`].
    pub fn dropped_failures(&self) -> usize {
        self.dropped_failures
    }

    pub fn entries(&self) -> &[AggregateEntry<I, T>] {
        &self.entries
    }

    /// Returns the number of kept entries with the given outcome kind.
    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.outcome.kind() == kind)
            .count()
    }

    pub fn successes(&self) -> impl Iterator<Item = (&I, &T)> {
        self.entries
            .iter()
            .filter_map(|entry| entry.outcome.as_success().map(|value| (&entry.item, value)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&I, &FetchError)> {
        self.entries
            .iter()
            .filter_map(|entry| entry.outcome.as_failure().map(|err| (&entry.item, err)))
    }

    pub fn cancelled(&self) -> impl Iterator<Item = &I> {
        self.entries
            .iter()
            .filter(|entry| entry.outcome.is_cancelled())
            .map(|entry| &entry.item)
    }

    pub fn into_entries(self) -> Vec<AggregateEntry<I, T>> {
        self.entries
    }

    /// Consumes the aggregate and returns the successful values in input order.
    pub fn into_successes(self) -> Vec<T> {
        self.entries
            .into_iter()
            .filter_map(|entry| match entry.outcome {
                FetchOutcome::Success(value) => Some(value),
                _ => None,
            })
            .collect()
    }
}

/// Aggregate under construction, one slot per item.
///
/// Every mutation goes through [`AggregateSlots::merge`], which callers must serialize. A slot
/// accepts exactly one outcome and no outcome is accepted once the slots are sealed.
#[derive(Debug)]
pub(crate) struct AggregateSlots<I, T> {
    items: Vec<I>,
    slots: Vec<Option<FetchOutcome<T>>>,
    merged: usize,
    sealed: bool,
}

impl<I, T> AggregateSlots<I, T>
where
    I: std::fmt::Debug,
{
    pub(crate) fn new(items: Vec<I>) -> Self {
        let slots = items.iter().map(|_| None).collect();

        Self {
            items,
            slots,
            merged: 0,
            sealed: false,
        }
    }

    pub(crate) fn merged(&self) -> usize {
        self.merged
    }

    /// Stores the outcome for `slot`.
    pub(crate) fn merge(&mut self, slot: usize, outcome: FetchOutcome<T>) -> FanOutResult<()> {
        if self.sealed {
            bail!(
                ErrorKind::AggregateMergeConflict,
                "Outcome merged after the aggregate was sealed",
                format!("slot {slot}")
            );
        }

        let Some(entry) = self.slots.get_mut(slot) else {
            bail!(
                ErrorKind::AggregateMergeConflict,
                "Outcome merged into an unknown slot",
                format!("slot {slot} of {}", self.items.len())
            );
        };

        if entry.is_some() {
            bail!(
                ErrorKind::AggregateMergeConflict,
                "Outcome merged twice for the same item",
                format!("slot {slot}")
            );
        }

        *entry = Some(outcome);
        self.merged += 1;

        Ok(())
    }

    /// Seals the slots and builds the final aggregate.
    ///
    /// After sealing, any further merge fails. Sealing with an empty slot is a contract
    /// violation, since every item must resolve before the batch completes.
    pub(crate) fn seal(&mut self, policy: FailurePolicy) -> FanOutResult<AggregateResult<I, T>> {
        if self.sealed {
            bail!(ErrorKind::InvalidState, "Aggregate was already sealed");
        }
        self.sealed = true;

        if let Some(missing) = self.slots.iter().position(Option::is_none) {
            bail!(
                ErrorKind::AggregateMergeConflict,
                "Aggregate sealed before every item resolved",
                format!("slot {missing} has no outcome, {} of {} merged", self.merged, self.slots.len())
            );
        }

        let requested = self.items.len();
        let items = mem::take(&mut self.items);
        let slots = mem::take(&mut self.slots);

        let mut entries = Vec::with_capacity(requested);
        let mut dropped_failures = 0;
        // Every slot is filled, checked above.
        let outcomes = slots.into_iter().flatten();
        for (index, (item, outcome)) in items.into_iter().zip(outcomes).enumerate() {
            if let (FailurePolicy::Drop, FetchOutcome::Failure(err)) = (policy, &outcome) {
                warn!(index, ?item, error = %err, "dropping failed item from aggregate");
                dropped_failures += 1;
                continue;
            }

            entries.push(AggregateEntry {
                index,
                item,
                outcome,
            });
        }

        Ok(AggregateResult {
            entries,
            requested,
            dropped_failures,
        })
    }
}

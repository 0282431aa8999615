//! Concurrency primitives for coordinating the workers of a batch.
//!
//! A batch spawns one worker per item. Workers run on any thread of the runtime and finish in
//! any order, yet the batch must resolve exactly once, with every outcome merged, without races
//! on the aggregate and without blocking the context that started it.
//!
//! # Coordination Patterns
//!
//! ## Completion
//!
//! The [`signal`] module provides a counted join: the coordinator enters once per item before
//! spawning anything, and every worker leaves exactly once after its outcome was merged. The
//! signal fires when the count drops to zero and wakes callbacks and async waiters.
//!
//! ## Merging
//!
//! The [`merge`] module guarantees at most one merge into the aggregate at a time, either by
//! funneling merges through a collector task, by a short-lived mutex, or by handing outcomes
//! back to the coordinator.
//!
//! ## Cancellation
//!
//! The [`cancel`] module implements a watch-based broadcast. Workers that have not started
//! resolve as cancelled, so a cancelled batch still completes.
//!
//! # Safety Guarantees
//!
//! - **No lost updates**: the aggregate is only ever mutated through a serialized merge.
//! - **No lock nesting**: the aggregate lock is released before a worker leaves the signal.
//! - **No self-deadlock**: waiting for completion by parking a thread is refused on threads that
//!   drive the runtime, since the workers being waited for may need that very thread. The
//!   problematic pattern looks like this:
//!
//! ```rust,ignore
//! // On a current-thread runtime, every worker is scheduled on the thread that then parks.
//! let signal = CompletionSignal::new();
//! for item in items {
//!     let guard = signal.enter()?;
//!     tokio::spawn(async move {
//!         fetch(item).await;
//!         guard.leave();
//!     });
//! }
//! signal.wait_blocking()?; // Refused with `ErrorKind::BlockingWaitInRuntime`.
//! ```
//!
//! Use [`signal::CompletionSignal::notify`] or `.fired().await` instead.

pub mod cancel;
pub(crate) mod merge;
pub mod signal;

/// Returns the message a panic was raised with, if it carried one.
pub(crate) fn panic_payload_message(payload: &(dyn std::any::Any + Send)) -> Option<&str> {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

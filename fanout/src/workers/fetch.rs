use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::concurrency::cancel::CancelRx;
use crate::concurrency::panic_payload_message;
use crate::config::InFlightPolicy;
use crate::error::FetchError;
use crate::fetcher::Fetcher;
use crate::types::FetchOutcome;

/// Unit of work resolving a single item of a batch.
///
/// A [`FetchTask`] never touches the aggregate. It produces exactly one [`FetchOutcome`] and
/// leaves merging to whoever runs it.
#[derive(Debug)]
pub struct FetchTask<F: Fetcher> {
    slot: usize,
    item: F::Item,
    fetcher: Arc<F>,
    permits: Arc<Semaphore>,
    item_timeout: Option<Duration>,
    in_flight_on_cancel: InFlightPolicy,
    cancel_rx: CancelRx,
}

impl<F> FetchTask<F>
where
    F: Fetcher,
{
    pub(crate) fn new(
        slot: usize,
        item: F::Item,
        fetcher: Arc<F>,
        permits: Arc<Semaphore>,
        item_timeout: Option<Duration>,
        in_flight_on_cancel: InFlightPolicy,
        cancel_rx: CancelRx,
    ) -> Self {
        Self {
            slot,
            item,
            fetcher,
            permits,
            item_timeout,
            in_flight_on_cancel,
            cancel_rx,
        }
    }

    /// Position of the item in the batch input.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn item(&self) -> &F::Item {
        &self.item
    }

    /// Resolves the item.
    ///
    /// Waits for a concurrency permit, then calls the fetcher under the optional per-item
    /// timeout. Cancellation before the fetch started always yields [`FetchOutcome::Cancelled`];
    /// cancellation during the fetch only does so under [`InFlightPolicy::Abandon`].
    pub async fn run(mut self) -> FetchOutcome<F::Output> {
        if self.cancel_rx.is_cancelled() {
            debug!(slot = self.slot, "batch cancelled before the task started");
            return FetchOutcome::Cancelled;
        }

        // The permit bounds how many fetches of the batch run at the same time and is held
        // until the outcome is produced.
        let _permit = tokio::select! {
            biased;

            _ = self.cancel_rx.cancelled() => {
                debug!(slot = self.slot, "batch cancelled while waiting for a permit");
                return FetchOutcome::Cancelled;
            }

            permit = self.permits.clone().acquire_owned() => {
                match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        return FetchOutcome::Failure(FetchError::Unknown(
                            "concurrency limiter was closed".to_owned(),
                        ));
                    }
                }
            }
        };

        debug!(slot = self.slot, item = ?self.item, fetcher = F::name(), "fetching item");

        let fetch = fetch_once(self.fetcher.as_ref(), self.item.clone(), self.item_timeout);
        let result = match self.in_flight_on_cancel {
            InFlightPolicy::Complete => fetch.await,
            InFlightPolicy::Abandon => {
                tokio::select! {
                    biased;

                    _ = self.cancel_rx.cancelled() => {
                        debug!(slot = self.slot, "abandoning in-flight fetch after cancellation");
                        return FetchOutcome::Cancelled;
                    }

                    result = fetch => result,
                }
            }
        };

        if let Err(err) = &result {
            warn!(slot = self.slot, item = ?self.item, error = %err, "item fetch failed");
        }

        result.into()
    }
}

/// Calls the fetcher once, turning a timeout or a panic into a [`FetchError`].
async fn fetch_once<F>(
    fetcher: &F,
    item: F::Item,
    item_timeout: Option<Duration>,
) -> Result<F::Output, FetchError>
where
    F: Fetcher,
{
    let fetch = AssertUnwindSafe(fetcher.fetch(item)).catch_unwind();

    let result = match item_timeout {
        Some(item_timeout) => match tokio::time::timeout(item_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => return Err(FetchError::Timeout(item_timeout)),
        },
        None => fetch.await,
    };

    result.unwrap_or_else(|payload| Err(FetchError::Unknown(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    match panic_payload_message(payload) {
        Some(message) => format!("fetcher panicked: {message}"),
        None => "fetcher panicked".to_owned(),
    }
}

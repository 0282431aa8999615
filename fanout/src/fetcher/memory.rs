use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::FetchError;
use crate::fetcher::Fetcher;
use crate::types::WorkItem;

/// Scripted response of a [`MemoryFetcher`] for one item.
#[derive(Debug, Clone)]
struct Script<T> {
    result: Result<T, FetchError>,
    delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Stats<I> {
    calls: Vec<I>,
}

/// In-memory fetcher with scripted outcomes, for testing and development.
///
/// Every item resolves to the result registered for it, after an optional delay. Items without
/// a script resolve to [`FetchError::InvalidIdentifier`]. The fetcher records the order in which
/// items were requested and the peak number of fetches running at the same time, which makes it
/// useful to observe how a batch schedules its work.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
///
/// use fanout::config::FanOutConfig;
/// use fanout::error::FetchError;
/// use fanout::fan_out::FanOut;
/// use fanout::fetcher::memory::MemoryFetcher;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = MemoryFetcher::new()
///     .with_success(1, "one")
///     .with_failure(2, FetchError::UnexpectedStatus(404))
///     .with_default_delay(Duration::from_millis(10));
///
/// let fan_out = FanOut::new(FanOutConfig::default(), fetcher);
/// let result = fan_out.fetch_all(vec![1, 2]).await?;
///
/// assert_eq!(result.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryFetcher<I, T> {
    scripts: HashMap<I, Script<T>>,
    default_delay: Option<Duration>,
    stats: Arc<Mutex<Stats<I>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl<I, T> MemoryFetcher<I, T>
where
    I: WorkItem,
    T: Clone + Send + Sync + 'static,
{
    /// Creates a fetcher without any scripted item.
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            default_delay: None,
            stats: Arc::new(Mutex::new(Stats { calls: Vec::new() })),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Scripts `item` to resolve to `value`.
    pub fn with_success(mut self, item: I, value: T) -> Self {
        self.script(item, Ok(value));
        self
    }

    /// Scripts `item` to fail with `err`.
    pub fn with_failure(mut self, item: I, err: FetchError) -> Self {
        self.script(item, Err(err));
        self
    }

    /// Delays the response of an already scripted `item`.
    ///
    /// Has no effect on items without a script.
    pub fn with_delay(mut self, item: &I, delay: Duration) -> Self {
        if let Some(script) = self.scripts.get_mut(item) {
            script.delay = Some(delay);
        }
        self
    }

    /// Delays every response without a per-item delay.
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    /// Returns the items fetched so far, in call order.
    pub async fn calls(&self) -> Vec<I> {
        let stats = self.stats.lock().await;
        stats.calls.clone()
    }

    /// Returns the highest number of fetches observed running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn script(&mut self, item: I, result: Result<T, FetchError>) {
        let delay = self.scripts.get(&item).and_then(|script| script.delay);
        self.scripts.insert(item, Script { result, delay });
    }
}

impl<I, T> Default for MemoryFetcher<I, T>
where
    I: WorkItem,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the in-flight counter accurate even when a fetch is dropped mid-way.
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<I, T> Fetcher for MemoryFetcher<I, T>
where
    I: WorkItem,
    T: Clone + Send + Sync + 'static,
{
    type Item = I;
    type Output = T;

    fn name() -> &'static str {
        "memory"
    }

    async fn fetch(&self, item: I) -> Result<T, FetchError> {
        {
            let mut stats = self.stats.lock().await;
            stats.calls.push(item.clone());
        }

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let _guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
        };

        let Some(script) = self.scripts.get(&item) else {
            debug!(?item, "no script for item");
            return Err(FetchError::InvalidIdentifier(format!("{item:?}")));
        };

        if let Some(delay) = script.delay.or(self.default_delay) {
            tokio::time::sleep(delay).await;
        }

        script.result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_results_are_returned() {
        let fetcher = MemoryFetcher::new()
            .with_success("a", 1)
            .with_failure("b", FetchError::EmptyData);

        assert_eq!(fetcher.fetch("a").await.unwrap(), 1);
        assert!(matches!(fetcher.fetch("b").await, Err(FetchError::EmptyData)));
        assert!(matches!(
            fetcher.fetch("c").await,
            Err(FetchError::InvalidIdentifier(id)) if id == "\"c\""
        ));
        assert_eq!(fetcher.calls().await, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_survives_rescripting() {
        let fetcher = MemoryFetcher::new()
            .with_success(1u32, "first")
            .with_delay(&1, Duration::from_secs(5))
            .with_success(1, "second");

        let started = tokio::time::Instant::now();
        assert_eq!(fetcher.fetch(1).await.unwrap(), "second");
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(fetcher.peak_in_flight(), 1);
    }
}

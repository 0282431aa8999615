use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore};

use crate::error::FetchError;
use crate::fetcher::Fetcher;
use crate::test_utils::notify::TimedNotify;
use crate::types::WorkItem;

/// How a [`ControlledFetcher`] resolves one item.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Returns the item itself.
    Echo,
    /// Returns the item itself after sleeping.
    EchoAfter(Duration),
    Fail(FetchError),
    /// Panics inside the fetch.
    Panic(&'static str),
    /// Waits until released through [`ControlledFetcher::release_gated`], then echoes.
    Gated,
    /// Never resolves.
    Hang,
}

type StartCondition = (usize, Arc<Notify>);

struct Inner<I> {
    behaviors: HashMap<I, Behavior>,
    started: Vec<I>,
    finished: Vec<I>,
    start_conditions: Vec<StartCondition>,
}

impl<I> Inner<I> {
    fn check_conditions(&mut self) {
        let started = self.started.len();
        self.start_conditions.retain(|(count, notify)| {
            let should_retain = started < *count;
            if !should_retain {
                notify.notify_one();
            }
            should_retain
        });
    }
}

/// Test fetcher whose items resolve according to a scripted [`Behavior`].
///
/// Tracks which items started and finished fetching, and lets tests wait until a given number
/// of fetches started. Items without a behavior echo themselves.
pub struct ControlledFetcher<I> {
    inner: Arc<Mutex<Inner<I>>>,
    gate: Arc<Semaphore>,
}

impl<I> Clone for ControlledFetcher<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gate: self.gate.clone(),
        }
    }
}

impl<I> fmt::Debug for ControlledFetcher<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlledFetcher").finish_non_exhaustive()
    }
}

impl<I> ControlledFetcher<I>
where
    I: WorkItem,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                behaviors: HashMap::new(),
                started: Vec::new(),
                finished: Vec::new(),
                start_conditions: Vec::new(),
            })),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    /// Scripts how `item` resolves.
    pub async fn set(&self, item: I, behavior: Behavior) {
        let mut inner = self.inner.lock().await;
        inner.behaviors.insert(item, behavior);
    }

    /// Scripts every item of `items` the same way.
    pub async fn set_all<T>(&self, items: T, behavior: Behavior)
    where
        T: IntoIterator<Item = I>,
    {
        let mut inner = self.inner.lock().await;
        for item in items {
            inner.behaviors.insert(item, behavior.clone());
        }
    }

    /// Lets `count` gated fetches proceed.
    pub fn release_gated(&self, count: usize) {
        self.gate.add_permits(count);
    }

    /// Returns a notification fired once at least `count` fetches started.
    pub async fn notify_on_started(&self, count: usize) -> TimedNotify {
        let notify = Arc::new(Notify::new());

        let mut inner = self.inner.lock().await;
        inner.start_conditions.push((count, notify.clone()));
        inner.check_conditions();

        TimedNotify::new(notify)
    }

    /// Items whose fetch started, in start order.
    pub async fn started(&self) -> Vec<I> {
        self.inner.lock().await.started.clone()
    }

    /// Items whose fetch returned, in completion order.
    pub async fn finished(&self) -> Vec<I> {
        self.inner.lock().await.finished.clone()
    }
}

impl<I> Default for ControlledFetcher<I>
where
    I: WorkItem,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<I> Fetcher for ControlledFetcher<I>
where
    I: WorkItem,
{
    type Item = I;
    type Output = I;

    fn name() -> &'static str {
        "controlled"
    }

    async fn fetch(&self, item: I) -> Result<I, FetchError> {
        let behavior = {
            let mut inner = self.inner.lock().await;
            inner.started.push(item.clone());
            inner.check_conditions();
            inner
                .behaviors
                .get(&item)
                .cloned()
                .unwrap_or(Behavior::Echo)
        };

        let result = match behavior {
            Behavior::Echo => Ok(item.clone()),
            Behavior::EchoAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(item.clone())
            }
            Behavior::Fail(err) => Err(err),
            Behavior::Panic(message) => panic!("{message}"),
            Behavior::Gated => match self.gate.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    Ok(item.clone())
                }
                Err(_) => Err(FetchError::Unknown("gate closed".to_owned())),
            },
            Behavior::Hang => std::future::pending().await,
        };

        let mut inner = self.inner.lock().await;
        inner.finished.push(item);

        result
    }
}

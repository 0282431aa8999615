//! Counted completion signal for fan-out batches.
//!
//! A [`CompletionSignal`] tracks how many entered units of work have not left yet and fires
//! exactly once when that number drops to zero. Entering hands out a [`CompletionGuard`]; the
//! guard is the only way to leave, so every enter is matched by exactly one leave and a leave
//! can never precede its enter. Dropping a guard leaves as well, which keeps the count accurate
//! when a task is aborted or unwinds.
//!
//! The primary ways of observing completion are non-blocking: [`CompletionSignal::notify`]
//! registers a callback and [`CompletionSignal::fired`] is awaited. A blocking
//! [`CompletionSignal::wait_blocking`] exists for plain threads only. Called from a thread that
//! drives a tokio runtime it is refused with [`ErrorKind::BlockingWaitInRuntime`], since the
//! leaves it waits for may be scheduled on that very thread.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error};

use crate::bail;
use crate::concurrency::panic_payload_message;
use crate::error::{ErrorKind, FanOutResult};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle of a [`CompletionSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalPhase {
    /// Nothing entered yet.
    Idle,
    /// Waiting for `remaining` guards to leave.
    Armed { remaining: usize },
    /// The last guard left and callbacks are running.
    Firing,
    /// Terminal. Callbacks ran and waiters were released.
    Fired,
}

struct SignalState {
    phase: SignalPhase,
    callbacks: Vec<Callback>,
}

struct Inner {
    state: Mutex<SignalState>,
    fired_cv: Condvar,
    fired_tx: watch::Sender<bool>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SignalState> {
        // Callbacks never run under the lock, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn leave(&self) {
        let mut state = self.lock();
        match state.phase {
            SignalPhase::Armed { remaining: 1 } => {
                state.phase = SignalPhase::Firing;
                drop(state);
                self.fire();
            }
            SignalPhase::Armed { remaining } => {
                state.phase = SignalPhase::Armed {
                    remaining: remaining - 1,
                };
            }
            phase => {
                // Guards only exist while armed, so this means the count is corrupted.
                error!(?phase, "completion guard left a signal that is not armed");
            }
        }
    }

    /// Runs every registered callback, including ones registered while firing, then releases
    /// all waiters.
    ///
    /// A panicking callback is logged and does not keep the others from running.
    fn fire(&self) {
        loop {
            let callbacks = {
                let mut state = self.lock();
                if state.callbacks.is_empty() {
                    state.phase = SignalPhase::Fired;
                    break;
                }
                std::mem::take(&mut state.callbacks)
            };

            for callback in callbacks {
                if let Err(err) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                    error!(
                        panic = panic_payload_message(err.as_ref()).unwrap_or("unknown"),
                        "completion callback panicked"
                    );
                }
            }
        }

        debug!("completion signal fired");

        self.fired_cv.notify_all();
        self.fired_tx.send_replace(true);
    }

    /// Moves an idle signal straight to firing. Returns whether it did.
    fn seal_if_idle(&self) -> bool {
        let mut state = self.lock();
        if state.phase != SignalPhase::Idle {
            return false;
        }
        state.phase = SignalPhase::Firing;
        true
    }
}

/// Counted join primitive that fires once every entered unit of work has left.
///
/// Cloning a [`CompletionSignal`] yields another handle to the same counter.
#[derive(Clone)]
pub struct CompletionSignal {
    inner: Arc<Inner>,
}

impl CompletionSignal {
    /// Creates an idle signal.
    pub fn new() -> Self {
        let (fired_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SignalState {
                    phase: SignalPhase::Idle,
                    callbacks: Vec::new(),
                }),
                fired_cv: Condvar::new(),
                fired_tx,
            }),
        }
    }

    /// Registers one more expected completion and returns the guard that resolves it.
    ///
    /// Fails with [`ErrorKind::InvalidState`] once the signal is firing or fired.
    pub fn enter(&self) -> FanOutResult<CompletionGuard> {
        let mut state = self.inner.lock();
        state.phase = match state.phase {
            SignalPhase::Idle => SignalPhase::Armed { remaining: 1 },
            SignalPhase::Armed { remaining } => SignalPhase::Armed {
                remaining: remaining + 1,
            },
            SignalPhase::Firing | SignalPhase::Fired => {
                bail!(
                    ErrorKind::InvalidState,
                    "Cannot enter a completion signal that already fired"
                );
            }
        };

        Ok(CompletionGuard {
            inner: Some(self.inner.clone()),
        })
    }

    /// Registers `callback` to run exactly once when the signal fires.
    ///
    /// The callback runs on the thread that performs the last leave. If the signal already
    /// fired, or nothing was ever entered, it runs immediately on the calling thread; in the
    /// idle case the signal is fired and can no longer be entered.
    pub fn notify<C>(&self, callback: C)
    where
        C: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.lock();
        match state.phase {
            SignalPhase::Idle => {
                state.phase = SignalPhase::Firing;
                state.callbacks.push(Box::new(callback));
                drop(state);
                self.inner.fire();
            }
            SignalPhase::Armed { .. } | SignalPhase::Firing => {
                state.callbacks.push(Box::new(callback));
            }
            SignalPhase::Fired => {
                drop(state);
                callback();
            }
        }
    }

    /// Waits asynchronously until the signal fired.
    ///
    /// Awaiting an idle signal fires it.
    pub async fn fired(&self) {
        let mut fired_rx = self.inner.fired_tx.subscribe();

        if self.inner.seal_if_idle() {
            self.inner.fire();
        }

        // The sender lives in `inner`, which this handle keeps alive, so the channel can't close.
        let _ = fired_rx.wait_for(|fired| *fired).await;
    }

    /// Blocks the current thread until the signal fired.
    ///
    /// Fails with [`ErrorKind::BlockingWaitInRuntime`] when called from a thread that is
    /// driving a tokio runtime. Waiting on an idle signal fires it.
    pub fn wait_blocking(&self) -> FanOutResult<()> {
        ensure_outside_runtime()?;

        if self.inner.seal_if_idle() {
            self.inner.fire();
        }

        let state = self.inner.lock();
        let _state = self
            .inner
            .fired_cv
            .wait_while(state, |state| state.phase != SignalPhase::Fired)
            .unwrap_or_else(PoisonError::into_inner);

        Ok(())
    }

    /// Like [`CompletionSignal::wait_blocking`], giving up after `timeout`.
    ///
    /// Returns whether the signal fired in time.
    pub fn wait_blocking_timeout(&self, timeout: Duration) -> FanOutResult<bool> {
        ensure_outside_runtime()?;

        if self.inner.seal_if_idle() {
            self.inner.fire();
        }

        let state = self.inner.lock();
        let (state, _) = self
            .inner
            .fired_cv
            .wait_timeout_while(state, timeout, |state| state.phase != SignalPhase::Fired)
            .unwrap_or_else(PoisonError::into_inner);

        Ok(state.phase == SignalPhase::Fired)
    }

    /// Returns the number of entered guards that did not leave yet.
    pub fn remaining(&self) -> usize {
        match self.inner.lock().phase {
            SignalPhase::Armed { remaining } => remaining,
            _ => 0,
        }
    }

    pub fn phase(&self) -> SignalPhase {
        self.inner.lock().phase
    }

    pub fn is_fired(&self) -> bool {
        self.phase() == SignalPhase::Fired
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("phase", &self.phase())
            .finish()
    }
}

/// Proof of one entered unit of work on a [`CompletionSignal`].
///
/// Consumed by [`CompletionGuard::leave`]; dropping it leaves as well.
pub struct CompletionGuard {
    inner: Option<Arc<Inner>>,
}

impl CompletionGuard {
    /// Records the completion of the unit of work this guard was entered for.
    pub fn leave(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.leave();
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.leave();
        }
    }
}

impl fmt::Debug for CompletionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionGuard")
            .field("pending", &self.inner.is_some())
            .finish()
    }
}

fn ensure_outside_runtime() -> FanOutResult<()> {
    if tokio::runtime::Handle::try_current().is_ok() {
        bail!(
            ErrorKind::BlockingWaitInRuntime,
            "Blocking wait on a completion signal from within an async runtime",
            "use `notify` or `fired().await` instead"
        );
    }

    Ok(())
}

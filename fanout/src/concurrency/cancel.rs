use tokio::sync::watch;

/// Transmitter side of a batch cancellation channel.
///
/// [`CancelTx`] requests every subscribed task of a batch to stop. Tasks that have not started
/// fetching resolve as cancelled; tasks already fetching follow the batch's in-flight policy.
/// Cancelling is idempotent and cannot be undone.
#[derive(Debug, Clone)]
pub struct CancelTx(watch::Sender<bool>);

impl CancelTx {
    /// Requests cancellation of the batch.
    pub fn cancel(&self) {
        // Use infallible send to support cancelling before any receivers subscribe.
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Creates a new cancellation receiver subscription.
    pub fn subscribe(&self) -> CancelRx {
        CancelRx(self.0.subscribe())
    }
}

/// Receiver side of a batch cancellation channel.
#[derive(Debug, Clone)]
pub struct CancelRx(watch::Receiver<bool>);

impl CancelRx {
    /// Returns a receiver that is never cancelled.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation was requested.
    ///
    /// Stays pending forever if the transmitter is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Creates a new cancellation channel.
pub fn create_cancel_channel() -> (CancelTx, CancelRx) {
    let (tx, rx) = watch::channel(false);
    (CancelTx(tx), CancelRx(rx))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_cancel_reaches_existing_and_late_subscribers() {
        let (tx, mut rx) = create_cancel_channel();
        assert!(!rx.is_cancelled());

        tx.cancel();

        timeout(Duration::from_secs(1), rx.cancelled()).await.unwrap();
        let mut late = tx.subscribe();
        timeout(Duration::from_secs(1), late.cancelled()).await.unwrap();
        assert!(tx.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_stays_pending() {
        let mut rx = CancelRx::never();

        assert!(timeout(Duration::from_millis(20), rx.cancelled()).await.is_err());
        assert!(!rx.is_cancelled());
    }
}

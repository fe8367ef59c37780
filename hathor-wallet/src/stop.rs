//! The wallet's terminal stop latch.

use tokio::sync::watch;

use crate::error::{WalletError, WalletResult};

/// A one-way latch flipped by `stop()`.
///
/// Once signalled, every clone reports stopped forever: tasks parked on
/// [`stopped`] wake up, late subscribers resolve immediately, and [`check`]
/// turns the latch into the API-level error. This is the single place
/// [`WalletError::Stopped`] comes from — anything that suspends (storage,
/// transport, the tx-queue drain) consults the same latch at its next
/// suspension point.
///
/// [`stopped`]: StopToken::stopped
/// [`check`]: StopToken::check
#[derive(Clone, Debug)]
pub struct StopToken {
    latch: watch::Sender<bool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            latch: watch::channel(false).0,
        }
    }

    /// Signal the stop. Idempotent; there is no un-stop.
    pub fn stop(&self) {
        self.latch.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.latch.borrow()
    }

    /// Wait for the stop signal. Resolves immediately when the wallet was
    /// already stopped.
    pub async fn stopped(&self) {
        let mut rx = self.latch.subscribe();
        // We hold the sender, so the channel cannot close under the wait.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Fail an operation on a stopped wallet.
    pub fn check(&self) -> WalletResult<()> {
        if self.is_stopped() {
            return Err(WalletError::Stopped);
        }
        Ok(())
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[test]
    fn stop_is_idempotent() {
        let stop = StopToken::new();
        assert!(stop.check().is_ok());
        stop.stop();
        stop.stop();
        assert!(stop.is_stopped());
        assert!(matches!(stop.check(), Err(WalletError::Stopped)));
    }

    #[tokio::test]
    async fn waiters_wake_on_stop() {
        let stop = StopToken::new();
        let waiter = stop.clone();
        let handle = tokio::spawn(async move { waiter.stopped().await });
        stop.stop();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter did not wake")
            .unwrap();
    }

    #[tokio::test]
    async fn late_subscribers_see_an_old_stop() {
        let stop = StopToken::new();
        stop.stop();
        let clone = stop.clone();
        timeout(Duration::from_millis(10), clone.stopped())
            .await
            .expect("did not resolve immediately");
    }
}

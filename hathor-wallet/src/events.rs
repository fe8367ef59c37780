//! Typed wallet events, delivered over a broadcast bus.

use std::sync::Arc;

use hathor_common::tx::HistoryTx;
use tokio::sync::broadcast;

/// Buffered events per subscriber before the oldest are dropped.
const EVENT_CHANNEL_SIZE: usize = 256;

/// The wallet lifecycle states.
///
/// `Error` is a sink reachable from any non-terminal state; `Closed` is
/// reachable from any state via `stop()`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WalletState {
    Closed,
    Connecting,
    Syncing,
    Processing,
    Ready,
    Error,
}

/// Everything a wallet announces to its subscribers.
#[derive(Clone, Debug)]
pub enum WalletEvent {
    StateChanged(WalletState),
    NewTx(Arc<HistoryTx>),
    UpdatedTx(Arc<HistoryTx>),
    MoreAddressesLoaded { count: u32 },
}

/// A cloneable bus over which [`WalletEvent`]s are broadcast.
///
/// Built on [`tokio::sync::broadcast`] because (1) notification is a noop
/// when there are no subscribers, which is common, and (2) lagging
/// subscribers don't block the wallet: tx events queue up to the channel
/// size and state changes are newest-wins by construction (a lagged
/// receiver observes only the latest value it can catch up to).
#[derive(Clone)]
pub struct EventsBus {
    event_tx: broadcast::Sender<WalletEvent>,
}

impl EventsBus {
    pub fn new() -> Self {
        Self {
            event_tx: broadcast::channel(EVENT_CHANNEL_SIZE).0,
        }
    }

    /// Send an event onto the bus. A noop if nobody is listening.
    pub fn notify(&self, event: WalletEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Start listening to all events notified after this point.
    pub fn subscribe(&self) -> EventsRx {
        EventsRx {
            event_rx: self.event_tx.subscribe(),
        }
    }
}

impl Default for EventsBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventsRx {
    event_rx: broadcast::Receiver<WalletEvent>,
}

impl EventsRx {
    /// Wait for the next event. Skips over any events missed while lagging.
    pub async fn recv(&mut self) -> Option<WalletEvent> {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match self.event_rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Closed) => return None,
                Err(RecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Wait for the next event that makes `filter` return true.
    ///
    /// Waits indefinitely; wrap in a timeout where needed.
    pub async fn next_filtered(
        &mut self,
        filter: impl Fn(&WalletEvent) -> bool,
    ) -> Option<WalletEvent> {
        loop {
            let event = self.recv().await?;
            if filter(&event) {
                return Some(event);
            }
        }
    }
}

//! History synchronization against the full node.
//!
//! Everything that advances history state — address subscription, bulk
//! fetches, history streaming — runs on a process-wide FIFO lane with a
//! single slot, so no two sync tasks ever interleave writes against the
//! history processor, across every wallet instance in the process.

use std::{
    future::Future,
    str::FromStr,
    sync::{Arc, OnceLock},
};

use bitcoin::secp256k1::Secp256k1;
use hathor_common::{
    access::AccessData,
    address::WalletAddress,
    constants::{ADDRESS_HISTORY_BATCH_SIZE, HISTORY_STREAMING_CAPABILITY},
    tx::HistoryTx,
};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{WalletError, WalletResult},
    events::{EventsBus, WalletEvent},
    scan::ScanPolicy,
    stop::StopToken,
    storage::{ProcessOutcome, Storage},
    transport::{NodeTransport, StreamTarget},
};

/// How the wallet pulls history out of the node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HistorySyncMode {
    /// Paged address-history GETs.
    PollHttp,
    /// Server-pushed history for explicitly named addresses.
    ManualStreamWs,
    /// Server-pushed history; the node walks the xpub lineage itself.
    XpubStreamWs,
}

impl HistorySyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            HistorySyncMode::PollHttp => "poll_http",
            HistorySyncMode::ManualStreamWs => "manual_stream_ws",
            HistorySyncMode::XpubStreamWs => "xpub_stream_ws",
        }
    }
}

impl FromStr for HistorySyncMode {
    type Err = WalletError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poll_http" => Ok(HistorySyncMode::PollHttp),
            "manual_stream_ws" => Ok(HistorySyncMode::ManualStreamWs),
            "xpub_stream_ws" => Ok(HistorySyncMode::XpubStreamWs),
            other => Err(WalletError::UnsupportedSyncMode(other.to_owned())),
        }
    }
}

static SYNC_LANE: OnceLock<Arc<Semaphore>> = OnceLock::new();

fn sync_lane() -> &'static Arc<Semaphore> {
    SYNC_LANE.get_or_init(|| Arc::new(Semaphore::new(1)))
}

/// Run `fut` on the global sync lane. Waiters are served in FIFO order and
/// at most one runs at a time.
pub async fn on_sync_lane<F: Future>(fut: F) -> F::Output {
    let _permit = sync_lane()
        .acquire()
        .await
        .expect("sync lane semaphore is never closed");
    fut.await
}

/// Downgrade a streaming mode when the connection can't stream. Never fails
/// the wallet over a missing capability.
pub fn negotiate_mode(
    configured: HistorySyncMode,
    transport: &dyn NodeTransport,
) -> HistorySyncMode {
    match configured {
        HistorySyncMode::PollHttp => HistorySyncMode::PollHttp,
        streaming => {
            if transport.has_capability(HISTORY_STREAMING_CAPABILITY) {
                streaming
            } else {
                warn!(
                    configured = streaming.as_str(),
                    "node lacks the {HISTORY_STREAMING_CAPABILITY} \
                     capability, downgrading to poll_http"
                );
                HistorySyncMode::PollHttp
            }
        }
    }
}

/// Ingest one history tx and emit the matching wallet events.
pub(crate) async fn ingest_and_emit(
    storage: &Storage,
    events: &EventsBus,
    tx: HistoryTx,
) -> WalletResult<ProcessOutcome> {
    let tx_id = tx.tx_id;
    let outcome = storage.process_new_tx(tx).await?;

    match &outcome {
        ProcessOutcome::New => {
            if let Some(stored) = storage.backend().get_tx(&tx_id).await? {
                events.notify(WalletEvent::NewTx(Arc::new(stored)));
            }
        }
        ProcessOutcome::Updated => {
            if let Some(stored) = storage.backend().get_tx(&tx_id).await? {
                events.notify(WalletEvent::UpdatedTx(Arc::new(stored)));
            }
        }
        ProcessOutcome::Unchanged => {}
        ProcessOutcome::Reprocessed { changed } => {
            if let Some(stored) = storage.backend().get_tx(&tx_id).await? {
                events.notify(WalletEvent::UpdatedTx(Arc::new(stored)));
            }
            for changed_id in changed {
                if let Some(stored) =
                    storage.backend().get_tx(changed_id).await?
                {
                    events.notify(WalletEvent::UpdatedTx(Arc::new(stored)));
                }
            }
        }
    }
    Ok(outcome)
}

/// One wallet's history synchronization, borrowed from the facade for the
/// duration of a lane-serialized task.
pub(crate) struct HistorySync<'a> {
    pub storage: &'a Storage,
    pub transport: &'a dyn NodeTransport,
    pub access: &'a AccessData,
    pub events: &'a EventsBus,
    pub stop: &'a StopToken,
}

impl HistorySync<'_> {
    /// Satisfy the scan policy: derive, subscribe, and fetch history until
    /// the address window stops growing.
    #[instrument(skip_all, name = "(history-sync)")]
    pub async fn run(&self, mode: HistorySyncMode) -> WalletResult<()> {
        // Re-subscribe and re-fetch every address we already track. On a
        // fresh wallet this is a no-op; after a reload or a restart over a
        // persistent backend it rebuilds the derived state.
        let existing: Vec<String> = self
            .storage
            .backend()
            .iter_addresses()
            .await?
            .into_iter()
            .map(|address| address.encoded)
            .collect();
        if !existing.is_empty() {
            for address in &existing {
                self.transport.subscribe_address(address).await?;
            }
            self.fetch_history(mode, &existing).await?;
        }

        self.extend(mode).await?;
        info!("history sync complete");
        Ok(())
    }

    /// Load and fetch only what the scan policy is missing. Used after an
    /// ingestion moves the gap-limit window; already-fetched addresses are
    /// not touched.
    pub async fn extend(&self, mode: HistorySyncMode) -> WalletResult<()> {
        loop {
            self.stop.check()?;
            let policy = self.current_policy().await?;
            let (loaded, highest_used) = self.storage.scan_state().await?;
            let Some(request) = policy.start_addresses(loaded, highest_used)
            else {
                break;
            };
            debug!(
                next_index = request.next_index,
                count = request.count,
                "loading addresses"
            );
            let addresses = self
                .load_addresses(request.next_index, request.count)
                .await?;
            self.fetch_history(mode, &addresses).await?;
        }
        Ok(())
    }

    async fn current_policy(&self) -> WalletResult<ScanPolicy> {
        Ok(self
            .storage
            .backend()
            .get_scan_policy()
            .await?
            .unwrap_or_default())
    }

    /// Derive and persist `count` addresses from `next_index`, subscribing
    /// each with the node.
    async fn load_addresses(
        &self,
        next_index: u32,
        count: u32,
    ) -> WalletResult<Vec<String>> {
        let secp = Secp256k1::new();
        let mut encoded_batch = Vec::with_capacity(count as usize);
        for index in next_index..next_index + count {
            let address = self.access.derive_address(&secp, index)?;
            let record = WalletAddress::new(&address, index);
            let encoded = record.encoded.clone();
            self.storage.backend().save_address(&record).await?;
            self.transport.subscribe_address(&encoded).await?;
            encoded_batch.push(encoded);
        }
        self.events
            .notify(WalletEvent::MoreAddressesLoaded { count });
        Ok(encoded_batch)
    }

    async fn fetch_history(
        &self,
        mode: HistorySyncMode,
        addresses: &[String],
    ) -> WalletResult<()> {
        match mode {
            HistorySyncMode::PollHttp => {
                for chunk in addresses.chunks(ADDRESS_HISTORY_BATCH_SIZE) {
                    let mut cursor = None;
                    loop {
                        self.stop.check()?;
                        let page = self
                            .transport
                            .get_address_history(chunk, cursor.as_ref())
                            .await?;
                        for tx in page.history {
                            ingest_and_emit(self.storage, self.events, tx)
                                .await?;
                        }
                        if !page.has_more {
                            break;
                        }
                        cursor = page.next_cursor;
                    }
                }
            }
            HistorySyncMode::ManualStreamWs => {
                let target = StreamTarget::Addresses(addresses.to_vec());
                self.drain_stream(target).await?;
            }
            HistorySyncMode::XpubStreamWs => {
                let target =
                    StreamTarget::Xpub(self.access.account_xpub.to_string());
                self.drain_stream(target).await?;
            }
        }
        Ok(())
    }

    async fn drain_stream(&self, target: StreamTarget) -> WalletResult<()> {
        let mut rx = self.transport.stream_history(target).await?;
        while let Some(tx) = rx.recv().await {
            self.stop.check()?;
            ingest_and_emit(self.storage, self.events, tx).await?;
        }
        Ok(())
    }
}

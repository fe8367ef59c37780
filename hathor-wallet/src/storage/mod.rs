//! The storage abstraction: logical tables behind a pluggable backend, and
//! the [`Storage`] owner which implements every derived-state operation on
//! top of them.
//!
//! All mutating backend operations are individually atomic. The shipped
//! [`MemoryBackend`] keeps everything in ordered maps; a persistent backend
//! implements the same trait.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use hathor_common::{
    access::AccessData,
    address::WalletAddress,
    amount::TokenAmount,
    token::{TokenBalance, TokenInfo, TokenUid},
    tx::{HistoryTx, TxId},
};
use serde::{Deserialize, Serialize};

use crate::scan::ScanPolicy;

mod memory;
mod processor;

pub use memory::MemoryBackend;
pub use processor::ProcessOutcome;

/// `(tx_id, output_index)`: the identity of an unspent output.
pub type UtxoKey = (TxId, u8);

/// A row of the derived utxo index. A row exists iff the referenced output
/// is unspent, pays a wallet address, and its transaction is not voided.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Utxo {
    pub tx_id: TxId,
    pub index: u8,
    pub token: TokenUid,
    /// The base58 wallet address this output pays to.
    pub address: String,
    pub value: TokenAmount,
    /// Mint/melt bits for authority outputs; 0 for regular outputs.
    pub authorities: u8,
    pub timelock: Option<u32>,
    /// Height of the enclosing block, for mining rewards.
    pub height: Option<u64>,
}

impl Utxo {
    pub fn key(&self) -> UtxoKey {
        (self.tx_id, self.index)
    }

    /// Whether this utxo is excluded from the spendable balance right now.
    pub fn is_locked(
        &self,
        now: u32,
        best_height: u64,
        reward_spend_min_blocks: u64,
    ) -> bool {
        if let Some(timelock) = self.timelock {
            if now < timelock {
                return true;
            }
        }
        if let Some(height) = self.height {
            if best_height < height + reward_spend_min_blocks {
                return true;
            }
        }
        false
    }
}

/// What [`Storage::select_utxos`] should return.
#[derive(Clone, Debug)]
pub struct UtxoFilter {
    pub token: TokenUid,
    /// Mint/melt bits the utxo must carry; 0 selects regular outputs only.
    pub authorities: u8,
    pub max_count: Option<usize>,
    /// Only utxos paying this address.
    pub address: Option<String>,
    pub min_value: Option<TokenAmount>,
    pub max_value: Option<TokenAmount>,
    /// Exclude locked and reserved utxos.
    pub only_available: bool,
    /// Sort by value, largest first.
    pub order_by_value_desc: bool,
}

impl UtxoFilter {
    pub fn for_token(token: TokenUid) -> Self {
        Self {
            token,
            authorities: 0,
            max_count: None,
            address: None,
            min_value: None,
            max_value: None,
            only_available: true,
            order_by_value_desc: false,
        }
    }

    pub fn authorities(mut self, bits: u8) -> Self {
        self.authorities = bits;
        self
    }

    pub fn max_count(mut self, count: usize) -> Self {
        self.max_count = Some(count);
        self
    }

    pub fn address(mut self, address: String) -> Self {
        self.address = Some(address);
        self
    }

    pub fn value_descending(mut self) -> Self {
        self.order_by_value_desc = true;
        self
    }
}

/// The logical-table interface a persistence backend must provide.
///
/// Every method is individually atomic. Ordered iteration contracts:
/// [`iter_addresses`] ascends by derivation index; [`iter_history`] descends
/// by `(timestamp, tx_id)` (newest first).
///
/// [`iter_addresses`]: StorageBackend::iter_addresses
/// [`iter_history`]: StorageBackend::iter_history
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn load_access(&self) -> anyhow::Result<Option<AccessData>>;
    async fn save_access(&self, access: &AccessData) -> anyhow::Result<()>;
    /// Destroy the access data. Only `stop(clean_storage = true)` calls
    /// this.
    async fn remove_access(&self) -> anyhow::Result<()>;

    async fn get_address_at(
        &self,
        index: u32,
    ) -> anyhow::Result<Option<WalletAddress>>;
    async fn get_address(
        &self,
        encoded: &str,
    ) -> anyhow::Result<Option<WalletAddress>>;
    async fn save_address(
        &self,
        address: &WalletAddress,
    ) -> anyhow::Result<()>;
    /// Number of derived addresses (= highest index + 1).
    async fn address_count(&self) -> anyhow::Result<u32>;
    async fn iter_addresses(&self) -> anyhow::Result<Vec<WalletAddress>>;

    async fn get_tx(&self, tx_id: &TxId)
        -> anyhow::Result<Option<HistoryTx>>;
    /// Upsert. Must never silently drop a tx because a prior one shares the
    /// id; re-ingestion reconciles in place.
    async fn add_tx(&self, tx: &HistoryTx) -> anyhow::Result<()>;
    async fn iter_history(&self) -> anyhow::Result<Vec<HistoryTx>>;

    async fn get_token(
        &self,
        uid: &TokenUid,
    ) -> anyhow::Result<Option<TokenInfo>>;
    async fn save_token(&self, token: &TokenInfo) -> anyhow::Result<()>;
    async fn iter_tokens(&self) -> anyhow::Result<Vec<TokenInfo>>;

    async fn get_utxo(&self, key: &UtxoKey)
        -> anyhow::Result<Option<Utxo>>;
    async fn save_utxo(&self, utxo: &Utxo) -> anyhow::Result<()>;
    async fn remove_utxo(&self, key: &UtxoKey) -> anyhow::Result<()>;
    async fn iter_utxos(&self) -> anyhow::Result<Vec<Utxo>>;
    async fn clear_utxos(&self) -> anyhow::Result<()>;

    async fn get_scan_policy(&self) -> anyhow::Result<Option<ScanPolicy>>;
    async fn set_scan_policy(
        &self,
        policy: &ScanPolicy,
    ) -> anyhow::Result<()>;

    /// Drop history and derived state; optionally addresses and the token
    /// registry too. Access data survives.
    async fn clean(
        &self,
        clean_addresses: bool,
        clean_tokens: bool,
    ) -> anyhow::Result<()>;
}

/// The wallet's view of the chain, needed by the lock rules.
#[derive(Copy, Clone, Debug, Default)]
struct ChainView {
    best_height: u64,
    reward_spend_min_blocks: u64,
}

/// Owns a [`StorageBackend`] and implements the derived-state operations:
/// balances, utxo selection, reservation bookkeeping, and (in
/// [`processor`]) history ingestion.
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
    /// Advisory "do not re-select" markers with wall-clock expiry,
    /// evaluated lazily at read time. Never persisted.
    selected: StdMutex<HashMap<UtxoKey, Instant>>,
    chain: StdMutex<ChainView>,
}

impl Storage {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            selected: StdMutex::new(HashMap::new()),
            chain: StdMutex::new(ChainView::default()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Preregister the native token if the registry doesn't have it yet.
    pub async fn ensure_native_token(&self) -> anyhow::Result<()> {
        if self.backend.get_token(&TokenUid::Native).await?.is_none() {
            self.backend.save_token(&TokenInfo::native()).await?;
        }
        Ok(())
    }

    // --- Chain view --- //

    pub fn set_reward_spend_min_blocks(&self, blocks: u64) {
        self.chain.lock().unwrap().reward_spend_min_blocks = blocks;
    }

    pub fn best_height(&self) -> u64 {
        self.chain.lock().unwrap().best_height
    }

    /// Raise the best known block height. Never lowers it.
    pub fn observe_height(&self, height: u64) {
        let mut chain = self.chain.lock().unwrap();
        if height > chain.best_height {
            chain.best_height = height;
        }
    }

    fn chain_view(&self) -> ChainView {
        *self.chain.lock().unwrap()
    }

    // --- Address queries --- //

    pub async fn is_address_mine(&self, encoded: &str) -> anyhow::Result<bool> {
        Ok(self.backend.get_address(encoded).await?.is_some())
    }

    /// `(derived_count, highest_index_with_transactions)`: the inputs the
    /// scan policy decides from.
    pub async fn scan_state(&self) -> anyhow::Result<(u32, Option<u32>)> {
        let loaded = self.backend.address_count().await?;
        let highest_used = self
            .backend
            .iter_addresses()
            .await?
            .into_iter()
            .filter(|address| address.num_transactions > 0)
            .map(|address| address.index)
            .max();
        Ok((loaded, highest_used))
    }

    // --- Utxo selection & reservation --- //

    /// All utxos matching `filter`, with lock state evaluated against the
    /// current time and chain view.
    pub async fn select_utxos(
        &self,
        filter: &UtxoFilter,
    ) -> anyhow::Result<Vec<Utxo>> {
        let now = unix_now();
        let chain = self.chain_view();

        let mut matches: Vec<Utxo> = self
            .backend
            .iter_utxos()
            .await?
            .into_iter()
            .filter(|utxo| utxo.token == filter.token)
            .filter(|utxo| {
                if filter.authorities == 0 {
                    utxo.authorities == 0
                } else {
                    utxo.authorities & filter.authorities
                        == filter.authorities
                }
            })
            .filter(|utxo| {
                filter
                    .address
                    .as_deref()
                    .map_or(true, |address| address == utxo.address)
            })
            .filter(|utxo| {
                filter.min_value.is_none()
                    || utxo.value >= filter.min_value.unwrap()
            })
            .filter(|utxo| {
                filter.max_value.is_none()
                    || utxo.value <= filter.max_value.unwrap()
            })
            .filter(|utxo| {
                !filter.only_available
                    || (!utxo.is_locked(
                        now,
                        chain.best_height,
                        chain.reward_spend_min_blocks,
                    ) && !self.is_selected(&utxo.key()))
            })
            .collect();

        if filter.order_by_value_desc {
            matches.sort_by(|a, b| {
                b.value.cmp(&a.value).then_with(|| a.key().cmp(&b.key()))
            });
        }
        if let Some(max_count) = filter.max_count {
            matches.truncate(max_count);
        }
        Ok(matches)
    }

    /// Set or clear the advisory "do not re-select" marker. The TTL expires
    /// on its own; the reservation is advisory only.
    pub fn mark_selected(&self, key: UtxoKey, selected: bool, ttl: Duration) {
        let mut selected_map = self.selected.lock().unwrap();
        if selected {
            selected_map.insert(key, Instant::now() + ttl);
        } else {
            selected_map.remove(&key);
        }
    }

    pub fn is_selected(&self, key: &UtxoKey) -> bool {
        let mut selected_map = self.selected.lock().unwrap();
        match selected_map.get(key) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                selected_map.remove(key);
                false
            }
            None => false,
        }
    }

    // --- Balances --- //

    /// The live balance of one token, computed from the utxo index and the
    /// current lock state.
    pub async fn get_balance(
        &self,
        token: &TokenUid,
    ) -> anyhow::Result<TokenBalance> {
        let now = unix_now();
        let chain = self.chain_view();
        let mut balance = TokenBalance::default();

        for utxo in self.backend.iter_utxos().await? {
            if utxo.token != *token {
                continue;
            }
            let locked = utxo.is_locked(
                now,
                chain.best_height,
                chain.reward_spend_min_blocks,
            );
            if utxo.authorities == 0 {
                balance.tokens.credit(utxo.value, locked);
            } else {
                if utxo.authorities & hathor_common::tx::AUTHORITY_MINT != 0 {
                    balance
                        .authorities
                        .mint
                        .credit(TokenAmount::ONE, locked);
                }
                if utxo.authorities & hathor_common::tx::AUTHORITY_MELT != 0 {
                    balance
                        .authorities
                        .melt
                        .credit(TokenAmount::ONE, locked);
                }
            }
        }
        Ok(balance)
    }

    // --- History queries --- //

    /// Wallet history touching `token`, newest first.
    pub async fn token_history(
        &self,
        token: &TokenUid,
    ) -> anyhow::Result<Vec<HistoryTx>> {
        let history = self.backend.iter_history().await?;
        Ok(history
            .into_iter()
            .filter(|tx| tx.touched_tokens().contains(token))
            .collect())
    }
}

/// Current unix time in seconds, saturated into the timestamp width used by
/// the ledger.
pub(crate) fn unix_now() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

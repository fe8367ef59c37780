//! The shipped all-in-memory backend: ordered maps under a single lock.
//! Every trait method takes the lock once, which gives the required
//! per-operation atomicity.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::RwLock,
};

use async_trait::async_trait;
use hathor_common::{
    access::AccessData,
    address::WalletAddress,
    token::{TokenInfo, TokenUid},
    tx::{HistoryTx, TxId},
};

use crate::{
    scan::ScanPolicy,
    storage::{StorageBackend, Utxo, UtxoKey},
};

#[derive(Default)]
struct Tables {
    access: Option<AccessData>,
    addresses_by_index: BTreeMap<u32, WalletAddress>,
    index_by_encoded: HashMap<String, u32>,
    txs: HashMap<TxId, HistoryTx>,
    /// `(timestamp, tx_id)` pairs for ordered history iteration.
    history_index: BTreeSet<(u32, TxId)>,
    tokens: BTreeMap<TokenUid, TokenInfo>,
    utxos: BTreeMap<UtxoKey, Utxo>,
    scan_policy: Option<ScanPolicy>,
}

pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load_access(&self) -> anyhow::Result<Option<AccessData>> {
        Ok(self.tables.read().unwrap().access.clone())
    }

    async fn save_access(&self, access: &AccessData) -> anyhow::Result<()> {
        self.tables.write().unwrap().access = Some(access.clone());
        Ok(())
    }

    async fn remove_access(&self) -> anyhow::Result<()> {
        self.tables.write().unwrap().access = None;
        Ok(())
    }

    async fn get_address_at(
        &self,
        index: u32,
    ) -> anyhow::Result<Option<WalletAddress>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .addresses_by_index
            .get(&index)
            .cloned())
    }

    async fn get_address(
        &self,
        encoded: &str,
    ) -> anyhow::Result<Option<WalletAddress>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .index_by_encoded
            .get(encoded)
            .and_then(|index| tables.addresses_by_index.get(index))
            .cloned())
    }

    async fn save_address(
        &self,
        address: &WalletAddress,
    ) -> anyhow::Result<()> {
        let mut tables = self.tables.write().unwrap();
        tables
            .index_by_encoded
            .insert(address.encoded.clone(), address.index);
        tables
            .addresses_by_index
            .insert(address.index, address.clone());
        Ok(())
    }

    async fn address_count(&self) -> anyhow::Result<u32> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .addresses_by_index
            .last_key_value()
            .map(|(index, _)| index + 1)
            .unwrap_or(0))
    }

    async fn iter_addresses(&self) -> anyhow::Result<Vec<WalletAddress>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .addresses_by_index
            .values()
            .cloned()
            .collect())
    }

    async fn get_tx(
        &self,
        tx_id: &TxId,
    ) -> anyhow::Result<Option<HistoryTx>> {
        Ok(self.tables.read().unwrap().txs.get(tx_id).cloned())
    }

    async fn add_tx(&self, tx: &HistoryTx) -> anyhow::Result<()> {
        let mut tables = self.tables.write().unwrap();
        if let Some(prev) = tables.txs.insert(tx.tx_id, tx.clone()) {
            if prev.timestamp != tx.timestamp {
                tables.history_index.remove(&(prev.timestamp, prev.tx_id));
            }
        }
        tables.history_index.insert((tx.timestamp, tx.tx_id));
        Ok(())
    }

    async fn iter_history(&self) -> anyhow::Result<Vec<HistoryTx>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .history_index
            .iter()
            .rev()
            .filter_map(|(_, tx_id)| tables.txs.get(tx_id).cloned())
            .collect())
    }

    async fn get_token(
        &self,
        uid: &TokenUid,
    ) -> anyhow::Result<Option<TokenInfo>> {
        Ok(self.tables.read().unwrap().tokens.get(uid).cloned())
    }

    async fn save_token(&self, token: &TokenInfo) -> anyhow::Result<()> {
        self.tables
            .write()
            .unwrap()
            .tokens
            .insert(token.uid.clone(), token.clone());
        Ok(())
    }

    async fn iter_tokens(&self) -> anyhow::Result<Vec<TokenInfo>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .tokens
            .values()
            .cloned()
            .collect())
    }

    async fn get_utxo(&self, key: &UtxoKey) -> anyhow::Result<Option<Utxo>> {
        Ok(self.tables.read().unwrap().utxos.get(key).cloned())
    }

    async fn save_utxo(&self, utxo: &Utxo) -> anyhow::Result<()> {
        self.tables
            .write()
            .unwrap()
            .utxos
            .insert(utxo.key(), utxo.clone());
        Ok(())
    }

    async fn remove_utxo(&self, key: &UtxoKey) -> anyhow::Result<()> {
        self.tables.write().unwrap().utxos.remove(key);
        Ok(())
    }

    async fn iter_utxos(&self) -> anyhow::Result<Vec<Utxo>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .utxos
            .values()
            .cloned()
            .collect())
    }

    async fn clear_utxos(&self) -> anyhow::Result<()> {
        self.tables.write().unwrap().utxos.clear();
        Ok(())
    }

    async fn get_scan_policy(&self) -> anyhow::Result<Option<ScanPolicy>> {
        Ok(self.tables.read().unwrap().scan_policy)
    }

    async fn set_scan_policy(
        &self,
        policy: &ScanPolicy,
    ) -> anyhow::Result<()> {
        self.tables.write().unwrap().scan_policy = Some(*policy);
        Ok(())
    }

    async fn clean(
        &self,
        clean_addresses: bool,
        clean_tokens: bool,
    ) -> anyhow::Result<()> {
        let mut tables = self.tables.write().unwrap();
        tables.txs.clear();
        tables.history_index.clear();
        tables.utxos.clear();
        if clean_addresses {
            tables.addresses_by_index.clear();
            tables.index_by_encoded.clear();
        } else {
            // History is gone; the per-address counters are derived from
            // it and must reset with it.
            for address in tables.addresses_by_index.values_mut() {
                address.num_transactions = 0;
                address.used = false;
            }
        }
        if clean_tokens {
            tables.tokens.clear();
        } else {
            // History is gone; zero out the cached balances and counters.
            for token in tables.tokens.values_mut() {
                token.num_transactions = 0;
                token.balance = Default::default();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use hathor_common::tx::{ProcessingStatus, TxVersion};

    use super::*;

    fn tx_at(timestamp: u32, id_byte: u8) -> HistoryTx {
        HistoryTx {
            tx_id: TxId::from_bytes([id_byte; 32]),
            version: TxVersion::Transaction,
            weight: 1.0,
            timestamp,
            is_voided: false,
            height: None,
            first_block: None,
            processing_status: ProcessingStatus::Finished,
            parents: vec![],
            inputs: vec![],
            outputs: vec![],
            tokens: vec![],
            token_name: None,
            token_symbol: None,
            nano_header: None,
        }
    }

    #[tokio::test]
    async fn history_iterates_newest_first() {
        let backend = MemoryBackend::new();
        backend.add_tx(&tx_at(100, 1)).await.unwrap();
        backend.add_tx(&tx_at(300, 2)).await.unwrap();
        backend.add_tx(&tx_at(200, 3)).await.unwrap();

        let history = backend.iter_history().await.unwrap();
        let timestamps: Vec<u32> =
            history.iter().map(|tx| tx.timestamp).collect();
        assert_eq!(timestamps, vec![300, 200, 100]);
    }

    #[tokio::test]
    async fn add_tx_is_upsert() {
        let backend = MemoryBackend::new();
        let mut tx = tx_at(100, 1);
        backend.add_tx(&tx).await.unwrap();
        tx.is_voided = true;
        backend.add_tx(&tx).await.unwrap();

        let stored = backend.get_tx(&tx.tx_id).await.unwrap().unwrap();
        assert!(stored.is_voided);
        assert_eq!(backend.iter_history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_with_new_timestamp_reindexes() {
        let backend = MemoryBackend::new();
        let mut tx = tx_at(100, 1);
        backend.add_tx(&tx).await.unwrap();
        tx.timestamp = 400;
        backend.add_tx(&tx).await.unwrap();

        let history = backend.iter_history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].timestamp, 400);
    }

    #[tokio::test]
    async fn address_count_tracks_highest_index() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.address_count().await.unwrap(), 0);
        let address = WalletAddress {
            encoded: "HAddr".to_owned(),
            index: 4,
            num_transactions: 0,
            used: false,
            seqnum: 0,
        };
        backend.save_address(&address).await.unwrap();
        assert_eq!(backend.address_count().await.unwrap(), 5);
    }
}

//! Shared helpers for the engine's own tests: a fluent history-tx builder
//! and a storage pre-seeded with wallet addresses.

use hathor_common::{
    address::WalletAddress,
    amount::TokenAmount,
    token::TokenUid,
    tx::{
        HistoryInput, HistoryOutput, HistoryTx, ProcessingStatus, TxId,
        TxVersion, AUTHORITY_MELT, AUTHORITY_MINT,
    },
};

use crate::storage::Storage;

pub(crate) fn tx_id(n: u8) -> TxId {
    TxId::from_bytes([n; 32])
}

/// A storage whose address table contains `addresses` at indices `0..n`.
pub(crate) async fn storage_with_addresses(addresses: &[&str]) -> Storage {
    let storage = Storage::in_memory();
    storage.ensure_native_token().await.unwrap();
    for (index, encoded) in addresses.iter().enumerate() {
        storage
            .backend()
            .save_address(&WalletAddress {
                encoded: (*encoded).to_owned(),
                index: index as u32,
                num_transactions: 0,
                used: false,
                seqnum: 0,
            })
            .await
            .unwrap();
    }
    storage
}

pub(crate) struct HistoryTxBuilder {
    tx: HistoryTx,
}

impl HistoryTxBuilder {
    pub fn new(id: u8, timestamp: u32) -> Self {
        Self {
            tx: HistoryTx {
                tx_id: tx_id(id),
                version: TxVersion::Transaction,
                weight: 10.0,
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
            },
        }
    }

    pub fn block(mut self, height: u64) -> Self {
        self.tx.version = TxVersion::Block;
        self.tx.height = Some(height);
        self
    }

    pub fn voided(mut self) -> Self {
        self.tx.is_voided = true;
        self
    }

    pub fn first_block(mut self, id: u8) -> Self {
        self.tx.first_block = Some(tx_id(id));
        self
    }

    pub fn create_token(mut self, name: &str, symbol: &str) -> Self {
        self.tx.version = TxVersion::CreateToken;
        self.tx.token_name = Some(name.to_owned());
        self.tx.token_symbol = Some(symbol.to_owned());
        self
    }

    pub fn token(mut self, uid: TokenUid) -> Self {
        self.tx.tokens.push(uid);
        self
    }

    pub fn input(mut self, spent_id: u8, index: u8) -> Self {
        self.tx.inputs.push(HistoryInput {
            tx_id: tx_id(spent_id),
            index,
        });
        self
    }

    /// A native-token output paying `address`.
    pub fn output(self, address: &str, value: u64) -> Self {
        self.output_raw(address, value, 0, None)
    }

    /// An output of the token at table index `token_index`.
    pub fn token_output(
        self,
        address: &str,
        value: u64,
        token_index: u8,
    ) -> Self {
        self.output_raw(address, value, token_index, None)
    }

    pub fn timelocked_output(
        self,
        address: &str,
        value: u64,
        timelock: u32,
    ) -> Self {
        self.output_raw(address, value, 0, Some(timelock))
    }

    pub fn mint_authority(self, address: &str, token_index: u8) -> Self {
        self.output_raw(
            address,
            AUTHORITY_MINT as u64,
            token_index | 0x80,
            None,
        )
    }

    pub fn melt_authority(self, address: &str, token_index: u8) -> Self {
        self.output_raw(
            address,
            AUTHORITY_MELT as u64,
            token_index | 0x80,
            None,
        )
    }

    fn output_raw(
        mut self,
        address: &str,
        value: u64,
        token_data: u8,
        timelock: Option<u32>,
    ) -> Self {
        self.tx.outputs.push(HistoryOutput {
            value: TokenAmount::from_u64(value),
            token_data,
            script: vec![],
            decoded_address: Some(address.to_owned()),
            timelock,
            spent_by: None,
        });
        self
    }

    pub fn build(self) -> HistoryTx {
        self.tx
    }
}

//! Request / response models for the full node and mining collaborators.
//! The wire format is the transport adapter's concern; these are the typed
//! shapes the wallet core consumes.

use serde::{Deserialize, Serialize};

use crate::{
    amount::TokenAmount,
    token::TokenUid,
    tx::{HistoryTx, TxId},
};

/// The sentinel message some node builds return for a missing transaction.
/// The response layer detects it and surfaces a typed "not found" instead.
pub const TX_NOT_FOUND_MESSAGE: &str = "Transaction not found";

/// Consensus and policy parameters reported by the full node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeVersion {
    pub version: String,
    pub network: String,
    pub min_weight: f64,
    pub min_tx_weight: f64,
    pub min_tx_weight_coefficient: f64,
    pub min_tx_weight_k: f64,
    /// Fraction of minted value that must be deposited in native token.
    pub token_deposit_percentage: f64,
    /// Blocks a mining reward must wait before it can be spent.
    pub reward_spend_min_blocks: u64,
    pub max_number_inputs: usize,
    pub max_number_outputs: usize,
}

impl Default for NodeVersion {
    fn default() -> Self {
        Self {
            version: String::new(),
            network: "mainnet".to_owned(),
            min_weight: 14.0,
            min_tx_weight: 14.0,
            min_tx_weight_coefficient: 1.6,
            min_tx_weight_k: 100.0,
            token_deposit_percentage: 0.01,
            reward_spend_min_blocks: 300,
            max_number_inputs: 255,
            max_number_outputs: 255,
        }
    }
}

/// DAG metadata the node reports alongside a transaction.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxMetadata {
    /// Hashes of the transactions (or itself) voiding this tx; empty when
    /// not voided.
    #[serde(default)]
    pub voided_by: Vec<TxId>,
    pub first_block: Option<TxId>,
}

/// A transaction fetched by id, with its metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxWithMeta {
    pub tx: HistoryTx,
    pub meta: TxMetadata,
}

/// Paging cursor for address-history fetches: resume after
/// `(first_address, first_hash)`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HistoryCursor {
    pub address: String,
    pub hash: TxId,
}

/// One page of address history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressHistoryPage {
    pub history: Vec<HistoryTx>,
    pub has_more: bool,
    /// Set when `has_more`: where the next page starts.
    pub next_cursor: Option<HistoryCursor>,
}

/// A reference to an authority output as reported by token-info queries.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AuthorityRef {
    pub tx_id: TxId,
    pub index: u8,
}

/// Global information about a token, as known by the node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenDetails {
    pub uid: TokenUid,
    pub name: String,
    pub symbol: String,
    pub total: TokenAmount,
    pub transactions_count: u64,
    pub mint: Vec<AuthorityRef>,
    pub melt: Vec<AuthorityRef>,
}

/// Status of a submitted mining job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Mining,
    /// The job finished; `tx_hex` carries the tx with weight, parents, and
    /// nonce filled in.
    Done { tx_hex: String },
    Failed { message: String },
    Cancelled,
}

/// The kinds of graphviz neighborhood queries the node supports.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphvizNeighborKind {
    Funds,
    Verification,
}

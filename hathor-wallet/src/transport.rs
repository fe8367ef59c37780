//! Abstract interfaces to the remote collaborators: the full node (HTTP +
//! push channel) and the tx-mining service. The engine depends only on
//! these traits; wire adapters live outside the core.

use std::time::Duration;

use async_trait::async_trait;
use hathor_common::{
    api::{
        AddressHistoryPage, GraphvizNeighborKind, HistoryCursor, JobStatus,
        NodeVersion, TokenDetails, TxMetadata, TxWithMeta,
        TX_NOT_FOUND_MESSAGE,
    },
    token::TokenUid,
    tx::{HistoryTx, TxId},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::error::{WalletError, WalletResult};

#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// The request did not complete; it may be retried.
    #[error("transport error: {0}")]
    Transport(String),
    /// The collaborator answered outside the protocol; retrying won't help.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transport(_))
    }
}

impl From<TransportError> for WalletError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Transport(msg) => WalletError::Transport(msg),
            TransportError::Protocol(msg) => WalletError::Protocol(msg),
        }
    }
}

/// Connection lifecycle reported by the transport.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnState {
    Connected,
    Disconnected,
}

/// Messages pushed by the node over the realtime channel.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    StateChanged(ConnState),
    /// A `wallet:address_history` push: a tx touching a subscribed address.
    AddressHistory(Box<HistoryTx>),
}

/// What a streaming history fetch is keyed on.
#[derive(Clone, Debug)]
pub enum StreamTarget {
    /// The node walks the xpub's address lineage server-side.
    Xpub(String),
    /// The wallet names the addresses explicitly.
    Addresses(Vec<String>),
}

/// The raw shape of a get-transaction response, before sentinel detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxResponse {
    pub success: bool,
    pub tx: Option<HistoryTx>,
    pub meta: Option<TxMetadata>,
    pub message: Option<String>,
}

/// Detect the node's `"Transaction not found"` sentinel and lift the raw
/// response into a typed result. This is the only place the sentinel string
/// is interpreted.
pub fn resolve_tx_response(
    tx_id: TxId,
    response: TxResponse,
) -> WalletResult<TxWithMeta> {
    if response.success {
        let tx = response.tx.ok_or_else(|| {
            WalletError::Protocol("success response with no tx".to_owned())
        })?;
        let meta = response.meta.unwrap_or_default();
        return Ok(TxWithMeta { tx, meta });
    }
    match response.message.as_deref() {
        Some(TX_NOT_FOUND_MESSAGE) => Err(WalletError::TxNotFound(tx_id)),
        Some(message) => Err(WalletError::Protocol(message.to_owned())),
        None => Err(WalletError::Protocol(
            "failure response with no message".to_owned(),
        )),
    }
}

/// The full node, as the wallet core sees it.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn get_version(&self) -> Result<NodeVersion, TransportError>;

    async fn get_transaction(
        &self,
        tx_id: TxId,
    ) -> Result<TxResponse, TransportError>;

    async fn get_confirmation_data(
        &self,
        tx_id: TxId,
    ) -> Result<serde_json::Value, TransportError>;

    async fn get_graphviz_neighbors(
        &self,
        tx_id: TxId,
        kind: GraphvizNeighborKind,
        max_level: u8,
    ) -> Result<String, TransportError>;

    /// One page of history for a batch of addresses.
    async fn get_address_history(
        &self,
        addresses: &[String],
        cursor: Option<&HistoryCursor>,
    ) -> Result<AddressHistoryPage, TransportError>;

    /// Server-pushed history for the given target. The stream ends when the
    /// server has sent everything it knows.
    async fn stream_history(
        &self,
        target: StreamTarget,
    ) -> Result<mpsc::Receiver<HistoryTx>, TransportError>;

    /// Whether the connected node advertises `capability`.
    fn has_capability(&self, capability: &str) -> bool;

    async fn subscribe_address(
        &self,
        address: &str,
    ) -> Result<(), TransportError>;

    async fn unsubscribe_address(
        &self,
        address: &str,
    ) -> Result<(), TransportError>;

    async fn get_token_details(
        &self,
        uid: &TokenUid,
    ) -> Result<Option<TokenDetails>, TransportError>;

    /// Subscribe to connection state changes and pushed history messages.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// The tx-mining service, which fills in weight/parents/nonce and
/// propagates the result.
#[async_trait]
pub trait MiningTransport: Send + Sync {
    /// Submit a signed tx for mining; returns a job id.
    async fn submit_job(
        &self,
        tx_hex: &str,
        propagate: bool,
        add_parents: bool,
        timeout: Option<Duration>,
    ) -> Result<String, TransportError>;

    async fn get_job_status(
        &self,
        job_id: &str,
    ) -> Result<JobStatus, TransportError>;

    async fn cancel_job(&self, job_id: &str)
        -> Result<(), TransportError>;
}

#[cfg(test)]
mod test {
    use super::*;

    fn not_found_response() -> TxResponse {
        TxResponse {
            success: false,
            tx: None,
            meta: None,
            message: Some(TX_NOT_FOUND_MESSAGE.to_owned()),
        }
    }

    #[test]
    fn sentinel_becomes_typed_not_found() {
        let tx_id = TxId::from_bytes([1u8; 32]);
        let err =
            resolve_tx_response(tx_id, not_found_response()).unwrap_err();
        assert!(matches!(err, WalletError::TxNotFound(id) if id == tx_id));
    }

    #[test]
    fn other_failures_are_protocol_errors() {
        let tx_id = TxId::from_bytes([1u8; 32]);
        let response = TxResponse {
            message: Some("internal error".to_owned()),
            ..not_found_response()
        };
        let err = resolve_tx_response(tx_id, response).unwrap_err();
        assert!(matches!(err, WalletError::Protocol(_)));
    }
}

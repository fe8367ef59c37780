//! The typed errors surfaced by the wallet engine's public API.

use hathor_common::{access::AccessError, token::TokenUid, tx::TxId, TokenAmount};
use thiserror::Error;

use crate::builder::AuthorityKind;

pub type WalletResult<T> = Result<T, WalletError>;

#[derive(Debug, Error)]
pub enum WalletError {
    /// Operation requires a completed `start()`.
    #[error("wallet is not initialized")]
    NotInitialized,

    /// Operation requires private keys absent in this wallet.
    #[error("wallet is read-only")]
    ReadOnly,

    #[error("operation requires a pin")]
    PinRequired,

    #[error("wrong pin")]
    WrongPin,

    #[error("wrong password")]
    WrongPassword,

    #[error("address does not belong to this wallet: {0}")]
    AddressNotMine(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error(
        "insufficient funds for {token}: required {required}, \
         available {available}"
    )]
    InsufficientFunds {
        token: TokenUid,
        required: TokenAmount,
        available: TokenAmount,
    },

    /// No unspent authority output of the requested kind is available.
    #[error("no {kind} authority available for token {token}")]
    NoAuthorityAvailable {
        token: TokenUid,
        kind: AuthorityKind,
    },

    #[error("invalid authority kind: {0}")]
    InvalidAuthorityKind(String),

    #[error("transaction not found: {0}")]
    TxNotFound(TxId),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// E.g. an index-limit operation on a gap-limit wallet.
    #[error("scan policy mismatch: {0}")]
    PolicyMismatch(&'static str),

    #[error("unsupported history sync mode: {0}")]
    UnsupportedSyncMode(String),

    /// The wallet was configured without a token; token-scoped history
    /// queries have nothing to resolve against.
    #[error("wallet token is not set")]
    TokenNotSet,

    #[error("contract error: {0}")]
    NanoContract(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// The wallet was stopped; start it again before calling this.
    #[error("wallet is stopped")]
    Stopped,

    /// A transient transport failure; the request may be retried.
    #[error("transport error: {0}")]
    Transport(String),

    /// The collaborator answered with something the protocol does not
    /// allow; retrying will not help.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// `start()` input validation failed.
    #[error("invalid wallet configuration: {0}")]
    InvalidConfig(String),
}

impl From<AccessError> for WalletError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::WrongPin => WalletError::WrongPin,
            AccessError::WrongPassword => WalletError::WrongPassword,
            AccessError::ReadOnly | AccessError::NoSeed =>
                WalletError::ReadOnly,
            other => WalletError::InvalidConfig(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for WalletError {
    fn from(err: anyhow::Error) -> Self {
        WalletError::Storage(format!("{err:#}"))
    }
}

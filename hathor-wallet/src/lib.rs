//! The in-memory wallet engine for the Hathor DAG ledger.
//!
//! The engine owns a deterministic key hierarchy, tracks a local view of
//! the chain (addresses, transactions, utxos, token balances), reacts to
//! streaming ledger events, and constructs / signs transactions that spend
//! the wallet's funds. Transports to the full node and the tx-mining
//! service are collaborator traits ([`transport`]); persistence is a
//! pluggable backend ([`storage::StorageBackend`]) with an in-memory
//! default.
//!
//! Entry point: [`wallet::HathorWallet`].

#![deny(non_snake_case)]

pub mod builder;
pub mod error;
pub mod events;
pub mod scan;
pub mod select;
pub mod signer;
pub mod stop;
pub mod storage;
pub mod sync;
pub mod template;
pub mod transport;
pub mod wallet;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{WalletError, WalletResult};
pub use events::{WalletEvent, WalletState};
pub use wallet::{HathorWallet, WalletConfig};

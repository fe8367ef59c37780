//! Domain types and key material for the Hathor wallet core.
//!
//! This crate is the I/O-free half of the wallet: amounts, tokens, the
//! canonical transaction codec, output scripts, addresses, the BIP32 access
//! data with its encrypted private material, and the small runtime utilities
//! (entropy, tasks, logging) shared by wallet binaries.

// Deny suspicious match names that are probably non-existent variants.
#![deny(non_snake_case)]

pub mod access;
pub mod address;
pub mod aes;
pub mod amount;
pub mod api;
pub mod constants;
pub mod entropy;
pub mod hex;
pub mod logger;
pub mod network;
pub mod password;
pub mod script;
pub mod seed;
pub mod task;
pub mod token;
pub mod tx;

pub use amount::TokenAmount;
pub use network::Network;
pub use token::TokenUid;
pub use tx::TxId;

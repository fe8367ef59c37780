//! Base58check addresses and the wallet's per-index address records.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use bitcoin::{
    base58,
    hashes::{hash160, Hash},
    secp256k1::PublicKey,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::Network;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum AddressError {
    #[error("address is not valid base58check: {0}")]
    Base58(String),
    #[error("address payload must be 21 bytes, got {0}")]
    BadLength(usize),
    #[error("unknown address version byte: {0:#04x}")]
    UnknownVersion(u8),
    #[error("address belongs to a different network")]
    WrongNetwork,
}

/// Whether an address commits to a pubkey hash or a script hash.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    P2pkh,
    P2sh,
}

/// A decoded wallet address: a 20-byte hash plus the network and kind
/// implied by its version byte. For the same `(network, kind, hash)` the
/// base58 form is deterministic.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Address {
    pub network: Network,
    pub kind: AddressKind,
    pub hash: [u8; 20],
}

impl Address {
    /// The P2PKH address of a compressed public key.
    pub fn from_pubkey(pubkey: &PublicKey, network: Network) -> Self {
        let hash = hash160::Hash::hash(&pubkey.serialize()).to_byte_array();
        Self {
            network,
            kind: AddressKind::P2pkh,
            hash,
        }
    }

    /// The P2SH address committing to `redeem_script`.
    pub fn from_redeem_script(redeem_script: &[u8], network: Network) -> Self {
        let hash = hash160::Hash::hash(redeem_script).to_byte_array();
        Self {
            network,
            kind: AddressKind::P2sh,
            hash,
        }
    }

    fn version_byte(&self) -> u8 {
        match self.kind {
            AddressKind::P2pkh => self.network.p2pkh_version_byte(),
            AddressKind::P2sh => self.network.p2sh_version_byte(),
        }
    }

    /// Decode a base58check address, inferring the network and kind from the
    /// version byte.
    pub fn decode(s: &str) -> Result<Self, AddressError> {
        let payload = base58::decode_check(s)
            .map_err(|e| AddressError::Base58(e.to_string()))?;
        if payload.len() != 21 {
            return Err(AddressError::BadLength(payload.len()));
        }
        let version = payload[0];
        let hash: [u8; 20] = payload[1..].try_into().unwrap();

        for network in Network::ALL {
            let kind = if version == network.p2pkh_version_byte() {
                AddressKind::P2pkh
            } else if version == network.p2sh_version_byte() {
                AddressKind::P2sh
            } else {
                continue;
            };
            return Ok(Self {
                network,
                kind,
                hash,
            });
        }
        Err(AddressError::UnknownVersion(version))
    }

    /// Decode and verify the address belongs to `network`. Networks which
    /// share version bytes (testnet and privatenet) both accept each other's
    /// encodings, so this checks the raw version byte rather than the
    /// network inferred by [`Address::decode`].
    pub fn decode_for_network(
        s: &str,
        network: Network,
    ) -> Result<Self, AddressError> {
        let payload = base58::decode_check(s)
            .map_err(|e| AddressError::Base58(e.to_string()))?;
        if payload.len() != 21 {
            return Err(AddressError::BadLength(payload.len()));
        }
        let version = payload[0];
        let hash: [u8; 20] = payload[1..].try_into().unwrap();
        let kind = if version == network.p2pkh_version_byte() {
            AddressKind::P2pkh
        } else if version == network.p2sh_version_byte() {
            AddressKind::P2sh
        } else {
            return Err(AddressError::WrongNetwork);
        };
        Ok(Self {
            network,
            kind,
            hash,
        })
    }

    /// The output script paying to this address.
    pub fn to_script(&self, timelock: Option<u32>) -> Vec<u8> {
        match self.kind {
            AddressKind::P2pkh => crate::script::p2pkh_script(&self.hash, timelock),
            AddressKind::P2sh => crate::script::p2sh_script(&self.hash, timelock),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut payload = [0u8; 21];
        payload[0] = self.version_byte();
        payload[1..].copy_from_slice(&self.hash);
        f.write_str(&base58::encode_check(&payload))
    }
}

impl FromStr for Address {
    type Err = AddressError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A wallet address record: the derived address plus its bookkeeping
/// counters. Created on demand by the scan policy engine; mutated only to
/// bump counters.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WalletAddress {
    /// The base58 form, cached to avoid re-encoding on every comparison.
    pub encoded: String,
    /// Index in the BIP32 lineage `account/0/index`.
    pub index: u32,
    /// Number of non-voided transactions touching this address.
    pub num_transactions: u32,
    pub used: bool,
    /// Monotonic counter for contract-invocation replay protection.
    pub seqnum: u64,
}

impl WalletAddress {
    pub fn new(address: &Address, index: u32) -> Self {
        Self {
            encoded: address.to_string(),
            index,
            num_transactions: 0,
            used: false,
            seqnum: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let address = Address {
            network: Network::Mainnet,
            kind: AddressKind::P2pkh,
            hash: [0x11; 20],
        };
        let encoded = address.to_string();
        assert_eq!(Address::decode(&encoded).unwrap(), address);
    }

    #[test]
    fn p2sh_roundtrip() {
        let address = Address {
            network: Network::Testnet,
            kind: AddressKind::P2sh,
            hash: [0x42; 20],
        };
        assert_eq!(
            Address::decode(&address.to_string()).unwrap(),
            address
        );
    }

    #[test]
    fn decode_for_network_rejects_foreign_address() {
        let mainnet = Address {
            network: Network::Mainnet,
            kind: AddressKind::P2pkh,
            hash: [0x11; 20],
        };
        let err = Address::decode_for_network(
            &mainnet.to_string(),
            Network::Testnet,
        )
        .unwrap_err();
        assert_eq!(err, AddressError::WrongNetwork);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Address::decode("not-an-address").is_err());
    }

    #[test]
    fn deterministic_encoding() {
        let address = Address {
            network: Network::Mainnet,
            kind: AddressKind::P2pkh,
            hash: [0x11; 20],
        };
        assert_eq!(address.to_string(), address.to_string());
        // Mainnet P2PKH addresses start with 'H'.
        assert!(address.to_string().starts_with('H'));
    }
}

//! The Hathor networks a wallet can operate against.

use std::{fmt, str::FromStr};

use bitcoin::NetworkKind;
use serde::{Deserialize, Serialize};

/// The BIP44 coin type registered for Hathor.
pub const HATHOR_COIN_TYPE: u32 = 280;

/// A network the wallet and its full node collaborator agree on. The network
/// determines the address version bytes and the derivation path hardening.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    /// A local network used by integration tests and private deployments.
    Privatenet,
}

impl Network {
    pub const ALL: [Network; 3] =
        [Network::Mainnet, Network::Testnet, Network::Privatenet];

    /// The version byte prepended to a pubkey hash before base58check
    /// encoding.
    pub fn p2pkh_version_byte(self) -> u8 {
        match self {
            Network::Mainnet => 0x28,
            Network::Testnet | Network::Privatenet => 0x49,
        }
    }

    /// The version byte prepended to a script hash before base58check
    /// encoding.
    pub fn p2sh_version_byte(self) -> u8 {
        match self {
            Network::Mainnet => 0x64,
            Network::Testnet | Network::Privatenet => 0x87,
        }
    }

    /// The BIP32 serialization network for extended keys.
    pub fn bip32_kind(self) -> NetworkKind {
        match self {
            Network::Mainnet => NetworkKind::Main,
            Network::Testnet | Network::Privatenet => NetworkKind::Test,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Privatenet => "privatenet",
        }
    }

    /// Whether a full node reporting `name` serves this network. Node builds
    /// report qualified names like `"testnet-golf"`.
    pub fn matches_node_network(self, name: &str) -> bool {
        name == self.as_str() || name.starts_with(self.as_str())
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = UnknownNetwork;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "privatenet" => Ok(Network::Privatenet),
            _ => Err(UnknownNetwork(s.to_owned())),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("unknown network: {0}")]
pub struct UnknownNetwork(pub String);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_bytes_differ_per_network() {
        assert_ne!(
            Network::Mainnet.p2pkh_version_byte(),
            Network::Testnet.p2pkh_version_byte()
        );
        assert_ne!(
            Network::Mainnet.p2sh_version_byte(),
            Network::Mainnet.p2pkh_version_byte()
        );
    }

    #[test]
    fn roundtrip_from_str() {
        for network in Network::ALL {
            assert_eq!(network, Network::from_str(network.as_str()).unwrap());
        }
    }

    #[test]
    fn node_network_matching() {
        assert!(Network::Testnet.matches_node_network("testnet-golf"));
        assert!(Network::Mainnet.matches_node_network("mainnet"));
        assert!(!Network::Mainnet.matches_node_network("testnet-golf"));
    }
}

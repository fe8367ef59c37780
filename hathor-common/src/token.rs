//! Token identifiers, registry entries, and partitioned balances.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{amount::TokenAmount, tx::TxId};

/// The string form of the ledger's built-in token uid.
pub const NATIVE_TOKEN_UID: &str = "00";

/// Identifies a token. The native token has the one-byte uid `00`; every
/// custom token is identified by the hash of the transaction that created it.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TokenUid {
    Native,
    Custom(TxId),
}

impl Default for TokenUid {
    fn default() -> Self {
        TokenUid::Native
    }
}

impl TokenUid {
    pub fn is_native(&self) -> bool {
        matches!(self, TokenUid::Native)
    }

    /// The 32-byte form written into a transaction's token table.
    /// Only custom tokens appear in the table.
    pub fn to_table_entry(&self) -> Option<[u8; 32]> {
        match self {
            TokenUid::Native => None,
            TokenUid::Custom(id) => Some(id.to_bytes()),
        }
    }
}

impl Display for TokenUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenUid::Native => f.write_str(NATIVE_TOKEN_UID),
            TokenUid::Custom(id) => Display::fmt(id, f),
        }
    }
}

impl FromStr for TokenUid {
    type Err = crate::hex::DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == NATIVE_TOKEN_UID {
            Ok(TokenUid::Native)
        } else {
            TxId::from_str(s).map(TokenUid::Custom)
        }
    }
}

impl From<TxId> for TokenUid {
    fn from(id: TxId) -> Self {
        TokenUid::Custom(id)
    }
}

impl Serialize for TokenUid {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TokenUid {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Partitions an amount of a single token by spendability.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
)]
pub struct Balance {
    /// Immediately spendable.
    pub unlocked: TokenAmount,
    /// Held back by a timelock or a reward height lock.
    pub locked: TokenAmount,
}

impl Balance {
    pub fn total(&self) -> TokenAmount {
        self.unlocked.saturating_add(self.locked)
    }

    pub fn credit(&mut self, amount: TokenAmount, locked: bool) {
        if locked {
            self.locked = self.locked.saturating_add(amount);
        } else {
            self.unlocked = self.unlocked.saturating_add(amount);
        }
    }
}

impl Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ unlocked: {}, locked: {} }}",
            self.unlocked, self.locked
        )
    }
}

impl std::ops::Add for Balance {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            unlocked: self.unlocked.saturating_add(other.unlocked),
            locked: self.locked.saturating_add(other.locked),
        }
    }
}

impl std::iter::Sum for Balance {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |a, b| a + b)
    }
}

/// Counts of mint / melt authority outputs held by the wallet, partitioned
/// like [`Balance`].
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
)]
pub struct AuthorityBalance {
    pub mint: Balance,
    pub melt: Balance,
}

/// The full balance picture for one token.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
)]
pub struct TokenBalance {
    pub tokens: Balance,
    pub authorities: AuthorityBalance,
}

/// A registry entry for a token the wallet has observed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub uid: TokenUid,
    pub name: String,
    pub symbol: String,
    /// Number of non-voided wallet transactions touching this token.
    pub num_transactions: u64,
    pub balance: TokenBalance,
}

impl TokenInfo {
    /// The preregistered entry for the native token.
    pub fn native() -> Self {
        Self {
            uid: TokenUid::Native,
            name: "Hathor".to_owned(),
            symbol: "HTR".to_owned(),
            num_transactions: 0,
            balance: TokenBalance::default(),
        }
    }

    /// A placeholder entry for a custom token observed in history before its
    /// create-token transaction (name and symbol unknown).
    pub fn unregistered(uid: TokenUid) -> Self {
        Self {
            uid,
            name: String::new(),
            symbol: String::new(),
            num_transactions: 0,
            balance: TokenBalance::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn native_uid_roundtrip() {
        assert_eq!(TokenUid::Native.to_string(), "00");
        assert_eq!("00".parse::<TokenUid>().unwrap(), TokenUid::Native);
    }

    #[test]
    fn custom_uid_roundtrip() {
        let uid = TokenUid::Custom(TxId::from_bytes([7u8; 32]));
        assert_eq!(uid.to_string().parse::<TokenUid>().unwrap(), uid);
    }

    #[test]
    fn balance_credit_partitions() {
        let mut balance = Balance::default();
        balance.credit(TokenAmount::from_u64(10), false);
        balance.credit(TokenAmount::from_u64(5), true);
        assert_eq!(balance.unlocked, TokenAmount::from_u64(10));
        assert_eq!(balance.locked, TokenAmount::from_u64(5));
        assert_eq!(balance.total(), TokenAmount::from_u64(15));
    }
}

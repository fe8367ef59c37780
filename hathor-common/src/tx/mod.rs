//! The transaction model: wire transactions the wallet builds and signs, and
//! history transactions as observed from the full node.

use std::{
    collections::BTreeSet,
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{amount::TokenAmount, hex, token::TokenUid};

pub mod ser;

/// Authority flag carried in an authority output's value field.
pub const AUTHORITY_MINT: u8 = 0b01;
/// Authority flag carried in an authority output's value field.
pub const AUTHORITY_MELT: u8 = 0b10;

/// High bit of `token_data`: this output is an authority output.
pub const TOKEN_AUTHORITY_MASK: u8 = 0x80;
/// Low bits of `token_data`: index into the transaction's token table.
pub const TOKEN_INDEX_MASK: u8 = 0x7f;

/// A 32-byte transaction hash, displayed and parsed as lowercase hex.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TxId([u8; 32]);

impl TxId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&hex::display(&self.0), f)
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", hex::display(&self.0))
    }
}

impl FromStr for TxId {
    type Err = hex::DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex::decode_to_array(s).map(Self)
    }
}

impl Serialize for TxId {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TxId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl proptest::arbitrary::Arbitrary for TxId {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        use proptest::{arbitrary::any, strategy::Strategy};
        any::<[u8; 32]>().prop_map(TxId::from_bytes).boxed()
    }
}

/// The transaction version discriminant on the wire.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub enum TxVersion {
    Block,
    Transaction,
    CreateToken,
    MergedMiningBlock,
    Unknown(u16),
}

impl TxVersion {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => TxVersion::Block,
            1 => TxVersion::Transaction,
            2 => TxVersion::CreateToken,
            3 => TxVersion::MergedMiningBlock,
            other => TxVersion::Unknown(other),
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            TxVersion::Block => 0,
            TxVersion::Transaction => 1,
            TxVersion::CreateToken => 2,
            TxVersion::MergedMiningBlock => 3,
            TxVersion::Unknown(other) => other,
        }
    }

    pub fn is_block(self) -> bool {
        matches!(self, TxVersion::Block | TxVersion::MergedMiningBlock)
    }
}

/// Returns the mint/melt bits carried by an output, or 0 for a regular
/// (non-authority) output.
pub fn authority_bits(token_data: u8, value: TokenAmount) -> u8 {
    if token_data & TOKEN_AUTHORITY_MASK == 0 {
        0
    } else {
        (value.to_i128() as u8) & (AUTHORITY_MINT | AUTHORITY_MELT)
    }
}

/// An input of a wire transaction: a reference to a prior output plus the
/// input data (signature script) that satisfies it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxInput {
    pub tx_id: TxId,
    pub index: u8,
    #[serde(with = "crate::hex::hexstr")]
    pub data: Vec<u8>,
}

impl TxInput {
    pub fn new(tx_id: TxId, index: u8) -> Self {
        Self {
            tx_id,
            index,
            data: Vec::new(),
        }
    }
}

/// An output of a wire transaction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: TokenAmount,
    pub token_data: u8,
    #[serde(with = "crate::hex::hexstr")]
    pub script: Vec<u8>,
}

impl TxOutput {
    pub fn is_authority(&self) -> bool {
        self.token_data & TOKEN_AUTHORITY_MASK != 0
    }

    pub fn authority_bits(&self) -> u8 {
        authority_bits(self.token_data, self.value)
    }

    pub fn token_index(&self) -> usize {
        (self.token_data & TOKEN_INDEX_MASK) as usize
    }
}

/// The name/symbol section of a create-token transaction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TokenCreationInfo {
    pub name: String,
    pub symbol: String,
}

/// The optional trailing header carrying a contract invocation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NanoHeader {
    /// The contract (or blueprint) being invoked.
    pub contract_id: TxId,
    /// Replay protection: must exceed the caller address's last seen value.
    pub seqnum: u64,
    pub method: String,
    #[serde(with = "crate::hex::hexstr")]
    pub args: Vec<u8>,
    #[serde(with = "crate::hex::hexstr")]
    pub caller_pubkey: Vec<u8>,
}

/// A transaction in the form the wallet builds, signs, and serializes for
/// mining. Graph metadata (weight, timestamp, parents) lives alongside the
/// funds sections but is excluded from the signing digest, so the mining
/// collaborator can attach parents without invalidating signatures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: TxVersion,
    /// The token table: uids of every custom token moved by this tx.
    pub tokens: Vec<TokenUid>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub weight: f64,
    pub timestamp: u32,
    pub parents: Vec<TxId>,
    pub token_info: Option<TokenCreationInfo>,
    pub nano_header: Option<NanoHeader>,
}

impl Transaction {
    pub fn new(version: TxVersion) -> Self {
        Self {
            version,
            tokens: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            weight: 0.0,
            timestamp: 0,
            parents: Vec::new(),
            token_info: None,
            nano_header: None,
        }
    }

    /// Resolve an output's `token_data` index against the token table.
    ///
    /// Index 0 is always the native token. In a create-token transaction the
    /// created token sits one past the end of the table; its uid is only
    /// known once the transaction hash is (`None` until then).
    pub fn token_at_index(&self, token_data: u8) -> Option<TokenUid> {
        let index = (token_data & TOKEN_INDEX_MASK) as usize;
        if index == 0 {
            Some(TokenUid::Native)
        } else {
            self.tokens.get(index - 1).cloned()
        }
    }

    /// Hex serialization of the full transaction, as submitted to mining.
    pub fn to_hex(&self) -> String {
        hex::encode(&ser::serialize_tx(self))
    }

    pub fn from_hex(s: &str) -> Result<Self, ser::DecodeTxError> {
        let bytes =
            hex::decode(s).map_err(|_| ser::DecodeTxError::InvalidHex)?;
        ser::deserialize_tx(&bytes)
    }

    /// The digest each input signature commits to. See [`ser::sighash_all`].
    pub fn sighash_all(&self) -> [u8; 32] {
        ser::sighash_all(self)
    }
}

/// Where an observed transaction is in the ingestion pipeline. Rows are
/// written as `Processing` and flipped to `Finished` once all derived state
/// (utxos, balances, counters) has been materialized.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Processing,
    Finished,
}

/// An input of a history transaction: only the reference to the prior output
/// matters for bookkeeping.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HistoryInput {
    pub tx_id: TxId,
    pub index: u8,
}

/// An output of a history transaction, carrying the wire fields plus the
/// decoded script info and local spent tracking.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HistoryOutput {
    pub value: TokenAmount,
    pub token_data: u8,
    #[serde(with = "crate::hex::hexstr")]
    pub script: Vec<u8>,
    /// The base58 address this output pays to, when the script is a known
    /// template.
    pub decoded_address: Option<String>,
    /// Unix timestamp before which this output may not be spent.
    pub timelock: Option<u32>,
    /// The wallet's local view of which tx consumed this output.
    pub spent_by: Option<TxId>,
}

impl HistoryOutput {
    pub fn is_authority(&self) -> bool {
        self.token_data & TOKEN_AUTHORITY_MASK != 0
    }

    pub fn authority_bits(&self) -> u8 {
        authority_bits(self.token_data, self.value)
    }

    pub fn token_index(&self) -> usize {
        (self.token_data & TOKEN_INDEX_MASK) as usize
    }
}

/// A transaction as observed locally: wire content plus DAG metadata the
/// node reports and local processing state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryTx {
    pub tx_id: TxId,
    pub version: TxVersion,
    pub weight: f64,
    pub timestamp: u32,
    pub is_voided: bool,
    /// Present iff this is a block.
    pub height: Option<u64>,
    /// The first block confirming this tx in the DAG.
    pub first_block: Option<TxId>,
    pub processing_status: ProcessingStatus,
    pub parents: Vec<TxId>,
    pub inputs: Vec<HistoryInput>,
    pub outputs: Vec<HistoryOutput>,
    pub tokens: Vec<TokenUid>,
    pub token_name: Option<String>,
    pub token_symbol: Option<String>,
    pub nano_header: Option<NanoHeader>,
}

impl HistoryTx {
    pub fn is_block(&self) -> bool {
        self.version.is_block()
    }

    /// Resolve the token moved by one of this tx's outputs.
    ///
    /// In a create-token transaction, indices past the token table resolve to
    /// the created token, whose uid is this tx's own hash.
    pub fn token_for_output(&self, output: &HistoryOutput) -> TokenUid {
        let index = output.token_index();
        if index == 0 {
            TokenUid::Native
        } else if let Some(uid) = self.tokens.get(index - 1) {
            uid.clone()
        } else {
            TokenUid::Custom(self.tx_id)
        }
    }

    /// All tokens this tx's outputs touch, deduplicated.
    pub fn touched_tokens(&self) -> BTreeSet<TokenUid> {
        self.outputs
            .iter()
            .map(|output| self.token_for_output(output))
            .collect()
    }

    /// The replay ordering key used by full history recomputation.
    pub fn replay_key(&self) -> (u32, TxId) {
        (self.timestamp, self.tx_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn txid_hex_roundtrip() {
        let id = TxId::from_bytes([0xab; 32]);
        let s = id.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(s.parse::<TxId>().unwrap(), id);
    }

    #[test]
    fn version_raw_roundtrip() {
        for raw in 0..8u16 {
            assert_eq!(TxVersion::from_raw(raw).to_raw(), raw);
        }
    }

    #[test]
    fn authority_bits_only_on_authority_outputs() {
        let mint = TokenAmount::from_u64(AUTHORITY_MINT as u64);
        assert_eq!(authority_bits(0x81, mint), AUTHORITY_MINT);
        // Same value on a regular output carries no authority.
        assert_eq!(authority_bits(0x01, mint), 0);
    }

    #[test]
    fn create_token_output_resolves_to_own_uid() {
        let tx = HistoryTx {
            tx_id: TxId::from_bytes([1u8; 32]),
            version: TxVersion::CreateToken,
            weight: 1.0,
            timestamp: 0,
            is_voided: false,
            height: None,
            first_block: None,
            processing_status: ProcessingStatus::Finished,
            parents: vec![],
            inputs: vec![],
            outputs: vec![HistoryOutput {
                value: TokenAmount::from_u64(100),
                token_data: 1,
                script: vec![],
                decoded_address: None,
                timelock: None,
                spent_by: None,
            }],
            tokens: vec![],
            token_name: Some("Test".to_owned()),
            token_symbol: Some("TST".to_owned()),
            nano_header: None,
        };
        assert_eq!(
            tx.token_for_output(&tx.outputs[0]),
            TokenUid::Custom(tx.tx_id)
        );
    }
}

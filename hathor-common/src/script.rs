//! Output script templates: P2PKH, P2SH, and data outputs, plus the
//! N-of-M redeem script committed to by threshold wallets.

use bitcoin::{
    hashes::{hash160, Hash},
    secp256k1::PublicKey,
};
use thiserror::Error;

// Opcodes used by the supported templates.
const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;
/// Consensus-level timelock: fails evaluation until the stack timestamp has
/// passed.
const OP_GREATERTHAN_TIMESTAMP: u8 = 0x6f;
const OP_PUSHDATA1: u8 = 0x4c;
/// `OP_1` .. `OP_16` are `OP_N_BASE + n`.
const OP_N_BASE: u8 = 0x50;

/// The maximum number of cosigners in a threshold redeem script.
pub const MAX_MULTISIG_PUBKEYS: usize = 16;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ScriptError {
    #[error("data push too long for a script ({0} bytes)")]
    PushTooLong(usize),
    #[error(
        "multisig configuration out of range: {required} of {total} keys"
    )]
    BadMultisigCounts { required: usize, total: usize },
}

/// A recognized output script, decoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParsedScript {
    P2pkh {
        pubkey_hash: [u8; 20],
        timelock: Option<u32>,
    },
    P2sh {
        script_hash: [u8; 20],
        timelock: Option<u32>,
    },
    Data {
        data: Vec<u8>,
    },
}

impl ParsedScript {
    pub fn timelock(&self) -> Option<u32> {
        match self {
            ParsedScript::P2pkh { timelock, .. } => *timelock,
            ParsedScript::P2sh { timelock, .. } => *timelock,
            ParsedScript::Data { .. } => None,
        }
    }
}

/// `[timelock] DUP HASH160 <pubkey_hash> EQUALVERIFY CHECKSIG`
pub fn p2pkh_script(pubkey_hash: &[u8; 20], timelock: Option<u32>) -> Vec<u8> {
    let mut script = Vec::with_capacity(31);
    push_timelock(&mut script, timelock);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(20);
    script.extend_from_slice(pubkey_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// `[timelock] HASH160 <script_hash> EQUAL`
pub fn p2sh_script(script_hash: &[u8; 20], timelock: Option<u32>) -> Vec<u8> {
    let mut script = Vec::with_capacity(29);
    push_timelock(&mut script, timelock);
    script.push(OP_HASH160);
    script.push(20);
    script.extend_from_slice(script_hash);
    script.push(OP_EQUAL);
    script
}

/// A bare data push, used to pin utf-8 payloads (e.g. NFT metadata) into an
/// output.
pub fn data_script(data: &[u8]) -> Result<Vec<u8>, ScriptError> {
    let mut script = Vec::with_capacity(data.len() + 2);
    push_data(&mut script, data)?;
    Ok(script)
}

/// The N-of-M redeem script: `<N> <pubkey_1> … <pubkey_M> <M> CHECKMULTISIG`.
///
/// Pubkeys are sorted lexicographically by their hex encoding (equivalently,
/// by their serialized bytes). This sort is load-bearing: threshold signature
/// assembly collects signatures in the same order.
pub fn multisig_redeem_script(
    pubkeys: &[PublicKey],
    required: usize,
) -> Result<Vec<u8>, ScriptError> {
    let total = pubkeys.len();
    if total == 0
        || total > MAX_MULTISIG_PUBKEYS
        || required == 0
        || required > total
    {
        return Err(ScriptError::BadMultisigCounts { required, total });
    }

    let mut sorted: Vec<[u8; 33]> =
        pubkeys.iter().map(|pk| pk.serialize()).collect();
    sorted.sort_unstable();

    let mut script = Vec::with_capacity(3 + total * 34);
    script.push(OP_N_BASE + required as u8);
    for pubkey in &sorted {
        script.push(33);
        script.extend_from_slice(pubkey);
    }
    script.push(OP_N_BASE + total as u8);
    script.push(OP_CHECKMULTISIG);
    Ok(script)
}

/// hash160 of a redeem script, as committed in a P2SH output.
pub fn script_hash(script: &[u8]) -> [u8; 20] {
    hash160::Hash::hash(script).to_byte_array()
}

/// P2PKH input data: `<sig> <pubkey>`.
pub fn p2pkh_input_data(
    signature_der: &[u8],
    pubkey: &PublicKey,
) -> Result<Vec<u8>, ScriptError> {
    let mut data = Vec::with_capacity(signature_der.len() + 36);
    push_data(&mut data, signature_der)?;
    push_data(&mut data, &pubkey.serialize())?;
    Ok(data)
}

/// P2SH input data: `<sig_1> … <sig_N> <redeem_script>`.
pub fn p2sh_input_data(
    signatures_der: &[Vec<u8>],
    redeem_script: &[u8],
) -> Result<Vec<u8>, ScriptError> {
    let mut data = Vec::new();
    for sig in signatures_der {
        push_data(&mut data, sig)?;
    }
    push_data(&mut data, redeem_script)?;
    Ok(data)
}

/// Decode a script against the known templates.
pub fn parse_script(script: &[u8]) -> Option<ParsedScript> {
    let (timelock, rest) = parse_timelock_prefix(script);

    match rest {
        // DUP HASH160 <20> EQUALVERIFY CHECKSIG
        [OP_DUP, OP_HASH160, 20, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG]
            if hash.len() == 20 =>
        {
            Some(ParsedScript::P2pkh {
                pubkey_hash: hash.try_into().unwrap(),
                timelock,
            })
        }
        // HASH160 <20> EQUAL
        [OP_HASH160, 20, hash @ .., OP_EQUAL] if hash.len() == 20 => {
            Some(ParsedScript::P2sh {
                script_hash: hash.try_into().unwrap(),
                timelock,
            })
        }
        // A single data push with no timelock prefix.
        _ if timelock.is_none() => {
            let (data, remaining) = parse_push(script)?;
            remaining.is_empty().then(|| ParsedScript::Data {
                data: data.to_vec(),
            })
        }
        _ => None,
    }
}

fn push_timelock(script: &mut Vec<u8>, timelock: Option<u32>) {
    if let Some(timestamp) = timelock {
        script.push(4);
        script.extend_from_slice(&timestamp.to_be_bytes());
        script.push(OP_GREATERTHAN_TIMESTAMP);
    }
}

fn parse_timelock_prefix(script: &[u8]) -> (Option<u32>, &[u8]) {
    match script {
        [4, t0, t1, t2, t3, OP_GREATERTHAN_TIMESTAMP, rest @ ..] => {
            let timelock = u32::from_be_bytes([*t0, *t1, *t2, *t3]);
            (Some(timelock), rest)
        }
        _ => (None, script),
    }
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) -> Result<(), ScriptError> {
    match data.len() {
        len @ 0..=75 => script.push(len as u8),
        len @ 76..=255 => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
        }
        len => return Err(ScriptError::PushTooLong(len)),
    }
    script.extend_from_slice(data);
    Ok(())
}

fn parse_push(script: &[u8]) -> Option<(&[u8], &[u8])> {
    match script {
        [len @ 1..=75, rest @ ..] if rest.len() >= *len as usize => {
            Some(rest.split_at(*len as usize))
        }
        [OP_PUSHDATA1, len, rest @ ..] if rest.len() >= *len as usize => {
            Some(rest.split_at(*len as usize))
        }
        _ => None,
    }
}

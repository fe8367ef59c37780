//! Canonical binary transaction encoding. All integers are big-endian.
//!
//! Layout:
//!
//! ```text
//! version(2) | tokens_len(1) | inputs_len(1) | outputs_len(1)
//! token table: tokens_len × uid(32)
//! input:  tx_id(32) | output_index(1) | data_len(2) | data
//! output: value(8 | 1+32) | token_data(1) | script_len(2) | script
//! [create-token only] info_version(1)=0x01 | name_len(1) | name
//!                     | symbol_len(1) | symbol
//! weight(8, f64) | timestamp(4) | parents_len(1) | parents: 32×N
//! [optional] nano header: 0x10 | contract_id(32) | seqnum(8)
//!            | method_len(1) | method | args_len(2) | args
//!            | caller_len(1) | caller_pubkey
//! ```
//!
//! A value whose first byte has the high bit set is the extended form: a
//! `0x80` sentinel followed by a 256-bit two's-complement integer in 32
//! bytes. Otherwise the value is 8 bytes. Values outside the `i128` range
//! or negative values are rejected on decode.

use bitcoin::hashes::{sha256, Hash};
use thiserror::Error;

use crate::{
    amount::TokenAmount,
    token::TokenUid,
    tx::{
        NanoHeader, TokenCreationInfo, Transaction, TxId, TxInput, TxOutput,
        TxVersion,
    },
};

/// Sentinel first byte of the extended (32-byte) value form.
const EXTENDED_VALUE_SENTINEL: u8 = 0x80;
/// Version byte of the create-token name/symbol section.
const TOKEN_INFO_VERSION: u8 = 0x01;
/// Header id byte of the nano (contract invocation) header.
const NANO_HEADER_ID: u8 = 0x10;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum DecodeTxError {
    #[error("transaction hex is not valid hex")]
    InvalidHex,
    #[error("unexpected end of transaction bytes")]
    UnexpectedEof,
    #[error("output value is negative or outside the representable range")]
    ValueOutOfRange,
    #[error("extended value form used where the short form is canonical")]
    NonCanonicalValue,
    #[error("string field is not valid utf-8")]
    BadUtf8,
    #[error("unknown trailing header id: {0:#04x}")]
    UnknownHeader(u8),
    #[error("trailing bytes after transaction")]
    TrailingBytes,
}

/// Serialize the full transaction, as submitted to the mining collaborator.
pub fn serialize_tx(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    write_funds_sections(&mut out, tx, false);
    out.extend_from_slice(&tx.weight.to_be_bytes());
    out.extend_from_slice(&tx.timestamp.to_be_bytes());
    out.push(tx.parents.len() as u8);
    for parent in &tx.parents {
        out.extend_from_slice(parent.as_slice());
    }
    if let Some(nano) = &tx.nano_header {
        write_nano_header(&mut out, nano);
    }
    out
}

/// The digest every input signature commits to: SHA-256 over the funds
/// sections (version, token table, inputs with data cleared, outputs, and
/// the create-token / nano sections). Graph metadata is excluded so that
/// attaching parents after signing does not invalidate signatures.
pub fn sighash_all(tx: &Transaction) -> [u8; 32] {
    let mut data = Vec::with_capacity(256);
    write_funds_sections(&mut data, tx, true);
    if let Some(nano) = &tx.nano_header {
        write_nano_header(&mut data, nano);
    }
    sha256::Hash::hash(&data).to_byte_array()
}

fn write_funds_sections(out: &mut Vec<u8>, tx: &Transaction, clear_data: bool) {
    out.extend_from_slice(&tx.version.to_raw().to_be_bytes());
    out.push(tx.tokens.len() as u8);
    out.push(tx.inputs.len() as u8);
    out.push(tx.outputs.len() as u8);

    for token in &tx.tokens {
        // The native token is implicit at index 0 and never appears in the
        // table.
        let entry = token
            .to_table_entry()
            .expect("native token must not be in the token table");
        out.extend_from_slice(&entry);
    }

    for input in &tx.inputs {
        out.extend_from_slice(input.tx_id.as_slice());
        out.push(input.index);
        if clear_data {
            out.extend_from_slice(&0u16.to_be_bytes());
        } else {
            out.extend_from_slice(&(input.data.len() as u16).to_be_bytes());
            out.extend_from_slice(&input.data);
        }
    }

    for output in &tx.outputs {
        write_value(out, output.value);
        out.push(output.token_data);
        out.extend_from_slice(&(output.script.len() as u16).to_be_bytes());
        out.extend_from_slice(&output.script);
    }

    if let Some(info) = &tx.token_info {
        out.push(TOKEN_INFO_VERSION);
        out.push(info.name.len() as u8);
        out.extend_from_slice(info.name.as_bytes());
        out.push(info.symbol.len() as u8);
        out.extend_from_slice(info.symbol.as_bytes());
    }
}

fn write_value(out: &mut Vec<u8>, value: TokenAmount) {
    let v = value.to_i128();
    if v < (1i128 << 63) {
        // Fits in 8 bytes with the high bit clear.
        out.extend_from_slice(&(v as u64).to_be_bytes());
    } else {
        out.push(EXTENDED_VALUE_SENTINEL);
        let mut buf = [0u8; 32];
        buf[16..].copy_from_slice(&v.to_be_bytes());
        out.extend_from_slice(&buf);
    }
}

fn write_nano_header(out: &mut Vec<u8>, nano: &NanoHeader) {
    out.push(NANO_HEADER_ID);
    out.extend_from_slice(nano.contract_id.as_slice());
    out.extend_from_slice(&nano.seqnum.to_be_bytes());
    out.push(nano.method.len() as u8);
    out.extend_from_slice(nano.method.as_bytes());
    out.extend_from_slice(&(nano.args.len() as u16).to_be_bytes());
    out.extend_from_slice(&nano.args);
    out.push(nano.caller_pubkey.len() as u8);
    out.extend_from_slice(&nano.caller_pubkey);
}

/// Deserialize a transaction from its canonical bytes. Strict: trailing
/// bytes and non-canonical value encodings are rejected.
pub fn deserialize_tx(bytes: &[u8]) -> Result<Transaction, DecodeTxError> {
    let mut reader = Reader { buf: bytes, pos: 0 };

    let version = TxVersion::from_raw(reader.read_u16()?);
    let tokens_len = reader.read_u8()? as usize;
    let inputs_len = reader.read_u8()? as usize;
    let outputs_len = reader.read_u8()? as usize;

    let mut tokens = Vec::with_capacity(tokens_len);
    for _ in 0..tokens_len {
        tokens.push(TokenUid::Custom(reader.read_tx_id()?));
    }

    let mut inputs = Vec::with_capacity(inputs_len);
    for _ in 0..inputs_len {
        let tx_id = reader.read_tx_id()?;
        let index = reader.read_u8()?;
        let data_len = reader.read_u16()? as usize;
        let data = reader.take(data_len)?.to_vec();
        inputs.push(TxInput { tx_id, index, data });
    }

    let mut outputs = Vec::with_capacity(outputs_len);
    for _ in 0..outputs_len {
        let value = read_value(&mut reader)?;
        let token_data = reader.read_u8()?;
        let script_len = reader.read_u16()? as usize;
        let script = reader.take(script_len)?.to_vec();
        outputs.push(TxOutput {
            value,
            token_data,
            script,
        });
    }

    let token_info = if version == TxVersion::CreateToken {
        let info_version = reader.read_u8()?;
        if info_version != TOKEN_INFO_VERSION {
            return Err(DecodeTxError::UnknownHeader(info_version));
        }
        let name_len = reader.read_u8()? as usize;
        let name = String::from_utf8(reader.take(name_len)?.to_vec())
            .map_err(|_| DecodeTxError::BadUtf8)?;
        let symbol_len = reader.read_u8()? as usize;
        let symbol = String::from_utf8(reader.take(symbol_len)?.to_vec())
            .map_err(|_| DecodeTxError::BadUtf8)?;
        Some(TokenCreationInfo { name, symbol })
    } else {
        None
    };

    let weight = f64::from_be_bytes(reader.take(8)?.try_into().unwrap());
    let timestamp = reader.read_u32()?;
    let parents_len = reader.read_u8()? as usize;
    let mut parents = Vec::with_capacity(parents_len);
    for _ in 0..parents_len {
        parents.push(reader.read_tx_id()?);
    }

    let nano_header = if !reader.is_empty() {
        let header_id = reader.read_u8()?;
        if header_id != NANO_HEADER_ID {
            return Err(DecodeTxError::UnknownHeader(header_id));
        }
        let contract_id = reader.read_tx_id()?;
        let seqnum = reader.read_u64()?;
        let method_len = reader.read_u8()? as usize;
        let method = String::from_utf8(reader.take(method_len)?.to_vec())
            .map_err(|_| DecodeTxError::BadUtf8)?;
        let args_len = reader.read_u16()? as usize;
        let args = reader.take(args_len)?.to_vec();
        let caller_len = reader.read_u8()? as usize;
        let caller_pubkey = reader.take(caller_len)?.to_vec();
        Some(NanoHeader {
            contract_id,
            seqnum,
            method,
            args,
            caller_pubkey,
        })
    } else {
        None
    };

    if !reader.is_empty() {
        return Err(DecodeTxError::TrailingBytes);
    }

    Ok(Transaction {
        version,
        tokens,
        inputs,
        outputs,
        weight,
        timestamp,
        parents,
        token_info,
        nano_header,
    })
}

fn read_value(reader: &mut Reader<'_>) -> Result<TokenAmount, DecodeTxError> {
    let first = reader.peek_u8()?;
    if first & 0x80 == 0 {
        let raw = reader.read_u64()?;
        Ok(TokenAmount::from_u64(raw))
    } else {
        if first != EXTENDED_VALUE_SENTINEL {
            return Err(DecodeTxError::ValueOutOfRange);
        }
        let _sentinel = reader.read_u8()?;
        let bytes: [u8; 32] = reader.take(32)?.try_into().unwrap();
        // The top 16 bytes must be a sign extension of the low 16.
        let fill = if bytes[16] & 0x80 != 0 { 0xff } else { 0x00 };
        if bytes[..16].iter().any(|&b| b != fill) {
            return Err(DecodeTxError::ValueOutOfRange);
        }
        let v = i128::from_be_bytes(bytes[16..].try_into().unwrap());
        if v < (1i128 << 63) {
            // Would have fit in the 8-byte form.
            return Err(DecodeTxError::NonCanonicalValue);
        }
        TokenAmount::try_from_i128(v)
            .map_err(|_| DecodeTxError::ValueOutOfRange)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeTxError> {
        let end =
            self.pos.checked_add(n).ok_or(DecodeTxError::UnexpectedEof)?;
        if end > self.buf.len() {
            return Err(DecodeTxError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn peek_u8(&self) -> Result<u8, DecodeTxError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(DecodeTxError::UnexpectedEof)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeTxError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeTxError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeTxError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeTxError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_tx_id(&mut self) -> Result<TxId, DecodeTxError> {
        let bytes: [u8; 32] = self.take(32)?.try_into().unwrap();
        Ok(TxId::from_bytes(bytes))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_tx() -> Transaction {
        let mut tx = Transaction::new(TxVersion::Transaction);
        tx.tokens = vec![TokenUid::Custom(TxId::from_bytes([2u8; 32]))];
        tx.inputs = vec![TxInput {
            tx_id: TxId::from_bytes([1u8; 32]),
            index: 3,
            data: vec![0xde, 0xad],
        }];
        tx.outputs = vec![
            TxOutput {
                value: TokenAmount::from_u64(1_000_000),
                token_data: 0,
                script: vec![0x51],
            },
            TxOutput {
                value: TokenAmount::from_u64(7),
                token_data: 1,
                script: vec![0x52, 0x53],
            },
        ];
        tx.weight = 17.25;
        tx.timestamp = 1_600_000_000;
        tx.parents = vec![TxId::from_bytes([9u8; 32])];
        tx
    }

    #[test]
    fn header_layout() {
        let tx = sample_tx();
        let bytes = serialize_tx(&tx);
        // version | tokens_len | inputs_len | outputs_len
        assert_eq!(&bytes[..5], &[0x00, 0x01, 0x01, 0x01, 0x02]);
        // Token table follows immediately.
        assert_eq!(&bytes[5..37], &[2u8; 32]);
    }

    #[test]
    fn roundtrip() {
        let tx = sample_tx();
        let decoded = deserialize_tx(&serialize_tx(&tx)).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn roundtrip_create_token() {
        let mut tx = sample_tx();
        tx.version = TxVersion::CreateToken;
        tx.tokens.clear();
        tx.token_info = Some(TokenCreationInfo {
            name: "MyToken".to_owned(),
            symbol: "MTK".to_owned(),
        });
        let decoded = deserialize_tx(&serialize_tx(&tx)).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn roundtrip_nano_header() {
        let mut tx = sample_tx();
        tx.nano_header = Some(NanoHeader {
            contract_id: TxId::from_bytes([4u8; 32]),
            seqnum: 42,
            method: "swap".to_owned(),
            args: vec![1, 2, 3],
            caller_pubkey: vec![0x02; 33],
        });
        let decoded = deserialize_tx(&serialize_tx(&tx)).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn extended_value_form() {
        let mut tx = sample_tx();
        let big = TokenAmount::try_from_i128(1i128 << 100).unwrap();
        tx.outputs[0].value = big;
        let bytes = serialize_tx(&tx);
        let decoded = deserialize_tx(&bytes).unwrap();
        assert_eq!(decoded.outputs[0].value, big);
    }

    #[test]
    fn rejects_non_canonical_extended_value() {
        let mut tx = sample_tx();
        tx.inputs.clear();
        tx.tokens.clear();
        tx.outputs.truncate(1);
        tx.outputs[0].token_data = 0;
        let mut bytes = serialize_tx(&tx);
        // Splice in an extended encoding of a value that fits in 8 bytes:
        // output starts right after the 5-byte header.
        let mut spliced = bytes[..5].to_vec();
        spliced.push(0x80);
        let mut ext = [0u8; 32];
        ext[31] = 7;
        spliced.extend_from_slice(&ext);
        spliced.extend_from_slice(&bytes.split_off(5 + 8));
        assert_eq!(
            deserialize_tx(&spliced),
            Err(DecodeTxError::NonCanonicalValue)
        );
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = serialize_tx(&sample_tx());
        bytes.push(0x00);
        // A trailing 0x00 is not a recognized header id.
        assert!(matches!(
            deserialize_tx(&bytes),
            Err(DecodeTxError::UnknownHeader(0x00))
        ));
    }

    #[test]
    fn sighash_ignores_input_data_and_graph_metadata() {
        let tx = sample_tx();
        let base = sighash_all(&tx);

        let mut with_data = tx.clone();
        with_data.inputs[0].data = vec![0xff; 70];
        assert_eq!(sighash_all(&with_data), base);

        let mut with_parents = tx.clone();
        with_parents.parents.push(TxId::from_bytes([8u8; 32]));
        with_parents.weight = 99.0;
        with_parents.timestamp += 1000;
        assert_eq!(sighash_all(&with_parents), base);

        let mut other_outputs = tx;
        other_outputs.outputs[0].value = TokenAmount::from_u64(1);
        assert_ne!(sighash_all(&other_outputs), base);
    }
}

//! Encoding, decoding, and displaying hex-formatted data.

use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors which can be produced while decoding a hex string.
#[derive(Copy, Clone, Debug, Error, Serialize, Deserialize)]
pub enum DecodeError {
    #[error("hex decode error: output buffer length != half input length")]
    BadOutputLength,

    #[error("hex decode error: input contains non-hex character")]
    InvalidCharacter,

    #[error("hex decode error: input string length must be even")]
    OddInputLength,
}

/// Convert a byte slice to an owned lowercase hex string. If the bytes only
/// need to be displayed, prefer [`display`], which avoids the allocation.
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(encode_nibble(byte >> 4));
        out.push(encode_nibble(byte & 0x0f));
    }
    out
}

/// Try to decode a hex string to owned bytes.
pub fn decode(hex: &str) -> Result<Vec<u8>, DecodeError> {
    let bytes = hex.as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddInputLength);
    }
    bytes
        .chunks_exact(2)
        .map(|pair| {
            let hi = decode_nibble(pair[0])?;
            let lo = decode_nibble(pair[1])?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

/// Decode a hex string into a fixed-length array.
pub fn decode_to_array<const N: usize>(
    hex: &str,
) -> Result<[u8; N], DecodeError> {
    let vec = decode(hex)?;
    <[u8; N]>::try_from(vec).map_err(|_| DecodeError::BadOutputLength)
}

/// Get a [`HexDisplay`] which provides `Debug` and `Display` impls for the
/// given byte slice without allocating.
#[inline]
pub fn display(bytes: &[u8]) -> HexDisplay<'_> {
    HexDisplay(bytes)
}

/// Provides `Debug` and `Display` impls for a byte slice.
pub struct HexDisplay<'a>(&'a [u8]);

impl fmt::Display for HexDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            f.write_char(encode_nibble(byte >> 4))?;
            f.write_char(encode_nibble(byte & 0x0f))?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexDisplay<'_> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[inline(always)]
const fn encode_nibble(nib: u8) -> char {
    match nib {
        0..=9 => (b'0' + nib) as char,
        _ => (b'a' + nib - 10) as char,
    }
}

#[inline]
const fn decode_nibble(x: u8) -> Result<u8, DecodeError> {
    match x {
        b'0'..=b'9' => Ok(x - b'0'),
        b'a'..=b'f' => Ok(x - b'a' + 10),
        b'A'..=b'F' => Ok(x - b'A' + 10),
        _ => Err(DecodeError::InvalidCharacter),
    }
}

/// Serialize / deserialize a `Vec<u8>` as a hex string.
/// Apply with `#[serde(with = "crate::hex::hexstr")]`.
pub mod hexstr {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Vec<u8>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&super::display(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::decode(&s).map_err(de::Error::custom)
    }
}

/// Serialize / deserialize an `Option<Vec<u8>>` as an optional hex string.
/// Apply with `#[serde(with = "crate::hex::hexstr_opt")]`.
pub mod hexstr_opt {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => {
                serializer.serialize_some(&super::display(bytes).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let maybe_s = Option::<String>::deserialize(deserializer)?;
        maybe_s
            .map(|s| super::decode(&s).map_err(de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, collection::vec, proptest};

    use super::*;

    #[test]
    fn test_encode() {
        assert_eq!("", encode(&[]));
        assert_eq!(
            "01348900abff",
            encode(&[0x01, 0x34, 0x89, 0x00, 0xab, 0xff])
        );
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(matches!(decode("abc"), Err(DecodeError::OddInputLength)));
        assert!(matches!(
            decode("zz"),
            Err(DecodeError::InvalidCharacter)
        ));
    }

    #[test]
    fn test_roundtrip() {
        proptest!(|(bytes in vec(any::<u8>(), 0..64))| {
            assert_eq!(bytes.as_slice(), decode(&encode(&bytes)).unwrap());
        })
    }

    #[test]
    fn test_encode_display_equiv() {
        proptest!(|(bytes: Vec<u8>)| {
            assert_eq!(encode(&bytes), display(&bytes).to_string());
        });
    }
}

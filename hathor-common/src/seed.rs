//! BIP39 mnemonic handling for wallet seeds.

use bip39::{Language, Mnemonic};
use thiserror::Error;

use crate::entropy::EntropySource;

/// Number of words in a freshly generated seed phrase (256 bits of entropy).
pub const GENERATED_WORD_COUNT: usize = 24;

#[derive(Clone, Debug, Error)]
#[error("invalid seed words: {0}")]
pub struct InvalidWords(#[from] bip39::Error);

/// Generate a fresh 24-word mnemonic from the given entropy source.
pub fn generate_words<E: EntropySource>(entropy: &mut E) -> Mnemonic {
    let mut bytes = [0u8; 32];
    entropy.fill(&mut bytes);
    Mnemonic::from_entropy_in(Language::English, &bytes)
        .expect("32 bytes is valid BIP39 entropy")
}

/// Parse and checksum-validate a space-separated seed phrase. Normalizes
/// interior whitespace and letter case the way wallet imports expect.
pub fn parse_words(words: &str) -> Result<Mnemonic, InvalidWords> {
    let normalized = words
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    Ok(Mnemonic::parse_in_normalized(Language::English, &normalized)?)
}

/// The 64-byte BIP39 seed for a validated mnemonic.
pub fn to_seed(mnemonic: &Mnemonic, passphrase: &str) -> [u8; 64] {
    mnemonic.to_seed_normalized(passphrase)
}

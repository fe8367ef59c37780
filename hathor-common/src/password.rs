//! PIN / password based encryption of wallet secrets.
//!
//! A thin wrapper around [`ring::pbkdf2`] which fixes the algorithm and
//! stretching parameters to provide a simple API for encrypting and
//! decrypting data under a low-entropy secret (the wallet PIN or the seed
//! password):
//!
//! - `pbkdf2(secret, salt) -> aes_key`
//! - `aes_key.encrypt(salt as aad, data) -> ciphertext`
//!
//! The per-wallet random `salt` doubles as the AAD, binding each ciphertext
//! to its wallet. No entropy requirements are enforced here: PINs are
//! typically 6 digits, and brute-force resistance comes from the key
//! stretch, not the secret length.

use std::num::NonZeroU32;

use ring::pbkdf2;
use secrecy::Zeroize;
use thiserror::Error;

use crate::{
    aes::{self, AesKey},
    entropy::EntropySource,
};

static PBKDF2_ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

/// The number of iterations used to stretch the derived key.
/// OWASP recommends 600K iterations for PBKDF2-HMAC-SHA256.
const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(600_000) {
    Some(n) => n,
    None => panic!("non-zero"),
};

/// The byte length of the salt sampled per wallet.
pub const SALT_LEN: usize = 32;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum Error {
    /// Wrong secret, tampered ciphertext, or unknown format.
    #[error("decryption error: {0}")]
    Decrypt(#[from] aes::DecryptError),
}

/// Sample a fresh per-wallet salt.
pub fn generate_salt<E: EntropySource>(entropy: &mut E) -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    entropy.fill(&mut salt);
    salt
}

/// Encrypt `data` under `secret`, stretched with the per-wallet `salt`.
pub fn encrypt<E: EntropySource>(
    entropy: &mut E,
    secret: &str,
    salt: &[u8; SALT_LEN],
    data: &[u8],
) -> Vec<u8> {
    let aes_key = derive_aes_key(secret, salt);
    aes_key.encrypt(entropy, salt, data)
}

/// Decrypt a ciphertext produced by [`encrypt`] with the same secret and
/// salt.
pub fn decrypt(
    secret: &str,
    salt: &[u8; SALT_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, Error> {
    let aes_key = derive_aes_key(secret, salt);
    Ok(aes_key.decrypt(salt, ciphertext)?)
}

/// Stretch `secret` into an [`AesKey`] with PBKDF2.
fn derive_aes_key(secret: &str, salt: &[u8; SALT_LEN]) -> AesKey {
    let mut key_buf = [0u8; 32];
    pbkdf2::derive(
        PBKDF2_ALGORITHM,
        PBKDF2_ITERATIONS,
        salt,
        secret.as_bytes(),
        &mut key_buf,
    );
    let aes_key = AesKey::new(&key_buf);
    key_buf.zeroize();
    aes_key
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entropy::SeededEntropy;

    #[test]
    fn roundtrip() {
        let mut entropy = SeededEntropy::from_u64(20260801);
        let salt = generate_salt(&mut entropy);
        let ciphertext = encrypt(&mut entropy, "000000", &salt, b"xpriv bytes");
        let plaintext = decrypt("000000", &salt, &ciphertext).unwrap();
        assert_eq!(plaintext, b"xpriv bytes");
    }

    #[test]
    fn wrong_secret_fails() {
        let mut entropy = SeededEntropy::from_u64(7);
        let salt = generate_salt(&mut entropy);
        let ciphertext = encrypt(&mut entropy, "000000", &salt, b"data");
        assert!(decrypt("000001", &salt, &ciphertext).is_err());
    }

    #[test]
    fn wrong_salt_fails() {
        let mut entropy = SeededEntropy::from_u64(8);
        let salt_a = generate_salt(&mut entropy);
        let salt_b = generate_salt(&mut entropy);
        let ciphertext = encrypt(&mut entropy, "000000", &salt_a, b"data");
        assert!(decrypt("000000", &salt_b, &ciphertext).is_err());
    }
}

//! Authenticated encryption of wallet secrets at rest.
//!
//! The scheme is AES-256-GCM with a random 96-bit nonce carried alongside
//! the ciphertext. Keys are never used directly from user input; they come
//! out of the PBKDF2 stretch in [`crate::password`], which makes nonce reuse
//! across wallets a non-issue (each wallet has a unique salt, hence a unique
//! key). A leading version byte leaves room to migrate the scheme without
//! breaking stored ciphertexts.
//!
//! Ciphertext layout: `version(1) | nonce(12) | sealed(data_len + 16)`.

use ring::aead::{
    Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN,
};
use thiserror::Error;

use crate::entropy::EntropySource;

/// The current ciphertext format version.
const FORMAT_VERSION: u8 = 0;

/// Total non-payload bytes in a ciphertext.
pub const CIPHERTEXT_OVERHEAD: usize = 1 + NONCE_LEN + 16;

/// Decryption failed: wrong key, tampered ciphertext, or unknown format.
/// Deliberately opaque so callers can't distinguish the cases.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
#[error("decryption error")]
pub struct DecryptError;

/// A 256-bit AES-GCM key.
pub struct AesKey(LessSafeKey);

impl AesKey {
    pub fn new(key_bytes: &[u8; 32]) -> Self {
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .expect("AES_256_GCM accepts 32-byte keys");
        Self(LessSafeKey::new(unbound))
    }

    /// Encrypt `data`, binding `aad` into the authentication tag.
    pub fn encrypt<E: EntropySource>(
        &self,
        entropy: &mut E,
        aad: &[u8],
        data: &[u8],
    ) -> Vec<u8> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        entropy.fill(&mut nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut out = Vec::with_capacity(data.len() + CIPHERTEXT_OVERHEAD);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&nonce_bytes);

        let mut sealed = data.to_vec();
        self.0
            .seal_in_place_append_tag(nonce, Aad::from(aad), &mut sealed)
            .expect("sealing in place cannot fail");
        out.extend_from_slice(&sealed);
        out
    }

    /// Decrypt a ciphertext produced by [`AesKey::encrypt`] under the same
    /// key and `aad`.
    pub fn decrypt(
        &self,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, DecryptError> {
        if ciphertext.len() < CIPHERTEXT_OVERHEAD {
            return Err(DecryptError);
        }
        let (header, sealed) = ciphertext.split_at(1 + NONCE_LEN);
        if header[0] != FORMAT_VERSION {
            return Err(DecryptError);
        }
        let nonce_bytes: [u8; NONCE_LEN] = header[1..].try_into().unwrap();
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buf = sealed.to_vec();
        let plaintext = self
            .0
            .open_in_place(nonce, Aad::from(aad), &mut buf)
            .map_err(|_| DecryptError)?;
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, proptest};

    use super::*;
    use crate::entropy::SeededEntropy;

    #[test]
    fn roundtrip() {
        proptest!(|(
            mut entropy in any::<SeededEntropy>(),
            key in any::<[u8; 32]>(),
            aad in any::<Vec<u8>>(),
            data in any::<Vec<u8>>(),
        )| {
            let aes_key = AesKey::new(&key);
            let ciphertext = aes_key.encrypt(&mut entropy, &aad, &data);
            let plaintext = aes_key.decrypt(&aad, &ciphertext).unwrap();
            assert_eq!(plaintext, data);
        });
    }

    #[test]
    fn wrong_key_fails() {
        let mut entropy = SeededEntropy::from_u64(1);
        let ciphertext =
            AesKey::new(&[1u8; 32]).encrypt(&mut entropy, b"", b"secret");
        assert_eq!(
            AesKey::new(&[2u8; 32]).decrypt(b"", &ciphertext),
            Err(DecryptError)
        );
    }

    #[test]
    fn wrong_aad_fails() {
        let mut entropy = SeededEntropy::from_u64(2);
        let key = AesKey::new(&[1u8; 32]);
        let ciphertext = key.encrypt(&mut entropy, b"salt-a", b"secret");
        assert_eq!(key.decrypt(b"salt-b", &ciphertext), Err(DecryptError));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut entropy = SeededEntropy::from_u64(3);
        let key = AesKey::new(&[1u8; 32]);
        let mut ciphertext = key.encrypt(&mut entropy, b"", b"secret");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert_eq!(key.decrypt(b"", &ciphertext), Err(DecryptError));
    }

    #[test]
    fn truncated_ciphertext_fails() {
        assert_eq!(
            AesKey::new(&[1u8; 32]).decrypt(b"", &[0u8; 5]),
            Err(DecryptError)
        );
    }
}

//! Per-wallet key material: the BIP32 account lineage, encrypted private
//! material at rest, and address derivation for both account layouts.
//!
//! An [`AccessData`] is created once at first start and never mutated except
//! by an explicit PIN / password change. Plaintext secrets exist only
//! transiently: the account xpriv is decrypted per signing operation and the
//! buffers are zeroized on every exit path.

use std::fmt;

use bitcoin::{
    bip32::{ChildNumber, Xpriv, Xpub},
    secp256k1::{self, ecdsa, Message, PublicKey, Secp256k1, SecretKey},
};
use secrecy::Zeroize;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    address::Address,
    entropy::EntropySource,
    network::{Network, HATHOR_COIN_TYPE},
    password::{self, SALT_LEN},
    script,
    seed,
};

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("wrong pin")]
    WrongPin,
    #[error("wrong password")]
    WrongPassword,
    #[error("wallet has no private key material")]
    ReadOnly,
    #[error("wallet has no stored seed words")]
    NoSeed,
    #[error("invalid seed words: {0}")]
    InvalidWords(#[from] seed::InvalidWords),
    #[error("invalid extended key: {0}")]
    InvalidXKey(#[from] bitcoin::bip32::Error),
    #[error("invalid multisig configuration: {0}")]
    InvalidMultisigConfig(String),
    #[error("operation requires a threshold wallet")]
    NotThreshold,
    #[error("script error: {0}")]
    Script(#[from] script::ScriptError),
}

/// The two account layouts.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    /// One signer, P2PKH addresses.
    Single,
    /// N-of-M cosigners, P2SH addresses over a shared redeem script.
    Threshold,
}

/// Caller-supplied threshold configuration: every cosigner's account xpub
/// (own included) and the signature threshold.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MultisigConfig {
    pub pubkeys: Vec<String>,
    pub num_signatures: usize,
}

/// Validated threshold data persisted inside [`AccessData`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MultisigData {
    /// Every cosigner's account xpub, sorted by the hex encoding of its
    /// public key. Signature assembly relies on this order.
    pub pubkeys: Vec<Xpub>,
    pub num_signatures: usize,
}

impl MultisigData {
    fn from_config(
        config: &MultisigConfig,
        own_xpub: Option<&Xpub>,
    ) -> Result<Self, AccessError> {
        if config.pubkeys.is_empty() {
            return Err(AccessError::InvalidMultisigConfig(
                "no cosigner pubkeys".to_owned(),
            ));
        }
        if config.num_signatures == 0
            || config.num_signatures > config.pubkeys.len()
        {
            return Err(AccessError::InvalidMultisigConfig(format!(
                "invalid threshold {} of {}",
                config.num_signatures,
                config.pubkeys.len(),
            )));
        }

        let mut pubkeys = Vec::with_capacity(config.pubkeys.len());
        for s in &config.pubkeys {
            let xpub: Xpub = s
                .parse()
                .map_err(AccessError::from)?;
            pubkeys.push(xpub);
        }

        if let Some(own) = own_xpub {
            if !pubkeys.contains(own) {
                return Err(AccessError::InvalidMultisigConfig(
                    "own account xpub not among cosigner pubkeys".to_owned(),
                ));
            }
        }

        pubkeys.sort_unstable_by_key(|xpub| xpub.public_key.serialize());
        Ok(Self {
            pubkeys,
            num_signatures: config.num_signatures,
        })
    }
}

/// The per-wallet key material singleton.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccessData {
    pub wallet_kind: WalletKind,
    pub network: Network,
    /// Per-wallet KDF salt, also bound into ciphertexts as AAD.
    pub salt: [u8; SALT_LEN],
    /// The account-level xpriv, encrypted under the PIN.
    /// `None` for watch-only wallets.
    #[serde(with = "crate::hex::hexstr_opt")]
    pub encrypted_main_xpriv: Option<Vec<u8>>,
    /// The seed phrase, encrypted under the password.
    /// `None` for xpriv- or xpub-initialized wallets.
    #[serde(with = "crate::hex::hexstr_opt")]
    pub encrypted_seed_words: Option<Vec<u8>>,
    /// The account-level xpub, always present.
    pub account_xpub: Xpub,
    /// Present iff `wallet_kind == Threshold`.
    pub multisig: Option<MultisigData>,
}

// Never log key material, even though everything here is encrypted or
// public.
impl fmt::Debug for AccessData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessData")
            .field("wallet_kind", &self.wallet_kind)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

/// `m/44'/280'/0'` for single-signer, `m/45'/280'/0'` for threshold.
fn account_path(kind: WalletKind) -> [ChildNumber; 3] {
    let purpose = match kind {
        WalletKind::Single => 44,
        WalletKind::Threshold => 45,
    };
    [
        ChildNumber::Hardened { index: purpose },
        ChildNumber::Hardened { index: HATHOR_COIN_TYPE },
        ChildNumber::Hardened { index: 0 },
    ]
}

impl AccessData {
    /// Build access data from a seed phrase. The account xpriv is encrypted
    /// under `pin`; the seed words under `password`.
    pub fn from_seed<E: EntropySource>(
        entropy: &mut E,
        words: &str,
        passphrase: &str,
        pin: &str,
        password: &str,
        network: Network,
        multisig: Option<&MultisigConfig>,
    ) -> Result<Self, AccessError> {
        let secp = Secp256k1::new();
        let mnemonic = seed::parse_words(words)?;
        let mut seed_bytes = seed::to_seed(&mnemonic, passphrase);

        let kind = match multisig {
            Some(_) => WalletKind::Threshold,
            None => WalletKind::Single,
        };

        let master = Xpriv::new_master(network.bip32_kind(), &seed_bytes)?;
        seed_bytes.zeroize();
        let account_xpriv =
            master.derive_priv(&secp, &account_path(kind))?;
        let account_xpub = Xpub::from_priv(&secp, &account_xpriv);

        let multisig_data = multisig
            .map(|config| MultisigData::from_config(config, Some(&account_xpub)))
            .transpose()?;

        let salt = password::generate_salt(entropy);
        let mut xpriv_bytes = account_xpriv.encode();
        let encrypted_main_xpriv =
            password::encrypt(entropy, pin, &salt, &xpriv_bytes);
        xpriv_bytes.zeroize();

        let normalized_words = mnemonic.to_string();
        let encrypted_seed_words = password::encrypt(
            entropy,
            password,
            &salt,
            normalized_words.as_bytes(),
        );

        Ok(Self {
            wallet_kind: kind,
            network,
            salt,
            encrypted_main_xpriv: Some(encrypted_main_xpriv),
            encrypted_seed_words: Some(encrypted_seed_words),
            account_xpub,
            multisig: multisig_data,
        })
    }

    /// Build access data from an account-level xpriv. No seed words are
    /// stored.
    pub fn from_xpriv<E: EntropySource>(
        entropy: &mut E,
        xpriv: &str,
        pin: &str,
        network: Network,
        multisig: Option<&MultisigConfig>,
    ) -> Result<Self, AccessError> {
        let secp = Secp256k1::new();
        let account_xpriv: Xpriv = xpriv.parse()?;
        let account_xpub = Xpub::from_priv(&secp, &account_xpriv);

        let kind = match multisig {
            Some(_) => WalletKind::Threshold,
            None => WalletKind::Single,
        };
        let multisig_data = multisig
            .map(|config| MultisigData::from_config(config, Some(&account_xpub)))
            .transpose()?;

        let salt = password::generate_salt(entropy);
        let mut xpriv_bytes = account_xpriv.encode();
        let encrypted_main_xpriv =
            password::encrypt(entropy, pin, &salt, &xpriv_bytes);
        xpriv_bytes.zeroize();

        Ok(Self {
            wallet_kind: kind,
            network,
            salt,
            encrypted_main_xpriv: Some(encrypted_main_xpriv),
            encrypted_seed_words: None,
            account_xpub,
            multisig: multisig_data,
        })
    }

    /// Build watch-only access data from an account-level xpub.
    pub fn from_xpub<E: EntropySource>(
        entropy: &mut E,
        xpub: &str,
        network: Network,
        multisig: Option<&MultisigConfig>,
    ) -> Result<Self, AccessError> {
        let account_xpub: Xpub = xpub.parse()?;
        let kind = match multisig {
            Some(_) => WalletKind::Threshold,
            None => WalletKind::Single,
        };
        let multisig_data = multisig
            .map(|config| MultisigData::from_config(config, Some(&account_xpub)))
            .transpose()?;

        Ok(Self {
            wallet_kind: kind,
            network,
            salt: password::generate_salt(entropy),
            encrypted_main_xpriv: None,
            encrypted_seed_words: None,
            account_xpub,
            multisig: multisig_data,
        })
    }

    /// Whether this wallet lacks private key material.
    pub fn is_readonly(&self) -> bool {
        self.encrypted_main_xpriv.is_none()
    }

    /// Decrypt the account xpriv under `pin`. The intermediate plaintext
    /// buffer is zeroized before returning.
    pub fn decrypt_main_xpriv(&self, pin: &str) -> Result<Xpriv, AccessError> {
        let ciphertext = self
            .encrypted_main_xpriv
            .as_ref()
            .ok_or(AccessError::ReadOnly)?;
        let mut plaintext = password::decrypt(pin, &self.salt, ciphertext)
            .map_err(|_| AccessError::WrongPin)?;
        let result = Xpriv::decode(&plaintext);
        plaintext.zeroize();
        Ok(result?)
    }

    /// Decrypt the seed phrase under `password`.
    pub fn decrypt_seed_words(
        &self,
        password: &str,
    ) -> Result<String, AccessError> {
        let ciphertext = self
            .encrypted_seed_words
            .as_ref()
            .ok_or(AccessError::NoSeed)?;
        let mut plaintext =
            password::decrypt(password, &self.salt, ciphertext)
                .map_err(|_| AccessError::WrongPassword)?;
        let result = String::from_utf8(plaintext.clone());
        plaintext.zeroize();
        result.map_err(|_| AccessError::WrongPassword)
    }

    /// Check `pin` without exposing the xpriv to the caller.
    pub fn verify_pin(&self, pin: &str) -> Result<(), AccessError> {
        self.decrypt_main_xpriv(pin).map(|_| ())
    }

    /// Re-encrypt the account xpriv under a new PIN.
    pub fn change_pin<E: EntropySource>(
        &mut self,
        entropy: &mut E,
        old_pin: &str,
        new_pin: &str,
    ) -> Result<(), AccessError> {
        let xpriv = self.decrypt_main_xpriv(old_pin)?;
        let mut xpriv_bytes = xpriv.encode();
        self.encrypted_main_xpriv =
            Some(password::encrypt(entropy, new_pin, &self.salt, &xpriv_bytes));
        xpriv_bytes.zeroize();
        Ok(())
    }

    /// Re-encrypt the seed words under a new password.
    pub fn change_password<E: EntropySource>(
        &mut self,
        entropy: &mut E,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AccessError> {
        let words = self.decrypt_seed_words(old_password)?;
        self.encrypted_seed_words = Some(password::encrypt(
            entropy,
            new_password,
            &self.salt,
            words.as_bytes(),
        ));
        Ok(())
    }

    /// The child public key at `account/0/index` for this wallet's own
    /// account.
    pub fn derive_pubkey(
        &self,
        secp: &Secp256k1<secp256k1::All>,
        index: u32,
    ) -> Result<PublicKey, AccessError> {
        derive_child_pubkey(secp, &self.account_xpub, index)
    }

    /// The address at `index`. Deterministic for a given (wallet, index).
    pub fn derive_address(
        &self,
        secp: &Secp256k1<secp256k1::All>,
        index: u32,
    ) -> Result<Address, AccessError> {
        match self.wallet_kind {
            WalletKind::Single => {
                let pubkey = self.derive_pubkey(secp, index)?;
                Ok(Address::from_pubkey(&pubkey, self.network))
            }
            WalletKind::Threshold => {
                let redeem_script = self.redeem_script_at(secp, index)?;
                Ok(Address::from_redeem_script(&redeem_script, self.network))
            }
        }
    }

    /// The N-of-M redeem script at `index`, built from every cosigner's
    /// child pubkey. Threshold wallets only.
    pub fn redeem_script_at(
        &self,
        secp: &Secp256k1<secp256k1::All>,
        index: u32,
    ) -> Result<Vec<u8>, AccessError> {
        let multisig =
            self.multisig.as_ref().ok_or(AccessError::NotThreshold)?;
        let mut pubkeys = Vec::with_capacity(multisig.pubkeys.len());
        for xpub in &multisig.pubkeys {
            pubkeys.push(derive_child_pubkey(secp, xpub, index)?);
        }
        Ok(script::multisig_redeem_script(
            &pubkeys,
            multisig.num_signatures,
        )?)
    }
}

/// Derive the child pubkey at `xpub/0/index`.
pub fn derive_child_pubkey(
    secp: &Secp256k1<secp256k1::All>,
    xpub: &Xpub,
    index: u32,
) -> Result<PublicKey, AccessError> {
    let child = xpub.derive_pub(
        secp,
        &[
            ChildNumber::Normal { index: 0 },
            ChildNumber::Normal { index },
        ],
    )?;
    Ok(child.public_key)
}

/// Derive the child private key at `xpriv/0/index`.
pub fn derive_child_privkey(
    secp: &Secp256k1<secp256k1::All>,
    account_xpriv: &Xpriv,
    index: u32,
) -> Result<SecretKey, AccessError> {
    let child = account_xpriv.derive_priv(
        secp,
        &[
            ChildNumber::Normal { index: 0 },
            ChildNumber::Normal { index },
        ],
    )?;
    Ok(child.private_key)
}

/// Sign a 32-byte digest, producing a low-S normalized signature.
pub fn sign_ecdsa(
    secp: &Secp256k1<secp256k1::All>,
    privkey: &SecretKey,
    digest: &[u8; 32],
) -> ecdsa::Signature {
    let message = Message::from_digest(*digest);
    // rust-secp256k1 signatures are low-S normalized by construction.
    secp.sign_ecdsa(&message, privkey)
}

/// Verify a signature over a 32-byte digest.
pub fn verify_ecdsa(
    secp: &Secp256k1<secp256k1::All>,
    pubkey: &PublicKey,
    digest: &[u8; 32],
    signature: &ecdsa::Signature,
) -> bool {
    let message = Message::from_digest(*digest);
    secp.verify_ecdsa(&message, signature, pubkey).is_ok()
}

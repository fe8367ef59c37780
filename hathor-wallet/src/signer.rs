//! Per-input signing: local P2PKH, threshold P2SH collect-then-assemble,
//! and the external-signer delegation hook.
//!
//! Private key material is decrypted per operation and erased on every
//! exit path via drop guards.

use async_trait::async_trait;
use bitcoin::{
    bip32::Xpriv,
    secp256k1::{All, PublicKey, Secp256k1, SecretKey},
};
use hathor_common::{
    access::{
        self, AccessData, WalletKind,
    },
    hex, script,
    tx::Transaction,
};

use crate::{
    error::{WalletError, WalletResult},
    storage::Storage,
};

/// Describes one input the wallet can sign: which input, which address,
/// and where that address sits in the BIP32 lineage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InputDescriptor {
    pub input_index: usize,
    pub address: String,
    pub derivation_index: u32,
}

/// A hook that signs on the wallet's behalf, e.g. a hardware device or a
/// remote signing service. When installed, the wallet is never read-only.
#[async_trait]
pub trait ExternalSigner: Send + Sync {
    /// Produce input-data for each descriptor, in order.
    async fn sign_transaction(
        &self,
        tx: &Transaction,
        inputs: &[InputDescriptor],
    ) -> WalletResult<Vec<Vec<u8>>>;
}

/// A decrypted account xpriv that erases itself when the signing scope
/// ends, however it ends.
struct DecryptedXpriv(Xpriv);

impl Drop for DecryptedXpriv {
    fn drop(&mut self) {
        self.0.private_key.non_secure_erase();
    }
}

/// A derived child key with the same erase-on-drop discipline.
struct ChildKey(SecretKey);

impl Drop for ChildKey {
    fn drop(&mut self) {
        self.0.non_secure_erase();
    }
}

/// The portable threshold signature blob:
/// `account_pubkey(33) | count(1) | [input_index(1) | sig_len(1) | sig]*`,
/// hex-encoded for transport between cosigners.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignatureBlob {
    pub account_pubkey: PublicKey,
    /// `(input_index, der_signature)` pairs.
    pub signatures: Vec<(u8, Vec<u8>)>,
}

impl SignatureBlob {
    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(34 + self.signatures.len() * 74);
        bytes.extend_from_slice(&self.account_pubkey.serialize());
        bytes.push(self.signatures.len() as u8);
        for (input_index, sig) in &self.signatures {
            bytes.push(*input_index);
            bytes.push(sig.len() as u8);
            bytes.extend_from_slice(sig);
        }
        hex::encode(&bytes)
    }

    pub fn decode(encoded: &str) -> WalletResult<Self> {
        let bytes = hex::decode(encoded).map_err(|_| {
            WalletError::InvalidTransaction(
                "signature blob is not valid hex".to_owned(),
            )
        })?;
        let truncated = || {
            WalletError::InvalidTransaction(
                "signature blob is truncated".to_owned(),
            )
        };

        let pubkey_bytes = bytes.get(..33).ok_or_else(truncated)?;
        let account_pubkey =
            PublicKey::from_slice(pubkey_bytes).map_err(|_| {
                WalletError::InvalidTransaction(
                    "signature blob has a bad pubkey".to_owned(),
                )
            })?;

        let count = *bytes.get(33).ok_or_else(truncated)? as usize;
        let mut signatures = Vec::with_capacity(count);
        let mut at = 34;
        for _ in 0..count {
            let input_index = *bytes.get(at).ok_or_else(truncated)?;
            let sig_len =
                *bytes.get(at + 1).ok_or_else(truncated)? as usize;
            let sig = bytes
                .get(at + 2..at + 2 + sig_len)
                .ok_or_else(truncated)?
                .to_vec();
            signatures.push((input_index, sig));
            at += 2 + sig_len;
        }
        if at != bytes.len() {
            return Err(WalletError::InvalidTransaction(
                "signature blob has trailing bytes".to_owned(),
            ));
        }
        Ok(Self {
            account_pubkey,
            signatures,
        })
    }
}

/// Signs transactions against one wallet's key material and storage.
pub struct Signer<'a> {
    storage: &'a Storage,
    access: &'a AccessData,
    secp: Secp256k1<All>,
}

impl<'a> Signer<'a> {
    pub fn new(storage: &'a Storage, access: &'a AccessData) -> Self {
        Self {
            storage,
            access,
            secp: Secp256k1::new(),
        }
    }

    /// The inputs of `tx` whose prior output pays a wallet address.
    pub async fn wallet_inputs(
        &self,
        tx: &Transaction,
    ) -> WalletResult<Vec<InputDescriptor>> {
        let mut descriptors = Vec::new();
        for (input_index, input) in tx.inputs.iter().enumerate() {
            let Some(prior) =
                self.storage.backend().get_tx(&input.tx_id).await?
            else {
                continue;
            };
            let Some(output) = prior.outputs.get(input.index as usize)
            else {
                continue;
            };
            let Some(address) = &output.decoded_address else {
                continue;
            };
            let Some(record) =
                self.storage.backend().get_address(address).await?
            else {
                continue;
            };
            descriptors.push(InputDescriptor {
                input_index,
                address: address.clone(),
                derivation_index: record.index,
            });
        }
        Ok(descriptors)
    }

    /// Sign every wallet-owned input of a single-signer transaction in
    /// place, building `<sig> <pubkey>` input data.
    pub async fn sign_transaction(
        &self,
        tx: &mut Transaction,
        pin: &str,
    ) -> WalletResult<()> {
        if self.access.wallet_kind != WalletKind::Single {
            return Err(WalletError::InvalidTransaction(
                "threshold wallets sign via get_all_signatures / \
                 assemble_partial"
                    .to_owned(),
            ));
        }
        let descriptors = self.wallet_inputs(tx).await?;
        let digest = tx.sighash_all();
        let xpriv = DecryptedXpriv(self.access.decrypt_main_xpriv(pin)?);

        for descriptor in descriptors {
            let child = ChildKey(access::derive_child_privkey(
                &self.secp,
                &xpriv.0,
                descriptor.derivation_index,
            )?);
            let signature = access::sign_ecdsa(&self.secp, &child.0, &digest);
            let pubkey = PublicKey::from_secret_key(&self.secp, &child.0);
            let data = script::p2pkh_input_data(
                &signature.serialize_der(),
                &pubkey,
            )
            .map_err(|e| WalletError::InvalidTransaction(e.to_string()))?;
            tx.inputs[descriptor.input_index].data = data;
        }
        Ok(())
    }

    /// Apply an external signer to every wallet-owned input.
    pub async fn sign_with_external(
        &self,
        tx: &mut Transaction,
        external: &dyn ExternalSigner,
    ) -> WalletResult<()> {
        let descriptors = self.wallet_inputs(tx).await?;
        if descriptors.is_empty() {
            return Ok(());
        }
        let data = external.sign_transaction(tx, &descriptors).await?;
        if data.len() != descriptors.len() {
            return Err(WalletError::InvalidTransaction(format!(
                "external signer returned {} input-data for {} inputs",
                data.len(),
                descriptors.len()
            )));
        }
        for (descriptor, input_data) in descriptors.iter().zip(data) {
            tx.inputs[descriptor.input_index].data = input_data;
        }
        Ok(())
    }

    /// Threshold step 1: sign every wallet-owned input and export a
    /// portable blob for the other cosigners.
    pub async fn get_all_signatures(
        &self,
        tx_hex: &str,
        pin: &str,
    ) -> WalletResult<String> {
        self.require_threshold()?;
        let tx = Transaction::from_hex(tx_hex)
            .map_err(|e| WalletError::InvalidTransaction(e.to_string()))?;
        let descriptors = self.wallet_inputs(&tx).await?;
        let digest = tx.sighash_all();
        let xpriv = DecryptedXpriv(self.access.decrypt_main_xpriv(pin)?);

        let mut signatures = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let child = ChildKey(access::derive_child_privkey(
                &self.secp,
                &xpriv.0,
                descriptor.derivation_index,
            )?);
            let signature = access::sign_ecdsa(&self.secp, &child.0, &digest);
            signatures.push((
                descriptor.input_index as u8,
                signature.serialize_der().to_vec(),
            ));
        }

        Ok(SignatureBlob {
            account_pubkey: self.access.account_xpub.public_key,
            signatures,
        }
        .encode())
    }

    /// Threshold step 2: combine cosigner blobs into input data
    /// `<sig_1> … <sig_N> <redeem_script>`, with signatures in ascending
    /// hex order of the cosigner account pubkeys. Extra blobs beyond the
    /// threshold are skipped.
    pub async fn assemble_partial(
        &self,
        tx_hex: &str,
        blobs: &[String],
    ) -> WalletResult<Transaction> {
        let multisig = self.require_threshold()?;
        let required = multisig.num_signatures;

        let mut tx = Transaction::from_hex(tx_hex)
            .map_err(|e| WalletError::InvalidTransaction(e.to_string()))?;
        let descriptors = self.wallet_inputs(&tx).await?;

        let mut parsed: Vec<SignatureBlob> = Vec::with_capacity(blobs.len());
        for blob in blobs {
            let blob = SignatureBlob::decode(blob)?;
            // A duplicated cosigner blob counts once.
            if !parsed
                .iter()
                .any(|seen| seen.account_pubkey == blob.account_pubkey)
            {
                parsed.push(blob);
            }
        }
        // The load-bearing sort: signature order must match the
        // lexicographic hex order of the cosigner account pubkeys.
        parsed.sort_by_key(|blob| blob.account_pubkey.serialize());

        for descriptor in descriptors {
            let redeem_script = self.access.redeem_script_at(
                &self.secp,
                descriptor.derivation_index,
            )?;

            let signatures: Vec<Vec<u8>> = parsed
                .iter()
                .filter_map(|blob| {
                    blob.signatures
                        .iter()
                        .find(|(input_index, _)| {
                            *input_index == descriptor.input_index as u8
                        })
                        .map(|(_, sig)| sig.clone())
                })
                .take(required)
                .collect();

            if signatures.len() < required {
                return Err(WalletError::InvalidTransaction(format!(
                    "input {} has {} of {} required signatures",
                    descriptor.input_index,
                    signatures.len(),
                    required
                )));
            }

            tx.inputs[descriptor.input_index].data =
                script::p2sh_input_data(&signatures, &redeem_script)
                    .map_err(|e| {
                        WalletError::InvalidTransaction(e.to_string())
                    })?;
        }
        Ok(tx)
    }

    fn require_threshold(
        &self,
    ) -> WalletResult<&hathor_common::access::MultisigData> {
        self.access.multisig.as_ref().ok_or_else(|| {
            WalletError::InvalidTransaction(
                "operation requires a threshold wallet".to_owned(),
            )
        })
    }
}

#[cfg(test)]
mod test {
    use bitcoin::bip32::Xpub;
    use hathor_common::{
        access::MultisigConfig,
        address::WalletAddress,
        amount::TokenAmount,
        entropy::SeededEntropy,
        network::Network,
        seed,
        tx::{TxInput, TxVersion},
    };

    use super::*;
    use crate::testing::{tx_id, HistoryTxBuilder};

    const WORDS: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon \
         abandon abandon abandon abandon abandon abandon abandon abandon \
         abandon abandon abandon abandon abandon abandon abandon art";

    /// Parse `<push> <push> ...` input data into its pushed chunks.
    fn parse_pushes(mut data: &[u8]) -> Vec<Vec<u8>> {
        let mut pushes = Vec::new();
        while !data.is_empty() {
            let (len, rest) = match data[0] {
                0x4c => (data[1] as usize, &data[2..]),
                len => (len as usize, &data[1..]),
            };
            pushes.push(rest[..len].to_vec());
            data = &rest[len..];
        }
        pushes
    }

    async fn single_signer() -> (Storage, AccessData, Vec<String>) {
        let secp = Secp256k1::new();
        let mut entropy = SeededEntropy::from_u64(5);
        let access = AccessData::from_seed(
            &mut entropy,
            WORDS,
            "",
            "000000",
            "p",
            Network::Testnet,
            None,
        )
        .unwrap();
        let storage = Storage::in_memory();
        storage.ensure_native_token().await.unwrap();
        let mut addresses = Vec::new();
        for index in 0..2 {
            let address = access.derive_address(&secp, index).unwrap();
            storage
                .backend()
                .save_address(&WalletAddress::new(&address, index))
                .await
                .unwrap();
            addresses.push(address.to_string());
        }
        (storage, access, addresses)
    }

    #[tokio::test]
    async fn p2pkh_signing_produces_valid_input_data() {
        let (storage, access, addresses) = single_signer().await;
        storage
            .process_new_tx(
                HistoryTxBuilder::new(1, 100)
                    .output(&addresses[0], 1_000)
                    .build(),
            )
            .await
            .unwrap();

        let mut tx = Transaction::new(TxVersion::Transaction);
        tx.inputs.push(TxInput::new(tx_id(1), 0));
        tx.outputs.push(hathor_common::tx::TxOutput {
            value: TokenAmount::from_u64(1_000),
            token_data: 0,
            script: vec![0x51],
        });

        let signer = Signer::new(&storage, &access);
        signer.sign_transaction(&mut tx, "000000").await.unwrap();

        let pushes = parse_pushes(&tx.inputs[0].data);
        assert_eq!(pushes.len(), 2);
        // Second push is the compressed pubkey for address index 0.
        let secp = Secp256k1::new();
        let expected = access.derive_pubkey(&secp, 0).unwrap();
        assert_eq!(pushes[1], expected.serialize().to_vec());

        // The DER signature verifies against the sighash.
        let signature = bitcoin::secp256k1::ecdsa::Signature::from_der(
            &pushes[0],
        )
        .unwrap();
        assert!(access::verify_ecdsa(
            &secp,
            &expected,
            &tx.sighash_all(),
            &signature
        ));
    }

    #[tokio::test]
    async fn wrong_pin_is_rejected() {
        let (storage, access, addresses) = single_signer().await;
        storage
            .process_new_tx(
                HistoryTxBuilder::new(1, 100)
                    .output(&addresses[0], 1_000)
                    .build(),
            )
            .await
            .unwrap();
        let mut tx = Transaction::new(TxVersion::Transaction);
        tx.inputs.push(TxInput::new(tx_id(1), 0));

        let signer = Signer::new(&storage, &access);
        let err = signer
            .sign_transaction(&mut tx, "999999")
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::WrongPin));
    }

    fn threshold_wallets() -> Vec<AccessData> {
        let mut blob_entropy = SeededEntropy::from_u64(6);
        let words: Vec<String> = [10u64, 20, 30]
            .iter()
            .map(|n| {
                let mut seed_entropy = SeededEntropy::from_u64(*n);
                seed::generate_words(&mut seed_entropy).to_string()
            })
            .collect();

        let xpubs: Vec<String> = words
            .iter()
            .map(|w| {
                // Derive each cosigner's threshold account xpub.
                let secp = Secp256k1::new();
                let mnemonic = seed::parse_words(w).unwrap();
                let seed_bytes = seed::to_seed(&mnemonic, "");
                let master = Xpriv::new_master(
                    Network::Testnet.bip32_kind(),
                    &seed_bytes,
                )
                .unwrap();
                let account = master
                    .derive_priv(
                        &secp,
                        &[
                            bitcoin::bip32::ChildNumber::Hardened {
                                index: 45,
                            },
                            bitcoin::bip32::ChildNumber::Hardened {
                                index: 280,
                            },
                            bitcoin::bip32::ChildNumber::Hardened {
                                index: 0,
                            },
                        ],
                    )
                    .unwrap();
                Xpub::from_priv(&secp, &account).to_string()
            })
            .collect();

        let config = MultisigConfig {
            pubkeys: xpubs,
            num_signatures: 2,
        };
        words
            .iter()
            .map(|w| {
                AccessData::from_seed(
                    &mut blob_entropy,
                    w,
                    "",
                    "000000",
                    "p",
                    Network::Testnet,
                    Some(&config),
                )
                .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn threshold_collect_then_assemble() {
        let secp = Secp256k1::new();
        let wallets = threshold_wallets();

        // Every cosigner sees the same P2SH address at index 0.
        let shared_address =
            wallets[0].derive_address(&secp, 0).unwrap().to_string();

        // Each cosigner needs its own storage view of the shared wallet.
        let mut storages = Vec::new();
        for _ in &wallets {
            let storage = Storage::in_memory();
            storage.ensure_native_token().await.unwrap();
            let decoded =
                wallets[0].derive_address(&secp, 0).unwrap();
            storage
                .backend()
                .save_address(&WalletAddress::new(&decoded, 0))
                .await
                .unwrap();
            storage
                .process_new_tx(
                    HistoryTxBuilder::new(1, 100)
                        .output(&shared_address, 1_000)
                        .build(),
                )
                .await
                .unwrap();
            storages.push(storage);
        }

        // Build the spend.
        let mut tx = Transaction::new(TxVersion::Transaction);
        tx.inputs.push(TxInput::new(tx_id(1), 0));
        tx.outputs.push(hathor_common::tx::TxOutput {
            value: TokenAmount::from_u64(1_000),
            token_data: 0,
            script: vec![0x51],
        });
        let tx_hex = tx.to_hex();

        // Cosigners 1 and 2 produce blobs; wallet 0 assembles.
        let blob_1 = Signer::new(&storages[1], &wallets[1])
            .get_all_signatures(&tx_hex, "000000")
            .await
            .unwrap();
        let blob_2 = Signer::new(&storages[2], &wallets[2])
            .get_all_signatures(&tx_hex, "000000")
            .await
            .unwrap();

        let assembled = Signer::new(&storages[0], &wallets[0])
            .assemble_partial(&tx_hex, &[blob_1.clone(), blob_2.clone()])
            .await
            .unwrap();

        // Input data decodes as <sig_a> <sig_b> <redeem_script>.
        let pushes = parse_pushes(&assembled.inputs[0].data);
        assert_eq!(pushes.len(), 3);
        let redeem_script =
            wallets[0].redeem_script_at(&secp, 0).unwrap();
        assert_eq!(pushes[2], redeem_script);

        // Signatures are ordered by hex-sorted cosigner account pubkeys.
        let decoded_1 = SignatureBlob::decode(&blob_1).unwrap();
        let decoded_2 = SignatureBlob::decode(&blob_2).unwrap();
        let mut expected = vec![
            (
                decoded_1.account_pubkey.serialize(),
                decoded_1.signatures[0].1.clone(),
            ),
            (
                decoded_2.account_pubkey.serialize(),
                decoded_2.signatures[0].1.clone(),
            ),
        ];
        expected.sort_by_key(|(pubkey, _)| *pubkey);
        assert_eq!(pushes[0], expected[0].1);
        assert_eq!(pushes[1], expected[1].1);

        // Each signature verifies against the sighash under the matching
        // cosigner account-derived child pubkey.
        let digest = assembled.sighash_all();
        for (cosigner, sig_der) in
            [(&wallets[1], &decoded_1), (&wallets[2], &decoded_2)]
        {
            let child = access::derive_child_pubkey(
                &secp,
                &cosigner.account_xpub,
                0,
            )
            .unwrap();
            let signature =
                bitcoin::secp256k1::ecdsa::Signature::from_der(
                    &sig_der.signatures[0].1,
                )
                .unwrap();
            assert!(access::verify_ecdsa(
                &secp, &child, &digest, &signature
            ));
        }
    }

    #[tokio::test]
    async fn assemble_fails_below_threshold() {
        let secp = Secp256k1::new();
        let wallets = threshold_wallets();
        let shared = wallets[0].derive_address(&secp, 0).unwrap();

        let storage = Storage::in_memory();
        storage.ensure_native_token().await.unwrap();
        storage
            .backend()
            .save_address(&WalletAddress::new(&shared, 0))
            .await
            .unwrap();
        storage
            .process_new_tx(
                HistoryTxBuilder::new(1, 100)
                    .output(&shared.to_string(), 1_000)
                    .build(),
            )
            .await
            .unwrap();

        let mut tx = Transaction::new(TxVersion::Transaction);
        tx.inputs.push(TxInput::new(tx_id(1), 0));
        let tx_hex = tx.to_hex();

        let blob = Signer::new(&storage, &wallets[1])
            .get_all_signatures(&tx_hex, "000000")
            .await
            .unwrap();

        // One blob for a 2-of-3 wallet: not enough. A duplicate of the
        // same blob doesn't help either.
        let signer = Signer::new(&storage, &wallets[0]);
        for blobs in [vec![blob.clone()], vec![blob.clone(), blob]] {
            let err = signer
                .assemble_partial(&tx_hex, &blobs)
                .await
                .unwrap_err();
            assert!(matches!(err, WalletError::InvalidTransaction(_)));
        }
    }

    #[test]
    fn blob_roundtrip() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let blob = SignatureBlob {
            account_pubkey: PublicKey::from_secret_key(&secp, &sk),
            signatures: vec![(0, vec![0xde; 70]), (2, vec![0xad; 71])],
        };
        assert_eq!(
            SignatureBlob::decode(&blob.encode()).unwrap(),
            blob
        );
    }
}

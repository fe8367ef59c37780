//! A declarative transaction template: a typed list of instructions the
//! interpreter validates and lowers into a fully populated transaction.
//! Templates are serializable, so callers can ship them across process
//! boundaries and have the wallet do the utxo work.

use hathor_common::{
    amount::TokenAmount,
    api::NodeVersion,
    network::Network,
    script,
    token::TokenUid,
    tx::{
        TokenCreationInfo, Transaction, TxInput, TxOutput, TxVersion,
    },
    TxId,
};
use serde::{Deserialize, Serialize};

use crate::{
    builder::{AuthorityKind, TxBuilder},
    error::{WalletError, WalletResult},
    select::select_for_amount,
    storage::Storage,
};

/// One step of a transaction template.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TemplateInstruction {
    /// Produce a token output.
    Output {
        address: String,
        amount: TokenAmount,
        #[serde(default)]
        token: TokenUid,
        #[serde(default)]
        timelock: Option<u32>,
    },
    /// Produce a data output (burns one native base unit).
    DataOutput { data: String },
    /// Produce an authority output.
    AuthorityOutput {
        address: String,
        token: TokenUid,
        kind: AuthorityKind,
    },
    /// Consume a specific utxo.
    ConsumeUtxo { tx_id: TxId, index: u8 },
    /// Run amount-filling selection for a token, adding change if needed.
    SelectUtxos {
        token: TokenUid,
        amount: TokenAmount,
        #[serde(default)]
        change_address: Option<String>,
    },
    /// Turn the transaction into a create-token transaction.
    CreateToken { name: String, symbol: String },
}

/// A validated sequence of instructions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TxTemplate {
    pub instructions: Vec<TemplateInstruction>,
}

impl TxTemplate {
    pub fn new(instructions: Vec<TemplateInstruction>) -> Self {
        Self { instructions }
    }
}

/// Lowers templates into transactions against one wallet's storage.
pub struct TemplateInterpreter<'a> {
    storage: &'a Storage,
    builder: TxBuilder<'a>,
    params: &'a NodeVersion,
}

impl<'a> TemplateInterpreter<'a> {
    pub fn new(
        storage: &'a Storage,
        params: &'a NodeVersion,
        network: Network,
    ) -> Self {
        Self {
            storage,
            builder: TxBuilder::new(storage, params, network),
            params,
        }
    }

    /// Validate and lower `template`. Instructions execute in order;
    /// outputs appear in instruction order, with selection change appended
    /// at the end.
    pub async fn interpret(
        &self,
        template: &TxTemplate,
    ) -> WalletResult<Transaction> {
        if template.instructions.is_empty() {
            return Err(WalletError::InvalidTransaction(
                "template has no instructions".to_owned(),
            ));
        }

        let mut tx = Transaction::new(TxVersion::Transaction);
        let mut change_outputs: Vec<TxOutput> = Vec::new();

        // The token table is every custom token named by any instruction,
        // in first-appearance order. A create-token template references its
        // new token at the implicit index past the table.
        for instruction in &template.instructions {
            let token = match instruction {
                TemplateInstruction::Output { token, .. } => Some(token),
                TemplateInstruction::AuthorityOutput { token, .. } =>
                    Some(token),
                TemplateInstruction::SelectUtxos { token, .. } =>
                    Some(token),
                _ => None,
            };
            if let Some(token) = token {
                if !token.is_native() && !tx.tokens.contains(token) {
                    tx.tokens.push(token.clone());
                }
            }
        }

        for instruction in &template.instructions {
            match instruction {
                TemplateInstruction::Output {
                    address,
                    amount,
                    token,
                    timelock,
                } => {
                    if amount.is_zero() {
                        return Err(WalletError::InvalidTransaction(
                            "template output amount must be positive"
                                .to_owned(),
                        ));
                    }
                    let token_data =
                        self.builder.token_index(&tx.tokens, token)?;
                    tx.outputs.push(TxOutput {
                        value: *amount,
                        token_data,
                        script: self
                            .builder
                            .script_for(address, *timelock)?,
                    });
                }
                TemplateInstruction::DataOutput { data } => {
                    tx.outputs.push(TxOutput {
                        value: TokenAmount::ONE,
                        token_data: 0,
                        script: script::data_script(data.as_bytes())
                            .map_err(|e| {
                                WalletError::InvalidTransaction(
                                    e.to_string(),
                                )
                            })?,
                    });
                }
                TemplateInstruction::AuthorityOutput {
                    address,
                    token,
                    kind,
                } => {
                    let token_data =
                        self.builder.token_index(&tx.tokens, token)?;
                    tx.outputs.push(self.builder.authority_output(
                        address, token_data, *kind,
                    )?);
                }
                TemplateInstruction::ConsumeUtxo { tx_id, index } => {
                    let key = (*tx_id, *index);
                    let utxo = self
                        .storage
                        .backend()
                        .get_utxo(&key)
                        .await?
                        .ok_or_else(|| {
                            WalletError::InvalidTransaction(format!(
                                "template consumes unknown utxo \
                                 {tx_id}:{index}"
                            ))
                        })?;
                    tx.inputs.push(TxInput::new(utxo.tx_id, utxo.index));
                    self.builder.reserve(&utxo);
                }
                TemplateInstruction::SelectUtxos {
                    token,
                    amount,
                    change_address,
                } => {
                    let selection = select_for_amount(
                        self.storage,
                        token,
                        *amount,
                        None,
                        self.params.max_number_inputs,
                    )
                    .await?;
                    self.builder.push_selection(&mut tx, &selection);
                    if !selection.change.is_zero() {
                        let address = match change_address {
                            Some(address) => {
                                self.builder.require_mine(address).await?;
                                address.clone()
                            }
                            None => self
                                .builder
                                .fresh_change_address()
                                .await?,
                        };
                        change_outputs.push(TxOutput {
                            value: selection.change,
                            token_data: self
                                .builder
                                .token_index(&tx.tokens, token)?,
                            script: self
                                .builder
                                .script_for(&address, None)?,
                        });
                    }
                }
                TemplateInstruction::CreateToken { name, symbol } => {
                    if tx.token_info.is_some() {
                        return Err(WalletError::InvalidTransaction(
                            "template creates a token twice".to_owned(),
                        ));
                    }
                    tx.version = TxVersion::CreateToken;
                    tx.token_info = Some(TokenCreationInfo {
                        name: name.clone(),
                        symbol: symbol.clone(),
                    });
                }
            }
        }

        tx.outputs.extend(change_outputs);
        if tx.outputs.is_empty() && tx.inputs.is_empty() {
            return Err(WalletError::InvalidTransaction(
                "template produced an empty transaction".to_owned(),
            ));
        }
        self.builder.finalize(tx)
    }
}

#[cfg(test)]
mod test {
    use hathor_common::{
        access::AccessData, address::WalletAddress, entropy::SeededEntropy,
    };

    use super::*;
    use crate::testing::HistoryTxBuilder;

    const WORDS: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon \
         abandon abandon abandon abandon abandon abandon abandon abandon \
         abandon abandon abandon abandon abandon abandon abandon art";

    async fn funded_storage() -> (Storage, Vec<String>) {
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let mut entropy = SeededEntropy::from_u64(2);
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
        for index in 0..3 {
            let address = access.derive_address(&secp, index).unwrap();
            storage
                .backend()
                .save_address(&WalletAddress::new(&address, index))
                .await
                .unwrap();
            addresses.push(address.to_string());
        }
        storage
            .process_new_tx(
                HistoryTxBuilder::new(1, 100)
                    .output(&addresses[0], 1_000)
                    .build(),
            )
            .await
            .unwrap();
        (storage, addresses)
    }

    #[tokio::test]
    async fn template_lowers_to_send() {
        let (storage, addresses) = funded_storage().await;
        let params = NodeVersion::default();
        let interpreter = TemplateInterpreter::new(
            &storage,
            &params,
            Network::Testnet,
        );

        let template = TxTemplate::new(vec![
            TemplateInstruction::Output {
                address: addresses[1].clone(),
                amount: TokenAmount::from_u64(300),
                token: TokenUid::Native,
                timelock: None,
            },
            TemplateInstruction::SelectUtxos {
                token: TokenUid::Native,
                amount: TokenAmount::from_u64(300),
                change_address: None,
            },
        ]);

        let tx = interpreter.interpret(&template).await.unwrap();
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].value, TokenAmount::from_u64(300));
        assert_eq!(tx.outputs[1].value, TokenAmount::from_u64(700));
    }

    #[tokio::test]
    async fn template_rejects_double_create() {
        let (storage, _) = funded_storage().await;
        let params = NodeVersion::default();
        let interpreter = TemplateInterpreter::new(
            &storage,
            &params,
            Network::Testnet,
        );

        let template = TxTemplate::new(vec![
            TemplateInstruction::CreateToken {
                name: "A".to_owned(),
                symbol: "A".to_owned(),
            },
            TemplateInstruction::CreateToken {
                name: "B".to_owned(),
                symbol: "B".to_owned(),
            },
        ]);
        let err = interpreter.interpret(&template).await.unwrap_err();
        assert!(matches!(err, WalletError::InvalidTransaction(_)));
    }

    #[tokio::test]
    async fn template_roundtrips_through_json() {
        let template = TxTemplate::new(vec![
            TemplateInstruction::DataOutput {
                data: "hello".to_owned(),
            },
            TemplateInstruction::SelectUtxos {
                token: TokenUid::Native,
                amount: TokenAmount::ONE,
                change_address: None,
            },
        ]);
        let json = serde_json::to_string(&template).unwrap();
        let parsed: TxTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.instructions.len(), 2);
        assert!(json.contains("\"type\":\"data_output\""));
    }
}

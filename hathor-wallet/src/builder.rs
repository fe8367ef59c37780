//! Unsigned transaction construction: plain sends, token lifecycle
//! operations (create / mint / melt), authority management, and utxo
//! consolidation.
//!
//! Every builder returns a structurally valid, unsigned [`Transaction`]
//! whose inputs have been advisorily reserved via `mark_selected`. Signing
//! is the signer's job; weight/parents finalization beyond the local
//! estimate is the mining collaborator's.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    str::FromStr,
};

use hathor_common::{
    address::Address,
    amount::TokenAmount,
    api::NodeVersion,
    constants::{NFT_DEPOSIT, SELECTED_UTXO_TTL},
    network::Network,
    script,
    token::TokenUid,
    tx::{
        ser, TokenCreationInfo, Transaction, TxInput, TxOutput, TxVersion,
        AUTHORITY_MELT, AUTHORITY_MINT, TOKEN_AUTHORITY_MASK,
    },
    TxId,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{WalletError, WalletResult},
    select::{select_for_amount, Selection},
    storage::{unix_now, Storage, Utxo, UtxoFilter},
};

/// The two authority capabilities a custom token can carry.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AuthorityKind {
    Mint,
    Melt,
}

impl AuthorityKind {
    pub fn bits(self) -> u8 {
        match self {
            AuthorityKind::Mint => AUTHORITY_MINT,
            AuthorityKind::Melt => AUTHORITY_MELT,
        }
    }
}

impl Display for AuthorityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorityKind::Mint => f.write_str("mint"),
            AuthorityKind::Melt => f.write_str("melt"),
        }
    }
}

impl FromStr for AuthorityKind {
    type Err = WalletError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mint" => Ok(AuthorityKind::Mint),
            "melt" => Ok(AuthorityKind::Melt),
            other =>
                Err(WalletError::InvalidAuthorityKind(other.to_owned())),
        }
    }
}

/// One requested output of a plain send.
#[derive(Clone, Debug)]
pub enum SendOutput {
    Token {
        address: String,
        value: TokenAmount,
        token: TokenUid,
        timelock: Option<u32>,
    },
    /// A data output; burns one native base unit.
    Data { data: String },
}

#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Spend exactly these utxos instead of running selection.
    pub inputs: Option<Vec<(TxId, u8)>>,
    pub change_address: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CreateTokenOptions {
    /// Where the minted amount goes; own next address when `None`.
    pub destination: Option<String>,
    pub create_mint_authority: bool,
    pub create_melt_authority: bool,
    /// Where the authority outputs go; own next address when `None`.
    pub authority_address: Option<String>,
    pub allow_external_authority_address: bool,
    pub change_address: Option<String>,
    /// NFT: the fee collapses to one base unit and these data outputs are
    /// prepended.
    pub nft_data: Option<Vec<String>>,
}

impl Default for CreateTokenOptions {
    fn default() -> Self {
        Self {
            destination: None,
            create_mint_authority: true,
            create_melt_authority: true,
            authority_address: None,
            allow_external_authority_address: false,
            change_address: None,
            nft_data: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MintOptions {
    pub destination: Option<String>,
    pub create_another_mint: bool,
    pub authority_address: Option<String>,
    pub allow_external_authority_address: bool,
    pub change_address: Option<String>,
}

impl Default for MintOptions {
    fn default() -> Self {
        Self {
            destination: None,
            create_another_mint: true,
            authority_address: None,
            allow_external_authority_address: false,
            change_address: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MeltOptions {
    /// Where the returned native deposit goes; own next address when
    /// `None`.
    pub deposit_address: Option<String>,
    pub create_another_melt: bool,
    pub authority_address: Option<String>,
    pub allow_external_authority_address: bool,
    pub change_address: Option<String>,
}

impl Default for MeltOptions {
    fn default() -> Self {
        Self {
            deposit_address: None,
            create_another_melt: true,
            authority_address: None,
            allow_external_authority_address: false,
            change_address: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConsolidateFilter {
    pub token: TokenUid,
    /// Only consolidate utxos paying this address.
    pub address: Option<String>,
    pub min_value: Option<TokenAmount>,
    pub max_value: Option<TokenAmount>,
}

impl ConsolidateFilter {
    pub fn for_token(token: TokenUid) -> Self {
        Self {
            token,
            ..Default::default()
        }
    }
}

/// Builds unsigned transactions against one wallet's storage and the
/// node-reported parameters.
pub struct TxBuilder<'a> {
    storage: &'a Storage,
    params: &'a NodeVersion,
    network: Network,
}

impl<'a> TxBuilder<'a> {
    pub fn new(
        storage: &'a Storage,
        params: &'a NodeVersion,
        network: Network,
    ) -> Self {
        Self {
            storage,
            params,
            network,
        }
    }

    // --- send --- //

    pub async fn send(
        &self,
        outputs: Vec<SendOutput>,
        options: SendOptions,
    ) -> WalletResult<Transaction> {
        if outputs.is_empty() {
            return Err(WalletError::InvalidTransaction(
                "a send needs at least one output".to_owned(),
            ));
        }

        // Token table order: first appearance across the user's outputs.
        let mut tokens: Vec<TokenUid> = Vec::new();
        let mut required: BTreeMap<TokenUid, TokenAmount> = BTreeMap::new();
        for output in &outputs {
            let (token, value) = match output {
                SendOutput::Token { token, value, .. } =>
                    (token.clone(), *value),
                SendOutput::Data { .. } =>
                    (TokenUid::Native, TokenAmount::ONE),
            };
            if !token.is_native() && !tokens.contains(&token) {
                tokens.push(token.clone());
            }
            let entry = required.entry(token).or_insert(TokenAmount::ZERO);
            *entry = entry.saturating_add(value);
        }

        let mut tx = Transaction::new(TxVersion::Transaction);
        tx.tokens = tokens;

        for output in &outputs {
            match output {
                SendOutput::Token {
                    address,
                    value,
                    token,
                    timelock,
                } => {
                    let script = self.script_for(address, *timelock)?;
                    tx.outputs.push(TxOutput {
                        value: *value,
                        token_data: self.token_index(&tx.tokens, token)?,
                        script,
                    });
                }
                SendOutput::Data { data } => {
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
            }
        }

        // Fill inputs and compute per-token change.
        let mut changes: Vec<(TokenUid, TokenAmount)> = Vec::new();
        match options.inputs {
            Some(chosen) => {
                let utxos = self.resolve_chosen_inputs(&chosen).await?;
                let mut provided: BTreeMap<TokenUid, TokenAmount> =
                    BTreeMap::new();
                for utxo in &utxos {
                    let entry = provided
                        .entry(utxo.token.clone())
                        .or_insert(TokenAmount::ZERO);
                    *entry = entry.saturating_add(utxo.value);
                    tx.inputs.push(TxInput::new(utxo.tx_id, utxo.index));
                    self.reserve(utxo);
                }
                for (token, needed) in &required {
                    let have = provided
                        .get(token)
                        .copied()
                        .unwrap_or(TokenAmount::ZERO);
                    let change = have.checked_sub(*needed).ok_or_else(
                        || WalletError::InsufficientFunds {
                            token: token.clone(),
                            required: *needed,
                            available: have,
                        },
                    )?;
                    if !change.is_zero() {
                        changes.push((token.clone(), change));
                    }
                }
            }
            None => {
                for (token, needed) in &required {
                    let selection = select_for_amount(
                        self.storage,
                        token,
                        *needed,
                        None,
                        self.params.max_number_inputs,
                    )
                    .await?;
                    self.push_selection(&mut tx, &selection);
                    if !selection.change.is_zero() {
                        changes.push((token.clone(), selection.change));
                    }
                }
            }
        }

        // Change outputs after the user's, native first then table order.
        changes.sort_by_key(|(token, _)| {
            self.token_index(&tx.tokens, token).unwrap_or(u8::MAX)
        });
        let change_address = match options.change_address {
            Some(address) => {
                self.require_mine(&address).await?;
                address
            }
            None => self.fresh_change_address().await?,
        };
        for (token, change) in changes {
            let script = self.script_for(&change_address, None)?;
            tx.outputs.push(TxOutput {
                value: change,
                token_data: self.token_index(&tx.tokens, &token)?,
                script,
            });
        }

        self.finalize(tx)
    }

    // --- token lifecycle --- //

    pub async fn create_token(
        &self,
        name: &str,
        symbol: &str,
        amount: TokenAmount,
        options: CreateTokenOptions,
    ) -> WalletResult<Transaction> {
        if name.is_empty() || symbol.is_empty() {
            return Err(WalletError::InvalidTransaction(
                "token name and symbol must be non-empty".to_owned(),
            ));
        }

        let is_nft = options.nft_data.is_some();
        let native_needed = if is_nft {
            let n_data =
                options.nft_data.as_ref().map(Vec::len).unwrap_or(0) as u64;
            TokenAmount::from_u64(NFT_DEPOSIT.max(n_data))
        } else {
            deposit_for(amount, self.params.token_deposit_percentage)
        };

        let mut tx = Transaction::new(TxVersion::CreateToken);
        tx.token_info = Some(TokenCreationInfo {
            name: name.to_owned(),
            symbol: symbol.to_owned(),
        });

        // NFT data outputs come first, burning one base unit each.
        if let Some(nft_data) = &options.nft_data {
            for data in nft_data {
                tx.outputs.push(TxOutput {
                    value: TokenAmount::ONE,
                    token_data: 0,
                    script: script::data_script(data.as_bytes()).map_err(
                        |e| WalletError::InvalidTransaction(e.to_string()),
                    )?,
                });
            }
        }

        let selection = select_for_amount(
            self.storage,
            &TokenUid::Native,
            native_needed,
            None,
            self.params.max_number_inputs,
        )
        .await?;
        self.push_selection(&mut tx, &selection);

        // The created token sits at table index 1 (table itself is empty).
        let destination = match options.destination {
            Some(address) => address,
            None => self.fresh_change_address().await?,
        };
        tx.outputs.push(TxOutput {
            value: amount,
            token_data: 1,
            script: self.script_for(&destination, None)?,
        });

        let authority_address = self
            .authority_destination(
                options.authority_address.as_deref(),
                options.allow_external_authority_address,
            )
            .await?;
        if options.create_mint_authority {
            tx.outputs.push(self.authority_output(
                &authority_address,
                1,
                AuthorityKind::Mint,
            )?);
        }
        if options.create_melt_authority {
            tx.outputs.push(self.authority_output(
                &authority_address,
                1,
                AuthorityKind::Melt,
            )?);
        }

        self.push_native_change(
            &mut tx,
            selection.change,
            options.change_address,
        )
        .await?;
        self.finalize(tx)
    }

    pub async fn mint(
        &self,
        token: &TokenUid,
        amount: TokenAmount,
        options: MintOptions,
    ) -> WalletResult<Transaction> {
        let authority =
            self.take_authority(token, AuthorityKind::Mint, 1).await?;

        let deposit =
            deposit_for(amount, self.params.token_deposit_percentage);
        let selection = select_for_amount(
            self.storage,
            &TokenUid::Native,
            deposit,
            None,
            self.params.max_number_inputs,
        )
        .await?;

        let mut tx = Transaction::new(TxVersion::Transaction);
        tx.tokens = vec![token.clone()];
        for utxo in &authority {
            tx.inputs.push(TxInput::new(utxo.tx_id, utxo.index));
            self.reserve(utxo);
        }
        self.push_selection(&mut tx, &selection);

        let destination = match options.destination {
            Some(address) => address,
            None => self.fresh_change_address().await?,
        };
        tx.outputs.push(TxOutput {
            value: amount,
            token_data: 1,
            script: self.script_for(&destination, None)?,
        });

        if options.create_another_mint {
            let authority_address = self
                .authority_destination(
                    options.authority_address.as_deref(),
                    options.allow_external_authority_address,
                )
                .await?;
            tx.outputs.push(self.authority_output(
                &authority_address,
                1,
                AuthorityKind::Mint,
            )?);
        }

        self.push_native_change(
            &mut tx,
            selection.change,
            options.change_address,
        )
        .await?;
        self.finalize(tx)
    }

    pub async fn melt(
        &self,
        token: &TokenUid,
        amount: TokenAmount,
        options: MeltOptions,
    ) -> WalletResult<Transaction> {
        let authority =
            self.take_authority(token, AuthorityKind::Melt, 1).await?;

        let selection = select_for_amount(
            self.storage,
            token,
            amount,
            None,
            self.params.max_number_inputs,
        )
        .await?;

        let mut tx = Transaction::new(TxVersion::Transaction);
        tx.tokens = vec![token.clone()];
        for utxo in &authority {
            tx.inputs.push(TxInput::new(utxo.tx_id, utxo.index));
            self.reserve(utxo);
        }
        self.push_selection(&mut tx, &selection);

        // The melted amount's deposit comes back in native token.
        let withdraw =
            withdraw_for(amount, self.params.token_deposit_percentage);
        if !withdraw.is_zero() {
            let deposit_address = match options.deposit_address {
                Some(address) => address,
                None => self.fresh_change_address().await?,
            };
            tx.outputs.push(TxOutput {
                value: withdraw,
                token_data: 0,
                script: self.script_for(&deposit_address, None)?,
            });
        }

        // Token change: melted utxos rarely match the amount exactly.
        if !selection.change.is_zero() {
            let change_address = match options.change_address.clone() {
                Some(address) => {
                    self.require_mine(&address).await?;
                    address
                }
                None => self.fresh_change_address().await?,
            };
            tx.outputs.push(TxOutput {
                value: selection.change,
                token_data: 1,
                script: self.script_for(&change_address, None)?,
            });
        }

        if options.create_another_melt {
            let authority_address = self
                .authority_destination(
                    options.authority_address.as_deref(),
                    options.allow_external_authority_address,
                )
                .await?;
            tx.outputs.push(self.authority_output(
                &authority_address,
                1,
                AuthorityKind::Melt,
            )?);
        }

        self.finalize(tx)
    }

    /// Transfer one authority utxo to `destination`, optionally keeping a
    /// second authority output for ourselves.
    pub async fn delegate_authority(
        &self,
        token: &TokenUid,
        kind: AuthorityKind,
        destination: &str,
        create_another: bool,
        allow_external: bool,
    ) -> WalletResult<Transaction> {
        let authority = self.take_authority(token, kind, 1).await?;
        if !allow_external {
            self.require_mine(destination).await?;
        }

        let mut tx = Transaction::new(TxVersion::Transaction);
        tx.tokens = vec![token.clone()];
        for utxo in &authority {
            tx.inputs.push(TxInput::new(utxo.tx_id, utxo.index));
            self.reserve(utxo);
        }

        tx.outputs
            .push(self.authority_output(destination, 1, kind)?);
        if create_another {
            let own = self.fresh_change_address().await?;
            tx.outputs.push(self.authority_output(&own, 1, kind)?);
        }

        self.finalize(tx)
    }

    /// Burn `count` authority utxos of the given kind. The transaction has
    /// inputs and no authority outputs, so the authority count drops.
    pub async fn destroy_authority(
        &self,
        token: &TokenUid,
        kind: AuthorityKind,
        count: usize,
    ) -> WalletResult<Transaction> {
        if count == 0 {
            return Err(WalletError::InvalidTransaction(
                "cannot destroy zero authorities".to_owned(),
            ));
        }
        let authority = self.take_authority(token, kind, count).await?;

        let mut tx = Transaction::new(TxVersion::Transaction);
        tx.tokens = vec![token.clone()];
        for utxo in &authority {
            tx.inputs.push(TxInput::new(utxo.tx_id, utxo.index));
            self.reserve(utxo);
        }
        self.finalize(tx)
    }

    /// Greedily collect utxos matching `filter` into a single output at
    /// `destination`, which must be a wallet address.
    pub async fn consolidate(
        &self,
        destination: &str,
        filter: ConsolidateFilter,
    ) -> WalletResult<Transaction> {
        if !self.storage.is_address_mine(destination).await? {
            return Err(WalletError::AddressNotMine(
                destination.to_owned(),
            ));
        }

        let mut utxo_filter = UtxoFilter::for_token(filter.token.clone())
            .value_descending()
            .max_count(self.params.max_number_inputs);
        utxo_filter.address = filter.address;
        utxo_filter.min_value = filter.min_value;
        utxo_filter.max_value = filter.max_value;

        let utxos = self.storage.select_utxos(&utxo_filter).await?;
        if utxos.is_empty() {
            return Err(WalletError::InsufficientFunds {
                token: filter.token,
                required: TokenAmount::ONE,
                available: TokenAmount::ZERO,
            });
        }

        let mut tx = Transaction::new(TxVersion::Transaction);
        if !filter.token.is_native() {
            tx.tokens = vec![filter.token.clone()];
        }
        let mut total = TokenAmount::ZERO;
        for utxo in &utxos {
            total = total.saturating_add(utxo.value);
            tx.inputs.push(TxInput::new(utxo.tx_id, utxo.index));
            self.reserve(utxo);
        }
        tx.outputs.push(TxOutput {
            value: total,
            token_data: self.token_index(&tx.tokens, &filter.token)?,
            script: self.script_for(destination, None)?,
        });

        self.finalize(tx)
    }

    // --- shared pieces --- //

    pub(crate) fn script_for(
        &self,
        address: &str,
        timelock: Option<u32>,
    ) -> WalletResult<Vec<u8>> {
        let decoded = Address::decode_for_network(address, self.network)
            .map_err(|_| {
                WalletError::InvalidAddress(address.to_owned())
            })?;
        Ok(decoded.to_script(timelock))
    }

    pub(crate) fn token_index(
        &self,
        tokens: &[TokenUid],
        token: &TokenUid,
    ) -> WalletResult<u8> {
        if token.is_native() {
            return Ok(0);
        }
        tokens
            .iter()
            .position(|t| t == token)
            .map(|position| (position + 1) as u8)
            .ok_or_else(|| {
                WalletError::InvalidTransaction(format!(
                    "token {token} is not in the token table"
                ))
            })
    }

    pub(crate) fn authority_output(
        &self,
        address: &str,
        token_index: u8,
        kind: AuthorityKind,
    ) -> WalletResult<TxOutput> {
        Ok(TxOutput {
            value: TokenAmount::from_u64(kind.bits() as u64),
            token_data: token_index | TOKEN_AUTHORITY_MASK,
            script: self.script_for(address, None)?,
        })
    }

    /// Resolve an authority-output destination, enforcing the ownership
    /// policy unless the caller opted out.
    async fn authority_destination(
        &self,
        requested: Option<&str>,
        allow_external: bool,
    ) -> WalletResult<String> {
        match requested {
            Some(address) => {
                if !allow_external {
                    self.require_mine(address).await?;
                }
                Ok(address.to_owned())
            }
            None => self.fresh_change_address().await,
        }
    }

    pub(crate) async fn require_mine(&self, address: &str) -> WalletResult<()> {
        if !self.storage.is_address_mine(address).await? {
            return Err(WalletError::AddressNotMine(address.to_owned()));
        }
        Ok(())
    }

    /// The first unused wallet address, falling back to the highest
    /// derived one.
    pub(crate) async fn fresh_change_address(&self) -> WalletResult<String> {
        let addresses = self.storage.backend().iter_addresses().await?;
        let fresh = addresses
            .iter()
            .find(|address| !address.used)
            .or_else(|| addresses.last())
            .ok_or(WalletError::NotInitialized)?;
        Ok(fresh.encoded.clone())
    }

    pub(crate) async fn take_authority(
        &self,
        token: &TokenUid,
        kind: AuthorityKind,
        count: usize,
    ) -> WalletResult<Vec<Utxo>> {
        let filter = UtxoFilter::for_token(token.clone())
            .authorities(kind.bits())
            .max_count(count);
        let utxos = self.storage.select_utxos(&filter).await?;
        if utxos.len() < count {
            return Err(WalletError::NoAuthorityAvailable {
                token: token.clone(),
                kind,
            });
        }
        Ok(utxos)
    }

    pub(crate) fn push_selection(&self, tx: &mut Transaction, selection: &Selection) {
        for utxo in &selection.utxos {
            tx.inputs.push(TxInput::new(utxo.tx_id, utxo.index));
            self.reserve(utxo);
        }
    }

    async fn push_native_change(
        &self,
        tx: &mut Transaction,
        change: TokenAmount,
        change_address: Option<String>,
    ) -> WalletResult<()> {
        if change.is_zero() {
            return Ok(());
        }
        let address = match change_address {
            Some(address) => {
                self.require_mine(&address).await?;
                address
            }
            None => self.fresh_change_address().await?,
        };
        tx.outputs.push(TxOutput {
            value: change,
            token_data: 0,
            script: self.script_for(&address, None)?,
        });
        Ok(())
    }

    pub(crate) fn reserve(&self, utxo: &Utxo) {
        self.storage
            .mark_selected(utxo.key(), true, SELECTED_UTXO_TTL);
    }

    async fn resolve_chosen_inputs(
        &self,
        chosen: &[(TxId, u8)],
    ) -> WalletResult<Vec<Utxo>> {
        let mut utxos = Vec::with_capacity(chosen.len());
        for key in chosen {
            let utxo = self
                .storage
                .backend()
                .get_utxo(key)
                .await?
                .ok_or_else(|| {
                    WalletError::InvalidTransaction(format!(
                        "input {}:{} is not an available utxo",
                        key.0, key.1
                    ))
                })?;
            utxos.push(utxo);
        }
        Ok(utxos)
    }

    pub(crate) fn finalize(&self, mut tx: Transaction) -> WalletResult<Transaction> {
        if tx.inputs.len() > self.params.max_number_inputs {
            return Err(WalletError::InvalidTransaction(format!(
                "too many inputs: {} > {}",
                tx.inputs.len(),
                self.params.max_number_inputs
            )));
        }
        if tx.outputs.len() > self.params.max_number_outputs {
            return Err(WalletError::InvalidTransaction(format!(
                "too many outputs: {} > {}",
                tx.outputs.len(),
                self.params.max_number_outputs
            )));
        }
        tx.timestamp = unix_now();
        let size = ser::serialize_tx(&tx).len();
        tx.weight = self.calculate_weight(size);
        Ok(tx)
    }

    /// The minimum acceptable weight for a tx of `size` bytes under the
    /// node's parameters.
    fn calculate_weight(&self, size: usize) -> f64 {
        let size = size.max(1) as f64;
        let weight = self.params.min_tx_weight_coefficient * size.log2()
            + self.params.min_tx_weight_k / size;
        weight.max(self.params.min_tx_weight)
    }
}

/// `ceil(amount × percentage)` in exact fixed-point arithmetic.
pub fn deposit_for(amount: TokenAmount, percentage: f64) -> TokenAmount {
    scaled_mul(amount, percentage, true)
}

/// `floor(amount × percentage)`: what a melt returns.
pub fn withdraw_for(amount: TokenAmount, percentage: f64) -> TokenAmount {
    scaled_mul(amount, percentage, false)
}

fn scaled_mul(
    amount: TokenAmount,
    percentage: f64,
    round_up: bool,
) -> TokenAmount {
    const SCALE: i128 = 1_000_000_000;
    let parts_per_billion = (percentage * SCALE as f64).round() as i128;
    let product = amount
        .to_i128()
        .checked_mul(parts_per_billion)
        .unwrap_or(i128::MAX);
    let scaled = if round_up {
        (product + SCALE - 1) / SCALE
    } else {
        product / SCALE
    };
    TokenAmount::try_from_i128(scaled).unwrap_or(TokenAmount::ZERO)
}

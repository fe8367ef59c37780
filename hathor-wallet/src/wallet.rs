//! The wallet facade: lifecycle state machine, event emission, the public
//! API, and the coordination of storage, sync, builder, and signer.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock},
    time::Duration,
};

use hathor_common::{
    access::{AccessData, MultisigConfig},
    address::WalletAddress,
    amount::TokenAmount,
    api::{JobStatus, NodeVersion, TokenDetails, TxWithMeta},
    constants::{
        DOWNLOAD_METADATA_RETRY_INTERVAL, METADATA_RETRY_LIMIT,
    },
    entropy::OsEntropy,
    network::Network,
    task::WalletTask,
    token::{TokenBalance, TokenUid},
    tx::{HistoryTx, NanoHeader, Transaction, TxId, TxVersion},
};
use secrecy::Zeroize;
use tracing::{error, info, instrument, warn};

use crate::{
    builder::{
        AuthorityKind, ConsolidateFilter, CreateTokenOptions, MeltOptions,
        MintOptions, SendOptions, SendOutput, TxBuilder,
    },
    error::{WalletError, WalletResult},
    events::{EventsBus, EventsRx, WalletEvent, WalletState},
    scan::ScanPolicy,
    signer::{ExternalSigner, Signer},
    stop::StopToken,
    storage::{Storage, StorageBackend},
    sync::{
        ingest_and_emit, negotiate_mode, on_sync_lane, HistorySync,
        HistorySyncMode,
    },
    template::{TemplateInterpreter, TxTemplate},
    transport::{
        resolve_tx_response, ConnState, ConnectionEvent, MiningTransport,
        NodeTransport,
    },
};

/// Everything a wallet needs to start. Exactly one of `seed`, `xpriv`,
/// `xpub` must be set (unless the storage already carries access data from
/// a previous session).
pub struct WalletConfig {
    pub connection: Arc<dyn NodeTransport>,
    pub mining: Option<Arc<dyn MiningTransport>>,
    /// Defaults to the in-memory backend.
    pub storage: Option<Arc<dyn StorageBackend>>,
    pub network: Network,

    pub seed: Option<String>,
    pub xpriv: Option<String>,
    pub xpub: Option<String>,
    pub passphrase: Option<String>,
    pub password: Option<String>,
    pub pin_code: Option<String>,

    /// The token this wallet's history queries are scoped to.
    pub token_uid: Option<TokenUid>,
    /// Skip derivation for these known-good addresses (index order).
    pub precalculated_addresses: Option<Vec<String>>,
    pub multisig: Option<MultisigConfig>,
    pub scan_policy: Option<ScanPolicy>,
    pub history_sync_mode: HistorySyncMode,
    /// Invoked before a reconnection reload drops the derived history.
    pub before_reload: Option<Arc<dyn Fn() + Send + Sync>>,
    pub debug: bool,
}

impl WalletConfig {
    pub fn new(connection: Arc<dyn NodeTransport>, network: Network) -> Self {
        Self {
            connection,
            mining: None,
            storage: None,
            network,
            seed: None,
            xpriv: None,
            xpub: None,
            passphrase: None,
            password: None,
            pin_code: None,
            token_uid: Some(TokenUid::Native),
            precalculated_addresses: None,
            multisig: None,
            scan_policy: None,
            history_sync_mode: HistorySyncMode::PollHttp,
            before_reload: None,
            debug: false,
        }
    }
}

/// Plaintext credentials held only between construction and `start()`.
struct Credentials {
    seed: Option<String>,
    xpriv: Option<String>,
    xpub: Option<String>,
    passphrase: String,
    password: String,
    pin_code: String,
    multisig: Option<MultisigConfig>,
}

impl Drop for Credentials {
    fn drop(&mut self) {
        for secret in [&mut self.seed, &mut self.xpriv] {
            if let Some(s) = secret.as_mut() {
                s.zeroize();
            }
        }
        self.passphrase.zeroize();
        self.password.zeroize();
        self.pin_code.zeroize();
    }
}

struct WalletInner {
    network: Network,
    token_uid: Option<TokenUid>,
    sync_mode: HistorySyncMode,
    transport: Arc<dyn NodeTransport>,
    mining: Option<Arc<dyn MiningTransport>>,
    storage: Storage,
    access: StdRwLock<Option<AccessData>>,
    state: StdRwLock<WalletState>,
    events: EventsBus,
    params: StdRwLock<NodeVersion>,
    stop: StopToken,
    external_signer: StdRwLock<Option<Arc<dyn ExternalSigner>>>,
    credentials: StdMutex<Option<Credentials>>,
    scan_policy: Option<ScanPolicy>,
    precalculated_addresses: Option<Vec<String>>,
    before_reload: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// The public wallet handle. Cloneable; all clones share one engine.
#[derive(Clone)]
pub struct HathorWallet {
    inner: Arc<WalletInner>,
}

impl HathorWallet {
    pub fn new(config: WalletConfig) -> Self {
        let backend: Arc<dyn StorageBackend> = match config.storage {
            Some(backend) => backend,
            None => Arc::new(crate::storage::MemoryBackend::new()),
        };
        let storage = Storage::new(backend);
        let credentials = Credentials {
            seed: config.seed,
            xpriv: config.xpriv,
            xpub: config.xpub,
            passphrase: config.passphrase.unwrap_or_default(),
            password: config.password.unwrap_or_default(),
            pin_code: config.pin_code.unwrap_or_default(),
            multisig: config.multisig,
        };
        Self {
            inner: Arc::new(WalletInner {
                network: config.network,
                token_uid: config.token_uid,
                sync_mode: config.history_sync_mode,
                transport: config.connection,
                mining: config.mining,
                storage,
                access: StdRwLock::new(None),
                state: StdRwLock::new(WalletState::Closed),
                events: EventsBus::new(),
                params: StdRwLock::new(NodeVersion::default()),
                stop: StopToken::new(),
                external_signer: StdRwLock::new(None),
                credentials: StdMutex::new(Some(credentials)),
                scan_policy: config.scan_policy,
                precalculated_addresses: config.precalculated_addresses,
                before_reload: config.before_reload,
            }),
        }
    }

    // --- Lifecycle --- //

    /// Validate inputs, initialize key material, and begin connecting.
    /// Returns once the wallet is `Connecting`; progress to `Ready` is
    /// driven by connection events.
    #[instrument(skip_all, name = "(wallet-start)")]
    pub async fn start(&self) -> WalletResult<WalletTask<()>> {
        self.inner.stop.check()?;
        if self.state() != WalletState::Closed {
            return Err(WalletError::InvalidConfig(
                "wallet is already started".to_owned(),
            ));
        }

        let credentials = self
            .inner
            .credentials
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| {
                WalletError::InvalidConfig(
                    "wallet was already started once".to_owned(),
                )
            })?;
        self.init_access(credentials).await?;
        self.init_storage().await?;

        self.set_state(WalletState::Connecting);
        info!("wallet starting");

        let events_rx = self.inner.transport.events();
        let inner = self.inner.clone();
        Ok(WalletTask::spawn("wallet event loop", async move {
            event_loop(inner, events_rx).await;
        }))
    }

    /// Stop the wallet. Pending sync work observes the signal at its next
    /// suspension point; further API calls fail with `Stopped`. A stopped
    /// instance stays stopped: to go again, build a new [`HathorWallet`]
    /// over the same storage backend (access data and history are reused).
    pub async fn stop(&self, clean_storage: bool) -> WalletResult<()> {
        info!(clean_storage, "wallet stopping");
        self.inner.stop.stop();
        self.set_state(WalletState::Closed);
        if clean_storage {
            self.inner.storage.backend().clean(true, true).await?;
            self.inner.storage.backend().remove_access().await?;
        }
        Ok(())
    }

    pub fn state(&self) -> WalletState {
        *self.inner.state.read().unwrap()
    }

    pub fn events(&self) -> EventsRx {
        self.inner.events.subscribe()
    }

    pub fn set_external_signer(&self, signer: Arc<dyn ExternalSigner>) {
        *self.inner.external_signer.write().unwrap() = Some(signer);
    }

    // --- Address queries --- //

    pub async fn get_all_addresses(
        &self,
    ) -> WalletResult<Vec<WalletAddress>> {
        self.ensure_started()?;
        Ok(self.inner.storage.backend().iter_addresses().await?)
    }

    pub async fn get_address_at_index(
        &self,
        index: u32,
    ) -> WalletResult<Option<WalletAddress>> {
        self.ensure_started()?;
        Ok(self.inner.storage.backend().get_address_at(index).await?)
    }

    /// The first unused address, for receiving.
    pub async fn get_current_address(&self) -> WalletResult<WalletAddress> {
        self.ensure_started()?;
        let addresses = self.inner.storage.backend().iter_addresses().await?;
        addresses
            .iter()
            .find(|address| !address.used)
            .or_else(|| addresses.last())
            .cloned()
            .ok_or(WalletError::NotInitialized)
    }

    pub async fn is_address_mine(
        &self,
        address: &str,
    ) -> WalletResult<bool> {
        self.ensure_started()?;
        Ok(self.inner.storage.is_address_mine(address).await?)
    }

    pub async fn check_addresses_mine(
        &self,
        addresses: &[String],
    ) -> WalletResult<BTreeMap<String, bool>> {
        self.ensure_started()?;
        let mut result = BTreeMap::new();
        for address in addresses {
            let mine = self.inner.storage.is_address_mine(address).await?;
            result.insert(address.clone(), mine);
        }
        Ok(result)
    }

    /// The addresses of a tx that belong to this wallet.
    pub async fn get_tx_addresses(
        &self,
        tx: &HistoryTx,
    ) -> WalletResult<Vec<String>> {
        self.ensure_started()?;
        let mut addresses = Vec::new();
        for output in &tx.outputs {
            if let Some(address) = &output.decoded_address {
                if self.inner.storage.is_address_mine(address).await?
                    && !addresses.contains(address)
                {
                    addresses.push(address.clone());
                }
            }
        }
        Ok(addresses)
    }

    // --- Balance & history queries --- //

    /// `token = None` is reserved for a future "all configured tokens"
    /// query and is deliberately unimplemented.
    pub async fn get_balance(
        &self,
        token: Option<&TokenUid>,
    ) -> WalletResult<TokenBalance> {
        self.ensure_started()?;
        let token = token.ok_or(WalletError::NotImplemented(
            "get_balance over the default token set",
        ))?;
        Ok(self.inner.storage.get_balance(token).await?)
    }

    /// History touching the configured wallet token, newest first.
    pub async fn get_tx_history(&self) -> WalletResult<Vec<HistoryTx>> {
        self.ensure_started()?;
        let token = self
            .inner
            .token_uid
            .as_ref()
            .ok_or(WalletError::TokenNotSet)?;
        Ok(self.inner.storage.token_history(token).await?)
    }

    pub async fn get_tx(
        &self,
        tx_id: &TxId,
    ) -> WalletResult<Option<HistoryTx>> {
        self.ensure_started()?;
        Ok(self.inner.storage.backend().get_tx(tx_id).await?)
    }

    /// Fetch a tx from the full node, surfacing the node's "not found"
    /// sentinel as [`WalletError::TxNotFound`].
    pub async fn get_full_tx(&self, tx_id: TxId) -> WalletResult<TxWithMeta> {
        self.ensure_started()?;
        let response = self.inner.transport.get_transaction(tx_id).await?;
        resolve_tx_response(tx_id, response)
    }

    pub async fn get_confirmation_data(
        &self,
        tx_id: TxId,
    ) -> WalletResult<serde_json::Value> {
        self.ensure_started()?;
        Ok(self.inner.transport.get_confirmation_data(tx_id).await?)
    }

    pub async fn get_graphviz_neighbors(
        &self,
        tx_id: TxId,
        kind: hathor_common::api::GraphvizNeighborKind,
        max_level: u8,
    ) -> WalletResult<String> {
        self.ensure_started()?;
        Ok(self
            .inner
            .transport
            .get_graphviz_neighbors(tx_id, kind, max_level)
            .await?)
    }

    /// This wallet's net effect per token in `tx`, with locked and
    /// unlocked amounts collapsed and authorities ignored. Kept
    /// backward-compatible; see [`get_tx_balance_full`].
    ///
    /// [`get_tx_balance_full`]: HathorWallet::get_tx_balance_full
    pub async fn get_tx_balance(
        &self,
        tx: &HistoryTx,
    ) -> WalletResult<BTreeMap<TokenUid, i128>> {
        let full = self.get_tx_balance_full(tx).await?;
        Ok(full
            .into_iter()
            .map(|(token, balance)| {
                (token, balance.unlocked + balance.locked)
            })
            .collect())
    }

    /// Like [`get_tx_balance`] but with lock partitions and authority
    /// deltas preserved.
    ///
    /// [`get_tx_balance`]: HathorWallet::get_tx_balance
    pub async fn get_tx_balance_full(
        &self,
        tx: &HistoryTx,
    ) -> WalletResult<BTreeMap<TokenUid, TxTokenDelta>> {
        self.ensure_started()?;
        let mut deltas: BTreeMap<TokenUid, TxTokenDelta> = BTreeMap::new();
        let now = crate::storage::unix_now();

        for output in &tx.outputs {
            let Some(address) = &output.decoded_address else { continue };
            if !self.inner.storage.is_address_mine(address).await? {
                continue;
            }
            let token = tx.token_for_output(output);
            let delta = deltas.entry(token).or_default();
            if output.is_authority() {
                if output.authority_bits()
                    & hathor_common::tx::AUTHORITY_MINT
                    != 0
                {
                    delta.mint_authorities += 1;
                }
                if output.authority_bits()
                    & hathor_common::tx::AUTHORITY_MELT
                    != 0
                {
                    delta.melt_authorities += 1;
                }
            } else if output.timelock.map_or(false, |lock| now < lock) {
                delta.locked += output.value.to_i128();
            } else {
                delta.unlocked += output.value.to_i128();
            }
        }

        for input in &tx.inputs {
            let Some(prior) =
                self.inner.storage.backend().get_tx(&input.tx_id).await?
            else {
                continue;
            };
            let Some(output) = prior.outputs.get(input.index as usize)
            else {
                continue;
            };
            let Some(address) = &output.decoded_address else { continue };
            if !self.inner.storage.is_address_mine(address).await? {
                continue;
            }
            let token = prior.token_for_output(output);
            let delta = deltas.entry(token).or_default();
            if output.is_authority() {
                if output.authority_bits()
                    & hathor_common::tx::AUTHORITY_MINT
                    != 0
                {
                    delta.mint_authorities -= 1;
                }
                if output.authority_bits()
                    & hathor_common::tx::AUTHORITY_MELT
                    != 0
                {
                    delta.melt_authorities -= 1;
                }
            } else {
                delta.unlocked -= output.value.to_i128();
            }
        }

        Ok(deltas)
    }

    // --- Token queries --- //

    /// Global token info from the node, with bounded fixed-interval
    /// retries on transient failures. A missing token is `Ok(None)`.
    pub async fn get_token_details(
        &self,
        uid: &TokenUid,
    ) -> WalletResult<Option<TokenDetails>> {
        self.ensure_started()?;
        let mut last_error = None;
        for attempt in 0..METADATA_RETRY_LIMIT {
            self.inner.stop.check()?;
            match self.inner.transport.get_token_details(uid).await {
                Ok(details) => return Ok(details),
                Err(err) if err.is_retryable() => {
                    warn!(
                        %uid,
                        attempt,
                        "token details fetch failed, retrying: {err}"
                    );
                    last_error = Some(err);
                    tokio::time::sleep(DOWNLOAD_METADATA_RETRY_INTERVAL)
                        .await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_error
            .map(WalletError::from)
            .expect("retry loop ran at least once"))
    }

    // --- Scan policy --- //

    pub async fn get_scan_policy(&self) -> WalletResult<ScanPolicy> {
        self.ensure_started()?;
        Ok(self
            .inner
            .storage
            .backend()
            .get_scan_policy()
            .await?
            .unwrap_or_default())
    }

    pub async fn set_gap_limit(&self, gap: u32) -> WalletResult<()> {
        self.ensure_started()?;
        match self.get_scan_policy().await? {
            ScanPolicy::GapLimit { .. } => {
                self.inner
                    .storage
                    .backend()
                    .set_scan_policy(&ScanPolicy::GapLimit { gap })
                    .await?;
                Ok(())
            }
            ScanPolicy::IndexLimit { .. } => Err(
                WalletError::PolicyMismatch(
                    "set_gap_limit on an index-limit wallet",
                ),
            ),
        }
    }

    /// Grow an index-limit window. Shrinking is disallowed.
    pub async fn set_index_limit_end(&self, end: u32) -> WalletResult<()> {
        self.ensure_started()?;
        match self.get_scan_policy().await? {
            ScanPolicy::IndexLimit { start, end: old_end } => {
                if end < old_end {
                    return Err(WalletError::InvalidConfig(
                        "an index-limit window cannot shrink".to_owned(),
                    ));
                }
                self.inner
                    .storage
                    .backend()
                    .set_scan_policy(&ScanPolicy::IndexLimit { start, end })
                    .await?;
                Ok(())
            }
            ScanPolicy::GapLimit { .. } => Err(WalletError::PolicyMismatch(
                "set_index_limit_end on a gap-limit wallet",
            )),
        }
    }

    // --- Building & signing --- //

    /// Build and sign a plain send.
    pub async fn send_transaction(
        &self,
        outputs: Vec<SendOutput>,
        options: SendOptions,
        pin: Option<&str>,
    ) -> WalletResult<Transaction> {
        self.ensure_started()?;
        let params = self.params();
        let builder = TxBuilder::new(
            &self.inner.storage,
            &params,
            self.inner.network,
        );
        let mut tx = builder.send(outputs, options).await?;
        self.sign_tx(&mut tx, pin).await?;
        Ok(tx)
    }

    pub async fn create_token(
        &self,
        name: &str,
        symbol: &str,
        amount: TokenAmount,
        options: CreateTokenOptions,
        pin: Option<&str>,
    ) -> WalletResult<Transaction> {
        self.ensure_started()?;
        let params = self.params();
        let builder = TxBuilder::new(
            &self.inner.storage,
            &params,
            self.inner.network,
        );
        let mut tx =
            builder.create_token(name, symbol, amount, options).await?;
        self.sign_tx(&mut tx, pin).await?;
        Ok(tx)
    }

    pub async fn mint_tokens(
        &self,
        token: &TokenUid,
        amount: TokenAmount,
        options: MintOptions,
        pin: Option<&str>,
    ) -> WalletResult<Transaction> {
        self.ensure_started()?;
        let params = self.params();
        let builder = TxBuilder::new(
            &self.inner.storage,
            &params,
            self.inner.network,
        );
        let mut tx = builder.mint(token, amount, options).await?;
        self.sign_tx(&mut tx, pin).await?;
        Ok(tx)
    }

    pub async fn melt_tokens(
        &self,
        token: &TokenUid,
        amount: TokenAmount,
        options: MeltOptions,
        pin: Option<&str>,
    ) -> WalletResult<Transaction> {
        self.ensure_started()?;
        let params = self.params();
        let builder = TxBuilder::new(
            &self.inner.storage,
            &params,
            self.inner.network,
        );
        let mut tx = builder.melt(token, amount, options).await?;
        self.sign_tx(&mut tx, pin).await?;
        Ok(tx)
    }

    pub async fn delegate_authority(
        &self,
        token: &TokenUid,
        kind: AuthorityKind,
        destination: &str,
        create_another: bool,
        allow_external: bool,
        pin: Option<&str>,
    ) -> WalletResult<Transaction> {
        self.ensure_started()?;
        let params = self.params();
        let builder = TxBuilder::new(
            &self.inner.storage,
            &params,
            self.inner.network,
        );
        let mut tx = builder
            .delegate_authority(
                token,
                kind,
                destination,
                create_another,
                allow_external,
            )
            .await?;
        self.sign_tx(&mut tx, pin).await?;
        Ok(tx)
    }

    pub async fn destroy_authority(
        &self,
        token: &TokenUid,
        kind: AuthorityKind,
        count: usize,
        pin: Option<&str>,
    ) -> WalletResult<Transaction> {
        self.ensure_started()?;
        let params = self.params();
        let builder = TxBuilder::new(
            &self.inner.storage,
            &params,
            self.inner.network,
        );
        let mut tx = builder.destroy_authority(token, kind, count).await?;
        self.sign_tx(&mut tx, pin).await?;
        Ok(tx)
    }

    pub async fn consolidate_utxos(
        &self,
        destination: &str,
        filter: ConsolidateFilter,
        pin: Option<&str>,
    ) -> WalletResult<Transaction> {
        self.ensure_started()?;
        let params = self.params();
        let builder = TxBuilder::new(
            &self.inner.storage,
            &params,
            self.inner.network,
        );
        let mut tx = builder.consolidate(destination, filter).await?;
        self.sign_tx(&mut tx, pin).await?;
        Ok(tx)
    }

    /// Build a contract-invocation transaction: a nano header carrying the
    /// method, its serialized arguments, and the caller's pubkey. The
    /// caller address's sequence counter is bumped for replay protection.
    /// Execution is the node's job; the wallet only builds and signs.
    pub async fn build_contract_invocation(
        &self,
        contract_id: TxId,
        method: &str,
        args: Vec<u8>,
        caller_index: u32,
    ) -> WalletResult<Transaction> {
        self.ensure_started()?;
        if method.is_empty() {
            return Err(WalletError::NanoContract(
                "contract method must be non-empty".to_owned(),
            ));
        }
        let access = self.access()?;
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let caller_pubkey = access.derive_pubkey(&secp, caller_index)?;

        let mut record = self
            .inner
            .storage
            .backend()
            .get_address_at(caller_index)
            .await?
            .ok_or_else(|| {
                WalletError::InvalidAddress(format!(
                    "no wallet address at index {caller_index}"
                ))
            })?;
        record.seqnum += 1;
        let seqnum = record.seqnum;
        self.inner.storage.backend().save_address(&record).await?;

        let params = self.params();
        let builder = TxBuilder::new(
            &self.inner.storage,
            &params,
            self.inner.network,
        );
        let mut tx = Transaction::new(TxVersion::Transaction);
        tx.nano_header = Some(NanoHeader {
            contract_id,
            seqnum,
            method: method.to_owned(),
            args,
            caller_pubkey: caller_pubkey.serialize().to_vec(),
        });
        builder.finalize(tx)
    }

    /// Validate a declarative template and lower it into a populated
    /// transaction, signing in place when a `pin` (or an external signer)
    /// is available.
    pub async fn build_from_template(
        &self,
        template: &TxTemplate,
        pin: Option<&str>,
    ) -> WalletResult<Transaction> {
        self.ensure_started()?;
        let params = self.params();
        let interpreter = TemplateInterpreter::new(
            &self.inner.storage,
            &params,
            self.inner.network,
        );
        let mut tx = interpreter.interpret(template).await?;
        let has_external =
            self.inner.external_signer.read().unwrap().is_some();
        if pin.is_some() || has_external {
            self.sign_tx(&mut tx, pin).await?;
        }
        Ok(tx)
    }

    /// Sign an externally built transaction in place, delegating to the
    /// installed external signer when one is present.
    pub async fn sign_transaction(
        &self,
        tx: &mut Transaction,
        pin: Option<&str>,
    ) -> WalletResult<()> {
        self.ensure_started()?;
        self.sign_tx(tx, pin).await
    }

    /// Submit a signed tx to the mining collaborator and return the job
    /// id. Requires a configured mining transport.
    pub async fn push_tx(&self, tx: &Transaction) -> WalletResult<String> {
        self.ensure_started()?;
        let mining = self.inner.mining.as_ref().ok_or(
            WalletError::InvalidConfig(
                "no mining transport configured".to_owned(),
            ),
        )?;
        Ok(mining.submit_job(&tx.to_hex(), true, true, None).await?)
    }

    /// Poll a mining job until it leaves the pending/mining states, with
    /// exponential backoff between checks.
    pub async fn wait_for_mining_job(
        &self,
        job_id: &str,
    ) -> WalletResult<JobStatus> {
        self.ensure_started()?;
        let mining = self.inner.mining.as_ref().ok_or(
            WalletError::InvalidConfig(
                "no mining transport configured".to_owned(),
            ),
        )?;
        let mut attempt = 0u32;
        loop {
            self.inner.stop.check()?;
            match mining.get_job_status(job_id).await? {
                JobStatus::Pending | JobStatus::Mining => {
                    tokio::time::sleep(mining_poll_delay(attempt)).await;
                    attempt += 1;
                }
                terminal => return Ok(terminal),
            }
        }
    }

    pub async fn cancel_mining_job(&self, job_id: &str) -> WalletResult<()> {
        self.ensure_started()?;
        let mining = self.inner.mining.as_ref().ok_or(
            WalletError::InvalidConfig(
                "no mining transport configured".to_owned(),
            ),
        )?;
        Ok(mining.cancel_job(job_id).await?)
    }

    /// Threshold step 1 over the wire format. See [`Signer`].
    pub async fn get_all_signatures(
        &self,
        tx_hex: &str,
        pin: &str,
    ) -> WalletResult<String> {
        self.ensure_started()?;
        let access = self.access()?;
        Signer::new(&self.inner.storage, &access)
            .get_all_signatures(tx_hex, pin)
            .await
    }

    /// Threshold step 2 over the wire format. See [`Signer`].
    pub async fn assemble_partial(
        &self,
        tx_hex: &str,
        blobs: &[String],
    ) -> WalletResult<Transaction> {
        self.ensure_started()?;
        let access = self.access()?;
        Signer::new(&self.inner.storage, &access)
            .assemble_partial(tx_hex, blobs)
            .await
    }

    // --- Key management --- //

    pub async fn change_pin(
        &self,
        old_pin: &str,
        new_pin: &str,
    ) -> WalletResult<()> {
        self.ensure_started()?;
        let mut access = self.access()?;
        let mut entropy = OsEntropy::new();
        access.change_pin(&mut entropy, old_pin, new_pin)?;
        self.inner.storage.backend().save_access(&access).await?;
        *self.inner.access.write().unwrap() = Some(access);
        Ok(())
    }

    pub async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> WalletResult<()> {
        self.ensure_started()?;
        let mut access = self.access()?;
        let mut entropy = OsEntropy::new();
        access.change_password(&mut entropy, old_password, new_password)?;
        self.inner.storage.backend().save_access(&access).await?;
        *self.inner.access.write().unwrap() = Some(access);
        Ok(())
    }

    pub fn is_readonly(&self) -> bool {
        let has_external =
            self.inner.external_signer.read().unwrap().is_some();
        if has_external {
            return false;
        }
        self.inner
            .access
            .read()
            .unwrap()
            .as_ref()
            .map_or(true, AccessData::is_readonly)
    }

    // --- Internals --- //

    async fn init_access(
        &self,
        credentials: Credentials,
    ) -> WalletResult<()> {
        // Reload case: access data persisted by a previous session wins.
        if let Some(access) =
            self.inner.storage.backend().load_access().await?
        {
            *self.inner.access.write().unwrap() = Some(access);
            return Ok(());
        }

        let supplied = [
            credentials.seed.is_some(),
            credentials.xpriv.is_some(),
            credentials.xpub.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        if supplied != 1 {
            return Err(WalletError::InvalidConfig(format!(
                "exactly one of seed, xpriv, xpub must be supplied \
                 (got {supplied})"
            )));
        }

        let mut entropy = OsEntropy::new();
        let multisig = credentials.multisig.clone();
        let access = if let Some(seed) = &credentials.seed {
            AccessData::from_seed(
                &mut entropy,
                seed,
                &credentials.passphrase,
                &credentials.pin_code,
                &credentials.password,
                self.inner.network,
                multisig.as_ref(),
            )?
        } else if let Some(xpriv) = &credentials.xpriv {
            AccessData::from_xpriv(
                &mut entropy,
                xpriv,
                &credentials.pin_code,
                self.inner.network,
                multisig.as_ref(),
            )?
        } else {
            let xpub = credentials.xpub.as_ref().expect("checked above");
            AccessData::from_xpub(
                &mut entropy,
                xpub,
                self.inner.network,
                multisig.as_ref(),
            )?
        };

        self.inner.storage.backend().save_access(&access).await?;
        *self.inner.access.write().unwrap() = Some(access);
        // `credentials` drops here, zeroizing the plaintext secrets.
        Ok(())
    }

    async fn init_storage(&self) -> WalletResult<()> {
        self.inner.storage.ensure_native_token().await?;
        if let Some(policy) = &self.inner.scan_policy {
            self.inner
                .storage
                .backend()
                .set_scan_policy(policy)
                .await?;
        }
        if let Some(precalculated) = &self.inner.precalculated_addresses {
            for (index, encoded) in precalculated.iter().enumerate() {
                let record = WalletAddress {
                    encoded: encoded.clone(),
                    index: index as u32,
                    num_transactions: 0,
                    used: false,
                    seqnum: 0,
                };
                self.inner.storage.backend().save_address(&record).await?;
            }
        }
        Ok(())
    }

    fn ensure_started(&self) -> WalletResult<()> {
        self.inner.stop.check()?;
        match self.state() {
            WalletState::Closed => Err(WalletError::NotInitialized),
            _ => Ok(()),
        }
    }

    fn access(&self) -> WalletResult<AccessData> {
        self.inner
            .access
            .read()
            .unwrap()
            .clone()
            .ok_or(WalletError::NotInitialized)
    }

    fn params(&self) -> NodeVersion {
        self.inner.params.read().unwrap().clone()
    }

    fn set_state(&self, state: WalletState) {
        set_state_inner(&self.inner, state);
    }

    async fn sign_tx(
        &self,
        tx: &mut Transaction,
        pin: Option<&str>,
    ) -> WalletResult<()> {
        let access = self.access()?;
        let external =
            self.inner.external_signer.read().unwrap().clone();
        let signer = Signer::new(&self.inner.storage, &access);
        match external {
            Some(external) =>
                signer.sign_with_external(tx, external.as_ref()).await,
            None => {
                if access.is_readonly() {
                    return Err(WalletError::ReadOnly);
                }
                let pin = pin.ok_or(WalletError::PinRequired)?;
                signer.sign_transaction(tx, pin).await
            }
        }
    }
}

/// A wallet's signed per-token delta for one transaction.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TxTokenDelta {
    pub unlocked: i128,
    pub locked: i128,
    pub mint_authorities: i64,
    pub melt_authorities: i64,
}

fn set_state_inner(inner: &Arc<WalletInner>, state: WalletState) {
    let changed = {
        let mut current = inner.state.write().unwrap();
        if *current == state {
            false
        } else {
            info!(from = ?*current, to = ?state, "wallet state");
            *current = state;
            true
        }
    };
    if changed {
        inner.events.notify(WalletEvent::StateChanged(state));
    }
}

/// The wallet's single event consumer: connection lifecycle, startup
/// sync, and the serialized incoming-tx queue.
async fn event_loop(
    inner: Arc<WalletInner>,
    mut events_rx: tokio::sync::broadcast::Receiver<ConnectionEvent>,
) {
    use tokio::sync::broadcast::error::RecvError;

    let mut pending: VecDeque<HistoryTx> = VecDeque::new();
    let mut synced = false;

    loop {
        let event = tokio::select! {
            () = inner.stop.stopped() => break,
            event = events_rx.recv() => event,
        };
        match event {
            Ok(ConnectionEvent::StateChanged(ConnState::Connected)) => {
                if synced {
                    // Reconnection: the node's view may have moved while we
                    // were away. Drop the derived history (addresses and
                    // the token registry survive) and resync.
                    if let Some(before_reload) = &inner.before_reload {
                        before_reload();
                    }
                    if let Err(err) =
                        inner.storage.backend().clean(false, false).await
                    {
                        error!("reload clean failed: {err:#}");
                        set_state_inner(&inner, WalletState::Error);
                        break;
                    }
                }
                synced = true;
                match startup(&inner, &mut events_rx, &mut pending).await {
                    Ok(()) => {}
                    Err(WalletError::Stopped) => break,
                    Err(err) => {
                        error!("wallet startup failed: {err}");
                        set_state_inner(&inner, WalletState::Error);
                        break;
                    }
                }
            }
            Ok(ConnectionEvent::StateChanged(ConnState::Disconnected)) => {
                set_state_inner(&inner, WalletState::Connecting);
            }
            Ok(ConnectionEvent::AddressHistory(tx)) => {
                pending.push_back(*tx);
                if *inner.state.read().unwrap() == WalletState::Ready {
                    set_state_inner(&inner, WalletState::Processing);
                    if let Err(err) =
                        drain_tx_queue(&inner, &mut pending).await
                    {
                        error!("tx queue processing failed: {err}");
                        set_state_inner(&inner, WalletState::Error);
                        break;
                    }
                    set_state_inner(&inner, WalletState::Ready);
                }
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "connection event stream lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
    info!("wallet event loop exiting");
}

/// Connected: negotiate, load history on the global lane, then drain the
/// push queue and go `Ready`.
async fn startup(
    inner: &Arc<WalletInner>,
    events_rx: &mut tokio::sync::broadcast::Receiver<ConnectionEvent>,
    pending: &mut VecDeque<HistoryTx>,
) -> WalletResult<()> {
    set_state_inner(inner, WalletState::Syncing);

    let access = inner
        .access
        .read()
        .unwrap()
        .clone()
        .ok_or(WalletError::NotInitialized)?;

    on_sync_lane(async {
        let version = inner.transport.get_version().await?;
        if !inner.network.matches_node_network(&version.network) {
            return Err(WalletError::Protocol(format!(
                "wallet is configured for {} but the node serves {}",
                inner.network, version.network
            )));
        }
        inner
            .storage
            .set_reward_spend_min_blocks(version.reward_spend_min_blocks);
        *inner.params.write().unwrap() = version;

        let mode = negotiate_mode(inner.sync_mode, inner.transport.as_ref());
        let sync = HistorySync {
            storage: &inner.storage,
            transport: inner.transport.as_ref(),
            access: &access,
            events: &inner.events,
            stop: &inner.stop,
        };
        sync.run(mode).await
    })
    .await?;

    set_state_inner(inner, WalletState::Processing);
    // Anything pushed while we were syncing is sitting in the broadcast
    // buffer; pull it into the queue, then drain in arrival order.
    loop {
        use tokio::sync::broadcast::error::TryRecvError;
        match events_rx.try_recv() {
            Ok(ConnectionEvent::AddressHistory(tx)) =>
                pending.push_back(*tx),
            Ok(_) => continue,
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    drain_tx_queue(inner, pending).await?;
    set_state_inner(inner, WalletState::Ready);
    info!("wallet ready");
    Ok(())
}

/// Process queued pushes in order, one at a time, yielding between
/// messages to keep the runtime responsive.
async fn drain_tx_queue(
    inner: &Arc<WalletInner>,
    pending: &mut VecDeque<HistoryTx>,
) -> WalletResult<()> {
    while let Some(tx) = pending.pop_front() {
        inner.stop.check()?;
        ingest_and_emit(&inner.storage, &inner.events, tx).await?;
        maybe_extend_addresses(inner).await?;
        tokio::task::yield_now().await;
    }
    Ok(())
}

/// After an ingestion the gap-limit window may have moved; load and
/// subscribe any newly required addresses.
async fn maybe_extend_addresses(
    inner: &Arc<WalletInner>,
) -> WalletResult<()> {
    let policy = inner
        .storage
        .backend()
        .get_scan_policy()
        .await?
        .unwrap_or_default();
    let (loaded, highest_used) = inner.storage.scan_state().await?;
    if policy.check_after_ingestion(loaded, highest_used).is_none() {
        return Ok(());
    }

    let access = inner
        .access
        .read()
        .unwrap()
        .clone()
        .ok_or(WalletError::NotInitialized)?;
    let sync = HistorySync {
        storage: &inner.storage,
        transport: inner.transport.as_ref(),
        access: &access,
        events: &inner.events,
        stop: &inner.stop,
    };
    let mode = negotiate_mode(inner.sync_mode, inner.transport.as_ref());
    on_sync_lane(sync.extend(mode)).await
}

/// Delay before mining-job poll `attempt` (0-based): doubles from 250ms up
/// to a 32 second ceiling.
fn mining_poll_delay(attempt: u32) -> Duration {
    const FLOOR_MS: u64 = 250;
    const CEILING_MS: u64 = 32_000;
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(FLOOR_MS.saturating_mul(factor).min(CEILING_MS))
}

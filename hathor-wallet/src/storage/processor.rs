//! Idempotent transaction ingestion and full-history recomputation.
//!
//! Every state update is keyed off the persisted state rather than the
//! incoming diff, so re-delivering the same message any number of times is
//! a no-op after the first. A voiding transition cascades, so it falls back
//! to a full replay of the non-voided history in `(timestamp, tx_id)`
//! order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use hathor_common::{
    token::{TokenInfo, TokenUid},
    tx::{HistoryTx, ProcessingStatus, TxId, TxVersion},
};
use tracing::{debug, info};

use crate::storage::{Storage, Utxo};

/// What [`Storage::process_new_tx`] did with a delivery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProcessOutcome {
    /// First observation: derived state was materialized.
    New,
    /// Metadata changed on a known tx.
    Updated,
    /// The delivery carried nothing new.
    Unchanged,
    /// A voiding transition triggered a full recomputation. `changed` lists
    /// the *other* txs whose effective voided state flipped.
    Reprocessed { changed: Vec<TxId> },
}

impl Storage {
    /// Ingest one observed transaction.
    pub async fn process_new_tx(
        &self,
        mut tx: HistoryTx,
    ) -> anyhow::Result<ProcessOutcome> {
        match self.backend().get_tx(&tx.tx_id).await? {
            None => {
                self.first_observation(tx).await?;
                Ok(ProcessOutcome::New)
            }
            Some(prev) if prev.is_voided != tx.is_voided => {
                info!(
                    tx_id = %tx.tx_id,
                    is_voided = tx.is_voided,
                    "voiding transition, recomputing history"
                );
                tx.processing_status = ProcessingStatus::Finished;
                self.backend().add_tx(&tx).await?;
                let mut changed = self.process_history().await?;
                changed.retain(|id| *id != tx.tx_id);
                Ok(ProcessOutcome::Reprocessed { changed })
            }
            Some(prev) => self.metadata_update(prev, tx).await,
        }
    }

    async fn first_observation(
        &self,
        mut tx: HistoryTx,
    ) -> anyhow::Result<()> {
        debug!(tx_id = %tx.tx_id, "first observation");
        tx.processing_status = ProcessingStatus::Processing;
        self.backend().add_tx(&tx).await?;

        if !tx.is_voided {
            if let (true, Some(height)) = (tx.is_block(), tx.height) {
                self.observe_height(height);
            }
            self.materialize(&tx).await?;
        }

        tx.processing_status = ProcessingStatus::Finished;
        self.backend().add_tx(&tx).await?;
        Ok(())
    }

    /// Create derived state for a non-voided tx seen for the first time.
    async fn materialize(&self, tx: &HistoryTx) -> anyhow::Result<()> {
        let mut touched_addresses = BTreeSet::new();
        let mut touched_tokens = BTreeSet::new();

        for (index, output) in tx.outputs.iter().enumerate() {
            touched_tokens.insert(tx.token_for_output(output));
            let Some(address) = &output.decoded_address else {
                continue;
            };
            if !self.is_address_mine(address).await? {
                continue;
            }
            touched_addresses.insert(address.clone());
            if output.spent_by.is_none() {
                self.backend()
                    .save_utxo(&Utxo {
                        tx_id: tx.tx_id,
                        index: index as u8,
                        token: tx.token_for_output(output),
                        address: address.clone(),
                        value: output.value,
                        authorities: output.authority_bits(),
                        timelock: output.timelock,
                        height: tx.is_block().then_some(tx.height).flatten(),
                    })
                    .await?;
            }
        }

        for input in &tx.inputs {
            let Some(mut prior) = self.backend().get_tx(&input.tx_id).await?
            else {
                continue;
            };
            let Some(output) =
                prior.outputs.get(input.index as usize).cloned()
            else {
                continue;
            };
            touched_tokens.insert(prior.token_for_output(&output));
            if let Some(address) = &output.decoded_address {
                if self.is_address_mine(address).await? {
                    touched_addresses.insert(address.clone());
                }
            }
            if output.spent_by != Some(tx.tx_id) {
                prior.outputs[input.index as usize].spent_by =
                    Some(tx.tx_id);
                self.backend().add_tx(&prior).await?;
            }
            self.backend()
                .remove_utxo(&(input.tx_id, input.index))
                .await?;
        }

        for encoded in &touched_addresses {
            if let Some(mut address) =
                self.backend().get_address(encoded).await?
            {
                address.num_transactions += 1;
                address.used = true;
                self.backend().save_address(&address).await?;
            }
        }

        for token in &touched_tokens {
            let mut info = match self.backend().get_token(token).await? {
                Some(info) => info,
                None => TokenInfo::unregistered(token.clone()),
            };
            self.adopt_token_creation(tx, token, &mut info);
            info.num_transactions += 1;
            self.backend().save_token(&info).await?;
        }

        self.refresh_token_balances(&touched_tokens).await?;
        Ok(())
    }

    /// Fill in name/symbol when `tx` is the create-token tx of `token`.
    fn adopt_token_creation(
        &self,
        tx: &HistoryTx,
        token: &TokenUid,
        info: &mut TokenInfo,
    ) {
        if tx.version == TxVersion::CreateToken
            && *token == TokenUid::Custom(tx.tx_id)
        {
            if let Some(name) = &tx.token_name {
                info.name = name.clone();
            }
            if let Some(symbol) = &tx.token_symbol {
                info.symbol = symbol.clone();
            }
        }
    }

    /// Reconcile a re-observation whose voided flag did not change.
    async fn metadata_update(
        &self,
        prev: HistoryTx,
        incoming: HistoryTx,
    ) -> anyhow::Result<ProcessOutcome> {
        let mut merged = prev;
        let mut changed = false;
        let mut tokens_to_refresh = BTreeSet::new();

        if merged.first_block != incoming.first_block {
            merged.first_block = incoming.first_block;
            changed = true;
        }
        if merged.height != incoming.height {
            merged.height = incoming.height;
            changed = true;
            if !merged.is_voided && merged.is_block() {
                if let Some(height) = merged.height {
                    self.observe_height(height);
                }
            }
        }

        // Adopt spent_by changes: someone else's spend of our outputs
        // landed (or was reorged away).
        let spent_diffs: Vec<(usize, Option<TxId>, Option<TxId>)> = merged
            .outputs
            .iter()
            .zip(&incoming.outputs)
            .enumerate()
            .filter(|(_, (ours, theirs))| ours.spent_by != theirs.spent_by)
            .map(|(index, (ours, theirs))| {
                (index, ours.spent_by, theirs.spent_by)
            })
            .collect();

        let mut spent_changes = Vec::with_capacity(spent_diffs.len());
        for (index, old_spent_by, new_spent_by) in spent_diffs {
            if new_spent_by.is_none() {
                // The local pointer is authoritative while the spender is a
                // live tx in our history; a delivery predating our own spend
                // must not clear it.
                if let Some(spender) = old_spent_by {
                    if let Some(spender_tx) =
                        self.backend().get_tx(&spender).await?
                    {
                        if !spender_tx.is_voided {
                            continue;
                        }
                    }
                }
            }
            spent_changes.push((index, new_spent_by));
        }

        for (index, new_spent_by) in spent_changes {
            let token = merged.token_for_output(&merged.outputs[index]);
            let address = merged.outputs[index].decoded_address.clone();
            let output = &mut merged.outputs[index];
            output.spent_by = new_spent_by;
            changed = true;

            let Some(address) = address else { continue };
            if !self.is_address_mine(&address).await? {
                continue;
            }
            tokens_to_refresh.insert(token.clone());
            let key = (merged.tx_id, index as u8);
            match new_spent_by {
                Some(_) => self.backend().remove_utxo(&key).await?,
                None if !merged.is_voided => {
                    let output = &merged.outputs[index];
                    self.backend()
                        .save_utxo(&Utxo {
                            tx_id: merged.tx_id,
                            index: index as u8,
                            token,
                            address,
                            value: output.value,
                            authorities: output.authority_bits(),
                            timelock: output.timelock,
                            height: merged
                                .is_block()
                                .then_some(merged.height)
                                .flatten(),
                        })
                        .await?;
                }
                None => {}
            }
        }

        if !changed {
            return Ok(ProcessOutcome::Unchanged);
        }

        merged.processing_status = ProcessingStatus::Finished;
        self.backend().add_tx(&merged).await?;
        self.refresh_token_balances(&tokens_to_refresh).await?;
        Ok(ProcessOutcome::Updated)
    }

    /// Discard all derived data and replay every non-voided transaction in
    /// `(timestamp, tx_id)` order. Voiding cascades: a tx spending an
    /// output of an effectively-voided in-history tx is itself voided, and
    /// the effective flag is written back. Returns the txs whose stored
    /// voided flag flipped.
    pub async fn process_history(&self) -> anyhow::Result<Vec<TxId>> {
        let history = self.backend().iter_history().await?;
        let original_voided: HashMap<TxId, bool> = history
            .iter()
            .map(|tx| (tx.tx_id, tx.is_voided))
            .collect();

        // Ascending replay order.
        let mut txs: BTreeMap<(u32, TxId), HistoryTx> = history
            .into_iter()
            .map(|mut tx| {
                for output in &mut tx.outputs {
                    output.spent_by = None;
                }
                tx.processing_status = ProcessingStatus::Processing;
                (tx.replay_key(), tx)
            })
            .collect();

        self.backend().clear_utxos().await?;

        // Pass 1: effective voidedness, cascading forward in replay order.
        let mut effective_voided: HashMap<TxId, bool> = HashMap::new();
        for tx in txs.values() {
            let mut is_void = tx.is_voided;
            if !is_void {
                is_void = tx.inputs.iter().any(|input| {
                    effective_voided.get(&input.tx_id) == Some(&true)
                });
            }
            effective_voided.insert(tx.tx_id, is_void);
        }
        for tx in txs.values_mut() {
            tx.is_voided = effective_voided[&tx.tx_id];
        }

        // Pass 2: spent_by pointers from non-voided spenders.
        let keys: Vec<(u32, TxId)> = txs.keys().copied().collect();
        let key_by_id: HashMap<TxId, (u32, TxId)> =
            keys.iter().map(|key| (key.1, *key)).collect();
        for key in &keys {
            let tx = txs[key].clone();
            if tx.is_voided {
                continue;
            }
            for input in &tx.inputs {
                let Some(prior_key) = key_by_id.get(&input.tx_id) else {
                    continue;
                };
                let prior = txs.get_mut(prior_key).unwrap();
                if let Some(output) =
                    prior.outputs.get_mut(input.index as usize)
                {
                    output.spent_by = Some(tx.tx_id);
                }
            }
        }

        // Pass 3: derived state from scratch.
        let mut address_counters: HashMap<String, u32> = HashMap::new();
        let mut token_counters: HashMap<TokenUid, u64> = HashMap::new();
        let mut token_creations: Vec<(TokenUid, String, String)> =
            Vec::new();
        let mut best_height: u64 = 0;

        for tx in txs.values() {
            if tx.is_voided {
                continue;
            }
            if let (true, Some(height)) = (tx.is_block(), tx.height) {
                best_height = best_height.max(height);
            }

            let mut touched_addresses = BTreeSet::new();
            for (index, output) in tx.outputs.iter().enumerate() {
                let token = tx.token_for_output(output);
                if tx.version == TxVersion::CreateToken
                    && token == TokenUid::Custom(tx.tx_id)
                {
                    token_creations.push((
                        token.clone(),
                        tx.token_name.clone().unwrap_or_default(),
                        tx.token_symbol.clone().unwrap_or_default(),
                    ));
                }

                let Some(address) = &output.decoded_address else {
                    continue;
                };
                if !self.is_address_mine(address).await? {
                    continue;
                }
                touched_addresses.insert(address.clone());
                if output.spent_by.is_none() {
                    self.backend()
                        .save_utxo(&Utxo {
                            tx_id: tx.tx_id,
                            index: index as u8,
                            token,
                            address: address.clone(),
                            value: output.value,
                            authorities: output.authority_bits(),
                            timelock: output.timelock,
                            height: tx
                                .is_block()
                                .then_some(tx.height)
                                .flatten(),
                        })
                        .await?;
                }
            }

            let mut touched_tokens = tx.touched_tokens();
            for input in &tx.inputs {
                let Some(prior_key) = key_by_id.get(&input.tx_id) else {
                    continue;
                };
                let prior = &txs[prior_key];
                let Some(output) = prior.outputs.get(input.index as usize)
                else {
                    continue;
                };
                touched_tokens.insert(prior.token_for_output(output));
                if let Some(address) = &output.decoded_address {
                    if self.is_address_mine(address).await? {
                        touched_addresses.insert(address.clone());
                    }
                }
            }

            for address in touched_addresses {
                *address_counters.entry(address).or_insert(0) += 1;
            }
            for token in touched_tokens {
                *token_counters.entry(token).or_insert(0) += 1;
            }
        }

        self.observe_height(best_height);

        // Write back txs with final status.
        for tx in txs.values_mut() {
            tx.processing_status = ProcessingStatus::Finished;
            self.backend().add_tx(tx).await?;
        }

        // Address counters.
        for mut address in self.backend().iter_addresses().await? {
            let count = address_counters
                .get(&address.encoded)
                .copied()
                .unwrap_or(0);
            if address.num_transactions != count
                || address.used != (count > 0)
            {
                address.num_transactions = count;
                address.used = count > 0;
                self.backend().save_address(&address).await?;
            }
        }

        // Token registry: counters, creations, balances.
        let mut all_tokens: BTreeSet<TokenUid> = self
            .backend()
            .iter_tokens()
            .await?
            .into_iter()
            .map(|info| info.uid)
            .collect();
        all_tokens.extend(token_counters.keys().cloned());

        for token in &all_tokens {
            let mut info = match self.backend().get_token(token).await? {
                Some(info) => info,
                None => TokenInfo::unregistered(token.clone()),
            };
            info.num_transactions =
                token_counters.get(token).copied().unwrap_or(0);
            if let Some((_, name, symbol)) = token_creations
                .iter()
                .find(|(uid, _, _)| uid == token)
            {
                info.name = name.clone();
                info.symbol = symbol.clone();
            }
            self.backend().save_token(&info).await?;
        }
        self.refresh_token_balances(&all_tokens).await?;

        Ok(original_voided
            .into_iter()
            .filter(|(id, was_voided)| {
                effective_voided.get(id) != Some(was_voided)
            })
            .map(|(id, _)| id)
            .collect())
    }

    /// Recompute and cache the balance of each listed token in its registry
    /// entry.
    pub(crate) async fn refresh_token_balances(
        &self,
        tokens: &BTreeSet<TokenUid>,
    ) -> anyhow::Result<()> {
        for token in tokens {
            let balance = self.get_balance(token).await?;
            let mut info = match self.backend().get_token(token).await? {
                Some(info) => info,
                None => TokenInfo::unregistered(token.clone()),
            };
            info.balance = balance;
            self.backend().save_token(&info).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use hathor_common::amount::TokenAmount;

    use super::*;
    use crate::testing::{storage_with_addresses, tx_id, HistoryTxBuilder};

    fn amount(value: u64) -> TokenAmount {
        TokenAmount::from_u64(value)
    }

    #[tokio::test]
    async fn receive_materializes_utxo_and_balance() {
        let storage = storage_with_addresses(&["addr-0", "addr-1"]).await;
        let tx = HistoryTxBuilder::new(1, 100)
            .output("addr-0", 1_000_000)
            .build();

        let outcome = storage.process_new_tx(tx).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::New);

        let balance = storage.get_balance(&TokenUid::Native).await.unwrap();
        assert_eq!(balance.tokens.unlocked, amount(1_000_000));
        assert_eq!(balance.tokens.locked, amount(0));

        let address =
            storage.backend().get_address("addr-0").await.unwrap().unwrap();
        assert_eq!(address.num_transactions, 1);
        assert!(address.used);

        // The cached registry balance agrees with the live one.
        let info = storage
            .backend()
            .get_token(&TokenUid::Native)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.balance.tokens.unlocked, amount(1_000_000));
        assert_eq!(info.num_transactions, 1);
    }

    #[tokio::test]
    async fn spend_consumes_utxo_and_sets_spent_by() {
        let storage = storage_with_addresses(&["addr-0", "addr-1"]).await;
        storage
            .process_new_tx(
                HistoryTxBuilder::new(1, 100)
                    .output("addr-0", 1_000_000)
                    .build(),
            )
            .await
            .unwrap();
        storage
            .process_new_tx(
                HistoryTxBuilder::new(2, 200)
                    .input(1, 0)
                    .output("addr-external", 400_000)
                    .output("addr-1", 600_000)
                    .build(),
            )
            .await
            .unwrap();

        let balance = storage.get_balance(&TokenUid::Native).await.unwrap();
        assert_eq!(balance.tokens.unlocked, amount(600_000));

        let funding =
            storage.backend().get_tx(&tx_id(1)).await.unwrap().unwrap();
        assert_eq!(funding.outputs[0].spent_by, Some(tx_id(2)));
        assert!(storage
            .backend()
            .get_utxo(&(tx_id(1), 0))
            .await
            .unwrap()
            .is_none());

        // The spend touches addr-0 (input) and addr-1 (change).
        for (encoded, expected) in [("addr-0", 2), ("addr-1", 1)] {
            let address = storage
                .backend()
                .get_address(encoded)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(address.num_transactions, expected, "{encoded}");
        }
    }

    #[tokio::test]
    async fn reingestion_is_a_noop() {
        let storage = storage_with_addresses(&["addr-0"]).await;
        let tx = HistoryTxBuilder::new(1, 100)
            .output("addr-0", 500)
            .build();

        storage.process_new_tx(tx.clone()).await.unwrap();
        let balance_before =
            storage.get_balance(&TokenUid::Native).await.unwrap();
        let address_before =
            storage.backend().get_address("addr-0").await.unwrap();

        for _ in 0..3 {
            let outcome = storage.process_new_tx(tx.clone()).await.unwrap();
            assert_eq!(outcome, ProcessOutcome::Unchanged);
        }

        assert_eq!(
            storage.get_balance(&TokenUid::Native).await.unwrap(),
            balance_before
        );
        assert_eq!(
            storage.backend().get_address("addr-0").await.unwrap(),
            address_before
        );
    }

    #[tokio::test]
    async fn reward_height_lock_then_unlock() {
        let storage = storage_with_addresses(&["addr-0"]).await;
        storage.set_reward_spend_min_blocks(10);

        storage
            .process_new_tx(
                HistoryTxBuilder::new(1, 100)
                    .block(100)
                    .output("addr-0", 6400)
                    .build(),
            )
            .await
            .unwrap();
        storage.observe_height(105);

        let balance = storage.get_balance(&TokenUid::Native).await.unwrap();
        assert_eq!(balance.tokens.unlocked, amount(0));
        assert_eq!(balance.tokens.locked, amount(6400));

        // A later block advances the height past the lock boundary.
        storage
            .process_new_tx(
                HistoryTxBuilder::new(2, 200).block(110).build(),
            )
            .await
            .unwrap();
        let balance = storage.get_balance(&TokenUid::Native).await.unwrap();
        assert_eq!(balance.tokens.unlocked, amount(6400));
        assert_eq!(balance.tokens.locked, amount(0));
    }

    #[tokio::test]
    async fn timelocked_output_is_locked() {
        let storage = storage_with_addresses(&["addr-0"]).await;
        let far_future = u32::MAX;
        storage
            .process_new_tx(
                HistoryTxBuilder::new(1, 100)
                    .timelocked_output("addr-0", 100, far_future)
                    .output("addr-0", 50)
                    .build(),
            )
            .await
            .unwrap();

        let balance = storage.get_balance(&TokenUid::Native).await.unwrap();
        assert_eq!(balance.tokens.locked, amount(100));
        assert_eq!(balance.tokens.unlocked, amount(50));
    }

    #[tokio::test]
    async fn void_cascade_scenario() {
        let storage = storage_with_addresses(&["addr-0", "addr-1"]).await;
        // A pays the wallet 10.
        let tx_a = HistoryTxBuilder::new(1, 100).output("addr-0", 10).build();
        // B spends A's output: 7 back to the wallet, 3 to a third party.
        let tx_b = HistoryTxBuilder::new(2, 200)
            .input(1, 0)
            .output("addr-1", 7)
            .output("addr-external", 3)
            .build();
        storage.process_new_tx(tx_a.clone()).await.unwrap();
        storage.process_new_tx(tx_b).await.unwrap();
        assert_eq!(
            storage
                .get_balance(&TokenUid::Native)
                .await
                .unwrap()
                .tokens
                .unlocked,
            amount(7)
        );

        // "A is voided" arrives.
        let voided_a = {
            let mut tx = tx_a;
            tx.is_voided = true;
            tx
        };
        let outcome = storage.process_new_tx(voided_a).await.unwrap();
        // B flipped too (it spends a voided tx).
        assert_eq!(
            outcome,
            ProcessOutcome::Reprocessed {
                changed: vec![tx_id(2)]
            }
        );

        let balance = storage.get_balance(&TokenUid::Native).await.unwrap();
        assert_eq!(balance.tokens.total(), amount(0));

        // A's output is no longer marked spent.
        let stored_a =
            storage.backend().get_tx(&tx_id(1)).await.unwrap().unwrap();
        assert_eq!(stored_a.outputs[0].spent_by, None);
        let stored_b =
            storage.backend().get_tx(&tx_id(2)).await.unwrap().unwrap();
        assert!(stored_b.is_voided);

        // Address counters dropped back to zero.
        for encoded in ["addr-0", "addr-1"] {
            let address = storage
                .backend()
                .get_address(encoded)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(address.num_transactions, 0, "{encoded}");
        }
    }

    #[tokio::test]
    async fn voiding_symmetry() {
        let storage = storage_with_addresses(&["addr-0"]).await;
        let tx = HistoryTxBuilder::new(1, 100).output("addr-0", 42).build();

        // voided=false then voided=true == never ingested (balances).
        storage.process_new_tx(tx.clone()).await.unwrap();
        let voided = {
            let mut t = tx.clone();
            t.is_voided = true;
            t
        };
        storage.process_new_tx(voided.clone()).await.unwrap();
        let balance = storage.get_balance(&TokenUid::Native).await.unwrap();
        assert_eq!(balance.tokens.total(), amount(0));
        assert!(storage
            .backend()
            .get_utxo(&(tx_id(1), 0))
            .await
            .unwrap()
            .is_none());

        // voided=true then voided=false == the non-voided state.
        storage.process_new_tx(tx.clone()).await.unwrap();
        let balance = storage.get_balance(&TokenUid::Native).await.unwrap();
        assert_eq!(balance.tokens.unlocked, amount(42));
    }

    #[tokio::test]
    async fn metadata_update_adopts_first_block() {
        let storage = storage_with_addresses(&["addr-0"]).await;
        let tx = HistoryTxBuilder::new(1, 100).output("addr-0", 5).build();
        storage.process_new_tx(tx.clone()).await.unwrap();

        let confirmed = {
            let mut t = tx;
            t.first_block = Some(tx_id(9));
            t
        };
        let outcome = storage.process_new_tx(confirmed).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Updated);
        let stored =
            storage.backend().get_tx(&tx_id(1)).await.unwrap().unwrap();
        assert_eq!(stored.first_block, Some(tx_id(9)));
    }

    #[tokio::test]
    async fn external_spend_lands_via_metadata_update() {
        let storage = storage_with_addresses(&["addr-0"]).await;
        let tx = HistoryTxBuilder::new(1, 100).output("addr-0", 5).build();
        storage.process_new_tx(tx.clone()).await.unwrap();

        // The node reports our output spent by a tx we don't track.
        let spent = {
            let mut t = tx;
            t.outputs[0].spent_by = Some(tx_id(7));
            t
        };
        let outcome = storage.process_new_tx(spent).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Updated);

        assert!(storage
            .backend()
            .get_utxo(&(tx_id(1), 0))
            .await
            .unwrap()
            .is_none());
        let balance = storage.get_balance(&TokenUid::Native).await.unwrap();
        assert_eq!(balance.tokens.total(), amount(0));
    }

    #[tokio::test]
    async fn stale_delivery_does_not_clear_spent_by() {
        let storage = storage_with_addresses(&["addr-0", "addr-1"]).await;
        let tx_a = HistoryTxBuilder::new(1, 100).output("addr-0", 10).build();
        storage.process_new_tx(tx_a.clone()).await.unwrap();
        storage
            .process_new_tx(
                HistoryTxBuilder::new(2, 200)
                    .input(1, 0)
                    .output("addr-1", 10)
                    .build(),
            )
            .await
            .unwrap();

        // Re-deliver the original snapshot of A (spent_by unset).
        let outcome = storage.process_new_tx(tx_a).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Unchanged);
        let stored_a =
            storage.backend().get_tx(&tx_id(1)).await.unwrap().unwrap();
        assert_eq!(stored_a.outputs[0].spent_by, Some(tx_id(2)));
        assert_eq!(
            storage
                .get_balance(&TokenUid::Native)
                .await
                .unwrap()
                .tokens
                .unlocked,
            amount(10)
        );
    }

    #[tokio::test]
    async fn create_token_registers_name_symbol_and_authorities() {
        let storage = storage_with_addresses(&["addr-0"]).await;
        let tx = HistoryTxBuilder::new(3, 100)
            .create_token("MyToken", "MTK")
            .token_output("addr-0", 100, 1)
            .mint_authority("addr-0", 1)
            .melt_authority("addr-0", 1)
            .build();
        storage.process_new_tx(tx).await.unwrap();

        let uid = TokenUid::Custom(tx_id(3));
        let info = storage.backend().get_token(&uid).await.unwrap().unwrap();
        assert_eq!(info.name, "MyToken");
        assert_eq!(info.symbol, "MTK");

        let balance = storage.get_balance(&uid).await.unwrap();
        assert_eq!(balance.tokens.unlocked, amount(100));
        assert_eq!(balance.authorities.mint.unlocked, amount(1));
        assert_eq!(balance.authorities.melt.unlocked, amount(1));
    }

    #[test]
    fn balance_consistency_over_random_histories() {
        use proptest::{collection::vec, prop_assert_eq, proptest};

        // Receives of arbitrary value, an arbitrary subset later voided:
        // the final unlocked balance is always the non-voided sum, and
        // re-delivering the whole sequence changes nothing.
        proptest!(|(
            receives in vec((1u64..1_000_000, proptest::bool::ANY), 1..12),
        )| {
            tokio_test::block_on(async {
                let storage = storage_with_addresses(&["addr-0"]).await;
                for (n, (value, _)) in receives.iter().enumerate() {
                    storage
                        .process_new_tx(
                            HistoryTxBuilder::new(n as u8 + 1, n as u32)
                                .output("addr-0", *value)
                                .build(),
                        )
                        .await
                        .unwrap();
                }
                for (n, (value, voided)) in receives.iter().enumerate() {
                    if !voided {
                        continue;
                    }
                    storage
                        .process_new_tx(
                            HistoryTxBuilder::new(n as u8 + 1, n as u32)
                                .output("addr-0", *value)
                                .voided()
                                .build(),
                        )
                        .await
                        .unwrap();
                }

                let expected: u64 = receives
                    .iter()
                    .filter(|(_, voided)| !voided)
                    .map(|(value, _)| *value)
                    .sum();
                let balance =
                    storage.get_balance(&TokenUid::Native).await.unwrap();
                prop_assert_eq!(
                    balance.tokens.unlocked,
                    amount(expected)
                );
                prop_assert_eq!(balance.tokens.locked, amount(0));

                // The cached registry balance agrees.
                let info = storage
                    .backend()
                    .get_token(&TokenUid::Native)
                    .await
                    .unwrap()
                    .unwrap();
                prop_assert_eq!(info.balance.tokens.unlocked, amount(expected));

                // Idempotence: the full sequence again is a no-op.
                for (n, (value, voided)) in receives.iter().enumerate() {
                    let mut builder =
                        HistoryTxBuilder::new(n as u8 + 1, n as u32)
                            .output("addr-0", *value);
                    if *voided {
                        builder = builder.voided();
                    }
                    storage.process_new_tx(builder.build()).await.unwrap();
                }
                let balance =
                    storage.get_balance(&TokenUid::Native).await.unwrap();
                prop_assert_eq!(
                    balance.tokens.unlocked,
                    amount(expected)
                );
                Ok(())
            })?;
        });
    }

    #[tokio::test]
    async fn process_history_equals_incremental_state() {
        let storage = storage_with_addresses(&["addr-0", "addr-1"]).await;
        storage
            .process_new_tx(
                HistoryTxBuilder::new(1, 100).output("addr-0", 100).build(),
            )
            .await
            .unwrap();
        storage
            .process_new_tx(
                HistoryTxBuilder::new(2, 200)
                    .input(1, 0)
                    .output("addr-1", 60)
                    .output("addr-external", 40)
                    .build(),
            )
            .await
            .unwrap();

        let balance_before =
            storage.get_balance(&TokenUid::Native).await.unwrap();
        let utxos_before = storage.backend().iter_utxos().await.unwrap();

        let changed = storage.process_history().await.unwrap();
        assert!(changed.is_empty());

        assert_eq!(
            storage.get_balance(&TokenUid::Native).await.unwrap(),
            balance_before
        );
        assert_eq!(
            storage.backend().iter_utxos().await.unwrap(),
            utxos_before
        );
    }
}

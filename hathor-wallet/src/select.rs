//! UTXO selection: greedy amount-filling over value-descending candidates.

use hathor_common::{amount::TokenAmount, token::TokenUid};

use crate::{
    error::{WalletError, WalletResult},
    storage::{Storage, Utxo, UtxoFilter},
};

/// The outcome of a selection: the inputs to spend and the change left
/// over after `amount` is covered.
#[derive(Clone, Debug)]
pub struct Selection {
    pub utxos: Vec<Utxo>,
    pub change: TokenAmount,
}

/// Select utxos worth at least `amount` of `token`.
///
/// Candidates are the available (unlocked, unreserved, non-authority)
/// utxos, optionally restricted to one address, taken in value-descending
/// order. The selection is a prefix of that order and stops as soon as the
/// amount is covered, bounded by `max_inputs`.
pub async fn select_for_amount(
    storage: &Storage,
    token: &TokenUid,
    amount: TokenAmount,
    address_filter: Option<&str>,
    max_inputs: usize,
) -> WalletResult<Selection> {
    if amount.is_zero() {
        return Ok(Selection {
            utxos: Vec::new(),
            change: TokenAmount::ZERO,
        });
    }

    let mut filter = UtxoFilter::for_token(token.clone()).value_descending();
    if let Some(address) = address_filter {
        filter = filter.address(address.to_owned());
    }
    let candidates = storage.select_utxos(&filter).await?;

    let mut selected = Vec::new();
    let mut total = TokenAmount::ZERO;
    for utxo in candidates.into_iter().take(max_inputs) {
        total = total.saturating_add(utxo.value);
        selected.push(utxo);
        if total >= amount {
            let change = total
                .checked_sub(amount)
                .expect("total >= amount");
            return Ok(Selection {
                utxos: selected,
                change,
            });
        }
    }

    Err(WalletError::InsufficientFunds {
        token: token.clone(),
        required: amount,
        available: total,
    })
}

#[cfg(test)]
mod test {
    use hathor_common::tx::AUTHORITY_MINT;

    use super::*;
    use crate::testing::{storage_with_addresses, tx_id, HistoryTxBuilder};

    async fn funded_storage(values: &[u64]) -> Storage {
        let storage = storage_with_addresses(&["addr-0"]).await;
        for (n, value) in values.iter().enumerate() {
            storage
                .process_new_tx(
                    HistoryTxBuilder::new(n as u8 + 1, 100 + n as u32)
                        .output("addr-0", *value)
                        .build(),
                )
                .await
                .unwrap();
        }
        storage
    }

    fn amount(value: u64) -> TokenAmount {
        TokenAmount::from_u64(value)
    }

    #[tokio::test]
    async fn selects_descending_prefix() {
        let storage = funded_storage(&[100, 500, 300]).await;
        let selection = select_for_amount(
            &storage,
            &TokenUid::Native,
            amount(600),
            None,
            255,
        )
        .await
        .unwrap();

        let values: Vec<u64> = selection
            .utxos
            .iter()
            .map(|u| u.value.to_i128() as u64)
            .collect();
        assert_eq!(values, vec![500, 300]);
        assert_eq!(selection.change, amount(200));
    }

    #[tokio::test]
    async fn stops_as_soon_as_covered() {
        let storage = funded_storage(&[500, 400, 300]).await;
        let selection = select_for_amount(
            &storage,
            &TokenUid::Native,
            amount(500),
            None,
            255,
        )
        .await
        .unwrap();
        assert_eq!(selection.utxos.len(), 1);
        assert_eq!(selection.change, amount(0));
    }

    #[tokio::test]
    async fn insufficient_funds_reports_available() {
        let storage = funded_storage(&[100, 50]).await;
        let err = select_for_amount(
            &storage,
            &TokenUid::Native,
            amount(1_000),
            None,
            255,
        )
        .await
        .unwrap_err();
        match err {
            WalletError::InsufficientFunds {
                required,
                available,
                ..
            } => {
                assert_eq!(required, amount(1_000));
                assert_eq!(available, amount(150));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn max_inputs_bounds_the_selection() {
        let storage = funded_storage(&[100, 100, 100]).await;
        let err = select_for_amount(
            &storage,
            &TokenUid::Native,
            amount(300),
            None,
            2,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn reserved_utxos_are_skipped() {
        let storage = funded_storage(&[100, 200]).await;
        // Reserve the 200-value utxo (tx 2).
        storage.mark_selected(
            (tx_id(2), 0),
            true,
            std::time::Duration::from_secs(60),
        );
        let selection = select_for_amount(
            &storage,
            &TokenUid::Native,
            amount(100),
            None,
            255,
        )
        .await
        .unwrap();
        assert_eq!(selection.utxos[0].key(), (tx_id(1), 0));
    }

    #[tokio::test]
    async fn authority_outputs_are_never_amount_candidates() {
        let storage = storage_with_addresses(&["addr-0"]).await;
        storage
            .process_new_tx(
                HistoryTxBuilder::new(1, 100)
                    .create_token("T", "T")
                    .token_output("addr-0", 50, 1)
                    .mint_authority("addr-0", 1)
                    .build(),
            )
            .await
            .unwrap();

        let uid = TokenUid::Custom(tx_id(1));
        let err = select_for_amount(&storage, &uid, amount(51), None, 255)
            .await
            .unwrap_err();
        match err {
            WalletError::InsufficientFunds { available, .. } => {
                // Only the 50 regular units count; the mint authority
                // (value bit AUTHORITY_MINT) is not spendable value.
                assert_eq!(available, amount(50));
                assert_ne!(available, amount(50 + AUTHORITY_MINT as u64));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

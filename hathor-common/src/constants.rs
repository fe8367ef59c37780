//! Wallet-wide defaults and limits.

use std::time::Duration;

/// Consecutive unused addresses to keep ahead of the highest used index.
pub const DEFAULT_GAP_LIMIT: u32 = 20;

/// Input / output count ceilings used until the node reports its own.
pub const DEFAULT_MAX_INPUTS: usize = 255;
pub const DEFAULT_MAX_OUTPUTS: usize = 255;

/// How long a utxo stays reserved after being picked for a transaction
/// under construction.
pub const SELECTED_UTXO_TTL: Duration = Duration::from_secs(60);

/// Retry budget for token-metadata fetches.
pub const METADATA_RETRY_LIMIT: usize = 5;
/// Spacing between token-metadata retries.
pub const DOWNLOAD_METADATA_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Deposit charged for an NFT creation, in native-token base units.
pub const NFT_DEPOSIT: u64 = 1;

/// Addresses per request when paging address history over HTTP.
pub const ADDRESS_HISTORY_BATCH_SIZE: usize = 20;

/// The transport capability required by the streaming sync modes.
pub const HISTORY_STREAMING_CAPABILITY: &str = "history-streaming";

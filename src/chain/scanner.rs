//! The chunked, resumable scanner over a token's Transfer log.
//!
//! A run resolves its end block once at start; blocks mined during the run
//! wait for the next one. Scanning proceeds in fixed-size chunks, and a
//! chunk's cursor position only becomes durable after its records are. A
//! crash between the two re-fetches a window the uniqueness constraint
//! absorbs.

use std::{collections::HashMap, sync::Arc};

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{
    decode::{TokenTransfer, decode_transfer},
    traits::{ChainDataSource, DataSourceError},
};
use crate::{
    config::StartPosition,
    models::{Cursor, Provider, Transaction, TransactionDefaults, TransactionType, units},
    persistence::{LedgerRepository, PersistenceError},
};

/// A parsed chain provider-account: `<chain>:<token_address>/<wallet_address>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainAccount {
    /// Chain identifier used to select the RPC endpoint set.
    pub chain_id: String,
    /// Token contract whose Transfer log is scanned.
    pub token: Address,
    /// Wallet whose activity is recorded.
    pub wallet: Address,
}

/// Errors that abort a whole scan run (chunk-level failures do not).
#[derive(Debug, Error)]
pub enum ScanError {
    /// The chain head could not be resolved, so the run never started.
    #[error("chain unavailable: {0}")]
    Rpc(#[from] DataSourceError),

    /// The ledger store rejected a write.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// What one scanner run accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Cursor position reached, if any chunk completed (or a prior cursor
    /// existed).
    pub last_block: Option<u64>,
    /// Newly persisted records (duplicates excluded).
    pub records_persisted: u64,
    /// Chunks abandoned and recorded as gaps.
    pub gaps_recorded: u64,
}

/// Generates the inclusive chunk ranges covering `[start, end]`:
/// strictly increasing, no gap, no overlap, the next chunk starting one
/// block after the previous one ends.
pub fn chunk_ranges(start: u64, end: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    assert!(chunk_size > 0, "chunk size must be positive");
    let mut ranges = Vec::new();
    let mut from = start;
    while from <= end {
        let to = from.saturating_add(chunk_size - 1).min(end);
        ranges.push((from, to));
        if to == u64::MAX {
            break;
        }
        from = to + 1;
    }
    ranges
}

/// The chunked log scanner for one chain pair.
pub struct LogScanner {
    data_source: Arc<dyn ChainDataSource>,
    repo: Arc<dyn LedgerRepository>,
    chunk_size: u64,
    cancellation_token: CancellationToken,
}

impl LogScanner {
    /// Creates a new scanner over the given data source and repository.
    pub fn new(
        data_source: Arc<dyn ChainDataSource>,
        repo: Arc<dyn LedgerRepository>,
        chunk_size: u64,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { data_source, repo, chunk_size: chunk_size.max(1), cancellation_token }
    }

    /// Runs one incremental scan for the pair.
    ///
    /// The starting block is the stored cursor plus one when present,
    /// otherwise `start` resolved against the head. A failed chunk is
    /// logged, recorded in the gap table and skipped; the cursor still
    /// advances as later chunks complete, because the gap marker keeps the
    /// unfetched range visible to operators.
    pub async fn run(
        &self,
        account: &ChainAccount,
        provider_account: &str,
        defaults: &TransactionDefaults,
        cursor: Option<&Cursor>,
        start: StartPosition,
        end_block: Option<u64>,
    ) -> Result<ScanOutcome, ScanError> {
        let head = match end_block {
            Some(block) => block,
            None => self.data_source.head_block().await?,
        };

        let resume_from = cursor.and_then(Cursor::as_block);
        let from_block = match resume_from {
            Some(last_synced) => last_synced + 1,
            None => start.resolve(head),
        };

        let mut outcome = ScanOutcome { last_block: resume_from, ..Default::default() };

        if from_block > head {
            tracing::info!(
                account = provider_account,
                from_block,
                head,
                "Already caught up; nothing to scan."
            );
            return Ok(outcome);
        }

        tracing::info!(
            account = provider_account,
            from_block,
            to_block = head,
            chunk_size = self.chunk_size,
            "Starting chain scan."
        );

        // Block timestamps repeat across transfers; cache them for the run.
        let mut timestamps: HashMap<u64, DateTime<Utc>> = HashMap::new();

        for (chunk_start, chunk_end) in chunk_ranges(from_block, head, self.chunk_size) {
            if self.cancellation_token.is_cancelled() {
                tracing::info!(account = provider_account, "Scan cancelled between chunks.");
                break;
            }

            let logs = match self
                .data_source
                .transfer_logs(account.token, chunk_start, chunk_end)
                .await
            {
                Ok(logs) => logs,
                Err(e) => {
                    tracing::warn!(
                        account = provider_account,
                        chunk_start,
                        chunk_end,
                        error = %e,
                        "Chunk fetch failed; recording gap and moving on."
                    );
                    self.repo
                        .record_gap(
                            Provider::Chain,
                            provider_account,
                            chunk_start,
                            chunk_end,
                            &e.to_string(),
                        )
                        .await?;
                    outcome.gaps_recorded += 1;
                    continue;
                }
            };

            let mut transfers = Vec::with_capacity(logs.len());
            for log in &logs {
                match decode_transfer(log) {
                    Ok(transfer) => transfers.push(transfer),
                    Err(e) => {
                        // Fatal to this entry only.
                        tracing::warn!(
                            account = provider_account,
                            error = %e,
                            "Dropping undecodable log entry."
                        );
                    }
                }
            }
            transfers.sort_by_key(|t| (t.block_number, t.log_index));

            if let Err(e) = self.resolve_timestamps(&transfers, &mut timestamps).await {
                tracing::warn!(
                    account = provider_account,
                    chunk_start,
                    chunk_end,
                    error = %e,
                    "Timestamp resolution failed; recording gap and moving on."
                );
                self.repo
                    .record_gap(
                        Provider::Chain,
                        provider_account,
                        chunk_start,
                        chunk_end,
                        &e.to_string(),
                    )
                    .await?;
                outcome.gaps_recorded += 1;
                continue;
            }

            for transfer in &transfers {
                let Some(tx) = normalize_transfer(
                    account,
                    provider_account,
                    defaults,
                    transfer,
                    timestamps[&transfer.block_number],
                ) else {
                    continue;
                };
                if self.repo.insert_transaction(&tx).await? {
                    outcome.records_persisted += 1;
                }
            }

            // Cursor advance happens-after the chunk's records are durable.
            self.repo
                .set_cursor(Provider::Chain, provider_account, &Cursor::Block(chunk_end))
                .await?;
            outcome.last_block = Some(chunk_end);

            tracing::debug!(
                account = provider_account,
                chunk_start,
                chunk_end,
                persisted = outcome.records_persisted,
                "Chunk complete."
            );
        }

        tracing::info!(
            account = provider_account,
            last_block = ?outcome.last_block,
            persisted = outcome.records_persisted,
            gaps = outcome.gaps_recorded,
            "Chain scan finished."
        );
        Ok(outcome)
    }

    /// Resolves the timestamps of every block the chunk's transfers touch.
    async fn resolve_timestamps(
        &self,
        transfers: &[TokenTransfer],
        timestamps: &mut HashMap<u64, DateTime<Utc>>,
    ) -> Result<(), DataSourceError> {
        for transfer in transfers {
            if timestamps.contains_key(&transfer.block_number) {
                continue;
            }
            let seconds = self.data_source.block_timestamp(transfer.block_number).await?;
            let ts = units::timestamp_from_unix_seconds(seconds as i64)
                .map_err(|_| DataSourceError::BlockNotFound(transfer.block_number))?;
            timestamps.insert(transfer.block_number, ts);
        }
        Ok(())
    }
}

/// Maps a decoded transfer onto the normalized schema, or `None` when the
/// transfer does not touch the registered wallet or its amount cannot be
/// represented.
fn normalize_transfer(
    account: &ChainAccount,
    provider_account: &str,
    defaults: &TransactionDefaults,
    transfer: &TokenTransfer,
    timestamp: DateTime<Utc>,
) -> Option<Transaction> {
    let outgoing = transfer.from == account.wallet;
    let incoming = transfer.to == account.wallet;
    if !outgoing && !incoming {
        return None;
    }

    let magnitude = match i64::try_from(transfer.value) {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(
                block = transfer.block_number,
                log_index = transfer.log_index,
                "Transfer amount exceeds the representable range; dropping entry."
            );
            return None;
        }
    };

    let (tx_type, value, counterparty) = if outgoing && incoming {
        (TransactionType::Internal, magnitude, account.wallet)
    } else if outgoing {
        (TransactionType::Transfer, -magnitude, transfer.to)
    } else {
        (TransactionType::Transfer, magnitude, transfer.from)
    };

    let provider_tx_id = match transfer.tx_hash {
        Some(hash) => format!("{hash:#x}-{}", transfer.log_index),
        None => format!("{}-{}", transfer.block_number, transfer.log_index),
    };

    let mut tx = Transaction {
        timestamp,
        provider: Provider::Chain,
        provider_account: provider_account.to_string(),
        provider_tx_id,
        account_address: Some(format!("{:#x}", account.wallet)),
        counterparty_address: Some(format!("{counterparty:#x}")),
        counterparty_name: None,
        counterparty_profile: None,
        value,
        token_symbol: defaults.token_symbol.clone().unwrap_or_else(|| "TOKEN".to_string()),
        token_decimals: defaults.token_decimals.unwrap_or(18),
        tx_type,
        tags: None,
        description: None,
        invoice_uuid: None,
        data: None,
    };
    tx.apply_defaults(defaults);
    Some(tx)
}

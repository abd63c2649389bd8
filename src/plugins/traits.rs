//! The capability interface every API-based provider implements, and the
//! error contract between plugins, their upstream clients and the
//! orchestrator.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::models::{Cursor, Provider, Transaction, TransactionDefaults};

/// Errors reported by the black-box upstream API clients.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The provider rejected the credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The request could not complete (after transport-level retries).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The provider's response could not be interpreted.
    #[error("malformed response: {0}")]
    Decode(String),
}

/// Pair-level failures a plugin can report. Anything below this level is
/// absorbed into a partial batch and logged.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The provider's entire response is unusable (auth failure, total
    /// outage). The caller must not advance the cursor.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The provider account string is not valid for this plugin.
    #[error("invalid provider account: {0}")]
    InvalidAccount(String),
}

impl From<UpstreamError> for PluginError {
    fn from(e: UpstreamError) -> Self {
        PluginError::UpstreamUnavailable(e.to_string())
    }
}

/// The ordered records one `index` call produced, plus the cursor position
/// they confirm.
#[derive(Debug, Clone, Default)]
pub struct IndexBatch {
    /// Normalized records in non-decreasing source-time order.
    pub transactions: Vec<Transaction>,
    /// The position to persist once the records are durable. `None` when
    /// the batch is empty, leaving the stored cursor untouched.
    pub next_cursor: Option<Cursor>,
}

impl IndexBatch {
    /// Builds a batch whose cursor is the latest record timestamp.
    pub fn from_transactions(mut transactions: Vec<Transaction>) -> Self {
        transactions.sort_by_key(|tx| tx.timestamp);
        let next_cursor = transactions.last().map(|tx| Cursor::Timestamp(tx.timestamp));
        Self { transactions, next_cursor }
    }
}

/// One polymorphic data-source plugin.
///
/// `index` fetches all transactions at or after the cursor (the boundary is
/// inclusive; a record exactly at the cursor may be re-fetched and is
/// absorbed by the uniqueness constraint) and maps them onto the normalized
/// schema, merging `defaults` with plugin-produced fields winning.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderPlugin: Send + Sync {
    /// Which provider this plugin serves.
    fn provider(&self) -> Provider;

    /// Fetches and normalizes all transactions at or after `cursor`.
    ///
    /// On a transport or decoding error for an individual sub-fetch, the
    /// plugin returns the subset of records it could still produce. When
    /// the entire response is unusable it fails with
    /// [`PluginError::UpstreamUnavailable`] and emits no records.
    async fn index<'c>(
        &self,
        provider_account: &str,
        defaults: &TransactionDefaults,
        cursor: Option<&'c Cursor>,
    ) -> Result<IndexBatch, PluginError>;

    /// Releases any background resources (token-refresh loops). Default is
    /// a no-op.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::models::TransactionType;

    fn tx_at(ts: chrono::DateTime<Utc>, id: &str) -> Transaction {
        Transaction {
            timestamp: ts,
            provider: Provider::Crowdfunding,
            provider_account: "acct".into(),
            provider_tx_id: id.into(),
            account_address: None,
            counterparty_address: None,
            counterparty_name: None,
            counterparty_profile: None,
            value: 1,
            token_symbol: "EUR".into(),
            token_decimals: 2,
            tx_type: TransactionType::Transfer,
            tags: None,
            description: None,
            invoice_uuid: None,
            data: None,
        }
    }

    #[test]
    fn batch_cursor_is_the_latest_timestamp() {
        let early = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 9, 3, 0, 0, 0).unwrap();
        let batch = IndexBatch::from_transactions(vec![tx_at(late, "b"), tx_at(early, "a")]);

        assert_eq!(batch.next_cursor, Some(Cursor::Timestamp(late)));
        // Records come back in non-decreasing source-time order.
        assert_eq!(batch.transactions[0].provider_tx_id, "a");
    }

    #[test]
    fn empty_batch_has_no_cursor() {
        let batch = IndexBatch::from_transactions(vec![]);
        assert!(batch.next_cursor.is_none());
        assert!(batch.transactions.is_empty());
    }
}

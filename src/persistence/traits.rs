//! The state-management interface the scanner and orchestrator write
//! through. Plugins never touch storage directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;

use super::error::PersistenceError;
use crate::models::{
    Cursor, Provider, Registration, Transaction, registration::NewRegistration,
};

/// A block range the scanner abandoned after a chunk-level failure.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncGap {
    /// Provider the gap belongs to.
    pub provider: Provider,
    /// Account the gap belongs to.
    pub provider_account: String,
    /// First unfetched block.
    pub from_block: u64,
    /// Last unfetched block.
    pub to_block: u64,
    /// Why the chunk was abandoned.
    pub reason: Option<String>,
    /// When the gap was recorded.
    pub created_at: DateTime<Utc>,
}

/// The repository owning cursors, transactions, registrations and gap
/// markers.
///
/// Writes must be safe under concurrent access from multiple pairs: the
/// uniqueness constraint plus atomic insert-or-ignore semantics stand in
/// for explicit locking.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Returns the last durably recorded position for a pair, or `None` if
    /// it has never synced.
    async fn get_cursor(
        &self,
        provider: Provider,
        account: &str,
    ) -> Result<Option<Cursor>, PersistenceError>;

    /// Overwrites the pair's cursor. Callers must only invoke this after
    /// the corresponding batch's records are durably persisted.
    async fn set_cursor(
        &self,
        provider: Provider,
        account: &str,
        cursor: &Cursor,
    ) -> Result<(), PersistenceError>;

    /// Inserts a transaction. Returns `true` if a row was written and
    /// `false` if a record with the same `(provider, provider_tx_id)`
    /// already existed; a duplicate is a successful no-op, not an error.
    async fn insert_transaction(&self, tx: &Transaction) -> Result<bool, PersistenceError>;

    /// Counts the stored transactions for a pair.
    async fn count_transactions(
        &self,
        provider: Provider,
        account: &str,
    ) -> Result<u64, PersistenceError>;

    /// Records a block range the scanner had to abandon.
    async fn record_gap(
        &self,
        provider: Provider,
        account: &str,
        from_block: u64,
        to_block: u64,
        reason: &str,
    ) -> Result<(), PersistenceError>;

    /// Lists the recorded gaps for a pair, oldest first.
    async fn list_gaps(
        &self,
        provider: Provider,
        account: &str,
    ) -> Result<Vec<SyncGap>, PersistenceError>;

    /// Creates or updates a registration, preserving any existing cursor.
    async fn upsert_registration(
        &self,
        registration: &NewRegistration,
    ) -> Result<(), PersistenceError>;

    /// Lists every registration.
    async fn list_registrations(&self) -> Result<Vec<Registration>, PersistenceError>;

    /// Deletes one pair's transactions, cursor and gap markers.
    async fn reset_pair(&self, provider: Provider, account: &str)
    -> Result<(), PersistenceError>;

    /// Drops all persisted transactions, cursors and gap markers.
    /// Destructive; callers must require an explicit opt-in.
    async fn reset_all(&self) -> Result<(), PersistenceError>;
}

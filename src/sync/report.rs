//! Structured per-pair results of a sync run.

use crate::models::{Cursor, Provider};

/// What happened to one (provider, account) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairOutcome {
    /// The pair's provider.
    pub provider: Provider,
    /// The pair's account.
    pub provider_account: String,
    /// Newly persisted records (duplicates excluded).
    pub records_persisted: u64,
    /// Cursor position reached by the end of the run.
    pub cursor: Option<Cursor>,
    /// Scanner chunks abandoned and recorded as gaps.
    pub gaps_recorded: u64,
    /// The pair-level failure, if the pair did not complete.
    pub error: Option<String>,
}

impl PairOutcome {
    /// Whether the pair completed without a pair-level failure.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// The result of syncing a set of pairs. Partial success is expected and
/// acceptable; failed pairs leave their cursors untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// One outcome per requested pair.
    pub pairs: Vec<PairOutcome>,
}

impl SyncReport {
    /// Whether any pair failed.
    pub fn has_failures(&self) -> bool {
        self.pairs.iter().any(|pair| !pair.succeeded())
    }

    /// Total records persisted across all pairs.
    pub fn records_persisted(&self) -> u64 {
        self.pairs.iter().map(|pair| pair.records_persisted).sum()
    }

    /// Logs one summary line per pair.
    pub fn log_summary(&self) {
        for pair in &self.pairs {
            match &pair.error {
                None => tracing::info!(
                    provider = %pair.provider,
                    account = %pair.provider_account,
                    persisted = pair.records_persisted,
                    cursor = ?pair.cursor.map(|c| c.to_string()),
                    gaps = pair.gaps_recorded,
                    "Pair synced."
                ),
                Some(error) => tracing::error!(
                    provider = %pair.provider,
                    account = %pair.provider_account,
                    error = %error,
                    "Pair failed; cursor untouched."
                ),
            }
        }
    }
}

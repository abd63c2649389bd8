//! The sync orchestrator: drives each registered (provider, account) pair
//! through load cursor → fetch → persist → advance cursor, bounded by the
//! configured pair concurrency.
//!
//! Pairs are independent; a pair-level failure leaves that pair's cursor
//! untouched and the other pairs running. Configuration errors abort the
//! whole run before any I/O starts.

use std::{collections::HashMap, sync::Arc};

use futures::{StreamExt, stream};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    chain::{ChainAccount, ChainDataSource, LogScanner},
    config::StartPosition,
    models::{Cursor, Provider, TransactionDefaults},
    persistence::LedgerRepository,
    plugins::ProviderPlugin,
    sync::report::{PairOutcome, SyncReport},
};

/// Fatal errors that abort a run before any pair starts.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A request references an unusable account, chain or provider.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// One pair to sync, with its run-scoped options.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// The pair's provider.
    pub provider: Provider,
    /// The pair's account identifier.
    pub provider_account: String,
    /// Caller-supplied values merged into every record.
    pub defaults: TransactionDefaults,
    /// Where a first-time chain scan starts.
    pub start: StartPosition,
    /// Optional fixed end block for a chain scan (defaults to the head at
    /// run start).
    pub end_block: Option<u64>,
    /// Wipe the pair's prior state before syncing.
    pub reset: bool,
}

impl SyncRequest {
    /// Creates a request with default options.
    pub fn new(provider: Provider, provider_account: impl Into<String>) -> Self {
        Self {
            provider,
            provider_account: provider_account.into(),
            defaults: TransactionDefaults::default(),
            start: StartPosition::Latest,
            end_block: None,
            reset: false,
        }
    }
}

/// The orchestrator owning the plugin set, the chain data sources and the
/// repository handle.
pub struct SyncOrchestrator {
    repo: Arc<dyn LedgerRepository>,
    chain_sources: HashMap<String, Arc<dyn ChainDataSource>>,
    plugins: HashMap<Provider, Arc<dyn ProviderPlugin>>,
    block_chunk_size: u64,
    concurrency: usize,
    cancellation_token: CancellationToken,
}

impl SyncOrchestrator {
    /// Creates an orchestrator with no sources or plugins attached.
    pub fn new(
        repo: Arc<dyn LedgerRepository>,
        block_chunk_size: u64,
        concurrency: usize,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            repo,
            chain_sources: HashMap::new(),
            plugins: HashMap::new(),
            block_chunk_size,
            concurrency: concurrency.max(1),
            cancellation_token,
        }
    }

    /// Attaches the data source for one chain identifier.
    pub fn with_chain_source(
        mut self,
        chain_id: impl Into<String>,
        source: Arc<dyn ChainDataSource>,
    ) -> Self {
        self.chain_sources.insert(chain_id.into(), source);
        self
    }

    /// Attaches an API provider plugin, dispatched by its provider tag.
    pub fn with_plugin(mut self, plugin: Arc<dyn ProviderPlugin>) -> Self {
        self.plugins.insert(plugin.provider(), plugin);
        self
    }

    /// Checks a request against the attached sources and plugins.
    fn validate(&self, request: &SyncRequest) -> Result<(), SyncError> {
        match request.provider {
            Provider::Chain => {
                let account: ChainAccount = request
                    .provider_account
                    .parse()
                    .map_err(|e: crate::chain::AccountParseError| {
                        SyncError::InvalidConfiguration(e.to_string())
                    })?;
                if !self.chain_sources.contains_key(&account.chain_id) {
                    return Err(SyncError::InvalidConfiguration(format!(
                        "unsupported chain identifier: {}",
                        account.chain_id
                    )));
                }
            }
            provider => {
                if !self.plugins.contains_key(&provider) {
                    return Err(SyncError::InvalidConfiguration(format!(
                        "no plugin configured for provider: {provider}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Syncs a set of pairs, up to `concurrency` at a time, and reports per
    /// pair. Validation failures abort before any pair starts.
    pub async fn sync_all(&self, requests: Vec<SyncRequest>) -> Result<SyncReport, SyncError> {
        for request in &requests {
            self.validate(request)?;
        }

        let pairs = stream::iter(requests)
            .map(|request| self.sync_pair(request))
            .buffered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        Ok(SyncReport { pairs })
    }

    /// Syncs one pair end to end. Never panics the run; every failure is
    /// folded into the returned outcome.
    pub async fn sync_pair(&self, request: SyncRequest) -> PairOutcome {
        if let Err(e) = self.validate(&request) {
            return Self::failed(&request, None, e.to_string());
        }

        if request.reset {
            if let Err(e) =
                self.repo.reset_pair(request.provider, &request.provider_account).await
            {
                return Self::failed(&request, None, e.to_string());
            }
        }

        let cursor = match self
            .repo
            .get_cursor(request.provider, &request.provider_account)
            .await
        {
            Ok(cursor) => cursor,
            Err(e) => return Self::failed(&request, None, e.to_string()),
        };

        match request.provider {
            Provider::Chain => self.sync_chain_pair(&request, cursor).await,
            _ => self.sync_plugin_pair(&request, cursor).await,
        }
    }

    async fn sync_chain_pair(
        &self,
        request: &SyncRequest,
        cursor: Option<Cursor>,
    ) -> PairOutcome {
        // Validated above; both lookups are infallible here.
        let account: ChainAccount =
            request.provider_account.parse().expect("validated chain account");
        let source = Arc::clone(&self.chain_sources[&account.chain_id]);

        let scanner = LogScanner::new(
            source,
            Arc::clone(&self.repo),
            self.block_chunk_size,
            self.cancellation_token.child_token(),
        );

        match scanner
            .run(
                &account,
                &request.provider_account,
                &request.defaults,
                cursor.as_ref(),
                request.start,
                request.end_block,
            )
            .await
        {
            Ok(outcome) => PairOutcome {
                provider: request.provider,
                provider_account: request.provider_account.clone(),
                records_persisted: outcome.records_persisted,
                cursor: outcome.last_block.map(Cursor::Block),
                gaps_recorded: outcome.gaps_recorded,
                error: None,
            },
            Err(e) => Self::failed(request, cursor, e.to_string()),
        }
    }

    async fn sync_plugin_pair(
        &self,
        request: &SyncRequest,
        cursor: Option<Cursor>,
    ) -> PairOutcome {
        let plugin = Arc::clone(&self.plugins[&request.provider]);

        let batch = match plugin
            .index(&request.provider_account, &request.defaults, cursor.as_ref())
            .await
        {
            Ok(batch) => batch,
            Err(e) => return Self::failed(request, cursor, e.to_string()),
        };

        // Persist in provider order before the cursor moves; a failure here
        // leaves the cursor behind the data, never ahead of it.
        let mut persisted = 0u64;
        for tx in &batch.transactions {
            match self.repo.insert_transaction(tx).await {
                Ok(true) => persisted += 1,
                Ok(false) => {
                    tracing::debug!(
                        provider = %tx.provider,
                        provider_tx_id = %tx.provider_tx_id,
                        "Duplicate record; insert was a no-op."
                    );
                }
                Err(e) => {
                    let mut outcome = Self::failed(request, cursor, e.to_string());
                    outcome.records_persisted = persisted;
                    return outcome;
                }
            }
        }

        let next_cursor = match batch.next_cursor {
            Some(next) => {
                if let Err(e) = self
                    .repo
                    .set_cursor(request.provider, &request.provider_account, &next)
                    .await
                {
                    let mut outcome = Self::failed(request, cursor, e.to_string());
                    outcome.records_persisted = persisted;
                    return outcome;
                }
                Some(next)
            }
            None => cursor,
        };

        PairOutcome {
            provider: request.provider,
            provider_account: request.provider_account.clone(),
            records_persisted: persisted,
            cursor: next_cursor,
            gaps_recorded: 0,
            error: None,
        }
    }

    /// Closes every plugin, releasing background resources like
    /// token-refresh loops.
    pub async fn shutdown(&self) {
        for plugin in self.plugins.values() {
            plugin.close().await;
        }
        tracing::info!("All provider plugins closed.");
    }

    fn failed(request: &SyncRequest, cursor: Option<Cursor>, error: String) -> PairOutcome {
        PairOutcome {
            provider: request.provider,
            provider_account: request.provider_account.clone(),
            records_persisted: 0,
            cursor,
            gaps_recorded: 0,
            error: Some(error),
        }
    }
}

//! End-to-end orchestrator tests against an in-memory database: the
//! idempotence, resumability and partial-failure properties of a sync run.

use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, U256, address};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ledgersync::{
    chain::{ChainDataSource, DataSourceError},
    config::StartPosition,
    models::{Cursor, Provider, TransactionDefaults},
    persistence::{LedgerRepository, SqliteLedgerRepository},
    plugins::{IndexBatch, PluginError, ProviderPlugin},
    sync::{SyncOrchestrator, SyncRequest},
    test_helpers::{sample_transaction, transfer_log},
};
use tokio_util::sync::CancellationToken;

const TOKEN: Address = address!("cB444e90D8198415266c6a2724b7900fb12FC56E");
const WALLET: Address = address!("1111111111111111111111111111111111111111");
const OTHER: Address = address!("2222222222222222222222222222222222222222");
const CHAIN_ACCOUNT: &str = "gnosis:0xcB444e90D8198415266c6a2724b7900fb12FC56E/0x1111111111111111111111111111111111111111";

async fn setup_repo() -> Arc<SqliteLedgerRepository> {
    let repo = SqliteLedgerRepository::new("sqlite::memory:")
        .await
        .expect("Failed to set up in-memory database");
    repo.run_migrations().await.expect("Failed to run migrations");
    Arc::new(repo)
}

/// A plugin that replays scripted batches and records the cursors it was
/// invoked with.
struct ScriptedPlugin {
    provider: Provider,
    batches: Mutex<Vec<Result<IndexBatch, PluginError>>>,
    seen_cursors: Mutex<Vec<Option<Cursor>>>,
}

impl ScriptedPlugin {
    fn new(provider: Provider, batches: Vec<Result<IndexBatch, PluginError>>) -> Self {
        Self { provider, batches: Mutex::new(batches), seen_cursors: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl ProviderPlugin for ScriptedPlugin {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn index<'c>(
        &self,
        _provider_account: &str,
        _defaults: &TransactionDefaults,
        cursor: Option<&'c Cursor>,
    ) -> Result<IndexBatch, PluginError> {
        self.seen_cursors.lock().unwrap().push(cursor.copied());
        let mut batches = self.batches.lock().unwrap();
        if batches.is_empty() {
            return Ok(IndexBatch::default());
        }
        batches.remove(0)
    }
}

/// An in-memory chain: a fixed head, a fixed set of transfer logs, and an
/// optional block range whose fetches always fail.
struct FakeChain {
    head: u64,
    logs: Vec<alloy::rpc::types::Log>,
    failing_range: Option<(u64, u64)>,
}

#[async_trait]
impl ChainDataSource for FakeChain {
    async fn transfer_logs(
        &self,
        _token: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<alloy::rpc::types::Log>, DataSourceError> {
        if let Some((fail_from, fail_to)) = self.failing_range {
            if from_block <= fail_to && to_block >= fail_from {
                return Err(DataSourceError::Rpc("synthetic outage".to_string().into()));
            }
        }
        Ok(self
            .logs
            .iter()
            .filter(|log| {
                log.block_number
                    .map(|b| b >= from_block && b <= to_block)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, number: u64) -> Result<u64, DataSourceError> {
        Ok(1_700_000_000 + number)
    }

    async fn head_block(&self) -> Result<u64, DataSourceError> {
        Ok(self.head)
    }
}

fn orchestrator(repo: Arc<SqliteLedgerRepository>) -> SyncOrchestrator {
    SyncOrchestrator::new(repo, 10_000, 2, CancellationToken::new())
}

fn page(provider: Provider, account: &str, ids_and_times: &[(&str, i64)]) -> IndexBatch {
    IndexBatch::from_transactions(
        ids_and_times
            .iter()
            .map(|(id, minute)| {
                let mut tx = sample_transaction(provider, account, id, 100);
                tx.timestamp = Utc.with_ymd_and_hms(2024, 9, 2, 10, 0, 0).unwrap()
                    + chrono::Duration::minutes(*minute);
                tx
            })
            .collect(),
    )
}

#[tokio::test]
async fn syncing_twice_with_no_new_upstream_data_adds_zero_records() {
    let repo = setup_repo().await;

    // The upstream returns the same page on both runs, as a re-fetch from
    // the same start position would.
    let batch = page(Provider::Crowdfunding, "acct", &[("a", 0), ("b", 1), ("c", 2)]);
    let plugin = Arc::new(ScriptedPlugin::new(
        Provider::Crowdfunding,
        vec![Ok(batch.clone()), Ok(batch)],
    ));

    let orchestrator = orchestrator(Arc::clone(&repo)).with_plugin(plugin);

    let first = orchestrator
        .sync_pair(SyncRequest::new(Provider::Crowdfunding, "acct"))
        .await;
    assert!(first.succeeded());
    assert_eq!(first.records_persisted, 3);

    let second = orchestrator
        .sync_pair(SyncRequest::new(Provider::Crowdfunding, "acct"))
        .await;
    assert!(second.succeeded());
    assert_eq!(second.records_persisted, 0);

    assert_eq!(repo.count_transactions(Provider::Crowdfunding, "acct").await.unwrap(), 3);
}

#[tokio::test]
async fn a_resumed_run_continues_from_the_stored_cursor() {
    let repo = setup_repo().await;

    let first_page = page(Provider::OpenBanking, "acct", &[("t1", 0), ("t2", 5)]);
    let second_page = page(Provider::OpenBanking, "acct", &[("t3", 10), ("t4", 11)]);
    let plugin = Arc::new(ScriptedPlugin::new(
        Provider::OpenBanking,
        vec![Ok(first_page.clone()), Ok(second_page)],
    ));

    let orchestrator = orchestrator(Arc::clone(&repo)).with_plugin(plugin.clone());

    orchestrator.sync_pair(SyncRequest::new(Provider::OpenBanking, "acct")).await;
    let second = orchestrator
        .sync_pair(SyncRequest::new(Provider::OpenBanking, "acct"))
        .await;
    assert!(second.succeeded());

    // The second invocation saw exactly the cursor the first run stored.
    let seen = plugin.seen_cursors.lock().unwrap().clone();
    assert_eq!(seen[0], None);
    assert_eq!(seen[1], first_page.next_cursor);

    // The whole window is covered exactly once.
    assert_eq!(repo.count_transactions(Provider::OpenBanking, "acct").await.unwrap(), 4);
}

#[tokio::test]
async fn failing_pair_is_isolated_and_keeps_its_cursor() {
    let repo = setup_repo().await;

    let healthy = Arc::new(ScriptedPlugin::new(
        Provider::Crowdfunding,
        vec![Ok(page(Provider::Crowdfunding, "acct-a", &[("a1", 0), ("a2", 1)]))],
    ));
    let broken = Arc::new(ScriptedPlugin::new(
        Provider::OpenBanking,
        vec![Err(PluginError::UpstreamUnavailable("auth failure".into()))],
    ));

    let orchestrator = orchestrator(Arc::clone(&repo))
        .with_plugin(healthy)
        .with_plugin(broken);

    let report = orchestrator
        .sync_all(vec![
            SyncRequest::new(Provider::Crowdfunding, "acct-a"),
            SyncRequest::new(Provider::OpenBanking, "acct-b"),
        ])
        .await
        .unwrap();

    assert!(report.has_failures());
    assert_eq!(repo.count_transactions(Provider::Crowdfunding, "acct-a").await.unwrap(), 2);
    assert_eq!(repo.count_transactions(Provider::OpenBanking, "acct-b").await.unwrap(), 0);

    // The healthy pair's cursor advanced; the broken pair never got one.
    assert!(repo.get_cursor(Provider::Crowdfunding, "acct-a").await.unwrap().is_some());
    assert!(repo.get_cursor(Provider::OpenBanking, "acct-b").await.unwrap().is_none());
}

#[tokio::test]
async fn chain_scan_persists_transfers_and_advances_per_chunk() {
    let repo = setup_repo().await;

    let chain = Arc::new(FakeChain {
        head: 25_000,
        logs: vec![
            transfer_log(TOKEN, OTHER, WALLET, U256::from(1_000u64), 5, 0),
            transfer_log(TOKEN, WALLET, OTHER, U256::from(400u64), 15_000, 2),
        ],
        failing_range: None,
    });

    let orchestrator =
        orchestrator(Arc::clone(&repo)).with_chain_source("gnosis", chain);

    let mut request = SyncRequest::new(Provider::Chain, CHAIN_ACCOUNT);
    request.start = StartPosition::Absolute(0);
    let outcome = orchestrator.sync_pair(request).await;

    assert!(outcome.succeeded(), "unexpected failure: {:?}", outcome.error);
    assert_eq!(outcome.records_persisted, 2);
    assert_eq!(outcome.cursor, Some(Cursor::Block(25_000)));
    assert_eq!(
        repo.get_cursor(Provider::Chain, CHAIN_ACCOUNT).await.unwrap(),
        Some(Cursor::Block(25_000))
    );

    // A second run from the stored cursor fetches nothing new.
    let mut again = SyncRequest::new(Provider::Chain, CHAIN_ACCOUNT);
    again.start = StartPosition::Absolute(0);
    let outcome = orchestrator.sync_pair(again).await;
    assert!(outcome.succeeded());
    assert_eq!(outcome.records_persisted, 0);
    assert_eq!(repo.count_transactions(Provider::Chain, CHAIN_ACCOUNT).await.unwrap(), 2);
}

#[tokio::test]
async fn failed_chunk_leaves_a_gap_marker_but_not_a_hole_in_the_cursor() {
    let repo = setup_repo().await;

    let chain = Arc::new(FakeChain {
        head: 25_000,
        logs: vec![
            transfer_log(TOKEN, OTHER, WALLET, U256::from(1_000u64), 5, 0),
            transfer_log(TOKEN, OTHER, WALLET, U256::from(2_000u64), 24_000, 0),
        ],
        failing_range: Some((10_000, 19_999)),
    });

    let orchestrator =
        orchestrator(Arc::clone(&repo)).with_chain_source("gnosis", chain);

    let mut request = SyncRequest::new(Provider::Chain, CHAIN_ACCOUNT);
    request.start = StartPosition::Absolute(0);
    let outcome = orchestrator.sync_pair(request).await;

    assert!(outcome.succeeded());
    assert_eq!(outcome.records_persisted, 2);
    assert_eq!(outcome.gaps_recorded, 1);
    assert_eq!(outcome.cursor, Some(Cursor::Block(25_000)));

    let gaps = repo.list_gaps(Provider::Chain, CHAIN_ACCOUNT).await.unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!((gaps[0].from_block, gaps[0].to_block), (10_000, 19_999));
}

#[tokio::test]
async fn reset_flag_wipes_prior_pair_state_before_syncing() {
    let repo = setup_repo().await;

    let plugin = Arc::new(ScriptedPlugin::new(
        Provider::Crowdfunding,
        vec![
            Ok(page(Provider::Crowdfunding, "acct", &[("a", 0)])),
            Ok(page(Provider::Crowdfunding, "acct", &[("a", 0), ("b", 1)])),
        ],
    ));
    let orchestrator = orchestrator(Arc::clone(&repo)).with_plugin(plugin.clone());

    orchestrator.sync_pair(SyncRequest::new(Provider::Crowdfunding, "acct")).await;
    assert_eq!(repo.count_transactions(Provider::Crowdfunding, "acct").await.unwrap(), 1);

    let mut request = SyncRequest::new(Provider::Crowdfunding, "acct");
    request.reset = true;
    let outcome = orchestrator.sync_pair(request).await;

    assert!(outcome.succeeded());
    // The reset cleared the cursor, so the plugin saw a fresh pair.
    let seen = plugin.seen_cursors.lock().unwrap().clone();
    assert_eq!(seen[1], None);
    assert_eq!(repo.count_transactions(Provider::Crowdfunding, "acct").await.unwrap(), 2);
}

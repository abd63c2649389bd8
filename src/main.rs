//! Process bootstrap and CLI surface for ledgersync.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use ledgersync::{
    chain::rpc::{EvmRpcSource, create_provider},
    config::{AppConfig, StartPosition},
    http_client::build_http_client,
    models::{Provider, TransactionDefaults, registration::NewRegistration},
    persistence::{LedgerRepository, SqliteLedgerRepository},
    plugins::{
        CardPlugin, CrowdfundingPlugin, OpenBankingPlugin, TokenCache,
        card::HttpCardApi,
        crowdfunding::{CrowdfundingApi, HttpCrowdfundingApi},
        openbanking::{HttpOpenBankingApi, OpenBankingApi},
    },
    sync::{SyncOrchestrator, SyncRequest},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding app.yaml.
    #[arg(long)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Syncs every registered (provider, account) pair.
    Run,
    /// Runs one incremental sync for a single pair, registering it first.
    Sync {
        /// Provider tag: chain, card_processor, crowdfunding or
        /// open_banking.
        provider: Provider,
        /// Provider account (for chain: <chain>:<token>/<wallet>).
        account: String,
        /// Start position for a first-time chain scan: a block number, a
        /// negative offset, or "latest".
        #[arg(long)]
        since: Option<StartPosition>,
        /// Fixed end block for a chain scan.
        #[arg(long)]
        until: Option<u64>,
        /// Wipe the pair's prior state before syncing.
        #[arg(long)]
        reset: bool,
        /// Label stored on the registration and used as default tags.
        #[arg(long)]
        label: Option<String>,
        /// Tags attached to every record of this run.
        #[arg(long)]
        tags: Option<String>,
    },
    /// Registers a pair without syncing it.
    Register {
        /// Provider tag.
        provider: Provider,
        /// Provider account.
        account: String,
        /// Label stored on the registration.
        #[arg(long)]
        label: Option<String>,
        /// Provider-specific filter.
        #[arg(long)]
        filter: Option<String>,
    },
    /// Drops all persisted transactions, cursors and gap markers.
    Reset {
        /// Required confirmation; the wipe is destructive.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber =
        FmtSubscriber::builder().with_env_filter(EnvFilter::from_default_env()).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let cli = Cli::parse();

    tracing::debug!("Loading application configuration...");
    let config = AppConfig::new(cli.config_dir.as_deref())?;
    tracing::debug!(database_url = %config.database_url, "Configuration loaded.");

    let repo = Arc::new(SqliteLedgerRepository::new(&config.database_url).await?);
    repo.run_migrations().await?;

    match cli.command {
        Commands::Register { provider, account, label, filter } => {
            repo.upsert_registration(&NewRegistration {
                provider,
                provider_account: account.clone(),
                label,
                filter,
            })
            .await?;
            tracing::info!(provider = %provider, account, "Registration stored.");
        }
        Commands::Reset { yes } => {
            if !yes {
                return Err("a full reset is destructive; pass --yes to confirm".into());
            }
            repo.reset_all().await?;
        }
        Commands::Run => {
            let registrations = repo.list_registrations().await?;
            if registrations.is_empty() {
                tracing::warn!("No registrations to sync.");
                return Ok(());
            }
            let requests = registrations
                .into_iter()
                .map(|registration| SyncRequest {
                    provider: registration.provider,
                    provider_account: registration.provider_account,
                    defaults: TransactionDefaults {
                        tags: registration.label,
                        ..Default::default()
                    },
                    start: config.start_position,
                    end_block: None,
                    reset: false,
                })
                .collect();
            run_requests(&config, Arc::clone(&repo), requests).await?;
        }
        Commands::Sync { provider, account, since, until, reset, label, tags } => {
            repo.upsert_registration(&NewRegistration {
                provider,
                provider_account: account.clone(),
                label: label.clone(),
                filter: None,
            })
            .await?;

            let request = SyncRequest {
                provider,
                provider_account: account,
                defaults: TransactionDefaults {
                    tags: tags.or(label),
                    ..Default::default()
                },
                start: since.unwrap_or(config.start_position),
                end_block: until,
                reset,
            };
            run_requests(&config, Arc::clone(&repo), vec![request]).await?;
        }
    }

    repo.close().await;
    Ok(())
}

/// Wires the orchestrator, runs the requests, reports and exits non-zero
/// on partial failure.
async fn run_requests(
    config: &AppConfig,
    repo: Arc<SqliteLedgerRepository>,
    requests: Vec<SyncRequest>,
) -> Result<(), Box<dyn std::error::Error>> {
    let cancellation_token = CancellationToken::new();

    // Cancel between chunks/pairs on shutdown signals; in-flight writes
    // finish first.
    let signal_token = cancellation_token.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM handler")
                .recv()
                .await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("SIGINT received, finishing the current chunk before stopping."),
            _ = terminate => tracing::info!("SIGTERM received, finishing the current chunk before stopping."),
        }
        signal_token.cancel();
    });

    let orchestrator =
        build_orchestrator(config, Arc::clone(&repo), cancellation_token).await?;

    let report = orchestrator.sync_all(requests).await?;
    report.log_summary();

    if tokio::time::timeout(config.shutdown_timeout, orchestrator.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            "Plugin cleanup did not complete within {:?}; continuing shutdown.",
            config.shutdown_timeout
        );
    }

    if report.has_failures() {
        repo.close().await;
        std::process::exit(1);
    }
    Ok(())
}

/// Builds the orchestrator from the configured chains and provider
/// credentials. Providers without configuration are simply not attached.
async fn build_orchestrator(
    config: &AppConfig,
    repo: Arc<SqliteLedgerRepository>,
    cancellation_token: CancellationToken,
) -> Result<SyncOrchestrator, Box<dyn std::error::Error>> {
    let mut orchestrator = SyncOrchestrator::new(
        repo as Arc<dyn LedgerRepository>,
        config.block_chunk_size,
        config.concurrency,
        cancellation_token,
    );

    for (chain_id, urls) in &config.rpc_urls {
        let provider = create_provider(urls.clone(), &config.rpc_retry)?;
        orchestrator = orchestrator.with_chain_source(
            chain_id.clone(),
            Arc::new(EvmRpcSource::new(
                provider,
                config.metadata_timeout,
                config.fetch_timeout,
            )),
        );
        tracing::debug!(chain_id, "Chain data source attached.");
    }

    let crowdfunding_api: Option<Arc<dyn CrowdfundingApi>> = match &config.crowdfunding {
        Some(cfg) => {
            let client = build_http_client(&config.http_retry, config.metadata_timeout)?;
            Some(Arc::new(HttpCrowdfundingApi::new(client, cfg.graphql_url.clone())))
        }
        None => None,
    };

    if let (Some(cfg), Some(api)) = (&config.crowdfunding, &crowdfunding_api) {
        orchestrator = orchestrator
            .with_plugin(Arc::new(CrowdfundingPlugin::new(Arc::clone(api), cfg.base_url.clone())));
    }

    if let Some(cfg) = &config.card {
        let client = build_http_client(&config.http_retry, config.fetch_timeout)?;
        let api = HttpCardApi::new(client, cfg.api_url.clone(), cfg.secret_key.clone());
        let base_url = config
            .crowdfunding
            .as_ref()
            .map(|c| c.base_url.clone())
            .unwrap_or_else(|| "https://opencollective.com".to_string());
        orchestrator = orchestrator.with_plugin(Arc::new(CardPlugin::new(
            Arc::new(api),
            crowdfunding_api.clone(),
            cfg.account_label.clone(),
            cfg.crowdfunding_application_id.clone(),
            base_url,
            cfg.correlation_window,
        )));
    }

    if let Some(cfg) = &config.open_banking {
        let client = build_http_client(&config.http_retry, config.fetch_timeout)?;
        let api: Arc<dyn OpenBankingApi> = Arc::new(HttpOpenBankingApi::new(
            client,
            cfg.api_url.clone(),
            cfg.secret_id.clone(),
            cfg.secret_key.clone(),
        ));
        let tokens = Arc::new(TokenCache::new(cfg.access_token.clone()));
        tokens
            .spawn_refresh_loop(
                Arc::clone(&api),
                cfg.token_refresh_interval,
                config.metadata_timeout,
            )
            .await;
        orchestrator =
            orchestrator.with_plugin(Arc::new(OpenBankingPlugin::new(api, tokens)));
    }

    Ok(orchestrator)
}

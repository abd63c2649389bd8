//! Top-level application configuration, loaded from a YAML file with
//! environment-variable overrides.

use std::{collections::HashMap, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use url::Url;

use super::{
    HttpRetryConfig, RpcRetryConfig, StartPosition,
    helpers::deserialize_duration_from_seconds,
};

fn default_block_chunk_size() -> u64 {
    10_000
}

fn default_concurrency() -> usize {
    4
}

fn default_metadata_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_correlation_window() -> Duration {
    Duration::from_secs(30)
}

fn default_token_refresh_interval() -> Duration {
    Duration::from_secs(12 * 60 * 60)
}

fn default_crowdfunding_base_url() -> String {
    "https://opencollective.com".to_string()
}

fn default_account_label() -> String {
    "card-processor".to_string()
}

/// Credentials and endpoints for the card-processor API.
#[derive(Debug, Deserialize, Clone)]
pub struct CardProcessorConfig {
    /// Base URL of the card-processor REST API.
    pub api_url: Url,
    /// API secret key.
    pub secret_key: String,
    /// Label used as the account address when a charge carries none.
    #[serde(default = "default_account_label")]
    pub account_label: String,
    /// Upstream application identifier that marks charges routed through
    /// the crowdfunding platform.
    pub crowdfunding_application_id: Option<String>,
    /// Window after a charge's timestamp in which a matching crowdfunding
    /// credit is searched for.
    #[serde(
        default = "default_correlation_window",
        deserialize_with = "deserialize_duration_from_seconds",
        rename = "correlation_window_secs"
    )]
    pub correlation_window: Duration,
}

/// Endpoint for the crowdfunding platform's GraphQL API.
#[derive(Debug, Deserialize, Clone)]
pub struct CrowdfundingConfig {
    /// GraphQL endpoint URL.
    pub graphql_url: Url,
    /// Public base URL used to build collective profile addresses.
    #[serde(default = "default_crowdfunding_base_url")]
    pub base_url: String,
}

/// Credentials and endpoints for the open-banking aggregator.
#[derive(Debug, Deserialize, Clone)]
pub struct OpenBankingConfig {
    /// Base URL of the aggregator REST API.
    pub api_url: Url,
    /// Secret id used to issue access tokens.
    pub secret_id: String,
    /// Secret key used to issue access tokens.
    pub secret_key: String,
    /// Static access token; when set, issuance and refresh are skipped.
    pub access_token: Option<String>,
    /// How often the background loop refreshes the access token.
    #[serde(
        default = "default_token_refresh_interval",
        deserialize_with = "deserialize_duration_from_seconds",
        rename = "token_refresh_interval_secs"
    )]
    pub token_refresh_interval: Duration,
}

/// Application configuration for ledgersync.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Database URL for the SQLite ledger.
    pub database_url: String,

    /// RPC endpoint URLs keyed by chain identifier (e.g. "gnosis").
    #[serde(default)]
    pub rpc_urls: HashMap<String, Vec<Url>>,

    /// Blocks per scanner chunk.
    #[serde(default = "default_block_chunk_size")]
    pub block_chunk_size: u64,

    /// How many (provider, account) pairs sync concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Where a first-time chain scan starts.
    #[serde(default)]
    pub start_position: StartPosition,

    /// Timeout for small metadata lookups (block timestamps, token calls).
    #[serde(
        default = "default_metadata_timeout",
        deserialize_with = "deserialize_duration_from_seconds",
        rename = "metadata_timeout_secs"
    )]
    pub metadata_timeout: Duration,

    /// Timeout for bulk fetches (log ranges, transaction pages).
    #[serde(
        default = "default_fetch_timeout",
        deserialize_with = "deserialize_duration_from_seconds",
        rename = "fetch_timeout_secs"
    )]
    pub fetch_timeout: Duration,

    /// Grace period for cleanup on shutdown.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration_from_seconds",
        rename = "shutdown_timeout_secs"
    )]
    pub shutdown_timeout: Duration,

    /// Retry policy for chain RPC requests.
    #[serde(default)]
    pub rpc_retry: RpcRetryConfig,

    /// Retry policy for provider HTTP requests.
    #[serde(default)]
    pub http_retry: HttpRetryConfig,

    /// Card-processor credentials; the plugin is disabled when absent.
    pub card: Option<CardProcessorConfig>,

    /// Crowdfunding endpoint; the plugin is disabled when absent.
    pub crowdfunding: Option<CrowdfundingConfig>,

    /// Open-banking credentials; the plugin is disabled when absent.
    pub open_banking: Option<OpenBankingConfig>,
}

impl AppConfig {
    /// Creates a new `AppConfig` by reading from the configuration directory
    /// and `LEDGERSYNC__`-prefixed environment variables.
    pub fn new(config_dir: Option<&str>) -> Result<Self, ConfigError> {
        let config_dir = config_dir.unwrap_or("configs");
        Config::builder()
            .add_source(File::with_name(&format!("{config_dir}/app.yaml")))
            .add_source(Environment::with_prefix("LEDGERSYNC").separator("__"))
            .build()?
            .try_deserialize()
    }
}

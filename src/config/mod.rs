//! Configuration module for ledgersync.

mod app_config;
mod helpers;
mod http_retry;
mod rpc_retry;
mod start_position;

pub use app_config::{
    AppConfig, CardProcessorConfig, CrowdfundingConfig, OpenBankingConfig,
};
pub use helpers::{deserialize_duration_from_ms, deserialize_duration_from_seconds};
pub use http_retry::{HttpRetryConfig, JitterSetting};
pub use rpc_retry::RpcRetryConfig;
pub use start_position::StartPosition;

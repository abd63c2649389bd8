//! The interface the scanner uses to fetch data from an EVM-compatible
//! chain. The concrete RPC client behind it is a black box.

use alloy::{primitives::Address, rpc::types::Log};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

/// Custom error type for chain data-source operations.
#[derive(Error, Debug)]
pub enum DataSourceError {
    /// Error when interacting with the RPC provider.
    #[error("rpc error: {0}")]
    Rpc(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// Indicates that the requested block was not found.
    #[error("block not found: {0}")]
    BlockNotFound(u64),

    /// A call exceeded its bounded timeout.
    #[error("timed out: {0}")]
    Timeout(String),
}

/// A data source that can fetch token-transfer activity from a chain.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainDataSource: Send + Sync {
    /// Fetches raw Transfer logs emitted by `token` over the inclusive
    /// block range.
    async fn transfer_logs(
        &self,
        token: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, DataSourceError>;

    /// Resolves the unix timestamp of a block.
    async fn block_timestamp(&self, number: u64) -> Result<u64, DataSourceError>;

    /// Fetches the current chain head block number.
    async fn head_block(&self) -> Result<u64, DataSourceError>;
}

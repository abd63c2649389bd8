//! Chain RPC provider construction with retry and fallback transport
//! layers, and the thin [`ChainDataSource`] implementation on top of it.

use std::{num::NonZeroUsize, time::Duration};

use alloy::{
    primitives::Address,
    providers::{Provider, ProviderBuilder, layers::CallBatchLayer},
    rpc::{
        client::RpcClient,
        types::{Filter, Log},
    },
    transports::{
        http::{Http, reqwest::Url},
        layers::{FallbackLayer, RetryBackoffLayer},
    },
    sol_types::SolEvent,
};
use async_trait::async_trait;
use tower::ServiceBuilder;

use super::{
    decode::Transfer,
    traits::{ChainDataSource, DataSourceError},
};
use crate::config::RpcRetryConfig;

/// Custom error type for provider construction.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Error when creating the provider.
    #[error("provider creation failed: {0}")]
    Creation(String),
}

/// Creates a provider over the given RPC URLs, retrying transient failures
/// with backoff and falling back across endpoints.
pub fn create_provider(
    urls: Vec<Url>,
    retry_config: &RpcRetryConfig,
) -> Result<impl Provider + use<>, ProviderError> {
    let transport_count = NonZeroUsize::new(urls.len())
        .ok_or_else(|| ProviderError::Creation("RPC URL list cannot be empty".into()))?;

    let fallback_layer =
        FallbackLayer::default().with_active_transport_count(transport_count);
    let transports: Vec<_> = urls.into_iter().map(Http::new).collect();

    let retry_layer = RetryBackoffLayer::new(
        retry_config.max_retry,
        retry_config.backoff_ms,
        retry_config.compute_units_per_second,
    );

    let service =
        ServiceBuilder::new().layer(retry_layer).layer(fallback_layer).service(transports);

    let client = RpcClient::builder().transport(service, false);
    Ok(ProviderBuilder::new().layer(CallBatchLayer::new()).connect_client(client))
}

/// A [`ChainDataSource`] backed by an EVM RPC endpoint.
pub struct EvmRpcSource<P> {
    provider: P,
    metadata_timeout: Duration,
    fetch_timeout: Duration,
}

impl<P> EvmRpcSource<P>
where
    P: Provider,
{
    /// Creates a new `EvmRpcSource`. `metadata_timeout` bounds block
    /// lookups, `fetch_timeout` bounds bulk log fetches.
    pub fn new(provider: P, metadata_timeout: Duration, fetch_timeout: Duration) -> Self {
        Self { provider, metadata_timeout, fetch_timeout }
    }
}

#[async_trait]
impl<P> ChainDataSource for EvmRpcSource<P>
where
    P: Provider + Send + Sync,
{
    #[tracing::instrument(skip(self), level = "debug")]
    async fn transfer_logs(
        &self,
        token: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, DataSourceError> {
        let filter = Filter::new()
            .address(token)
            .event_signature(Transfer::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        let logs = tokio::time::timeout(self.fetch_timeout, self.provider.get_logs(&filter))
            .await
            .map_err(|_| {
                DataSourceError::Timeout(format!("log fetch {from_block}..={to_block}"))
            })?
            .map_err(|e| DataSourceError::Rpc(Box::new(e)))?;

        tracing::debug!(from_block, to_block, count = logs.len(), "Fetched transfer logs.");
        Ok(logs)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn block_timestamp(&self, number: u64) -> Result<u64, DataSourceError> {
        let block = tokio::time::timeout(
            self.metadata_timeout,
            self.provider.get_block_by_number(number.into()),
        )
        .await
        .map_err(|_| DataSourceError::Timeout(format!("block {number} lookup")))?
        .map_err(|e| DataSourceError::Rpc(Box::new(e)))?
        .ok_or(DataSourceError::BlockNotFound(number))?;

        Ok(block.header.timestamp)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn head_block(&self) -> Result<u64, DataSourceError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| DataSourceError::Rpc(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use alloy::{
        primitives::{U256, address},
        providers::ProviderBuilder,
        transports::mock::Asserter,
    };

    use super::*;

    fn mock_source() -> (EvmRpcSource<impl Provider>, Asserter) {
        let asserter = Asserter::new();
        let provider = ProviderBuilder::new().connect_mocked_client(asserter.clone());
        (EvmRpcSource::new(provider, Duration::from_secs(5), Duration::from_secs(30)), asserter)
    }

    #[tokio::test]
    async fn head_block_comes_from_the_node() {
        let (source, asserter) = mock_source();
        asserter.push_success(&U256::from(25_000u64));
        assert_eq!(source.head_block().await.unwrap(), 25_000);
    }

    #[tokio::test]
    async fn transfer_logs_surface_rpc_errors() {
        let (source, asserter) = mock_source();
        asserter.push_failure_msg("filter too wide");
        let result = source
            .transfer_logs(address!("cB444e90D8198415266c6a2724b7900fb12FC56E"), 0, 9_999)
            .await;
        assert!(matches!(result, Err(DataSourceError::Rpc(_))));
    }

    #[tokio::test]
    async fn missing_block_is_reported_as_not_found() {
        let (source, asserter) = mock_source();
        asserter.push_success(&Option::<alloy::rpc::types::Block>::None);
        let result = source.block_timestamp(404).await;
        assert!(matches!(result, Err(DataSourceError::BlockNotFound(404))));
    }

    #[test]
    fn create_provider_rejects_empty_url_list() {
        assert!(matches!(
            create_provider(vec![], &RpcRetryConfig::default()),
            Err(ProviderError::Creation(_))
        ));
    }
}

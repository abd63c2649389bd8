//! Construction of the retryable HTTP clients used by the payment-provider
//! API callers. Transient failures (network blips, rate limits) are retried
//! with exponential backoff at the middleware layer; anything that survives
//! the retries surfaces to the plugin as an upstream error.

use std::time::Duration;

use reqwest::Client as ReqwestClient;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{Jitter, RetryTransientMiddleware, policies::ExponentialBackoff};
use thiserror::Error;

use crate::config::{HttpRetryConfig, JitterSetting};

/// Errors from HTTP client construction.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The underlying `reqwest::Client` could not be built.
    #[error("failed to create HTTP client: {0}")]
    Build(String),
}

/// Builds an HTTP client with retry middleware and a bounded request
/// timeout. Each provider API caller owns one client.
pub fn build_http_client(
    retry: &HttpRetryConfig,
    request_timeout: Duration,
) -> Result<ClientWithMiddleware, HttpClientError> {
    let base_client = ReqwestClient::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .connect_timeout(Duration::from_secs(10))
        .timeout(request_timeout)
        .build()
        .map_err(|e| HttpClientError::Build(e.to_string()))?;

    let policy_builder = match retry.jitter {
        JitterSetting::None => ExponentialBackoff::builder().jitter(Jitter::None),
        JitterSetting::Full => ExponentialBackoff::builder().jitter(Jitter::Full),
    };

    let retry_policy = policy_builder
        .base(retry.base_for_backoff)
        .retry_bounds(retry.initial_backoff_ms, retry.max_backoff_secs)
        .build_with_max_retries(retry.max_retries);

    Ok(ClientBuilder::new(base_client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build())
}

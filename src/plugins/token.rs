//! An owned access-token cache with a background, periodic, time-boxed
//! refresh loop.
//!
//! The cache is an explicit resource with a start/stop lifecycle: the
//! refresh loop is spawned once, renews the token on its own timer
//! independently of `index` calls, and is cancelled by `close()` without
//! cancelling in-flight requests that still hold the cached token.

use std::{sync::Arc, time::Duration};

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::openbanking::OpenBankingApi;
use super::traits::UpstreamError;

/// An issued access/refresh token pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    /// Short-lived bearer token.
    pub access: String,
    /// Long-lived token used to renew `access`.
    pub refresh: String,
}

/// Cached credentials for one open-banking API connection.
pub struct TokenCache {
    /// Static token injected via configuration; short-circuits issuance
    /// and refresh entirely.
    static_token: Option<String>,
    state: RwLock<Option<TokenPair>>,
    cancellation_token: CancellationToken,
    refresh_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TokenCache {
    /// Creates a cache. When `static_token` is set, no issuance or refresh
    /// ever happens.
    pub fn new(static_token: Option<String>) -> Self {
        Self {
            static_token,
            state: RwLock::new(None),
            cancellation_token: CancellationToken::new(),
            refresh_task: Mutex::new(None),
        }
    }

    /// Returns a usable access token: the static override, the cached
    /// token, or a freshly issued pair (cached for subsequent calls).
    pub async fn access_token(
        &self,
        api: &dyn OpenBankingApi,
    ) -> Result<String, UpstreamError> {
        if let Some(token) = &self.static_token {
            return Ok(token.clone());
        }

        if let Some(pair) = self.state.read().await.as_ref() {
            return Ok(pair.access.clone());
        }

        let mut state = self.state.write().await;
        // Another caller may have issued while we waited for the lock.
        if let Some(pair) = state.as_ref() {
            return Ok(pair.access.clone());
        }

        tracing::debug!("No cached access token; issuing a new pair.");
        let pair = api.issue_token().await?;
        let access = pair.access.clone();
        *state = Some(pair);
        Ok(access)
    }

    /// Spawns the background refresh loop. Each renewal is bounded by
    /// `refresh_timeout`; a failed renewal keeps the previous token and
    /// retries on the next tick.
    pub async fn spawn_refresh_loop(
        self: &Arc<Self>,
        api: Arc<dyn OpenBankingApi>,
        interval: Duration,
        refresh_timeout: Duration,
    ) {
        if self.static_token.is_some() {
            return;
        }

        let cache = Arc::clone(self);
        let token = self.cancellation_token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        tracing::info!("Token refresh loop cancelled.");
                        break;
                    }

                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = cache.refresh_once(api.as_ref(), refresh_timeout).await {
                            tracing::warn!(error = %e, "Access token refresh failed; keeping previous token.");
                        }
                    }
                }
            }
        });

        *self.refresh_task.lock().await = Some(handle);
    }

    /// Performs one time-boxed refresh, replacing the cached access token.
    async fn refresh_once(
        &self,
        api: &dyn OpenBankingApi,
        refresh_timeout: Duration,
    ) -> Result<(), UpstreamError> {
        let refresh = match self.state.read().await.as_ref() {
            Some(pair) => pair.refresh.clone(),
            // Nothing issued yet; the next access_token call will issue.
            None => return Ok(()),
        };

        let access = tokio::time::timeout(refresh_timeout, api.refresh_token(&refresh))
            .await
            .map_err(|_| UpstreamError::Transport("token refresh timed out".into()))??;

        if let Some(pair) = self.state.write().await.as_mut() {
            pair.access = access;
            tracing::debug!("Access token refreshed.");
        }
        Ok(())
    }

    /// Cancels the refresh loop and waits for it to stop. Idempotent.
    pub async fn close(&self) {
        self.cancellation_token.cancel();
        if let Some(handle) = self.refresh_task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

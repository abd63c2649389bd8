//! The crowdfunding-platform plugin: lists a collective's transactions
//! since the cursor over GraphQL and maps them onto the normalized schema.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
#[cfg(test)]
use mockall::automock;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::traits::{IndexBatch, PluginError, ProviderPlugin, UpstreamError};
use crate::models::{
    Cursor, Provider, Transaction, TransactionDefaults, TransactionType,
    transaction::CounterpartyProfile,
};

/// A provider-native crowdfunding transaction.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrowdfundingTransaction {
    /// Stable transaction uuid.
    pub uuid: String,
    /// When the transaction was created.
    pub created_at: DateTime<Utc>,
    /// Amount in minor units of `host_currency`.
    pub amount: i64,
    /// Currency code.
    pub host_currency: String,
    /// Human description.
    #[serde(default)]
    pub description: Option<String>,
    /// Slug of the contributing collective.
    pub from_slug: String,
    /// Display name of the contributing collective.
    pub from_name: String,
    /// Avatar URL of the contributing collective.
    #[serde(default)]
    pub from_image_url: Option<String>,
    /// Total amount of the originating order, when the transaction settles
    /// one.
    #[serde(default)]
    pub order_total: Option<i64>,
}

/// Black-box client for the crowdfunding platform's transaction listing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CrowdfundingApi: Send + Sync {
    /// Lists a collective's transactions, newest last, within the given
    /// bounds. `credit_only` restricts the listing to CREDIT entries.
    async fn list_transactions(
        &self,
        collective_slug: &str,
        date_from: Option<DateTime<Utc>>,
        date_to: Option<DateTime<Utc>>,
        credit_only: bool,
        limit: Option<u32>,
    ) -> Result<Vec<CrowdfundingTransaction>, UpstreamError>;
}

/// The crowdfunding provider plugin.
pub struct CrowdfundingPlugin {
    api: Arc<dyn CrowdfundingApi>,
    base_url: String,
}

impl CrowdfundingPlugin {
    /// Creates the plugin. `base_url` is the platform's public site, used
    /// to build profile addresses.
    pub fn new(api: Arc<dyn CrowdfundingApi>, base_url: String) -> Self {
        Self { api, base_url: base_url.trim_end_matches('/').to_string() }
    }

    /// Builds the public profile URL for a collective slug.
    fn profile_url(&self, slug: &str) -> String {
        format!("{}/{}", self.base_url, slug)
    }
}

#[async_trait]
impl ProviderPlugin for CrowdfundingPlugin {
    fn provider(&self) -> Provider {
        Provider::Crowdfunding
    }

    #[tracing::instrument(skip(self, defaults), level = "debug")]
    async fn index<'c>(
        &self,
        provider_account: &str,
        defaults: &TransactionDefaults,
        cursor: Option<&'c Cursor>,
    ) -> Result<IndexBatch, PluginError> {
        // Accounts may arrive as full profile URLs; the slug is the last
        // path segment either way.
        let slug = provider_account
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PluginError::InvalidAccount(provider_account.to_string()))?;

        let since = cursor.and_then(Cursor::as_timestamp);
        tracing::info!(slug, since = ?since, "Indexing crowdfunding transactions.");

        let upstream = self
            .api
            .list_transactions(slug, since, None, false, None)
            .await
            .map_err(PluginError::from)?;

        let mut transactions = Vec::with_capacity(upstream.len());
        for record in upstream {
            let mut tx = Transaction {
                timestamp: record.created_at,
                provider: Provider::Crowdfunding,
                provider_account: provider_account.to_string(),
                provider_tx_id: record.uuid,
                account_address: Some(self.profile_url(slug)),
                counterparty_address: Some(self.profile_url(&record.from_slug)),
                counterparty_name: Some(record.from_name.clone()),
                counterparty_profile: Some(CounterpartyProfile {
                    name: record.from_name,
                    url: Some(self.profile_url(&record.from_slug)),
                    image_url: record.from_image_url,
                }),
                value: record.amount,
                token_symbol: record.host_currency,
                token_decimals: 2,
                tx_type: TransactionType::Transfer,
                tags: None,
                description: record.description.map(|d| d.trim().to_string()),
                invoice_uuid: None,
                data: None,
            };
            tx.apply_defaults(defaults);
            transactions.push(tx);
        }

        Ok(IndexBatch::from_transactions(transactions))
    }
}

const TRANSACTIONS_QUERY: &str = r#"
  query getTransactions(
    $collectiveSlug: String!
    $dateFrom: String
    $dateTo: String
    $type: String
    $limit: Int
  ) {
    allTransactions(
      collectiveSlug: $collectiveSlug
      dateFrom: $dateFrom
      dateTo: $dateTo
      type: $type
      limit: $limit
    ) {
      id
      uuid
      createdAt
      hostCurrency
      amount
      description
      fromCollective {
        slug
        name
        imageUrl
      }
      ... on Order {
        order {
          totalAmount
        }
      }
    }
  }
"#;

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope {
    #[serde(default)]
    data: Option<GraphQlData>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlData {
    #[serde(default)]
    all_transactions: Option<Vec<RawTransaction>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    uuid: String,
    created_at: DateTime<Utc>,
    amount: i64,
    host_currency: String,
    #[serde(default)]
    description: Option<String>,
    from_collective: RawCollective,
    #[serde(default)]
    order: Option<RawOrder>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCollective {
    slug: String,
    name: String,
    #[serde(default)]
    image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    #[serde(default)]
    total_amount: Option<i64>,
}

/// GraphQL-over-HTTP implementation of [`CrowdfundingApi`].
pub struct HttpCrowdfundingApi {
    client: ClientWithMiddleware,
    graphql_url: Url,
}

impl HttpCrowdfundingApi {
    /// Creates the client against the platform's GraphQL endpoint.
    pub fn new(client: ClientWithMiddleware, graphql_url: Url) -> Self {
        Self { client, graphql_url }
    }
}

#[async_trait]
impl CrowdfundingApi for HttpCrowdfundingApi {
    async fn list_transactions(
        &self,
        collective_slug: &str,
        date_from: Option<DateTime<Utc>>,
        date_to: Option<DateTime<Utc>>,
        credit_only: bool,
        limit: Option<u32>,
    ) -> Result<Vec<CrowdfundingTransaction>, UpstreamError> {
        let variables = json!({
            "collectiveSlug": collective_slug,
            "dateFrom": date_from.map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, true)),
            "dateTo": date_to.map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, true)),
            "type": credit_only.then_some("CREDIT"),
            "limit": limit,
        });

        let response = self
            .client
            .post(self.graphql_url.clone())
            .json(&json!({ "query": TRANSACTIONS_QUERY, "variables": variables }))
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(UpstreamError::Auth(format!("graphql endpoint returned {status}")));
        }
        if !status.is_success() {
            return Err(UpstreamError::Transport(format!("graphql endpoint returned {status}")));
        }

        let envelope: GraphQlEnvelope =
            response.json().await.map_err(|e| UpstreamError::Decode(e.to_string()))?;

        if let Some(errors) = envelope.errors {
            return Err(UpstreamError::Decode(format!("graphql errors: {errors}")));
        }

        let raw = envelope.data.and_then(|d| d.all_transactions).unwrap_or_default();
        Ok(raw
            .into_iter()
            .map(|t| CrowdfundingTransaction {
                uuid: t.uuid,
                created_at: t.created_at,
                amount: t.amount,
                host_currency: t.host_currency,
                description: t.description,
                from_slug: t.from_collective.slug,
                from_name: t.from_collective.name,
                from_image_url: t.from_collective.image_url,
                order_total: t.order.and_then(|o| o.total_amount),
            })
            .collect())
    }
}

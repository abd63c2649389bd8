//! The card-processor plugin: lists charges since the cursor, expands
//! processing fees into their own FEE records, enriches from checkout
//! sessions, and best-effort correlates charges routed through the
//! crowdfunding platform.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use serde_json::json;
use url::Url;
use uuid::Uuid;

use super::{
    crowdfunding::{CrowdfundingApi, CrowdfundingTransaction},
    traits::{IndexBatch, PluginError, ProviderPlugin, UpstreamError},
};
use crate::models::{
    Cursor, Provider, Transaction, TransactionDefaults, TransactionType,
    transaction::CounterpartyProfile, units,
};

/// A provider-native charge.
#[derive(Debug, Clone, Deserialize)]
pub struct Charge {
    /// Charge identifier.
    pub id: String,
    /// Creation time, unix seconds.
    pub created: i64,
    /// Amount in minor units.
    pub amount: i64,
    /// Lowercase currency code.
    pub currency: String,
    /// Human description.
    #[serde(default)]
    pub description: Option<String>,
    /// Name from the billing details.
    #[serde(default)]
    pub billing_name: Option<String>,
    /// Destination account address from the charge metadata, when set.
    #[serde(default)]
    pub destination_account: Option<String>,
    /// Payment-intent id, when the charge came through checkout.
    #[serde(default)]
    pub payment_intent: Option<String>,
    /// Balance-transaction id carrying the fee breakdown.
    #[serde(default)]
    pub balance_transaction: Option<String>,
}

/// One fee line item of a balance transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct FeeDetail {
    /// Fee kind (e.g. "stripe_fee", "application_fee").
    #[serde(rename = "type")]
    pub fee_type: String,
    /// Fee amount in minor units, positive.
    pub amount: i64,
    /// Lowercase currency code.
    pub currency: String,
    /// Human description.
    #[serde(default)]
    pub description: Option<String>,
    /// Application the fee accrues to, when not the processor itself.
    #[serde(default)]
    pub application: Option<String>,
}

/// The balance transaction backing a charge.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceTransaction {
    /// Balance-transaction identifier.
    pub id: String,
    /// Fee breakdown.
    #[serde(default)]
    pub fee_details: Vec<FeeDetail>,
}

/// A line item of the checkout session behind a payment intent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionLineItem {
    /// Item description.
    #[serde(default)]
    pub description: Option<String>,
    /// Quantity purchased.
    #[serde(default)]
    pub quantity: Option<u64>,
    /// Total amount in minor units.
    #[serde(default)]
    pub amount_total: Option<i64>,
    /// Product identifier.
    #[serde(default)]
    pub product_id: Option<String>,
    /// Price identifier.
    #[serde(default)]
    pub price_id: Option<String>,
}

/// Checkout-session details for a payment intent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionDetails {
    /// Caller-supplied description from the session metadata.
    #[serde(default)]
    pub metadata_description: Option<String>,
    /// Caller-supplied account address from the session metadata.
    #[serde(default)]
    pub metadata_account_address: Option<String>,
    /// The session's line items.
    #[serde(default)]
    pub line_items: Vec<SessionLineItem>,
}

/// Black-box client for the card processor's REST API.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CardApi: Send + Sync {
    /// Lists charges created at or after the given time, oldest first.
    async fn list_charges(
        &self,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Charge>, UpstreamError>;

    /// Retrieves the balance transaction carrying a charge's fee
    /// breakdown.
    async fn balance_transaction(&self, id: &str) -> Result<BalanceTransaction, UpstreamError>;

    /// Retrieves the checkout-session details behind a payment intent, if
    /// any session exists.
    async fn session_details(
        &self,
        payment_intent: &str,
    ) -> Result<Option<SessionDetails>, UpstreamError>;
}

/// The card-processor provider plugin.
pub struct CardPlugin {
    api: Arc<dyn CardApi>,
    /// Crowdfunding listing used for best-effort correlation; `None`
    /// disables enrichment entirely.
    crowdfunding: Option<Arc<dyn CrowdfundingApi>>,
    account_label: String,
    crowdfunding_application_id: Option<String>,
    crowdfunding_base_url: String,
    correlation_window: Duration,
}

impl CardPlugin {
    /// Creates the plugin.
    pub fn new(
        api: Arc<dyn CardApi>,
        crowdfunding: Option<Arc<dyn CrowdfundingApi>>,
        account_label: String,
        crowdfunding_application_id: Option<String>,
        crowdfunding_base_url: String,
        correlation_window: Duration,
    ) -> Self {
        Self {
            api,
            crowdfunding,
            account_label,
            crowdfunding_application_id,
            crowdfunding_base_url: crowdfunding_base_url.trim_end_matches('/').to_string(),
            correlation_window,
        }
    }

    /// Display label for the application a fee accrues to.
    fn application_label(&self, application: Option<&str>) -> String {
        match (application, &self.crowdfunding_application_id) {
            (Some(app), Some(known)) if app == known => "crowdfunding".to_string(),
            _ => self.account_label.clone(),
        }
    }

    /// Looks for the crowdfunding credit a routed charge settled: a CREDIT
    /// within `[created_at, created_at + window]` whose originating order
    /// total exactly equals `amount`. Best-effort; any failure means no
    /// enrichment.
    async fn correlate(
        &self,
        slug: &str,
        created_at: DateTime<Utc>,
        amount: i64,
    ) -> Option<CrowdfundingTransaction> {
        let api = self.crowdfunding.as_ref()?;
        let window = chrono::Duration::from_std(self.correlation_window).ok()?;
        let window_end = created_at.checked_add_signed(window)?;

        let credits = match api
            .list_transactions(slug, Some(created_at), Some(window_end), true, None)
            .await
        {
            Ok(credits) => credits,
            Err(e) => {
                tracing::warn!(slug, error = %e, "Correlation lookup failed; keeping record unenriched.");
                return None;
            }
        };

        // Latest matching credit wins; the bounds are re-checked here so a
        // sloppy upstream window cannot widen the contract.
        credits.into_iter().rev().find(|credit| {
            credit.order_total == Some(amount)
                && credit.created_at >= created_at
                && credit.created_at <= window_end
        })
    }

    /// Builds the FEE records for one charge, sharing its invoice uuid.
    fn expand_fees(
        &self,
        charge: &Charge,
        balance: &BalanceTransaction,
        timestamp: DateTime<Utc>,
        account_address: &str,
        provider_account: &str,
        invoice_uuid: Uuid,
        defaults: &TransactionDefaults,
    ) -> Vec<Transaction> {
        balance
            .fee_details
            .iter()
            .map(|fee| {
                let mut tx = Transaction {
                    timestamp,
                    provider: Provider::CardProcessor,
                    provider_account: provider_account.to_string(),
                    provider_tx_id: format!("{}-{}", charge.id, fee.fee_type),
                    account_address: Some(account_address.to_string()),
                    counterparty_address: fee.application.clone(),
                    counterparty_name: Some(self.application_label(fee.application.as_deref())),
                    counterparty_profile: None,
                    value: -fee.amount,
                    token_symbol: fee.currency.to_uppercase(),
                    token_decimals: 2,
                    tx_type: TransactionType::Fee,
                    tags: None,
                    description: fee.description.clone(),
                    invoice_uuid: Some(invoice_uuid),
                    data: None,
                };
                tx.apply_defaults(defaults);
                tx
            })
            .collect()
    }
}

#[async_trait]
impl ProviderPlugin for CardPlugin {
    fn provider(&self) -> Provider {
        Provider::CardProcessor
    }

    #[tracing::instrument(skip(self, defaults), level = "debug")]
    async fn index<'c>(
        &self,
        provider_account: &str,
        defaults: &TransactionDefaults,
        cursor: Option<&'c Cursor>,
    ) -> Result<IndexBatch, PluginError> {
        let since = cursor.and_then(Cursor::as_timestamp);
        tracing::info!(account = provider_account, since = ?since, "Indexing card charges.");

        let charges = self.api.list_charges(since).await.map_err(PluginError::from)?;

        let mut transactions = Vec::new();
        for charge in charges {
            let timestamp = match units::timestamp_from_unix_seconds(charge.created) {
                Ok(ts) => ts,
                Err(e) => {
                    tracing::warn!(charge = %charge.id, error = %e, "Dropping charge with unrepresentable timestamp.");
                    continue;
                }
            };

            // Every record expanded from this charge shares one invoice id.
            let invoice_uuid = Uuid::new_v4();
            let account_address = charge
                .destination_account
                .clone()
                .unwrap_or_else(|| self.account_label.clone());
            let mut data = serde_json::Map::new();

            let mut tx = Transaction {
                timestamp,
                provider: Provider::CardProcessor,
                provider_account: provider_account.to_string(),
                provider_tx_id: charge.id.clone(),
                account_address: Some(account_address.clone()),
                counterparty_address: None,
                counterparty_name: charge.billing_name.clone(),
                counterparty_profile: None,
                value: charge.amount,
                token_symbol: charge.currency.to_uppercase(),
                token_decimals: 2,
                tx_type: TransactionType::Transfer,
                tags: None,
                description: charge.description.clone(),
                invoice_uuid: Some(invoice_uuid),
                data: None,
            };

            // A destination inside the crowdfunding platform marks a routed
            // charge; try to resolve who actually contributed.
            if account_address.starts_with(&self.crowdfunding_base_url) {
                data.insert("via".to_string(), json!("crowdfunding"));
                if let Some(slug) =
                    account_address.trim_end_matches('/').rsplit('/').next()
                {
                    if let Some(credit) =
                        self.correlate(slug, timestamp, charge.amount).await
                    {
                        let profile_url = format!(
                            "{}/{}",
                            self.crowdfunding_base_url, credit.from_slug
                        );
                        tx.counterparty_address = Some(profile_url.clone());
                        tx.counterparty_profile = Some(CounterpartyProfile {
                            name: credit.from_name,
                            url: Some(profile_url),
                            image_url: credit.from_image_url,
                        });
                    }
                }
            }

            // Fee expansion; a failed sub-fetch degrades to the primary
            // record alone.
            if let Some(balance_id) = &charge.balance_transaction {
                match self.api.balance_transaction(balance_id).await {
                    Ok(balance) => transactions.extend(self.expand_fees(
                        &charge,
                        &balance,
                        timestamp,
                        &account_address,
                        provider_account,
                        invoice_uuid,
                        defaults,
                    )),
                    Err(e) => {
                        tracing::warn!(charge = %charge.id, error = %e, "Fee lookup failed; emitting charge without fee records.");
                    }
                }
            }

            // Checkout-session enrichment, also best-effort.
            if let Some(payment_intent) = &charge.payment_intent {
                match self.api.session_details(payment_intent).await {
                    Ok(Some(details)) => {
                        if let Some(description) = details.metadata_description {
                            tx.description = Some(description);
                            if let Some(address) = details.metadata_account_address {
                                tx.counterparty_address = Some(address);
                            }
                        } else if let Some(item) = details.line_items.first() {
                            if item.description.is_some() {
                                tx.description = item.description.clone();
                            }
                            if let Some(product_id) = &item.product_id {
                                data.insert("product_id".to_string(), json!(product_id));
                            }
                            if let Some(price_id) = &item.price_id {
                                data.insert("price_id".to_string(), json!(price_id));
                            }
                            if let Some(quantity) = item.quantity {
                                data.insert("quantity".to_string(), json!(quantity));
                            }
                            if let Some(unit_price) = item.amount_total {
                                data.insert("unit_price".to_string(), json!(unit_price));
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(charge = %charge.id, error = %e, "Session lookup failed; keeping charge as-is.");
                    }
                }
            }

            if !data.is_empty() {
                tx.data = Some(serde_json::Value::Object(data));
            }
            tx.apply_defaults(defaults);
            transactions.push(tx);
        }

        Ok(IndexBatch::from_transactions(transactions))
    }
}

#[derive(Debug, Deserialize)]
struct ChargeList {
    data: Vec<RawCharge>,
}

#[derive(Debug, Deserialize)]
struct RawCharge {
    id: String,
    created: i64,
    amount: i64,
    currency: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    billing_details: Option<RawBillingDetails>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    balance_transaction: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBillingDetails {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionList {
    data: Vec<RawSession>,
}

#[derive(Debug, Deserialize)]
struct RawSession {
    id: String,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct LineItemList {
    data: Vec<RawLineItem>,
}

#[derive(Debug, Deserialize)]
struct RawLineItem {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    quantity: Option<u64>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    price: Option<RawPrice>,
}

#[derive(Debug, Deserialize)]
struct RawPrice {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    product: Option<String>,
}

/// REST implementation of [`CardApi`].
pub struct HttpCardApi {
    client: ClientWithMiddleware,
    api_url: Url,
    secret_key: String,
}

impl HttpCardApi {
    /// Creates the client against the processor's REST API.
    pub fn new(client: ClientWithMiddleware, api_url: Url, secret_key: String) -> Self {
        Self { client, api_url, secret_key }
    }

    fn endpoint(&self, path: &str) -> Result<Url, UpstreamError> {
        self.api_url.join(path).map_err(|e| UpstreamError::Transport(e.to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, UpstreamError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(UpstreamError::Auth(format!("card api returned {status}")));
        }
        if !status.is_success() {
            return Err(UpstreamError::Transport(format!("card api returned {status}")));
        }
        response.json().await.map_err(|e| UpstreamError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CardApi for HttpCardApi {
    async fn list_charges(
        &self,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Charge>, UpstreamError> {
        let mut query: Vec<(&str, String)> = vec![("limit", "100".to_string())];
        if let Some(after) = created_after {
            query.push(("created[gte]", after.timestamp().to_string()));
        }

        let list: ChargeList =
            self.get_json(self.endpoint("v1/charges")?, &query).await?;

        Ok(list
            .data
            .into_iter()
            .map(|raw| Charge {
                id: raw.id,
                created: raw.created,
                amount: raw.amount,
                currency: raw.currency,
                description: raw.description,
                billing_name: raw.billing_details.and_then(|b| b.name),
                destination_account: raw
                    .metadata
                    .get("to")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                payment_intent: raw.payment_intent,
                balance_transaction: raw.balance_transaction,
            })
            .collect())
    }

    async fn balance_transaction(&self, id: &str) -> Result<BalanceTransaction, UpstreamError> {
        self.get_json(self.endpoint(&format!("v1/balance_transactions/{id}"))?, &[]).await
    }

    async fn session_details(
        &self,
        payment_intent: &str,
    ) -> Result<Option<SessionDetails>, UpstreamError> {
        let sessions: SessionList = self
            .get_json(
                self.endpoint("v1/checkout/sessions")?,
                &[("payment_intent", payment_intent.to_string())],
            )
            .await?;
        let Some(session) = sessions.data.into_iter().next() else {
            return Ok(None);
        };

        let items: LineItemList = self
            .get_json(
                self.endpoint(&format!("v1/checkout/sessions/{}/line_items", session.id))?,
                &[],
            )
            .await?;

        Ok(Some(SessionDetails {
            metadata_description: session
                .metadata
                .get("description")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            metadata_account_address: session
                .metadata
                .get("accountAddress")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            line_items: items
                .data
                .into_iter()
                .map(|raw| SessionLineItem {
                    description: raw.description,
                    quantity: raw.quantity,
                    amount_total: raw.amount_total,
                    product_id: raw.price.as_ref().and_then(|p| p.product.clone()),
                    price_id: raw.price.and_then(|p| p.id),
                })
                .collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::plugins::crowdfunding::MockCrowdfundingApi;

    const BASE_URL: &str = "https://opencollective.com";

    fn charge_at(created: i64) -> Charge {
        Charge {
            id: "ch_1".into(),
            created,
            amount: 12_100,
            currency: "eur".into(),
            description: Some("ticket".into()),
            billing_name: Some("Jo Doe".into()),
            destination_account: None,
            payment_intent: None,
            balance_transaction: None,
        }
    }

    fn credit_at(ts: DateTime<Utc>, order_total: i64) -> CrowdfundingTransaction {
        CrowdfundingTransaction {
            uuid: "credit-uuid".into(),
            created_at: ts,
            amount: order_total,
            host_currency: "EUR".into(),
            description: None,
            from_slug: "a-backer".into(),
            from_name: "A Backer".into(),
            from_image_url: None,
            order_total: Some(order_total),
        }
    }

    fn plugin(api: MockCardApi, crowdfunding: Option<MockCrowdfundingApi>) -> CardPlugin {
        CardPlugin::new(
            Arc::new(api),
            crowdfunding.map(|c| Arc::new(c) as Arc<dyn CrowdfundingApi>),
            "card-processor".into(),
            Some("ca_known_app".into()),
            BASE_URL.into(),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn one_charge_with_two_fees_yields_three_records_sharing_an_invoice() {
        let mut api = MockCardApi::new();
        api.expect_list_charges().times(1).returning(|_| {
            Ok(vec![Charge {
                balance_transaction: Some("txn_1".into()),
                ..charge_at(1_725_271_807)
            }])
        });
        api.expect_balance_transaction().times(1).returning(|_| {
            Ok(BalanceTransaction {
                id: "txn_1".into(),
                fee_details: vec![
                    FeeDetail {
                        fee_type: "processing_fee".into(),
                        amount: 250,
                        currency: "eur".into(),
                        description: Some("processing".into()),
                        application: None,
                    },
                    FeeDetail {
                        fee_type: "application_fee".into(),
                        amount: 100,
                        currency: "eur".into(),
                        description: None,
                        application: Some("ca_known_app".into()),
                    },
                ],
            })
        });

        let plugin = plugin(api, None);
        let batch =
            plugin.index("acct_main", &TransactionDefaults::default(), None).await.unwrap();

        assert_eq!(batch.transactions.len(), 3);

        let invoice = batch.transactions[0].invoice_uuid.unwrap();
        assert!(batch.transactions.iter().all(|tx| tx.invoice_uuid == Some(invoice)));

        let fees: Vec<_> = batch
            .transactions
            .iter()
            .filter(|tx| tx.tx_type == TransactionType::Fee)
            .collect();
        assert_eq!(fees.len(), 2);
        assert!(fees.iter().all(|tx| tx.value < 0));
        assert!(fees.iter().any(|tx| tx.provider_tx_id == "ch_1-processing_fee"));
        assert!(fees.iter().any(|tx| tx.provider_tx_id == "ch_1-application_fee"));
        // The application fee maps to the known crowdfunding application.
        let app_fee =
            fees.iter().find(|tx| tx.provider_tx_id == "ch_1-application_fee").unwrap();
        assert_eq!(app_fee.counterparty_name.as_deref(), Some("crowdfunding"));

        let primary = batch
            .transactions
            .iter()
            .find(|tx| tx.tx_type == TransactionType::Transfer)
            .unwrap();
        assert_eq!(primary.provider_tx_id, "ch_1");
        assert_eq!(primary.value, 12_100);
    }

    #[tokio::test]
    async fn routed_charge_is_enriched_when_a_credit_matches_inside_the_window() {
        let created = Utc.with_ymd_and_hms(2024, 9, 2, 11, 4, 20).unwrap();
        let mut api = MockCardApi::new();
        api.expect_list_charges().times(1).returning(move |_| {
            Ok(vec![Charge {
                destination_account: Some(format!("{BASE_URL}/commons-hub")),
                ..charge_at(created.timestamp())
            }])
        });

        let mut crowdfunding = MockCrowdfundingApi::new();
        crowdfunding
            .expect_list_transactions()
            .withf(move |slug, from, to, credit_only, _| {
                slug == "commons-hub"
                    && *from == Some(created)
                    && *to == Some(created + chrono::Duration::seconds(30))
                    && *credit_only
            })
            .times(1)
            .returning(move |_, _, _, _, _| {
                Ok(vec![credit_at(created + chrono::Duration::seconds(10), 12_100)])
            });

        let plugin = plugin(api, Some(crowdfunding));
        let batch =
            plugin.index("acct_main", &TransactionDefaults::default(), None).await.unwrap();

        let tx = &batch.transactions[0];
        assert_eq!(tx.counterparty_address.as_deref(), Some("https://opencollective.com/a-backer"));
        let profile = tx.counterparty_profile.as_ref().unwrap();
        assert_eq!(profile.name, "A Backer");
        assert_eq!(tx.data.as_ref().unwrap()["via"], "crowdfunding");
    }

    #[tokio::test]
    async fn no_enrichment_outside_the_window_or_on_amount_mismatch() {
        let created = Utc.with_ymd_and_hms(2024, 9, 2, 11, 4, 20).unwrap();

        for (offset_secs, order_total) in [(31i64, 12_100i64), (10, 9_999)] {
            let mut api = MockCardApi::new();
            api.expect_list_charges().times(1).returning(move |_| {
                Ok(vec![Charge {
                    destination_account: Some(format!("{BASE_URL}/commons-hub")),
                    ..charge_at(created.timestamp())
                }])
            });

            let mut crowdfunding = MockCrowdfundingApi::new();
            crowdfunding.expect_list_transactions().times(1).returning(move |_, _, _, _, _| {
                Ok(vec![credit_at(
                    created + chrono::Duration::seconds(offset_secs),
                    order_total,
                )])
            });

            let plugin = plugin(api, Some(crowdfunding));
            let batch = plugin
                .index("acct_main", &TransactionDefaults::default(), None)
                .await
                .unwrap();

            let tx = &batch.transactions[0];
            assert!(tx.counterparty_profile.is_none());
            // The routing marker stays even when correlation finds nothing.
            assert_eq!(tx.data.as_ref().unwrap()["via"], "crowdfunding");
        }
    }

    #[tokio::test]
    async fn correlation_failure_keeps_the_record_unenriched() {
        let created = Utc.with_ymd_and_hms(2024, 9, 2, 11, 4, 20).unwrap();
        let mut api = MockCardApi::new();
        api.expect_list_charges().times(1).returning(move |_| {
            Ok(vec![Charge {
                destination_account: Some(format!("{BASE_URL}/commons-hub")),
                ..charge_at(created.timestamp())
            }])
        });

        let mut crowdfunding = MockCrowdfundingApi::new();
        crowdfunding.expect_list_transactions().times(1).returning(|_, _, _, _, _| {
            Err(UpstreamError::Transport("timed out".into()))
        });

        let plugin = plugin(api, Some(crowdfunding));
        let batch =
            plugin.index("acct_main", &TransactionDefaults::default(), None).await.unwrap();
        assert_eq!(batch.transactions.len(), 1);
        assert!(batch.transactions[0].counterparty_profile.is_none());
    }

    #[tokio::test]
    async fn failed_fee_lookup_degrades_to_the_primary_record() {
        let mut api = MockCardApi::new();
        api.expect_list_charges().times(1).returning(|_| {
            Ok(vec![Charge {
                balance_transaction: Some("txn_1".into()),
                ..charge_at(1_725_271_807)
            }])
        });
        api.expect_balance_transaction()
            .times(1)
            .returning(|_| Err(UpstreamError::Transport("rate limited".into())));

        let plugin = plugin(api, None);
        let batch =
            plugin.index("acct_main", &TransactionDefaults::default(), None).await.unwrap();
        assert_eq!(batch.transactions.len(), 1);
        assert_eq!(batch.transactions[0].provider_tx_id, "ch_1");
    }

    #[tokio::test]
    async fn auth_failure_is_upstream_unavailable() {
        let mut api = MockCardApi::new();
        api.expect_list_charges()
            .times(1)
            .returning(|_| Err(UpstreamError::Auth("invalid api key".into())));

        let plugin = plugin(api, None);
        let result = plugin.index("acct_main", &TransactionDefaults::default(), None).await;
        assert!(matches!(result, Err(PluginError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn defaults_fill_tags_and_cursor_tracks_the_latest_charge() {
        let mut api = MockCardApi::new();
        api.expect_list_charges().times(1).returning(|_| {
            Ok(vec![
                charge_at(1_725_271_807),
                Charge { id: "ch_2".into(), ..charge_at(1_725_271_907) },
            ])
        });

        let plugin = plugin(api, None);
        let defaults =
            TransactionDefaults { tags: Some("EUR, card".into()), ..Default::default() };
        let batch = plugin.index("acct_main", &defaults, None).await.unwrap();

        assert!(batch.transactions.iter().all(|tx| tx.tags.as_deref() == Some("EUR, card")));
        let expected = units::timestamp_from_unix_seconds(1_725_271_907).unwrap();
        assert_eq!(batch.next_cursor, Some(Cursor::Timestamp(expected)));
    }
}

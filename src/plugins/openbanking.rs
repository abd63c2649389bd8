//! The open-banking plugin: lists an account's booked transactions since
//! the cursor. Amounts arrive as decimal strings and cross the fixed-point
//! boundary here; the access token comes from the owned [`TokenCache`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
#[cfg(test)]
use mockall::automock;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::{
    token::{TokenCache, TokenPair},
    traits::{IndexBatch, PluginError, ProviderPlugin, UpstreamError},
};
use crate::models::{
    Cursor, Provider, Transaction, TransactionDefaults, TransactionType, units,
};

/// A provider-native booked bank transaction.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookedTransaction {
    /// Aggregator-stable transaction identifier.
    pub internal_transaction_id: String,
    /// When the transaction was booked.
    pub booking_date_time: DateTime<Utc>,
    /// Signed decimal amount string (e.g. `"-12.34"`).
    pub amount: String,
    /// Currency code.
    pub currency: String,
    /// Free-text information from the bank.
    #[serde(default)]
    pub additional_information: Option<String>,
    /// Unstructured remittance information.
    #[serde(default)]
    pub remittance_information: Option<String>,
    /// Proprietary bank transaction code.
    #[serde(default)]
    pub bank_transaction_code: Option<String>,
    /// Debtor name, present on incoming transactions.
    #[serde(default)]
    pub debtor_name: Option<String>,
    /// Debtor IBAN.
    #[serde(default)]
    pub debtor_iban: Option<String>,
    /// Creditor name, present on outgoing transactions.
    #[serde(default)]
    pub creditor_name: Option<String>,
    /// Creditor IBAN.
    #[serde(default)]
    pub creditor_iban: Option<String>,
}

/// Black-box client for the open-banking aggregator's REST API.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OpenBankingApi: Send + Sync {
    /// Issues a fresh access/refresh token pair from the configured
    /// secrets.
    async fn issue_token(&self) -> Result<TokenPair, UpstreamError>;

    /// Renews an access token from a refresh token.
    async fn refresh_token(&self, refresh: &str) -> Result<String, UpstreamError>;

    /// Lists an account's booked transactions from `date_from` onward.
    async fn list_booked_transactions(
        &self,
        account_id: &str,
        access_token: &str,
        date_from: Option<NaiveDate>,
    ) -> Result<Vec<BookedTransaction>, UpstreamError>;
}

/// The open-banking provider plugin.
pub struct OpenBankingPlugin {
    api: Arc<dyn OpenBankingApi>,
    tokens: Arc<TokenCache>,
}

impl OpenBankingPlugin {
    /// Creates the plugin around an API client and its token cache. The
    /// caller decides whether to start the cache's refresh loop.
    pub fn new(api: Arc<dyn OpenBankingApi>, tokens: Arc<TokenCache>) -> Self {
        Self { api, tokens }
    }
}

#[async_trait]
impl ProviderPlugin for OpenBankingPlugin {
    fn provider(&self) -> Provider {
        Provider::OpenBanking
    }

    #[tracing::instrument(skip(self, defaults), level = "debug")]
    async fn index<'c>(
        &self,
        provider_account: &str,
        defaults: &TransactionDefaults,
        cursor: Option<&'c Cursor>,
    ) -> Result<IndexBatch, PluginError> {
        let since = cursor.and_then(Cursor::as_timestamp);
        tracing::info!(account = provider_account, since = ?since, "Indexing booked bank transactions.");

        let access_token =
            self.tokens.access_token(self.api.as_ref()).await.map_err(PluginError::from)?;

        let booked = self
            .api
            .list_booked_transactions(
                provider_account,
                &access_token,
                since.map(|ts| ts.date_naive()),
            )
            .await
            .map_err(PluginError::from)?;

        let mut transactions = Vec::with_capacity(booked.len());
        for record in booked {
            // Fixed-point conversion boundary; a malformed amount drops
            // that record only.
            let value = match units::minor_units(&record.amount, 2) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        transaction = %record.internal_transaction_id,
                        error = %e,
                        "Dropping booked transaction with malformed amount."
                    );
                    continue;
                }
            };

            let tx_type = match record.bank_transaction_code.as_deref() {
                Some("TRANSFER") => TransactionType::Transfer,
                _ => TransactionType::Internal,
            };

            let description = record
                .additional_information
                .or(record.remittance_information)
                .map(|d| d.trim().to_string());

            // Incoming transactions carry the debtor side, outgoing the
            // creditor side.
            let (counterparty_name, counterparty_address) =
                if record.debtor_name.is_some() || record.debtor_iban.is_some() {
                    (record.debtor_name, record.debtor_iban)
                } else {
                    (record.creditor_name, record.creditor_iban)
                };

            let mut tx = Transaction {
                timestamp: record.booking_date_time,
                provider: Provider::OpenBanking,
                provider_account: provider_account.to_string(),
                provider_tx_id: record.internal_transaction_id,
                account_address: None,
                counterparty_address,
                counterparty_name,
                counterparty_profile: None,
                value,
                token_symbol: record.currency,
                token_decimals: 2,
                tx_type,
                tags: None,
                description,
                invoice_uuid: None,
                data: None,
            };
            tx.apply_defaults(defaults);
            transactions.push(tx);
        }

        Ok(IndexBatch::from_transactions(transactions))
    }

    async fn close(&self) {
        self.tokens.close().await;
    }
}

#[derive(Debug, Deserialize)]
struct TokenNewResponse {
    access: String,
    refresh: String,
}

#[derive(Debug, Deserialize)]
struct TokenRefreshResponse {
    access: String,
}

#[derive(Debug, Deserialize)]
struct TransactionsEnvelope {
    transactions: BookedAndPending,
}

#[derive(Debug, Deserialize)]
struct BookedAndPending {
    #[serde(default)]
    booked: Vec<RawBooked>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBooked {
    internal_transaction_id: String,
    booking_date_time: DateTime<Utc>,
    transaction_amount: RawAmount,
    #[serde(default)]
    additional_information: Option<String>,
    #[serde(default)]
    remittance_information_unstructured: Option<String>,
    #[serde(default)]
    proprietary_bank_transaction_code: Option<String>,
    #[serde(default)]
    debtor_name: Option<String>,
    #[serde(default)]
    debtor_account: Option<RawAccountRef>,
    #[serde(default)]
    creditor_name: Option<String>,
    #[serde(default)]
    creditor_account: Option<RawAccountRef>,
}

#[derive(Debug, Deserialize)]
struct RawAmount {
    amount: String,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct RawAccountRef {
    #[serde(default)]
    iban: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    status_code: u16,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// REST implementation of [`OpenBankingApi`].
pub struct HttpOpenBankingApi {
    client: ClientWithMiddleware,
    api_url: Url,
    secret_id: String,
    secret_key: String,
}

impl HttpOpenBankingApi {
    /// Creates the client against the aggregator's REST API.
    pub fn new(
        client: ClientWithMiddleware,
        api_url: Url,
        secret_id: String,
        secret_key: String,
    ) -> Self {
        Self { client, api_url, secret_id, secret_key }
    }

    fn endpoint(&self, path: &str) -> Result<Url, UpstreamError> {
        self.api_url.join(path).map_err(|e| UpstreamError::Transport(e.to_string()))
    }
}

#[async_trait]
impl OpenBankingApi for HttpOpenBankingApi {
    async fn issue_token(&self) -> Result<TokenPair, UpstreamError> {
        let response = self
            .client
            .post(self.endpoint("token/new/")?)
            .json(&json!({ "secret_id": self.secret_id, "secret_key": self.secret_key }))
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UpstreamError::Auth(format!(
                "token issuance returned {}",
                response.status()
            )));
        }

        let token: TokenNewResponse =
            response.json().await.map_err(|e| UpstreamError::Decode(e.to_string()))?;
        Ok(TokenPair { access: token.access, refresh: token.refresh })
    }

    async fn refresh_token(&self, refresh: &str) -> Result<String, UpstreamError> {
        let response = self
            .client
            .post(self.endpoint("token/refresh/")?)
            .json(&json!({ "refresh": refresh }))
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UpstreamError::Auth(format!(
                "token refresh returned {}",
                response.status()
            )));
        }

        let token: TokenRefreshResponse =
            response.json().await.map_err(|e| UpstreamError::Decode(e.to_string()))?;
        Ok(token.access)
    }

    async fn list_booked_transactions(
        &self,
        account_id: &str,
        access_token: &str,
        date_from: Option<NaiveDate>,
    ) -> Result<Vec<BookedTransaction>, UpstreamError> {
        let mut url = self.endpoint(&format!("accounts/{account_id}/transactions/"))?;
        if let Some(from) = date_from {
            url.query_pairs_mut().append_pair("date_from", &from.to_string());
        }

        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| UpstreamError::Transport(e.to_string()))?;

        if !status.is_success() {
            // The aggregator reports failures as a structured body.
            if let Ok(error) = serde_json::from_str::<ApiErrorBody>(&body) {
                let message = format!(
                    "{} {} {}",
                    error.status_code,
                    error.summary.unwrap_or_default(),
                    error.detail.unwrap_or_default()
                );
                return if error.status_code == 401 || error.status_code == 403 {
                    Err(UpstreamError::Auth(message))
                } else {
                    Err(UpstreamError::Transport(message))
                };
            }
            return Err(UpstreamError::Transport(format!("aggregator returned {status}")));
        }

        let envelope: TransactionsEnvelope =
            serde_json::from_str(&body).map_err(|e| UpstreamError::Decode(e.to_string()))?;

        Ok(envelope
            .transactions
            .booked
            .into_iter()
            .map(|raw| BookedTransaction {
                internal_transaction_id: raw.internal_transaction_id,
                booking_date_time: raw.booking_date_time,
                amount: raw.transaction_amount.amount,
                currency: raw.transaction_amount.currency,
                additional_information: raw.additional_information,
                remittance_information: raw.remittance_information_unstructured,
                bank_transaction_code: raw.proprietary_bank_transaction_code,
                debtor_name: raw.debtor_name,
                debtor_iban: raw.debtor_account.and_then(|a| a.iban),
                creditor_name: raw.creditor_name,
                creditor_iban: raw.creditor_account.and_then(|a| a.iban),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn booked(id: &str, amount: &str) -> BookedTransaction {
        BookedTransaction {
            internal_transaction_id: id.into(),
            booking_date_time: Utc.with_ymd_and_hms(2024, 7, 1, 1, 20, 34).unwrap(),
            amount: amount.into(),
            currency: "EUR".into(),
            additional_information: Some(" rent july ".into()),
            remittance_information: None,
            bank_transaction_code: Some("TRANSFER".into()),
            debtor_name: Some("Tenant".into()),
            debtor_iban: Some("BE71096123456769".into()),
            creditor_name: None,
            creditor_iban: None,
        }
    }

    fn plugin_with(api: MockOpenBankingApi) -> OpenBankingPlugin {
        OpenBankingPlugin::new(Arc::new(api), Arc::new(TokenCache::new(Some("tok".into()))))
    }

    #[tokio::test]
    async fn decimal_amounts_cross_the_fixed_point_boundary() {
        let mut api = MockOpenBankingApi::new();
        api.expect_list_booked_transactions()
            .times(1)
            .returning(|_, _, _| Ok(vec![booked("t1", "12.34")]));

        let plugin = plugin_with(api);
        let batch = plugin
            .index("d4d1dda4-account", &TransactionDefaults::default(), None)
            .await
            .unwrap();

        let tx = &batch.transactions[0];
        assert_eq!(tx.value, 1234);
        assert_eq!(tx.token_decimals, 2);
        assert_eq!(tx.tx_type, TransactionType::Transfer);
        assert_eq!(tx.description.as_deref(), Some("rent july"));
        assert_eq!(tx.counterparty_name.as_deref(), Some("Tenant"));
        assert_eq!(tx.counterparty_address.as_deref(), Some("BE71096123456769"));
    }

    #[tokio::test]
    async fn malformed_amounts_drop_that_record_only() {
        let mut api = MockOpenBankingApi::new();
        api.expect_list_booked_transactions().times(1).returning(|_, _, _| {
            Ok(vec![booked("bad", "12,34"), booked("good", "-7.00")])
        });

        let plugin = plugin_with(api);
        let batch = plugin
            .index("account", &TransactionDefaults::default(), None)
            .await
            .unwrap();

        assert_eq!(batch.transactions.len(), 1);
        assert_eq!(batch.transactions[0].provider_tx_id, "good");
        assert_eq!(batch.transactions[0].value, -700);
    }

    #[tokio::test]
    async fn non_transfer_codes_map_to_internal() {
        let mut api = MockOpenBankingApi::new();
        api.expect_list_booked_transactions().times(1).returning(|_, _, _| {
            Ok(vec![BookedTransaction {
                bank_transaction_code: Some("CARD_PAYMENT".into()),
                ..booked("t1", "5.00")
            }])
        });

        let plugin = plugin_with(api);
        let batch = plugin
            .index("account", &TransactionDefaults::default(), None)
            .await
            .unwrap();
        assert_eq!(batch.transactions[0].tx_type, TransactionType::Internal);
    }

    #[tokio::test]
    async fn cursor_narrows_the_fetch_window_to_a_date() {
        let since = Utc.with_ymd_and_hms(2024, 7, 1, 1, 20, 34).unwrap();
        let mut api = MockOpenBankingApi::new();
        api.expect_list_booked_transactions()
            .withf(move |account, token, date_from| {
                account == "account"
                    && token == "tok"
                    && *date_from == Some(since.date_naive())
            })
            .times(1)
            .returning(|_, _, _| Ok(vec![]));

        let plugin = plugin_with(api);
        plugin
            .index(
                "account",
                &TransactionDefaults::default(),
                Some(&Cursor::Timestamp(since)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn token_issuance_failure_is_upstream_unavailable() {
        let mut api = MockOpenBankingApi::new();
        api.expect_issue_token()
            .times(1)
            .returning(|| Err(UpstreamError::Auth("bad secrets".into())));

        let plugin =
            OpenBankingPlugin::new(Arc::new(api), Arc::new(TokenCache::new(None)));
        let result = plugin.index("account", &TransactionDefaults::default(), None).await;
        assert!(matches!(result, Err(PluginError::UpstreamUnavailable(_))));
    }
}

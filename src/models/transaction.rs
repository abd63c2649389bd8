//! The normalized transaction record that every provider maps into, along
//! with its identity rule: a stored record is unique per
//! `(provider, provider_tx_id)`.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An external source of transaction data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// An EVM chain scanned for token-transfer events.
    Chain,
    /// A card payment processor.
    CardProcessor,
    /// A crowdfunding platform.
    Crowdfunding,
    /// An open-banking account aggregator.
    OpenBanking,
}

impl Provider {
    /// The stable string form used in the database and on the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Chain => "chain",
            Provider::CardProcessor => "card_processor",
            Provider::Crowdfunding => "crowdfunding",
            Provider::OpenBanking => "open_banking",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chain" => Ok(Provider::Chain),
            "card_processor" => Ok(Provider::CardProcessor),
            "crowdfunding" => Ok(Provider::Crowdfunding),
            "open_banking" => Ok(Provider::OpenBanking),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// The kind of economic event a record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    /// A transfer between the account and an external party.
    Transfer,
    /// A movement that stays within the account holder's own books.
    Internal,
    /// A processing fee attached to another transaction.
    Fee,
}

impl TransactionType {
    /// The stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Transfer => "TRANSFER",
            TransactionType::Internal => "INTERNAL",
            TransactionType::Fee => "FEE",
        }
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRANSFER" => Ok(TransactionType::Transfer),
            "INTERNAL" => Ok(TransactionType::Internal),
            "FEE" => Ok(TransactionType::Fee),
            other => Err(format!("unknown transaction type: {other}")),
        }
    }
}

/// A resolved external identity for a counterparty, populated only when
/// cross-provider correlation succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterpartyProfile {
    /// Display name of the counterparty.
    pub name: String,
    /// Canonical profile URL, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Avatar or logo URL, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// The normalized record shape shared by every provider.
///
/// `value` is a signed integer amount in the token/currency's minor unit;
/// negative values represent fees or outflows. Amounts never cross this
/// boundary as floats; see [`crate::models::units`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// When the economic event occurred, per the source's clock, in UTC.
    pub timestamp: DateTime<Utc>,
    /// The source this record was ingested from.
    pub provider: Provider,
    /// Opaque account identifier within the provider's namespace.
    pub provider_account: String,
    /// Provider-native transaction identifier. Unique together with
    /// `provider`; this is the sole deduplication key.
    pub provider_tx_id: String,
    /// The ledger owner's address or label at the provider.
    pub account_address: Option<String>,
    /// Address of the other party, in whatever form the provider uses.
    pub counterparty_address: Option<String>,
    /// Display name of the other party.
    pub counterparty_name: Option<String>,
    /// Resolved external identity of the other party, when correlation
    /// produced one.
    pub counterparty_profile: Option<CounterpartyProfile>,
    /// Signed amount in minor units of `token_symbol`.
    pub value: i64,
    /// Unit of `value` (currency code or token symbol).
    pub token_symbol: String,
    /// Number of decimals in `token_symbol`'s minor unit.
    pub token_decimals: u8,
    /// The kind of economic event.
    pub tx_type: TransactionType,
    /// Free-form caller-supplied labels.
    pub tags: Option<String>,
    /// Provider-supplied human description.
    pub description: Option<String>,
    /// Correlation key shared by records expanded from one upstream
    /// transaction (e.g. a charge and its fees).
    pub invoice_uuid: Option<Uuid>,
    /// Structured side-channel metadata (line items, originating
    /// application, routing hints).
    pub data: Option<serde_json::Value>,
}

impl Transaction {
    /// Merges caller-supplied defaults into this record. Fields the plugin
    /// already populated take precedence; defaults only fill gaps.
    pub fn apply_defaults(&mut self, defaults: &TransactionDefaults) {
        if self.account_address.is_none() {
            self.account_address = defaults.account_address.clone();
        }
        if self.tags.is_none() {
            self.tags = defaults.tags.clone();
        }
        if self.description.is_none() {
            self.description = defaults.description.clone();
        }
    }
}

/// Caller-supplied values merged into every record a plugin produces.
///
/// For chain accounts the token symbol/decimals also travel here, since the
/// scanner does not query token metadata from the contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDefaults {
    /// Fallback ledger-owner address or label.
    pub account_address: Option<String>,
    /// Labels to attach to each record.
    pub tags: Option<String>,
    /// Fallback description.
    pub description: Option<String>,
    /// Token symbol for chain accounts.
    pub token_symbol: Option<String>,
    /// Token decimals for chain accounts.
    pub token_decimals: Option<u8>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            timestamp: Utc.with_ymd_and_hms(2024, 9, 2, 10, 10, 7).unwrap(),
            provider: Provider::Crowdfunding,
            provider_account: "commons-hub".into(),
            provider_tx_id: "uuid-1".into(),
            account_address: None,
            counterparty_address: None,
            counterparty_name: Some("A Backer".into()),
            counterparty_profile: None,
            value: 1150,
            token_symbol: "EUR".into(),
            token_decimals: 2,
            tx_type: TransactionType::Transfer,
            tags: None,
            description: Some("monthly contribution".into()),
            invoice_uuid: None,
            data: None,
        }
    }

    #[test]
    fn defaults_fill_only_missing_fields() {
        let mut tx = sample_tx();
        let defaults = TransactionDefaults {
            account_address: Some("main account".into()),
            tags: Some("EUR, crowdfunding".into()),
            description: Some("should not win".into()),
            ..Default::default()
        };

        tx.apply_defaults(&defaults);

        assert_eq!(tx.account_address.as_deref(), Some("main account"));
        assert_eq!(tx.tags.as_deref(), Some("EUR, crowdfunding"));
        // The plugin-produced description takes precedence.
        assert_eq!(tx.description.as_deref(), Some("monthly contribution"));
    }

    #[test]
    fn provider_round_trips_through_str() {
        for provider in [
            Provider::Chain,
            Provider::CardProcessor,
            Provider::Crowdfunding,
            Provider::OpenBanking,
        ] {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert!("stripe".parse::<Provider>().is_err());
    }

    #[test]
    fn counterparty_profile_serializes_camel_case() {
        let profile = CounterpartyProfile {
            name: "A Backer".into(),
            url: Some("https://example.org/a-backer".into()),
            image_url: Some("https://example.org/a-backer.png".into()),
        };
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["imageUrl"], "https://example.org/a-backer.png");
    }
}

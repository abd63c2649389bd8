//! Declarative records of what to sync: one row per
//! (provider, provider_account, filter), read by the orchestrator.

use chrono::{DateTime, Utc};

use super::{Cursor, Provider};

/// A stored sync registration, including the pair's current cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    /// Row id.
    pub id: i64,
    /// Human label for the pair; also used as default tags on its records.
    pub label: Option<String>,
    /// The data source to sync from.
    pub provider: Provider,
    /// Account identifier within the provider's namespace.
    pub provider_account: String,
    /// Optional provider-specific filter (e.g. product ids).
    pub filter: Option<String>,
    /// Last durably synced position, if the pair has ever synced.
    pub cursor: Option<Cursor>,
    /// When the registration was created.
    pub created_at: DateTime<Utc>,
    /// When the registration (or its cursor) was last updated.
    pub updated_at: DateTime<Utc>,
}

/// The caller-supplied part of a registration, used for upserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRegistration {
    /// The data source to sync from.
    pub provider: Provider,
    /// Account identifier within the provider's namespace.
    pub provider_account: String,
    /// Human label for the pair.
    pub label: Option<String>,
    /// Optional provider-specific filter.
    pub filter: Option<String>,
}

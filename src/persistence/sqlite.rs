//! SQLite implementation of the ledger repository.
//!
//! Queries use the runtime-bound API rather than the compile-time checked
//! macros, which would require a live database during compilation.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{Row, SqlitePool, sqlite::SqliteConnectOptions, sqlite::SqliteRow};

use super::{
    error::PersistenceError,
    traits::{LedgerRepository, SyncGap},
};
use crate::models::{
    Cursor, Provider, Registration, Transaction,
    registration::NewRegistration,
};

/// A concrete [`LedgerRepository`] backed by SQLite.
pub struct SqliteLedgerRepository {
    pool: SqlitePool,
}

fn op_failed(e: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::OperationFailed(e.to_string())
}

fn block_to_i64(block: u64) -> Result<i64, PersistenceError> {
    i64::try_from(block)
        .map_err(|_| PersistenceError::InvalidInput(format!("block number out of range: {block}")))
}

impl SqliteLedgerRepository {
    /// Connects to the database at `database_url`, creating the file if it
    /// does not exist.
    #[tracing::instrument(level = "info")]
    pub async fn new(database_url: &str) -> Result<Self, PersistenceError> {
        tracing::debug!(database_url, "Connecting to SQLite database.");
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| PersistenceError::InvalidInput(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.map_err(op_failed)?;
        tracing::info!(database_url, "Connected to SQLite database.");
        Ok(Self { pool })
    }

    /// Runs database migrations.
    #[tracing::instrument(skip(self), level = "info")]
    pub async fn run_migrations(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations").run(&self.pool).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run database migrations.");
            PersistenceError::Migration(e.to_string())
        })?;
        tracing::info!("Database migrations completed.");
        Ok(())
    }

    /// Closes the connection pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn registration_from_row(row: &SqliteRow) -> Result<Registration, PersistenceError> {
        let provider: String = row.try_get("provider").map_err(op_failed)?;
        let provider =
            Provider::from_str(&provider).map_err(PersistenceError::Corrupt)?;
        let cursor: Option<String> = row.try_get("cursor").map_err(op_failed)?;
        let cursor = cursor
            .map(|raw| raw.parse::<Cursor>())
            .transpose()
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        let created_at: NaiveDateTime = row.try_get("created_at").map_err(op_failed)?;
        let updated_at: NaiveDateTime = row.try_get("updated_at").map_err(op_failed)?;

        Ok(Registration {
            id: row.try_get("id").map_err(op_failed)?,
            label: row.try_get("label").map_err(op_failed)?,
            provider,
            provider_account: row.try_get("provider_account").map_err(op_failed)?,
            filter: row.try_get("filter").map_err(op_failed)?,
            cursor,
            created_at: created_at.and_utc(),
            updated_at: updated_at.and_utc(),
        })
    }
}

#[async_trait]
impl LedgerRepository for SqliteLedgerRepository {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn get_cursor(
        &self,
        provider: Provider,
        account: &str,
    ) -> Result<Option<Cursor>, PersistenceError> {
        let row = sqlx::query(
            "SELECT cursor FROM indexer WHERE provider = ? AND provider_account = ?",
        )
        .bind(provider.as_str())
        .bind(account)
        .fetch_optional(&self.pool)
        .await
        .map_err(op_failed)?;

        let Some(row) = row else { return Ok(None) };
        let raw: Option<String> = row.try_get("cursor").map_err(op_failed)?;
        raw.map(|s| s.parse::<Cursor>())
            .transpose()
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn set_cursor(
        &self,
        provider: Provider,
        account: &str,
        cursor: &Cursor,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO indexer (provider, provider_account, cursor)
            VALUES (?, ?, ?)
            ON CONFLICT (provider, provider_account)
            DO UPDATE SET cursor = excluded.cursor, updated_at = datetime('now')
            "#,
        )
        .bind(provider.as_str())
        .bind(account)
        .bind(cursor.to_string())
        .execute(&self.pool)
        .await
        .map_err(op_failed)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, tx), level = "debug")]
    async fn insert_transaction(&self, tx: &Transaction) -> Result<bool, PersistenceError> {
        let profile = tx
            .counterparty_profile
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| PersistenceError::InvalidInput(e.to_string()))?;
        let data = tx
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| PersistenceError::InvalidInput(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO transactions (
                timestamp, provider, provider_account, provider_tx_id,
                account_address, counterparty_address, counterparty_name,
                counterparty_profile, value, token_symbol, token_decimals,
                tx_type, tags, description, invoice_uuid, data
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tx.timestamp.to_rfc3339())
        .bind(tx.provider.as_str())
        .bind(&tx.provider_account)
        .bind(&tx.provider_tx_id)
        .bind(&tx.account_address)
        .bind(&tx.counterparty_address)
        .bind(&tx.counterparty_name)
        .bind(profile)
        .bind(tx.value)
        .bind(&tx.token_symbol)
        .bind(i64::from(tx.token_decimals))
        .bind(tx.tx_type.as_str())
        .bind(&tx.tags)
        .bind(&tx.description)
        .bind(tx.invoice_uuid.map(|u| u.to_string()))
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(op_failed)?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn count_transactions(
        &self,
        provider: Provider,
        account: &str,
    ) -> Result<u64, PersistenceError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transactions WHERE provider = ? AND provider_account = ?",
        )
        .bind(provider.as_str())
        .bind(account)
        .fetch_one(&self.pool)
        .await
        .map_err(op_failed)?;
        Ok(count as u64)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn record_gap(
        &self,
        provider: Provider,
        account: &str,
        from_block: u64,
        to_block: u64,
        reason: &str,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO sync_gaps (provider, provider_account, from_block, to_block, reason)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(provider.as_str())
        .bind(account)
        .bind(block_to_i64(from_block)?)
        .bind(block_to_i64(to_block)?)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(op_failed)?;
        Ok(())
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn list_gaps(
        &self,
        provider: Provider,
        account: &str,
    ) -> Result<Vec<SyncGap>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT provider, provider_account, from_block, to_block, reason, created_at
            FROM sync_gaps
            WHERE provider = ? AND provider_account = ?
            ORDER BY id ASC
            "#,
        )
        .bind(provider.as_str())
        .bind(account)
        .fetch_all(&self.pool)
        .await
        .map_err(op_failed)?;

        let mut gaps = Vec::with_capacity(rows.len());
        for row in rows {
            let provider: String = row.try_get("provider").map_err(op_failed)?;
            let provider =
                Provider::from_str(&provider).map_err(PersistenceError::Corrupt)?;
            let from_block: i64 = row.try_get("from_block").map_err(op_failed)?;
            let to_block: i64 = row.try_get("to_block").map_err(op_failed)?;
            let created_at: NaiveDateTime = row.try_get("created_at").map_err(op_failed)?;
            gaps.push(SyncGap {
                provider,
                provider_account: row.try_get("provider_account").map_err(op_failed)?,
                from_block: from_block as u64,
                to_block: to_block as u64,
                reason: row.try_get("reason").map_err(op_failed)?,
                created_at: created_at.and_utc(),
            });
        }
        Ok(gaps)
    }

    #[tracing::instrument(skip(self, registration), level = "debug")]
    async fn upsert_registration(
        &self,
        registration: &NewRegistration,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO indexer (provider, provider_account, label, filter)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (provider, provider_account)
            DO UPDATE SET
                label = excluded.label,
                filter = excluded.filter,
                updated_at = datetime('now')
            "#,
        )
        .bind(registration.provider.as_str())
        .bind(&registration.provider_account)
        .bind(&registration.label)
        .bind(&registration.filter)
        .execute(&self.pool)
        .await
        .map_err(op_failed)?;
        Ok(())
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn list_registrations(&self) -> Result<Vec<Registration>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, label, provider, provider_account, filter, cursor,
                   created_at, updated_at
            FROM indexer
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(op_failed)?;

        rows.iter().map(Self::registration_from_row).collect()
    }

    #[tracing::instrument(skip(self), level = "info")]
    async fn reset_pair(
        &self,
        provider: Provider,
        account: &str,
    ) -> Result<(), PersistenceError> {
        let mut db_tx = self.pool.begin().await.map_err(op_failed)?;

        sqlx::query("DELETE FROM transactions WHERE provider = ? AND provider_account = ?")
            .bind(provider.as_str())
            .bind(account)
            .execute(&mut *db_tx)
            .await
            .map_err(op_failed)?;
        sqlx::query("DELETE FROM sync_gaps WHERE provider = ? AND provider_account = ?")
            .bind(provider.as_str())
            .bind(account)
            .execute(&mut *db_tx)
            .await
            .map_err(op_failed)?;
        sqlx::query(
            "UPDATE indexer SET cursor = NULL, updated_at = datetime('now')
             WHERE provider = ? AND provider_account = ?",
        )
        .bind(provider.as_str())
        .bind(account)
        .execute(&mut *db_tx)
        .await
        .map_err(op_failed)?;

        db_tx.commit().await.map_err(op_failed)?;
        tracing::info!(provider = %provider, account, "Pair state wiped.");
        Ok(())
    }

    #[tracing::instrument(skip(self), level = "info")]
    async fn reset_all(&self) -> Result<(), PersistenceError> {
        let mut db_tx = self.pool.begin().await.map_err(op_failed)?;

        sqlx::query("DELETE FROM transactions")
            .execute(&mut *db_tx)
            .await
            .map_err(op_failed)?;
        sqlx::query("DELETE FROM sync_gaps").execute(&mut *db_tx).await.map_err(op_failed)?;
        sqlx::query("UPDATE indexer SET cursor = NULL, updated_at = datetime('now')")
            .execute(&mut *db_tx)
            .await
            .map_err(op_failed)?;

        db_tx.commit().await.map_err(op_failed)?;
        tracing::warn!("All persisted transactions, gaps and cursors wiped.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::sample_transaction;

    async fn setup_test_db() -> SqliteLedgerRepository {
        let repo = SqliteLedgerRepository::new("sqlite::memory:")
            .await
            .expect("Failed to connect to in-memory db");
        repo.run_migrations().await.expect("Failed to run migrations");
        repo
    }

    #[tokio::test]
    async fn cursor_round_trips_and_overwrites() {
        let repo = setup_test_db().await;
        let account = "gnosis:token/wallet";

        assert!(repo.get_cursor(Provider::Chain, account).await.unwrap().is_none());

        repo.set_cursor(Provider::Chain, account, &Cursor::Block(9_999)).await.unwrap();
        assert_eq!(
            repo.get_cursor(Provider::Chain, account).await.unwrap(),
            Some(Cursor::Block(9_999))
        );

        repo.set_cursor(Provider::Chain, account, &Cursor::Block(19_999)).await.unwrap();
        assert_eq!(
            repo.get_cursor(Provider::Chain, account).await.unwrap(),
            Some(Cursor::Block(19_999))
        );
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_no_op() {
        let repo = setup_test_db().await;
        let tx = sample_transaction(Provider::Crowdfunding, "acct", "uuid-1", 1150);

        assert!(repo.insert_transaction(&tx).await.unwrap());
        assert!(!repo.insert_transaction(&tx).await.unwrap());
        assert_eq!(repo.count_transactions(Provider::Crowdfunding, "acct").await.unwrap(), 1);

        // Same id under a different provider is a distinct record.
        let other = Transaction {
            provider: Provider::OpenBanking,
            ..sample_transaction(Provider::Crowdfunding, "acct", "uuid-1", 1150)
        };
        assert!(repo.insert_transaction(&other).await.unwrap());
    }

    #[tokio::test]
    async fn registrations_upsert_preserves_the_cursor() {
        let repo = setup_test_db().await;
        let registration = NewRegistration {
            provider: Provider::Crowdfunding,
            provider_account: "commons-hub".into(),
            label: Some("EUR, commons-hub".into()),
            filter: None,
        };

        repo.upsert_registration(&registration).await.unwrap();
        repo.set_cursor(
            Provider::Crowdfunding,
            "commons-hub",
            &"2024-09-02T10:10:07.000Z".parse::<Cursor>().unwrap(),
        )
        .await
        .unwrap();

        // Re-registering must not clobber sync progress.
        repo.upsert_registration(&NewRegistration {
            label: Some("relabeled".into()),
            ..registration
        })
        .await
        .unwrap();

        let registrations = repo.list_registrations().await.unwrap();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].label.as_deref(), Some("relabeled"));
        assert!(registrations[0].cursor.is_some());
    }

    #[tokio::test]
    async fn gaps_are_recorded_per_pair() {
        let repo = setup_test_db().await;
        repo.record_gap(Provider::Chain, "pair-a", 0, 9_999, "connection reset")
            .await
            .unwrap();
        repo.record_gap(Provider::Chain, "pair-b", 10_000, 19_999, "timeout").await.unwrap();

        let gaps = repo.list_gaps(Provider::Chain, "pair-a").await.unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].from_block, 0);
        assert_eq!(gaps[0].to_block, 9_999);
        assert_eq!(gaps[0].reason.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn reset_pair_only_touches_that_pair() {
        let repo = setup_test_db().await;

        let tx_a = sample_transaction(Provider::Crowdfunding, "pair-a", "a-1", 100);
        let tx_b = sample_transaction(Provider::Crowdfunding, "pair-b", "b-1", 200);
        repo.insert_transaction(&tx_a).await.unwrap();
        repo.insert_transaction(&tx_b).await.unwrap();
        repo.set_cursor(Provider::Crowdfunding, "pair-a", &Cursor::Block(1)).await.unwrap();
        repo.set_cursor(Provider::Crowdfunding, "pair-b", &Cursor::Block(2)).await.unwrap();

        repo.reset_pair(Provider::Crowdfunding, "pair-a").await.unwrap();

        assert_eq!(repo.count_transactions(Provider::Crowdfunding, "pair-a").await.unwrap(), 0);
        assert_eq!(repo.count_transactions(Provider::Crowdfunding, "pair-b").await.unwrap(), 1);
        assert!(repo.get_cursor(Provider::Crowdfunding, "pair-a").await.unwrap().is_none());
        assert_eq!(
            repo.get_cursor(Provider::Crowdfunding, "pair-b").await.unwrap(),
            Some(Cursor::Block(2))
        );
    }

    #[tokio::test]
    async fn reset_all_wipes_everything() {
        let repo = setup_test_db().await;
        let tx = sample_transaction(Provider::OpenBanking, "acct", "t-1", 500);
        repo.insert_transaction(&tx).await.unwrap();
        repo.set_cursor(Provider::OpenBanking, "acct", &Cursor::Block(5)).await.unwrap();
        repo.record_gap(Provider::Chain, "pair", 0, 10, "x").await.unwrap();

        repo.reset_all().await.unwrap();

        assert_eq!(repo.count_transactions(Provider::OpenBanking, "acct").await.unwrap(), 0);
        assert!(repo.get_cursor(Provider::OpenBanking, "acct").await.unwrap().is_none());
        assert!(repo.list_gaps(Provider::Chain, "pair").await.unwrap().is_empty());
    }
}

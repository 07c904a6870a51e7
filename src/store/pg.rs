//! PostgreSQL-backed [`Store`] implementation.

use super::{Store, UpsertAddressesOutcome, UpsertRelationshipsOutcome};
use crate::error::{IngestError, Result};
use crate::models::Chain;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Creates the schema described in §6, if it does not already exist.
    /// The database's own migration tooling is the source of truth in
    /// production; this exists so integration tests can stand up a schema
    /// against a scratch database without an external migration runner.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_info (
                id BIGSERIAL PRIMARY KEY,
                chain_name TEXT NOT NULL,
                chain_id TEXT NOT NULL UNIQUE,
                next_block_number BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS address (
                id BIGSERIAL PRIMARY KEY,
                wallet_address TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS address_chain (
                id BIGSERIAL PRIMARY KEY,
                wallet_address_id BIGINT NOT NULL REFERENCES address(id) ON DELETE CASCADE,
                chain_id BIGINT NOT NULL REFERENCES chain_info(id) ON DELETE CASCADE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (wallet_address_id, chain_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS status (
                id BIGSERIAL PRIMARY KEY,
                status_type TEXT NOT NULL,
                status_code TEXT NOT NULL UNIQUE,
                status_description TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_call_failure_log (
                id BIGSERIAL PRIMARY KEY,
                chain_id TEXT NOT NULL,
                block_number BIGINT NOT NULL,
                status_code TEXT NOT NULL REFERENCES status(status_code),
                error_message TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for (status_type, code, description) in [
            ("success", "OK", "fetch succeeded"),
            ("error", "RPC_NOT_FOUND", "block not found upstream"),
            ("error", "RPC_TIMEOUT", "rpc call timed out"),
            (
                "error",
                "RPC_UPSTREAM_ERROR",
                "rpc provider returned an error object",
            ),
            ("error", "RPC_TRANSPORT_ERROR", "network or decode failure"),
        ] {
            sqlx::query(
                "INSERT INTO status (status_type, status_code, status_description) \
                 VALUES ($1, $2, $3) ON CONFLICT (status_code) DO NOTHING",
            )
            .bind(status_type)
            .bind(code)
            .bind(description)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Seed a chain row for tests/bootstrap; idempotent.
    pub async fn seed_chain(
        &self,
        chain_name: &str,
        chain_id: &str,
        next_block_number: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO chain_info (chain_name, chain_id, next_block_number) VALUES ($1, $2, $3) \
             ON CONFLICT (chain_id) DO NOTHING",
        )
        .bind(chain_name)
        .bind(chain_id)
        .bind(next_block_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn load_chain_by_external_id(&self, chain_id: &str) -> Result<Option<Chain>> {
        let chain = sqlx::query_as::<_, Chain>("SELECT * FROM chain_info WHERE chain_id = $1")
            .bind(chain_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(chain)
    }

    async fn upsert_addresses(
        &self,
        addresses: &BTreeSet<String>,
    ) -> Result<UpsertAddressesOutcome> {
        if addresses.is_empty() {
            return Ok(UpsertAddressesOutcome::default());
        }
        let owned: Vec<String> = addresses.iter().cloned().collect();
        match sqlx::query(
            "INSERT INTO address (wallet_address) SELECT * FROM UNNEST($1::text[]) \
             ON CONFLICT (wallet_address) DO NOTHING",
        )
        .bind(&owned)
        .execute(&self.pool)
        .await
        {
            Ok(done) => Ok(UpsertAddressesOutcome {
                inserted: done.rows_affected() as usize,
            }),
            Err(e) => Err(IngestError::StorageIntegrity(e.to_string())),
        }
    }

    async fn lookup_address_ids(
        &self,
        addresses: &BTreeSet<String>,
    ) -> Result<HashMap<String, i64>> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }
        let owned: Vec<String> = addresses.iter().cloned().collect();
        let rows = sqlx::query(
            "SELECT id, wallet_address FROM address WHERE wallet_address = ANY($1::text[])",
        )
        .bind(&owned)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("wallet_address"),
                    row.get::<i64, _>("id"),
                )
            })
            .collect())
    }

    async fn upsert_relationships(
        &self,
        address_ids: &[i64],
        chain_row_id: i64,
    ) -> Result<UpsertRelationshipsOutcome> {
        let mut outcome = UpsertRelationshipsOutcome::default();
        for &address_id in address_ids {
            let result = sqlx::query(
                "INSERT INTO address_chain (wallet_address_id, chain_id) VALUES ($1, $2) \
                 ON CONFLICT (wallet_address_id, chain_id) DO NOTHING",
            )
            .bind(address_id)
            .bind(chain_row_id)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) => outcome.inserted += done.rows_affected() as usize,
                Err(e) => {
                    warn!(
                        "relationship insert failed for address_id={address_id}: {e} (non-fatal)"
                    );
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn update_chain_high_water_mark(
        &self,
        chain_row_id: i64,
        new_next_block_number: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE chain_info SET next_block_number = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(new_next_block_number)
        .bind(chain_row_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_failure_log(
        &self,
        chain_id: &str,
        block_number: i64,
        status_code: &str,
        error_message: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO api_call_failure_log (chain_id, block_number, status_code, error_message) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(chain_id)
        .bind(block_number)
        .bind(status_code)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Issue a session-level hint ahead of a large batch (e.g. larger work
    /// memory). Failures here are non-fatal and logged, never surfaced.
    async fn tune_for_bulk(&self) {
        if let Err(e) = sqlx::query("SET LOCAL work_mem = '64MB'")
            .execute(&self.pool)
            .await
        {
            debug!("tune_for_bulk hint failed (non-fatal): {e}");
        }
    }

    async fn reset_tuning(&self) {
        if let Err(e) = sqlx::query("RESET work_mem").execute(&self.pool).await {
            debug!("reset_tuning hint failed (non-fatal): {e}");
        }
    }
}

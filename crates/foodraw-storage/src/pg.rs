use anyhow::Context;
use async_trait::async_trait;
use foodraw_core::{RawHash, RawRecord, StoredRawRecord};
use serde_json::value::RawValue;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::{RawStore, WriteError, WriteOutcome};

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// `raw_products` table keyed by `raw_hash` (primary key).
#[derive(Debug, Clone)]
pub struct PgRawStore {
    pool: PgPool,
}

impl PgRawStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), MigrateError> {
        MIGRATOR.run(&self.pool).await
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query("SELECT COUNT(*) AS n FROM raw_products")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")
    }

    pub async fn get(&self, raw_hash: &RawHash) -> anyhow::Result<Option<RawRecord>> {
        let row = sqlx::query(
            r#"
            SELECT source, fetched_at, payload_raw
              FROM raw_products
             WHERE raw_hash = $1
            "#,
        )
        .bind(raw_hash.to_hex())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading raw record {raw_hash}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload_raw: String = row.try_get("payload_raw")?;
        let stored = StoredRawRecord {
            source: row.try_get("source")?,
            fetched_at: row.try_get("fetched_at")?,
            raw_hash: *raw_hash,
            payload: RawValue::from_string(payload_raw)
                .with_context(|| format!("stored payload for {raw_hash} is not JSON"))?,
        };
        let record = RawRecord::try_from(stored)
            .with_context(|| format!("verifying raw record {raw_hash}"))?;
        Ok(Some(record))
    }
}

#[async_trait]
impl RawStore for PgRawStore {
    /// One atomic `INSERT .. ON CONFLICT DO NOTHING`; no read-before-write.
    async fn insert(&self, record: &RawRecord) -> Result<WriteOutcome, WriteError> {
        let raw_hash = record.raw_hash();
        let result = sqlx::query(
            r#"
            INSERT INTO raw_products (raw_hash, source, fetched_at, payload, payload_raw)
            VALUES ($1, $2, $3, $4::text::jsonb, $4)
            ON CONFLICT (raw_hash) DO NOTHING
            "#,
        )
        .bind(raw_hash.to_hex())
        .bind(record.source())
        .bind(record.fetched_at())
        .bind(record.payload_json())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(WriteOutcome::Inserted),
            Ok(_) => Ok(WriteOutcome::AlreadyExists),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tracing::debug!(%raw_hash, constraint = ?db_err.constraint(), "unique violation treated as duplicate");
                Ok(WriteOutcome::AlreadyExists)
            }
            Err(sqlx::Error::Database(db_err)) if is_data_exception(db_err.code().as_deref()) => {
                tracing::debug!(%raw_hash, code = ?db_err.code(), "payload rejected by postgres");
                Err(WriteError::Unrepresentable {
                    raw_hash,
                    reason: db_err.message().to_string(),
                })
            }
            Err(source) => Err(WriteError::Database { raw_hash, source }),
        }
    }

    fn describe(&self) -> String {
        "postgres:raw_products".to_string()
    }
}

/// SQLSTATE class 22 covers values the column type cannot hold, such as
/// 22P05 (`\u0000` in jsonb) or 22021 (invalid byte sequence).
fn is_data_exception(code: Option<&str>) -> bool {
    code.is_some_and(|code| code.starts_with("22"))
}

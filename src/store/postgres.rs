//! PostgreSQL storage backend.
//!
//! All claim transitions run inside a transaction holding a row-level
//! `SELECT ... FOR UPDATE` lock on the `(idempotency_key, method_key)` pair,
//! which makes the claim protocol linearizable per pair. JSON payloads land
//! in `jsonb` columns; reads cast back to text so the toolkit can hand the
//! stored response to its own deserializer.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, Pool, Postgres};

use crate::error::{ToolkitError, ToolkitResult};
use crate::store::{
    AuditRecord, AuditStore, CredentialRecord, CredentialStore, IdempotencyRecord,
    IdempotencyStatus, IdempotencyStore, PolicyRecord, PolicyStore,
};

/// Embedded schema, applied idempotently at startup.
const SCHEMA: &str = include_str!("schema.sql");

const IDEMPOTENCY_COLUMNS: &str = "idempotency_key, method_key, request_hash, status, \
     response_json::text AS response_json, error_message, expires_at, locked_at, locked_by, \
     created_at, updated_at";

/// PostgreSQL implementation of all storage contracts.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

/// Split an SQL schema into individual statements, dropping comment-only
/// fragments.
fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

#[derive(Debug, FromRow)]
struct IdempotencyRow {
    idempotency_key: String,
    method_key: String,
    request_hash: String,
    status: String,
    response_json: Option<String>,
    error_message: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IdempotencyRow> for IdempotencyRecord {
    type Error = ToolkitError;

    fn try_from(row: IdempotencyRow) -> Result<Self, Self::Error> {
        let status = IdempotencyStatus::parse(&row.status).ok_or_else(|| {
            ToolkitError::Internal(format!("unknown idempotency status '{}'", row.status))
        })?;
        Ok(IdempotencyRecord {
            idempotency_key: row.idempotency_key,
            method_key: row.method_key,
            request_hash: row.request_hash,
            status,
            response_json: row.response_json,
            error_message: row.error_message,
            expires_at: row.expires_at,
            locked_at: row.locked_at,
            locked_by: row.locked_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PolicyRow {
    client_key: String,
    method_key: String,
    enabled: bool,
    rl_permits_per_sec: Option<i32>,
    rl_burst: Option<i32>,
    retry_max_attempts: Option<i32>,
    retry_backoff_ms: Option<i32>,
    cache_ttl_seconds: Option<i32>,
    idempotency_ttl_seconds: Option<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PolicyRow> for PolicyRecord {
    fn from(row: PolicyRow) -> Self {
        PolicyRecord {
            client_key: row.client_key,
            method_key: row.method_key,
            enabled: row.enabled,
            rl_permits_per_sec: row.rl_permits_per_sec,
            rl_burst: row.rl_burst,
            retry_max_attempts: row.retry_max_attempts,
            retry_backoff_ms: row.retry_backoff_ms,
            cache_ttl_seconds: row.cache_ttl_seconds,
            idempotency_ttl_seconds: row.idempotency_ttl_seconds,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct CredentialRow {
    api_key_hash: String,
    client_id: i64,
    active: bool,
    created_at: DateTime<Utc>,
}

impl From<CredentialRow> for CredentialRecord {
    fn from(row: CredentialRow) -> Self {
        CredentialRecord {
            api_key_hash: row.api_key_hash,
            client_id: row.client_id,
            active: row.active,
            created_at: row.created_at,
        }
    }
}

impl PostgresStore {
    /// Connect to PostgreSQL and apply the embedded schema.
    pub async fn connect(url: &str, max_connections: u32) -> ToolkitResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;

        tracing::info!(max_connections, "Connecting to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    /// Apply all schema statements. Statements use `IF NOT EXISTS`, so this
    /// is safe to run on every startup.
    async fn apply_schema(&self) -> ToolkitResult<()> {
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("Schema applied");
        Ok(())
    }

    /// Access the underlying pool (used by operational tooling).
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl IdempotencyStore for PostgresStore {
    async fn acquire_or_get(
        &self,
        key: &str,
        method_key: &str,
        request_hash: &str,
        ttl: Duration,
        lock_owner: &str,
    ) -> ToolkitResult<IdempotencyRecord> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| ToolkitError::Internal(format!("idempotency ttl out of range: {e}")))?;

        let mut tx = self.pool.begin().await?;

        let select_for_update = format!(
            "SELECT {IDEMPOTENCY_COLUMNS} FROM idempotency_record \
             WHERE idempotency_key = $1 AND method_key = $2 FOR UPDATE"
        );

        let existing = sqlx::query_as::<_, IdempotencyRow>(&select_for_update)
            .bind(key)
            .bind(method_key)
            .fetch_optional(&mut *tx)
            .await?;

        let row = match existing {
            None => {
                // Two first-claimants can race here: FOR UPDATE does not lock
                // absent rows. ON CONFLICT makes the loser fall through to the
                // winner's row, which it then locks like any later arrival.
                let inserted = sqlx::query_as::<_, IdempotencyRow>(&format!(
                    "INSERT INTO idempotency_record \
                     (idempotency_key, method_key, request_hash, status, expires_at, \
                      locked_at, locked_by, created_at, updated_at) \
                     VALUES ($1, $2, $3, 'PENDING', $4, $5, $6, $5, $5) \
                     ON CONFLICT (idempotency_key, method_key) DO NOTHING \
                     RETURNING {IDEMPOTENCY_COLUMNS}"
                ))
                .bind(key)
                .bind(method_key)
                .bind(request_hash)
                .bind(expires_at)
                .bind(now)
                .bind(lock_owner)
                .fetch_optional(&mut *tx)
                .await?;

                match inserted {
                    Some(row) => row,
                    None => {
                        // Lost the insert race; lock the winner's row.
                        sqlx::query_as::<_, IdempotencyRow>(&select_for_update)
                            .bind(key)
                            .bind(method_key)
                            .fetch_one(&mut *tx)
                            .await?
                    }
                }
            }
            Some(row) => row,
        };

        let record = IdempotencyRecord::try_from(row)?;

        let record = if record.is_expired(now) {
            // Expired slot is reused by the next claimant.
            let row = sqlx::query_as::<_, IdempotencyRow>(&format!(
                "UPDATE idempotency_record \
                 SET request_hash = $3, status = 'PENDING', response_json = NULL, \
                     error_message = NULL, expires_at = $4, locked_at = $5, \
                     locked_by = $6, updated_at = $5 \
                 WHERE idempotency_key = $1 AND method_key = $2 \
                 RETURNING {IDEMPOTENCY_COLUMNS}"
            ))
            .bind(key)
            .bind(method_key)
            .bind(request_hash)
            .bind(expires_at)
            .bind(now)
            .bind(lock_owner)
            .fetch_one(&mut *tx)
            .await?;
            IdempotencyRecord::try_from(row)?
        } else if record.status == IdempotencyStatus::Pending
            && record.locked_by.as_deref().is_none_or(str::is_empty)
        {
            let row = sqlx::query_as::<_, IdempotencyRow>(&format!(
                "UPDATE idempotency_record \
                 SET locked_at = $3, locked_by = $4, updated_at = $3 \
                 WHERE idempotency_key = $1 AND method_key = $2 \
                 RETURNING {IDEMPOTENCY_COLUMNS}"
            ))
            .bind(key)
            .bind(method_key)
            .bind(now)
            .bind(lock_owner)
            .fetch_one(&mut *tx)
            .await?;
            IdempotencyRecord::try_from(row)?
        } else {
            record
        };

        tx.commit().await?;
        Ok(record)
    }

    async fn read(&self, key: &str, method_key: &str) -> ToolkitResult<Option<IdempotencyRecord>> {
        let row = sqlx::query_as::<_, IdempotencyRow>(&format!(
            "SELECT {IDEMPOTENCY_COLUMNS} FROM idempotency_record \
             WHERE idempotency_key = $1 AND method_key = $2"
        ))
        .bind(key)
        .bind(method_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(IdempotencyRecord::try_from).transpose()
    }

    async fn mark_completed(
        &self,
        key: &str,
        method_key: &str,
        request_hash: &str,
        response_json: Option<String>,
    ) -> ToolkitResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE idempotency_record \
             SET request_hash = $3, status = 'COMPLETED', response_json = $4::jsonb, \
                 error_message = NULL, locked_at = NULL, locked_by = NULL, updated_at = $5 \
             WHERE idempotency_key = $1 AND method_key = $2",
        )
        .bind(key)
        .bind(method_key)
        .bind(request_hash)
        .bind(response_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ToolkitError::Internal(format!(
                "idempotency record missing for key={key} method={method_key}"
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        key: &str,
        method_key: &str,
        request_hash: &str,
        error_message: &str,
    ) -> ToolkitResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE idempotency_record \
             SET request_hash = $3, status = 'FAILED', error_message = $4, \
                 locked_at = NULL, locked_by = NULL, updated_at = $5 \
             WHERE idempotency_key = $1 AND method_key = $2",
        )
        .bind(key)
        .bind(method_key)
        .bind(request_hash)
        .bind(error_message)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ToolkitError::Internal(format!(
                "idempotency record missing for key={key} method={method_key}"
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_expired(&self) -> ToolkitResult<u64> {
        let result = sqlx::query(
            "DELETE FROM idempotency_record \
             WHERE expires_at IS NOT NULL AND expires_at < $1",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AuditStore for PostgresStore {
    async fn append(&self, record: AuditRecord) -> ToolkitResult<()> {
        sqlx::query(
            "INSERT INTO audit_call_log \
             (correlation_id, trace_id, component, target_type, method_key, \
              args_json, result_json, status, duration_ms, error_message, \
              error_chain, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6::jsonb, $7::jsonb, $8, $9, $10, $11, $12)",
        )
        .bind(record.correlation_id)
        .bind(record.trace_id)
        .bind(record.component)
        .bind(record.target_type)
        .bind(record.method_key)
        .bind(record.args_json)
        .bind(record.result_json)
        .bind(record.status.as_str())
        .bind(record.duration_ms)
        .bind(record.error_message)
        .bind(record.error_chain)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl PolicyStore for PostgresStore {
    async fn find(
        &self,
        client_key: &str,
        method_key: &str,
    ) -> ToolkitResult<Option<PolicyRecord>> {
        let row = sqlx::query_as::<_, PolicyRow>(
            "SELECT client_key, method_key, enabled, rl_permits_per_sec, rl_burst, \
                    retry_max_attempts, retry_backoff_ms, cache_ttl_seconds, \
                    idempotency_ttl_seconds, created_at, updated_at \
             FROM api_client_policy \
             WHERE client_key = $1 AND method_key = $2",
        )
        .bind(client_key)
        .bind(method_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PolicyRecord::from))
    }
}

#[async_trait]
impl CredentialStore for PostgresStore {
    async fn find_active_by_hash(
        &self,
        api_key_hash: &str,
    ) -> ToolkitResult<Option<CredentialRecord>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            "SELECT api_key_hash, client_id, active, created_at \
             FROM api_client_credential \
             WHERE api_key_hash = $1 AND active",
        )
        .bind(api_key_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CredentialRecord::from))
    }
}

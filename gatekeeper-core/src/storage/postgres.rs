//! Postgres-backed `StorageBackend`, enforced by row-level security.
//!
//! Every method opens (or reuses, inside `store_journal_entry`'s single
//! insert) a transaction and issues `SET LOCAL app.user_handle = $1` before
//! touching a tenant table, so a forgotten `WHERE user_handle = ...`
//! predicate is still blocked by the table's RLS policy rather than leaking
//! another tenant's rows. `SET LOCAL` is transaction-scoped and is
//! automatically cleared on commit or rollback — nothing to reset by hand.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::UserHandle;
use crate::repository::Pagination;
use crate::subscription::{SubscriptionRecord, SubscriptionRegistry, SubscriptionStatus};
use crate::tiers::Tier;

use super::{BackendHealth, JournalEntry, JournalFilter, Preference, StorageBackend, StorageRecord, UserStats};

/// `sqlx::migrate!` embeds the SQL files under `gatekeeper-core/migrations`
/// at compile time; `PostgresStorage::migrate` runs them idempotently.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs pending migrations. Safe to call on every startup.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("migration failed: {e}")))
    }

    async fn begin_scoped(&self, user_handle: &UserHandle) -> Result<Transaction<'_, Postgres>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Internal(format!("failed to begin transaction: {e}")))?;
        sqlx::query("SELECT set_config('app.user_handle', $1, true)")
            .bind(user_handle.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Internal(format!("failed to scope transaction: {e}")))?;
        Ok(tx)
    }
}

#[derive(sqlx::FromRow)]
struct JournalEntryRow {
    id: Uuid,
    user_handle: String,
    text: String,
    entry_type: String,
    tags: Vec<String>,
    metadata: Value,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<JournalEntryRow> for JournalEntry {
    fn from(row: JournalEntryRow) -> Self {
        JournalEntry {
            id: row.id,
            user_handle: row.user_handle,
            text: row.text,
            entry_type: row.entry_type,
            tags: row.tags,
            metadata: row.metadata,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for PostgresStorage {
    async fn store_journal_entry(
        &self,
        user_handle: &UserHandle,
        text: &str,
        entry_type: &str,
        tags: &[String],
        metadata: Value,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let mut tx = self.begin_scoped(user_handle).await?;
        sqlx::query(
            r#"
            INSERT INTO journal_entries (id, user_handle, text, entry_type, tags, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            "#,
        )
        .bind(id)
        .bind(user_handle.as_str())
        .bind(text)
        .bind(entry_type)
        .bind(tags)
        .bind(&metadata)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Internal(format!("failed to store journal entry: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("failed to commit journal entry: {e}")))?;
        Ok(id)
    }

    async fn get_journal_entries(
        &self,
        user_handle: &UserHandle,
        filter: &JournalFilter,
        pagination: Pagination,
    ) -> Result<Vec<JournalEntry>> {
        let mut tx = self.begin_scoped(user_handle).await?;
        let rows = sqlx::query_as::<_, JournalEntryRow>(
            r#"
            SELECT id, user_handle, text, entry_type, tags, metadata, created_at, deleted_at
            FROM journal_entries
            WHERE user_handle = $1
              AND deleted_at IS NULL
              AND ($2::text IS NULL OR entry_type = $2)
              AND ($3::text IS NULL OR tags @> ARRAY[$3]::text[])
              AND ($4::timestamptz IS NULL OR created_at >= $4)
            ORDER BY created_at DESC
            OFFSET $5 LIMIT $6
            "#,
        )
        .bind(user_handle.as_str())
        .bind(&filter.entry_type)
        .bind(&filter.tag)
        .bind(filter.since)
        .bind(pagination.offset as i64)
        .bind(pagination.limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Error::Internal(format!("failed to query journal entries: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("failed to commit journal query: {e}")))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_entry(&self, user_handle: &UserHandle, entry_id: Uuid) -> Result<JournalEntry> {
        let mut tx = self.begin_scoped(user_handle).await?;
        let row = sqlx::query_as::<_, JournalEntryRow>(
            r#"
            SELECT id, user_handle, text, entry_type, tags, metadata, created_at, deleted_at
            FROM journal_entries
            WHERE user_handle = $1 AND id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(user_handle.as_str())
        .bind(entry_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Internal(format!("failed to fetch journal entry: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("failed to commit entry fetch: {e}")))?;
        row.map(Into::into).ok_or_else(|| Error::NotFound {
            resource: format!("journal entry {entry_id}"),
        })
    }

    async fn put_preference(&self, user_handle: &UserHandle, key: &str, value: Value) -> Result<()> {
        let mut tx = self.begin_scoped(user_handle).await?;
        sqlx::query(
            r#"
            INSERT INTO user_preferences (user_handle, key, value, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (user_handle, key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
            "#,
        )
        .bind(user_handle.as_str())
        .bind(key)
        .bind(&value)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Internal(format!("failed to store preference: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("failed to commit preference: {e}")))?;
        Ok(())
    }

    async fn get_preference(&self, user_handle: &UserHandle, key: &str) -> Result<Option<Preference>> {
        let mut tx = self.begin_scoped(user_handle).await?;
        let row: Option<(String, Value)> =
            sqlx::query_as("SELECT key, value FROM user_preferences WHERE user_handle = $1 AND key = $2")
                .bind(user_handle.as_str())
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| Error::Internal(format!("failed to fetch preference: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("failed to commit preference fetch: {e}")))?;
        Ok(row.map(|(key, value)| Preference { key, value }))
    }

    async fn put_record(
        &self,
        user_handle: &UserHandle,
        record_type: &str,
        record_key: &str,
        payload: Value,
    ) -> Result<()> {
        let mut tx = self.begin_scoped(user_handle).await?;
        sqlx::query(
            r#"
            INSERT INTO storage_records (user_handle, record_type, record_key, payload, created_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (user_handle, record_type, record_key)
                DO UPDATE SET payload = EXCLUDED.payload, created_at = now()
            "#,
        )
        .bind(user_handle.as_str())
        .bind(record_type)
        .bind(record_key)
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Internal(format!("failed to store record: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("failed to commit record: {e}")))?;
        Ok(())
    }

    async fn get_records(
        &self,
        user_handle: &UserHandle,
        record_type: &str,
        key_prefix: Option<&str>,
    ) -> Result<Vec<StorageRecord>> {
        let mut tx = self.begin_scoped(user_handle).await?;
        let rows: Vec<(String, String, Value, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT record_type, record_key, payload, created_at
            FROM storage_records
            WHERE user_handle = $1 AND record_type = $2
              AND ($3::text IS NULL OR record_key LIKE $3 || '%')
            ORDER BY record_key
            "#,
        )
        .bind(user_handle.as_str())
        .bind(record_type)
        .bind(key_prefix)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Error::Internal(format!("failed to query records: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("failed to commit record query: {e}")))?;
        Ok(rows
            .into_iter()
            .map(|(record_type, record_key, payload, created_at)| StorageRecord {
                record_type,
                record_key,
                payload,
                created_at,
            })
            .collect())
    }

    async fn user_stats(&self, user_handle: &UserHandle) -> Result<UserStats> {
        let mut tx = self.begin_scoped(user_handle).await?;
        let (entries_total, entries_this_month, storage_bytes): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE deleted_at IS NULL),
                COUNT(*) FILTER (WHERE deleted_at IS NULL AND created_at >= now() - interval '30 days'),
                COALESCE(SUM(length(text)) FILTER (WHERE deleted_at IS NULL), 0)
            FROM journal_entries
            WHERE user_handle = $1
            "#,
        )
        .bind(user_handle.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Internal(format!("failed to compute user stats: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| Error::Internal(format!("failed to commit stats query: {e}")))?;
        Ok(UserStats {
            entries_total,
            entries_this_month,
            storage_bytes,
        })
    }

    async fn health(&self) -> Result<BackendHealth> {
        let start = std::time::Instant::now();
        let result = sqlx::query("SELECT 1").execute(&self.pool).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        Ok(BackendHealth {
            ok: result.is_ok(),
            latency_ms,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    email_normalized: String,
    subscription_key: String,
    tier: String,
    status: String,
    expires_at: Option<DateTime<Utc>>,
    grace_until: Option<DateTime<Utc>>,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = Error;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        let tier = Tier::parse(&row.tier)
            .ok_or_else(|| Error::Internal(format!("unknown tier in subscription registry: {}", row.tier)))?;
        let status = match row.status.as_str() {
            "active" => SubscriptionStatus::Active,
            "expired" => SubscriptionStatus::Expired,
            "revoked" => SubscriptionStatus::Revoked,
            "grace" => SubscriptionStatus::Grace,
            other => return Err(Error::Internal(format!("unknown subscription status: {other}"))),
        };
        Ok(SubscriptionRecord {
            email_normalized: row.email_normalized,
            key: row.subscription_key,
            tier,
            status,
            expires_at: row.expires_at,
            grace_until: row.grace_until,
        })
    }
}

/// Queries `user_subscriptions` directly against the primary pool — this
/// table has no tenant-scoping RLS policy since it's keyed by email, not a
/// `user_handle` (the handle doesn't exist yet until a lookup succeeds).
#[async_trait::async_trait]
impl SubscriptionRegistry for PostgresStorage {
    async fn find_by_email(&self, email_normalized: &str) -> Result<Option<SubscriptionRecord>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT email_normalized, subscription_key, tier, status, expires_at, grace_until
            FROM user_subscriptions
            WHERE email_normalized = $1
            "#,
        )
        .bind(email_normalized)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("subscription registry query failed: {e}")))?;

        row.map(TryFrom::try_from).transpose()
    }
}

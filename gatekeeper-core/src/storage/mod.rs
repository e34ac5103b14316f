//! The tenant-scoped persistence contract and its implementations.
//!
//! Grounded in `repository/traits.rs`'s RPITIT async-fn-in-trait technique,
//! but not its generic `Repository<Id, Entity, Create, Update>` shape: the
//! four fixed tables this gateway owns don't have uniform CRUD operations
//! (`user_stats` has no analog in a generic repository), so the contract is
//! a hand-written trait with one method per spec'd operation.

mod memory;
#[cfg(feature = "database")]
mod postgres;

pub use memory::{InMemoryStorage, InMemorySubscriptionRegistry};
#[cfg(feature = "database")]
pub use postgres::PostgresStorage;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::identity::UserHandle;
use crate::repository::{FilterCondition, OrderDirection, Pagination};

/// A single journal entry, as returned by `get_journal_entries`/`get_entry`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JournalEntry {
    pub id: uuid::Uuid,
    pub user_handle: String,
    pub text: String,
    pub entry_type: String,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Filter applied by `get_journal_entries`.
#[derive(Debug, Clone, Default)]
pub struct JournalFilter {
    pub entry_type: Option<String>,
    pub tag: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

/// A user-scoped key/value preference row.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Preference {
    pub key: String,
    pub value: Value,
}

/// A generic, typed storage record (`storage_records` table).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StorageRecord {
    pub record_type: String,
    pub record_key: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Aggregate usage counters returned by `user_stats`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UserStats {
    pub entries_total: i64,
    pub entries_this_month: i64,
    pub storage_bytes: i64,
}

/// Liveness probe result for a single backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendHealth {
    pub ok: bool,
    pub latency_ms: u64,
}

/// Tenant-scoped persistence contract.
///
/// Every method is implicitly scoped to `user_handle`: implementations MUST
/// add an explicit `user_handle = ?` predicate to every query in addition
/// to whatever row-level-security policy the underlying engine enforces —
/// cross-tenant reads must be impossible by construction at two
/// independent layers, not one.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    async fn store_journal_entry(
        &self,
        user_handle: &UserHandle,
        text: &str,
        entry_type: &str,
        tags: &[String],
        metadata: Value,
    ) -> Result<uuid::Uuid>;

    async fn get_journal_entries(
        &self,
        user_handle: &UserHandle,
        filter: &JournalFilter,
        pagination: Pagination,
    ) -> Result<Vec<JournalEntry>>;

    async fn get_entry(&self, user_handle: &UserHandle, entry_id: uuid::Uuid) -> Result<JournalEntry>;

    async fn put_preference(&self, user_handle: &UserHandle, key: &str, value: Value) -> Result<()>;

    async fn get_preference(&self, user_handle: &UserHandle, key: &str) -> Result<Option<Preference>>;

    async fn put_record(
        &self,
        user_handle: &UserHandle,
        record_type: &str,
        record_key: &str,
        payload: Value,
    ) -> Result<()>;

    async fn get_records(
        &self,
        user_handle: &UserHandle,
        record_type: &str,
        key_prefix: Option<&str>,
    ) -> Result<Vec<StorageRecord>>;

    async fn user_stats(&self, user_handle: &UserHandle) -> Result<UserStats>;

    async fn health(&self) -> Result<BackendHealth>;
}

/// Builds the default `created_at DESC` ordering `get_journal_entries`
/// uses when no explicit order is requested by a caller.
pub fn default_journal_order() -> (&'static str, OrderDirection) {
    ("created_at", OrderDirection::Descending)
}

/// Builds the filter set `get_journal_entries` passes down to a backend
/// from the public [`JournalFilter`] shape, for backends (like Postgres)
/// that build dynamic `WHERE` clauses from [`FilterCondition`]s.
pub fn journal_filter_conditions(filter: &JournalFilter) -> Vec<FilterCondition> {
    let mut conditions = Vec::new();
    if let Some(entry_type) = &filter.entry_type {
        conditions.push(FilterCondition::eq("entry_type", entry_type.clone()));
    }
    if let Some(tag) = &filter.tag {
        conditions.push(FilterCondition::contains("tags", tag.clone()));
    }
    if let Some(since) = filter.since {
        conditions.push(FilterCondition::gte("created_at", since));
    }
    conditions
}

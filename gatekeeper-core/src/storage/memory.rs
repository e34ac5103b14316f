//! In-memory `StorageBackend`, used by tests and by `InMemoryStorage::new()`
//! deployments that haven't configured `DATABASE_URL` yet.
//!
//! Not row-level-security-enforced by a database engine — tenant isolation
//! here is just "only ever look at the map entry keyed by this user's own
//! handle," which is the same invariant the Postgres backend enforces twice
//! (query predicate + RLS policy). Good enough for tests; never meant to run
//! in production, hence no `optional`/`lazy_init` knobs mirroring it.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::UserHandle;
use crate::repository::Pagination;
use crate::subscription::{SubscriptionRecord, SubscriptionRegistry};

use super::{BackendHealth, JournalEntry, JournalFilter, Preference, StorageBackend, StorageRecord, UserStats};

#[derive(Default)]
struct TenantData {
    journal: Vec<JournalEntry>,
    preferences: HashMap<String, Value>,
    records: HashMap<(String, String), StorageRecord>,
}

/// Test/development stand-in for [`PostgresStorage`](super::PostgresStorage).
pub struct InMemoryStorage {
    tenants: Mutex<HashMap<UserHandle, TenantData>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tenants: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_filter(entry: &JournalEntry, filter: &JournalFilter) -> bool {
    if let Some(entry_type) = &filter.entry_type {
        if &entry.entry_type != entry_type {
            return false;
        }
    }
    if let Some(tag) = &filter.tag {
        if !entry.tags.iter().any(|t| t == tag) {
            return false;
        }
    }
    if let Some(since) = filter.since {
        if entry.created_at < since {
            return false;
        }
    }
    true
}

#[async_trait::async_trait]
impl StorageBackend for InMemoryStorage {
    async fn store_journal_entry(
        &self,
        user_handle: &UserHandle,
        text: &str,
        entry_type: &str,
        tags: &[String],
        metadata: Value,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let entry = JournalEntry {
            id,
            user_handle: user_handle.as_str().to_string(),
            text: text.to_string(),
            entry_type: entry_type.to_string(),
            tags: tags.to_vec(),
            metadata,
            created_at: Utc::now(),
            deleted_at: None,
        };
        let mut tenants = self.tenants.lock().expect("tenant map lock poisoned");
        tenants.entry(user_handle.clone()).or_default().journal.push(entry);
        Ok(id)
    }

    async fn get_journal_entries(
        &self,
        user_handle: &UserHandle,
        filter: &JournalFilter,
        pagination: Pagination,
    ) -> Result<Vec<JournalEntry>> {
        let tenants = self.tenants.lock().expect("tenant map lock poisoned");
        let Some(data) = tenants.get(user_handle) else {
            return Ok(Vec::new());
        };
        let mut matching: Vec<JournalEntry> = data
            .journal
            .iter()
            .filter(|e| e.deleted_at.is_none())
            .filter(|e| matches_filter(e, filter))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let start = pagination.offset as usize;
        let end = start.saturating_add(pagination.limit as usize);
        Ok(matching.into_iter().skip(start).take(end.saturating_sub(start)).collect())
    }

    async fn get_entry(&self, user_handle: &UserHandle, entry_id: Uuid) -> Result<JournalEntry> {
        let tenants = self.tenants.lock().expect("tenant map lock poisoned");
        tenants
            .get(user_handle)
            .and_then(|data| data.journal.iter().find(|e| e.id == entry_id && e.deleted_at.is_none()))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                resource: format!("journal entry {entry_id}"),
            })
    }

    async fn put_preference(&self, user_handle: &UserHandle, key: &str, value: Value) -> Result<()> {
        let mut tenants = self.tenants.lock().expect("tenant map lock poisoned");
        tenants
            .entry(user_handle.clone())
            .or_default()
            .preferences
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get_preference(&self, user_handle: &UserHandle, key: &str) -> Result<Option<Preference>> {
        let tenants = self.tenants.lock().expect("tenant map lock poisoned");
        Ok(tenants.get(user_handle).and_then(|data| {
            data.preferences.get(key).map(|value| Preference {
                key: key.to_string(),
                value: value.clone(),
            })
        }))
    }

    async fn put_record(
        &self,
        user_handle: &UserHandle,
        record_type: &str,
        record_key: &str,
        payload: Value,
    ) -> Result<()> {
        let mut tenants = self.tenants.lock().expect("tenant map lock poisoned");
        tenants.entry(user_handle.clone()).or_default().records.insert(
            (record_type.to_string(), record_key.to_string()),
            StorageRecord {
                record_type: record_type.to_string(),
                record_key: record_key.to_string(),
                payload,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_records(
        &self,
        user_handle: &UserHandle,
        record_type: &str,
        key_prefix: Option<&str>,
    ) -> Result<Vec<StorageRecord>> {
        let tenants = self.tenants.lock().expect("tenant map lock poisoned");
        let Some(data) = tenants.get(user_handle) else {
            return Ok(Vec::new());
        };
        let mut records: Vec<StorageRecord> = data
            .records
            .values()
            .filter(|r| r.record_type == record_type)
            .filter(|r| key_prefix.map_or(true, |prefix| r.record_key.starts_with(prefix)))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.record_key.cmp(&b.record_key));
        Ok(records)
    }

    async fn user_stats(&self, user_handle: &UserHandle) -> Result<UserStats> {
        let tenants = self.tenants.lock().expect("tenant map lock poisoned");
        let Some(data) = tenants.get(user_handle) else {
            return Ok(UserStats {
                entries_total: 0,
                entries_this_month: 0,
                storage_bytes: 0,
            });
        };
        let live: Vec<&JournalEntry> = data.journal.iter().filter(|e| e.deleted_at.is_none()).collect();
        let month_ago = Utc::now() - chrono::Duration::days(30);
        let entries_this_month = live.iter().filter(|e| e.created_at >= month_ago).count() as i64;
        let storage_bytes = live.iter().map(|e| e.text.len() as i64).sum();
        Ok(UserStats {
            entries_total: live.len() as i64,
            entries_this_month,
            storage_bytes,
        })
    }

    async fn health(&self) -> Result<BackendHealth> {
        Ok(BackendHealth { ok: true, latency_ms: 0 })
    }
}

/// Test/development stand-in for a Postgres-backed `user_subscriptions`
/// lookup, keyed by normalized email. Not RLS-scoped, same as its
/// production counterpart: subscriptions are keyed by email, not tenant.
#[derive(Default)]
pub struct InMemorySubscriptionRegistry {
    records: Mutex<HashMap<String, SubscriptionRecord>>,
}

impl InMemorySubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds (or replaces) the subscription row for `record.email_normalized`.
    pub fn seed(&self, record: SubscriptionRecord) {
        let mut records = self.records.lock().expect("subscription map lock poisoned");
        records.insert(record.email_normalized.clone(), record);
    }
}

#[async_trait::async_trait]
impl SubscriptionRegistry for InMemorySubscriptionRegistry {
    async fn find_by_email(&self, email_normalized: &str) -> Result<Option<SubscriptionRecord>> {
        let records = self.records.lock().expect("subscription map lock poisoned");
        Ok(records.get(email_normalized).cloned())
    }
}

//! Storage-backed tools: journal entries, preferences, typed records, and
//! aggregate usage stats. Each is a thin, schema-validated wrapper around
//! one or two [`StorageBackend`] calls.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::rate_limiter::Permission;
use crate::repository::Pagination;
use crate::storage::{JournalFilter, StorageBackend};

use super::{AuthContext, Tool};

pub struct StoreJournalEntry {
    storage: Arc<dyn StorageBackend>,
}

impl StoreJournalEntry {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl Tool for StoreJournalEntry {
    fn name(&self) -> &'static str {
        "store_journal_entry"
    }

    fn description(&self) -> &'static str {
        "Appends a free-text journal entry, optionally tagged and typed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "minLength": 1 },
                "entry_type": { "type": "string", "default": "note" },
                "tags": { "type": "array", "items": { "type": "string" } },
                "metadata": { "type": "object" },
            },
            "required": ["text"],
            "additionalProperties": false,
        })
    }

    fn permission(&self) -> Permission {
        Permission::Write
    }

    async fn execute(&self, ctx: &AuthContext, params: Value) -> Result<Value> {
        let text = params["text"].as_str().ok_or_else(|| Error::InvalidParameters {
            path: "$.text".into(),
            message: "required".into(),
        })?;
        let entry_type = params["entry_type"].as_str().unwrap_or("note");
        let tags: Vec<String> = params["tags"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let metadata = params.get("metadata").cloned().unwrap_or_else(|| json!({}));

        let id = self
            .storage
            .store_journal_entry(&ctx.user_handle, text, entry_type, &tags, metadata)
            .await?;
        Ok(json!({ "id": id }))
    }
}

pub struct GetJournalEntries {
    storage: Arc<dyn StorageBackend>,
}

impl GetJournalEntries {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl Tool for GetJournalEntries {
    fn name(&self) -> &'static str {
        "get_journal_entries"
    }

    fn description(&self) -> &'static str {
        "Lists journal entries, optionally filtered by type, tag, or recency."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "entry_type": { "type": "string" },
                "tag": { "type": "string" },
                "since": { "type": "string", "format": "date-time" },
                "offset": { "type": "integer", "minimum": 0 },
                "limit": { "type": "integer", "minimum": 1, "maximum": 500 },
            },
            "additionalProperties": false,
        })
    }

    fn permission(&self) -> Permission {
        Permission::Read
    }

    async fn execute(&self, ctx: &AuthContext, params: Value) -> Result<Value> {
        let filter = JournalFilter {
            entry_type: params["entry_type"].as_str().map(String::from),
            tag: params["tag"].as_str().map(String::from),
            since: params["since"]
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc)),
        };
        let pagination = Pagination {
            offset: params["offset"].as_u64().unwrap_or(0),
            limit: params["limit"].as_u64().unwrap_or(20),
        };

        let entries = self.storage.get_journal_entries(&ctx.user_handle, &filter, pagination).await?;
        Ok(json!({ "entries": entries }))
    }
}

pub struct GetEntry {
    storage: Arc<dyn StorageBackend>,
}

impl GetEntry {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl Tool for GetEntry {
    fn name(&self) -> &'static str {
        "get_entry"
    }

    fn description(&self) -> &'static str {
        "Fetches a single journal entry by id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "id": { "type": "string", "format": "uuid" } },
            "required": ["id"],
            "additionalProperties": false,
        })
    }

    fn permission(&self) -> Permission {
        Permission::Read
    }

    async fn execute(&self, ctx: &AuthContext, params: Value) -> Result<Value> {
        let id_str = params["id"].as_str().ok_or_else(|| Error::InvalidParameters {
            path: "$.id".into(),
            message: "required".into(),
        })?;
        let id = uuid::Uuid::parse_str(id_str).map_err(|_| Error::InvalidParameters {
            path: "$.id".into(),
            message: "not a valid uuid".into(),
        })?;
        let entry = self.storage.get_entry(&ctx.user_handle, id).await?;
        Ok(serde_json::to_value(entry).expect("JournalEntry always serializes"))
    }
}

pub struct PutPreference {
    storage: Arc<dyn StorageBackend>,
}

impl PutPreference {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl Tool for PutPreference {
    fn name(&self) -> &'static str {
        "put_preference"
    }

    fn description(&self) -> &'static str {
        "Sets a user-scoped key/value preference."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "minLength": 1 },
                "value": {},
            },
            "required": ["key", "value"],
            "additionalProperties": false,
        })
    }

    fn permission(&self) -> Permission {
        Permission::Write
    }

    async fn execute(&self, ctx: &AuthContext, params: Value) -> Result<Value> {
        let key = params["key"].as_str().ok_or_else(|| Error::InvalidParameters {
            path: "$.key".into(),
            message: "required".into(),
        })?;
        let value = params.get("value").cloned().unwrap_or(Value::Null);
        self.storage.put_preference(&ctx.user_handle, key, value).await?;
        Ok(json!({ "stored": true }))
    }
}

pub struct GetPreference {
    storage: Arc<dyn StorageBackend>,
}

impl GetPreference {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl Tool for GetPreference {
    fn name(&self) -> &'static str {
        "get_preference"
    }

    fn description(&self) -> &'static str {
        "Reads a user-scoped preference by key."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "key": { "type": "string", "minLength": 1 } },
            "required": ["key"],
            "additionalProperties": false,
        })
    }

    fn permission(&self) -> Permission {
        Permission::Read
    }

    async fn execute(&self, ctx: &AuthContext, params: Value) -> Result<Value> {
        let key = params["key"].as_str().ok_or_else(|| Error::InvalidParameters {
            path: "$.key".into(),
            message: "required".into(),
        })?;
        let pref = self.storage.get_preference(&ctx.user_handle, key).await?;
        Ok(json!({ "preference": pref }))
    }
}

pub struct PutRecord {
    storage: Arc<dyn StorageBackend>,
}

impl PutRecord {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl Tool for PutRecord {
    fn name(&self) -> &'static str {
        "put_record"
    }

    fn description(&self) -> &'static str {
        "Stores a typed, key-addressed record (e.g. a cached quote)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "record_type": { "type": "string", "minLength": 1 },
                "record_key": { "type": "string", "minLength": 1 },
                "payload": {},
            },
            "required": ["record_type", "record_key", "payload"],
            "additionalProperties": false,
        })
    }

    fn permission(&self) -> Permission {
        Permission::Write
    }

    fn required_feature(&self) -> Option<&'static str> {
        Some("records")
    }

    async fn execute(&self, ctx: &AuthContext, params: Value) -> Result<Value> {
        let record_type = params["record_type"].as_str().ok_or_else(|| Error::InvalidParameters {
            path: "$.record_type".into(),
            message: "required".into(),
        })?;
        let record_key = params["record_key"].as_str().ok_or_else(|| Error::InvalidParameters {
            path: "$.record_key".into(),
            message: "required".into(),
        })?;
        let payload = params.get("payload").cloned().unwrap_or(Value::Null);
        self.storage.put_record(&ctx.user_handle, record_type, record_key, payload).await?;
        Ok(json!({ "stored": true }))
    }
}

pub struct GetRecords {
    storage: Arc<dyn StorageBackend>,
}

impl GetRecords {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl Tool for GetRecords {
    fn name(&self) -> &'static str {
        "get_records"
    }

    fn description(&self) -> &'static str {
        "Lists records of a given type, optionally filtered by key prefix."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "record_type": { "type": "string", "minLength": 1 },
                "key_prefix": { "type": "string" },
            },
            "required": ["record_type"],
            "additionalProperties": false,
        })
    }

    fn permission(&self) -> Permission {
        Permission::Read
    }

    fn required_feature(&self) -> Option<&'static str> {
        Some("records")
    }

    async fn execute(&self, ctx: &AuthContext, params: Value) -> Result<Value> {
        let record_type = params["record_type"].as_str().ok_or_else(|| Error::InvalidParameters {
            path: "$.record_type".into(),
            message: "required".into(),
        })?;
        let key_prefix = params["key_prefix"].as_str();
        let records = self.storage.get_records(&ctx.user_handle, record_type, key_prefix).await?;
        Ok(json!({ "records": records }))
    }
}

pub struct GetUserStats {
    storage: Arc<dyn StorageBackend>,
}

impl GetUserStats {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl Tool for GetUserStats {
    fn name(&self) -> &'static str {
        "get_user_stats"
    }

    fn description(&self) -> &'static str {
        "Returns aggregate usage counters for the caller's own tenant."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    fn permission(&self) -> Permission {
        Permission::Read
    }

    async fn execute(&self, ctx: &AuthContext, _params: Value) -> Result<Value> {
        let stats = self.storage.user_stats(&ctx.user_handle).await?;
        Ok(serde_json::to_value(stats).expect("UserStats always serializes"))
    }
}

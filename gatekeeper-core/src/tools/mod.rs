//! Tool registry and dispatch: the surface `tools/call` actually invokes.
//!
//! One small trait, one registry keyed by name. Tools are heterogeneous
//! (each has its own parameter schema and storage shape), so there is no
//! shared generic; `Tool` is an object-safe trait dispatched through
//! `Arc<dyn Tool>`.

mod builtin;
mod market;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::identity::UserHandle;
use crate::rate_limiter::Permission;
use crate::storage::StorageBackend;
use crate::tiers::{Tier, TierCatalog};

/// Everything a [`Tool`] needs to know about the caller it's executing for.
/// Built by `persistence_adapter::dispatch` once subscription validation,
/// identity derivation, and rate limiting have all passed.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_handle: UserHandle,
    pub email_normalized: String,
    pub tier: Tier,
    pub upstream_api_key: Option<String>,
    pub upstream_api_secret: Option<String>,
}

/// A tool's advertised shape, as returned by `tools/list`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// The envelope every tool invocation resolves to, regardless of outcome.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A single callable tool. Implementations own their storage/upstream
/// dependencies and are stateless otherwise — all per-caller state lives in
/// the [`AuthContext`] passed to [`Tool::execute`].
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON Schema (draft 2020-12 subset) describing `tools/call`'s
    /// `arguments` object for this tool.
    fn parameters_schema(&self) -> Value;

    /// Whether invoking this tool counts against the read or write rate
    /// limit window, and which fail-open/fail-closed rule applies when the
    /// rate limiter's backing store is unreachable.
    fn permission(&self) -> Permission;

    /// A tier feature flag gating this tool, checked via
    /// [`TierCatalog::has_feature`]. `None` means every tier may call it.
    fn required_feature(&self) -> Option<&'static str> {
        None
    }

    async fn execute(&self, ctx: &AuthContext, params: Value) -> Result<Value>;
}

/// Startup-populated table of callable tools, keyed by name.
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    /// Builds the registry this service ships: journal, preferences,
    /// records, usage stats, and the upstream-backed market snapshot.
    pub fn with_default_tools(storage: Arc<dyn StorageBackend>, upstream_client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(builtin::StoreJournalEntry::new(storage.clone())));
        registry.register(Arc::new(builtin::GetJournalEntries::new(storage.clone())));
        registry.register(Arc::new(builtin::GetEntry::new(storage.clone())));
        registry.register(Arc::new(builtin::PutPreference::new(storage.clone())));
        registry.register(Arc::new(builtin::GetPreference::new(storage.clone())));
        registry.register(Arc::new(builtin::PutRecord::new(storage.clone())));
        registry.register(Arc::new(builtin::GetRecords::new(storage.clone())));
        registry.register(Arc::new(builtin::GetUserStats::new(storage)));
        registry.register(Arc::new(market::GetMarketSnapshot::new(upstream_client)));
        registry
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn list_schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Looks up `name`, checks tier entitlement, validates `params` against
    /// the tool's schema, then times and runs it.
    pub async fn dispatch(&self, ctx: &AuthContext, name: &str, params: Value) -> Result<ToolResult> {
        let tool = self.get(name).ok_or_else(|| Error::UnknownTool { name: name.to_string() })?;

        if let Some(feature) = tool.required_feature() {
            if !TierCatalog.has_feature(ctx.tier, feature) {
                return Err(Error::Unauthorized {
                    reason: crate::error::UnauthorizedReason::InsufficientTier,
                });
            }
        }

        validate_params(&tool.parameters_schema(), &params)?;

        let start = Instant::now();
        let outcome = tool.execute(ctx, params).await;
        let execution_time_ms = start.elapsed().as_millis() as u64;

        Ok(match outcome {
            Ok(data) => ToolResult {
                success: true,
                data: Some(data),
                error: None,
                execution_time_ms,
                metadata: None,
            },
            Err(err) => ToolResult {
                success: false,
                data: None,
                error: Some(err.to_jsonrpc_parts().1),
                execution_time_ms,
                metadata: None,
            },
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_params(schema: &Value, params: &Value) -> Result<()> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| Error::Internal(format!("invalid tool parameter schema: {e}")))?;
    if let Some(error) = validator.iter_errors(params).next() {
        return Err(Error::InvalidParameters {
            path: error.instance_path.to_string(),
            message: error.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;
    use crate::storage::InMemoryStorage;
    use serde_json::json;

    fn ctx() -> AuthContext {
        AuthContext {
            user_handle: identity::derive_handle("user@example.com", identity::DEFAULT_NAMESPACE).unwrap(),
            email_normalized: "user@example.com".into(),
            tier: Tier::Premium,
            upstream_api_key: None,
            upstream_api_secret: None,
        }
    }

    fn registry() -> ToolRegistry {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
        ToolRegistry::with_default_tools(storage, reqwest::Client::new())
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected_before_schema_validation() {
        let registry = registry();
        let err = registry.dispatch(&ctx(), "nonexistent", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::UnknownTool { .. }));
    }

    #[tokio::test]
    async fn insufficient_tier_is_rejected_before_execution() {
        let registry = registry();
        let mut low_tier = ctx();
        low_tier.tier = Tier::Free;
        let err = registry
            .dispatch(&low_tier, "get_market_snapshot", json!({ "symbol": "AAPL" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn malformed_params_fail_schema_validation() {
        let registry = registry();
        let err = registry
            .dispatch(&ctx(), "store_journal_entry", json!({ "text": 123 }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameters { .. }));
    }

    #[tokio::test]
    async fn journal_round_trip_through_the_registry() {
        let registry = registry();
        let stored = registry
            .dispatch(
                &ctx(),
                "store_journal_entry",
                json!({ "text": "hello", "entry_type": "note" }),
            )
            .await
            .unwrap();
        assert!(stored.success);

        let listed = registry
            .dispatch(&ctx(), "get_journal_entries", json!({}))
            .await
            .unwrap();
        assert!(listed.success);
        assert_eq!(listed.data.unwrap()["entries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_schemas_is_sorted_and_non_empty() {
        let registry = registry();
        let schemas = registry.list_schemas();
        assert!(!schemas.is_empty());
        let mut names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        names.dedup();
        assert_eq!(names.len(), schemas.len());
    }
}

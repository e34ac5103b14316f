//! JSON-RPC 2.0 envelope and the MCP method table
//! (`initialize`, `tools/list`, `tools/call`, `ping`).
//!
//! Shared by both transports: each extracts credentials its own way, then
//! calls [`dispatch`] with the parsed [`JsonRpcRequest`]. Neither transport
//! special-cases a method by name outside this module.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::persistence_adapter::{self, RawCredentials};
use crate::state::AppState;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;

/// The MCP protocol version this server speaks. Echoed back from
/// `initialize` regardless of what the client requested, since there is
/// exactly one version implemented.
const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A response envelope. Carries exactly one of `result`/`error`, never both
/// — enforced by the two constructors rather than by the type itself, to
/// keep (de)serialization a plain flat struct.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data }),
        }
    }

    /// `true` once a rate-limit or missing-credentials rejection is
    /// wrapped in here; transports that carry HTTP status codes use this
    /// to pick something other than `200 OK`. Pure JSON-RPC transports
    /// (stdio) ignore it entirely.
    pub fn error_code(&self) -> Option<i64> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Builds a response envelope from a dispatch outcome, translating an
/// [`Error`] into its JSON-RPC parts.
pub fn response_from_result(id: Option<Value>, result: Result<Value>) -> JsonRpcResponse {
    match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(err) => {
            let (code, message, data) = err.to_jsonrpc_parts();
            JsonRpcResponse::error(id, code, message, data)
        }
    }
}

/// `dispatch`'s full outcome: the JSON-RPC result (or the [`Error`] that
/// short-circuited it) plus whether the call was only admitted because the
/// rate limiter's backing store was unreachable. Every non-`tools/call`
/// method leaves `rate_limit_degraded` at `false` — only a tool invocation
/// can touch the limiter.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub value: Result<Value>,
    pub rate_limit_degraded: bool,
}

impl DispatchOutcome {
    fn ok(value: Value) -> Self {
        Self { value: Ok(value), rate_limit_degraded: false }
    }

    fn err(error: Error) -> Self {
        Self { value: Err(error), rate_limit_degraded: false }
    }
}

/// Runs one request through the MCP method table. Returns a
/// [`DispatchOutcome`] (rather than an already-wrapped [`JsonRpcResponse`])
/// so callers that care about transport-specific detail — the HTTP
/// transport picks a status code and an `X-RateLimit-Degraded` header from
/// it — can inspect it before wrapping.
pub async fn dispatch(
    state: &AppState,
    request: &JsonRpcRequest,
    credentials: Option<RawCredentials>,
) -> DispatchOutcome {
    match request.method.as_str() {
        "initialize" => DispatchOutcome::ok(initialize(state, request.params.as_ref())),
        "ping" => DispatchOutcome::ok(json!({})),
        "tools/list" => DispatchOutcome::ok(json!({ "tools": state.tools().list_schemas() })),
        "tools/call" => tools_call(state, request.params.as_ref(), credentials).await,
        other => DispatchOutcome::err(Error::UnknownMethod { method: other.to_string() }),
    }
}

/// `initialize` never requires auth and is idempotent: every call returns
/// the same fixed capability set, regardless of what the client claims to
/// support.
fn initialize(state: &AppState, params: Option<&Value>) -> Value {
    let protocol_version = params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(|v| v.as_str())
        .unwrap_or(PROTOCOL_VERSION);

    json!({
        "protocolVersion": protocol_version,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": state.config().service.name,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

async fn tools_call(
    state: &AppState,
    params: Option<&Value>,
    credentials: Option<RawCredentials>,
) -> DispatchOutcome {
    let params = match params {
        Some(params) => params,
        None => {
            return DispatchOutcome::err(Error::InvalidParameters {
                path: "$.params".into(),
                message: "tools/call requires params".into(),
            })
        }
    };

    let name = match params["name"].as_str() {
        Some(name) => name,
        None => {
            return DispatchOutcome::err(Error::InvalidParameters {
                path: "$.params.name".into(),
                message: "required".into(),
            })
        }
    };

    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match persistence_adapter::dispatch(state, credentials, name, arguments).await {
        Ok((result, degraded)) => {
            let value = serde_json::to_value(result)
                .map_err(|e| Error::Internal(format!("failed to serialize tool result: {e}")));
            DispatchOutcome { value, rate_limit_degraded: degraded }
        }
        Err(e) => DispatchOutcome::err(e),
    }
}

/// Extracts `{email, subscription_key, upstream_api_key, upstream_api_secret}`
/// from a JSON-RPC request's `params.auth` object — the fallback the HTTP
/// transport uses when the caller supplied no auth headers, and the only
/// mechanism the stdio transport has (it attaches the same object to every
/// synthesized request from process-start environment values).
pub fn credentials_from_params(params: Option<&Value>) -> Option<RawCredentials> {
    let auth = params?.get("auth")?;
    let email = auth.get("email")?.as_str()?.to_string();
    let subscription_key = auth.get("subscription_key")?.as_str()?.to_string();
    Some(RawCredentials {
        email,
        subscription_key,
        upstream_api_key: auth.get("upstream_api_key").and_then(|v| v.as_str()).map(String::from),
        upstream_api_secret: auth.get("upstream_api_secret").and_then(|v| v.as_str()).map(String::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;
    use crate::storage::{InMemoryStorage, InMemorySubscriptionRegistry};
    use crate::subscription::{SubscriptionRecord, SubscriptionStatus, SubscriptionValidator};
    use crate::tiers::Tier;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_state() -> AppState {
        let storage: Arc<dyn crate::storage::StorageBackend> = Arc::new(InMemoryStorage::new());
        let registry = Arc::new(InMemorySubscriptionRegistry::new());
        registry.seed(SubscriptionRecord {
            email_normalized: identity::normalize_email("user@example.com").unwrap(),
            key: "fm_sub_abcdefgh12345678".into(),
            tier: Tier::Premium,
            status: SubscriptionStatus::Active,
            expires_at: None,
            grace_until: None,
        });
        let validator = Arc::new(SubscriptionValidator::new(
            registry,
            10,
            Duration::from_secs(300),
            Duration::from_secs(30),
        ));
        let redis_config = deadpool_redis::Config::from_url("redis://127.0.0.1:6399/0");
        let redis_pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .expect("lazy redis pool construction never dials the server");
        let rate_limiter = Arc::new(crate::rate_limiter::RateLimiter::new(redis_pool));
        let tools = Arc::new(crate::tools::ToolRegistry::with_default_tools(
            storage.clone(),
            reqwest::Client::new(),
        ));
        AppState::new(Arc::new(crate::config::Config::default()), storage, validator, rate_limiter, tools)
    }

    #[tokio::test]
    async fn initialize_never_requires_credentials() {
        let state = test_state();
        let request = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(json!("a1")),
            method: "initialize".into(),
            params: Some(json!({ "protocolVersion": "2024-11-05", "capabilities": {}, "clientInfo": {"name":"x","version":"0"} })),
        };
        let result = dispatch(&state, &request, None).await.value.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["capabilities"]["tools"], json!({}));
    }

    #[tokio::test]
    async fn tools_list_returns_the_registry_snapshot() {
        let state = test_state();
        let request = JsonRpcRequest { jsonrpc: "2.0".into(), id: Some(json!(1)), method: "tools/list".into(), params: None };
        let result = dispatch(&state, &request, None).await.value.unwrap();
        assert!(!result["tools"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let state = test_state();
        let request = JsonRpcRequest { jsonrpc: "2.0".into(), id: Some(json!(1)), method: "frobnicate".into(), params: None };
        let err = dispatch(&state, &request, None).await.value.unwrap_err();
        assert!(matches!(err, Error::UnknownMethod { .. }));
        assert_eq!(err.jsonrpc_code(), -32601);
    }

    #[tokio::test]
    async fn tools_call_without_credentials_is_unauthorized() {
        let state = test_state();
        let request = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(json!(2)),
            method: "tools/call".into(),
            params: Some(json!({ "name": "get_journal_entries", "arguments": {} })),
        };
        let err = dispatch(&state, &request, None).await.value.unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn tools_call_reaches_the_tool_with_valid_credentials() {
        let state = test_state();
        let creds = RawCredentials {
            email: "user@example.com".into(),
            subscription_key: "fm_sub_abcdefgh12345678".into(),
            upstream_api_key: None,
            upstream_api_secret: None,
        };
        let request = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(json!(3)),
            method: "tools/call".into(),
            params: Some(json!({ "name": "get_journal_entries", "arguments": {} })),
        };
        let outcome = dispatch(&state, &request, Some(creds)).await;
        assert_eq!(outcome.value.unwrap()["success"], true);
        assert!(outcome.rate_limit_degraded);
    }

    #[test]
    fn credentials_from_params_reads_the_auth_object() {
        let params = json!({ "auth": { "email": "a@b.com", "subscription_key": "fm_sub_abcdefgh" } });
        let creds = credentials_from_params(Some(&params)).unwrap();
        assert_eq!(creds.email, "a@b.com");
        assert_eq!(creds.subscription_key, "fm_sub_abcdefgh");
    }

    #[test]
    fn credentials_from_params_is_none_without_an_auth_object() {
        assert!(credentials_from_params(Some(&json!({}))).is_none());
        assert!(credentials_from_params(None).is_none());
    }

    #[test]
    fn response_from_result_wraps_success_and_error() {
        let ok = response_from_result(Some(json!(1)), Ok(json!({"a": 1})));
        assert_eq!(ok.error_code(), None);
        let err = response_from_result(Some(json!(1)), Err(Error::UnknownTool { name: "x".into() }));
        assert_eq!(err.error_code(), Some(-32601));
    }
}

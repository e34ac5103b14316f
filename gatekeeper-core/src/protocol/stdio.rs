//! Stdio transport: one JSON-RPC object per line on stdin, one per line on
//! stdout. Credentials are read once from the environment at process
//! start and attached to every request — there is no per-request header
//! mechanism on this transport.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};
use crate::persistence_adapter::RawCredentials;
use crate::protocol::jsonrpc::{self, JsonRpcRequest, JsonRpcResponse};
use crate::state::AppState;

/// Reads `USER_EMAIL` / `SUBSCRIPTION_KEY` (and the optional upstream
/// pass-through pair) from the process environment. `None` when either
/// required variable is absent — every `tools/call` then fails the same
/// way a bare HTTP request with no auth headers would.
pub fn credentials_from_env() -> Option<RawCredentials> {
    let email = std::env::var("USER_EMAIL").ok()?;
    let subscription_key = std::env::var("SUBSCRIPTION_KEY").ok()?;
    Some(RawCredentials {
        email,
        subscription_key,
        upstream_api_key: std::env::var("UPSTREAM_API_KEY").ok(),
        upstream_api_secret: std::env::var("UPSTREAM_API_SECRET").ok(),
    })
}

/// Runs the read-dispatch-write loop until stdin hits EOF. Each line is
/// handled independently; a line that fails to parse gets a JSON-RPC parse
/// error response (`id: null`) rather than aborting the loop, so one bad
/// line from a misbehaving peer does not take down the session.
pub async fn run(state: AppState) -> Result<()> {
    let credentials = credentials_from_env();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.map_err(Error::Io)? {
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(&state, &line, credentials.clone()).await;
        let mut serialized = serde_json::to_string(&response).expect("JsonRpcResponse always serializes");
        serialized.push('\n');
        stdout.write_all(serialized.as_bytes()).await.map_err(Error::Io)?;
        stdout.flush().await.map_err(Error::Io)?;
    }

    Ok(())
}

async fn handle_line(state: &AppState, line: &str, credentials: Option<RawCredentials>) -> JsonRpcResponse {
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return JsonRpcResponse::error(None, jsonrpc::PARSE_ERROR, format!("parse error: {e}"), None),
    };

    let id = request.id.clone();
    let outcome = jsonrpc::dispatch(state, &request, credentials).await;
    jsonrpc::response_from_result(id, outcome.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::identity;
    use crate::storage::{InMemoryStorage, InMemorySubscriptionRegistry};
    use crate::subscription::{SubscriptionRecord, SubscriptionStatus, SubscriptionValidator};
    use crate::tiers::Tier;
    use serde_json::json;
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
        AppState::new(Arc::new(Config::default()), storage, validator, rate_limiter, tools)
    }

    #[tokio::test]
    async fn a_malformed_line_yields_a_parse_error_with_null_id() {
        let state = test_state();
        let response = handle_line(&state, "{not json", None).await;
        assert!(response.id.is_none());
        assert_eq!(response.error_code(), Some(jsonrpc::PARSE_ERROR));
    }

    #[tokio::test]
    async fn a_valid_line_preserves_its_id() {
        let state = test_state();
        let line = json!({"jsonrpc":"2.0","id":7,"method":"initialize","params":{}}).to_string();
        let response = handle_line(&state, &line, None).await;
        assert_eq!(response.id, Some(json!(7)));
        assert_eq!(response.error_code(), None);
    }

    #[tokio::test]
    async fn tools_call_without_env_credentials_is_unauthorized_not_a_parse_failure() {
        let state = test_state();
        let line =
            json!({"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"get_journal_entries","arguments":{}}})
                .to_string();
        let response = handle_line(&state, &line, None).await;
        assert_eq!(response.error_code(), Some(-32001));
    }
}

//! HTTP transport: `POST /mcp` plus the `GET /health` / `GET /status` side
//! endpoints. Builds the `Router`; [`crate::server::Server::serve`] layers
//! the cross-cutting middleware (CORS, compression, timeouts, tracing) on
//! top of what this module returns.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::error::{Error, UnauthorizedReason};
use crate::health::{health, status};
use crate::persistence_adapter::RawCredentials;
use crate::protocol::jsonrpc::{self, JsonRpcRequest, JsonRpcResponse};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/mcp", post(mcp))
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

/// `X-User-Email` / `X-Subscription-Key` (required together) plus the
/// optional upstream pass-through pair. Per spec, extraction order is
/// header first, then `params.auth` on the JSON-RPC body — the header
/// path is checked here; the body fallback happens in [`mcp`] once the
/// request has been parsed.
fn credentials_from_headers(headers: &HeaderMap) -> Option<RawCredentials> {
    let email = headers.get("x-user-email")?.to_str().ok()?.to_string();
    let subscription_key = headers.get("x-subscription-key")?.to_str().ok()?.to_string();
    Some(RawCredentials {
        email,
        subscription_key,
        upstream_api_key: headers.get("x-upstream-api-key").and_then(|v| v.to_str().ok()).map(String::from),
        upstream_api_secret: headers.get("x-upstream-api-secret").and_then(|v| v.to_str().ok()).map(String::from),
    })
}

/// `POST /mcp` — the single JSON-RPC endpoint. Almost every outcome is
/// carried as a `200 OK` JSON-RPC envelope (including application errors);
/// the three exceptions are transport-level, per spec §6:
/// - malformed JSON body → `400` with a JSON-RPC parse-error envelope (`id: null`)
/// - missing required auth headers/body-auth on an auth-requiring method → `400`
/// - a breached rate-limit window → `429` with `Retry-After`
///
/// Oversized bodies never reach this handler — `RequestBodyLimitLayer`
/// rejects them with `413` upstream, in [`crate::server::Server`].
///
/// A successful `tools/call` against a read-only tool additionally carries
/// `X-RateLimit-Degraded: true` when it was only admitted because the rate
/// limiter's backing store was unreachable (fail-open).
async fn mcp(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let response = JsonRpcResponse::error(None, jsonrpc::PARSE_ERROR, format!("parse error: {e}"), None);
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let credentials =
        credentials_from_headers(&headers).or_else(|| jsonrpc::credentials_from_params(request.params.as_ref()));

    let id = request.id.clone();
    let outcome = jsonrpc::dispatch(&state, &request, credentials).await;
    let degraded = outcome.rate_limit_degraded;

    let (status_code, retry_after) = match &outcome.value {
        Err(Error::Unauthorized { reason: UnauthorizedReason::MissingCredentials }) => {
            (StatusCode::BAD_REQUEST, None)
        }
        Err(Error::RateLimited { retry_after_secs }) => (StatusCode::TOO_MANY_REQUESTS, Some(*retry_after_secs)),
        _ => (StatusCode::OK, None),
    };

    let response = jsonrpc::response_from_result(id, outcome.value);
    let mut http_response = (status_code, Json(response)).into_response();

    if let Some(secs) = retry_after {
        http_response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from_str(&secs.to_string()).expect("a decimal second count is a valid header value"),
        );
    }

    if degraded {
        http_response
            .headers_mut()
            .insert(HeaderName::from_static("x-ratelimit-degraded"), HeaderValue::from_static("true"));
    }

    http_response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::identity;
    use crate::storage::{InMemoryStorage, InMemorySubscriptionRegistry};
    use crate::subscription::{SubscriptionRecord, SubscriptionStatus, SubscriptionValidator};
    use crate::tiers::Tier;
    use axum::http::{HeaderName, Request};
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

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

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn initialize_requires_no_headers_and_returns_200() {
        let app = router(test_state());
        let req = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(
                json!({"jsonrpc":"2.0","id":"a1","method":"initialize","params":{"protocolVersion":"2024-11-05"}})
                    .to_string(),
            ))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["result"]["protocolVersion"], "2024-11-05");
    }

    #[tokio::test]
    async fn tools_call_without_any_credentials_is_http_400() {
        let app = router(test_state());
        let req = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(
                json!({"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"get_journal_entries","arguments":{}}})
                    .to_string(),
            ))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_subscription_is_200_with_a_jsonrpc_error() {
        let app = router(test_state());
        let req = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .header(HeaderName::from_static("x-user-email"), "x@y.z")
            .header(HeaderName::from_static("x-subscription-key"), "fm_sub_doesnotexist1")
            .body(axum::body::Body::from(
                json!({"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"get_journal_entries","arguments":{}}})
                    .to_string(),
            ))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32001);
    }

    #[tokio::test]
    async fn a_read_tool_with_an_unreachable_limiter_sets_the_degraded_header() {
        let app = router(test_state());
        let req = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .header(HeaderName::from_static("x-user-email"), "user@example.com")
            .header(HeaderName::from_static("x-subscription-key"), "fm_sub_abcdefgh12345678")
            .body(axum::body::Body::from(
                json!({"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"get_journal_entries","arguments":{}}})
                    .to_string(),
            ))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-ratelimit-degraded").unwrap(), "true");
    }

    #[tokio::test]
    async fn malformed_json_body_is_400_with_a_parse_error() {
        let app = router(test_state());
        let req = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .body(axum::body::Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], jsonrpc::PARSE_ERROR);
    }

    #[tokio::test]
    async fn unknown_method_is_200_with_dash32601() {
        let app = router(test_state());
        let req = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(json!({"jsonrpc":"2.0","id":1,"method":"frobnicate"}).to_string()))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn health_endpoint_is_200() {
        let app = router(test_state());
        let req = Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

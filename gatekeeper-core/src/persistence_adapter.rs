//! The orchestrator: composes identity, subscription validation, rate
//! limiting, and the tool registry into one authenticated call path.
//!
//! Every transport (HTTP, stdio) extracts its own credentials, then hands
//! them to [`dispatch`] — the six-step pipeline is shared so the two
//! protocol adapters never duplicate auth logic.

pub use crate::tools::AuthContext;

use crate::error::{Error, Result, UnauthorizedReason};
use crate::identity;
use crate::rate_limiter::RateDecision;
use crate::state::AppState;
use crate::subscription::InvalidReason;
use crate::tiers::TierCatalog;
use crate::tools::ToolResult;

/// Credentials extracted from a transport-specific request, before any
/// validation has happened.
#[derive(Debug, Clone)]
pub struct RawCredentials {
    pub email: String,
    pub subscription_key: String,
    pub upstream_api_key: Option<String>,
    pub upstream_api_secret: Option<String>,
}

/// Runs the shared pipeline — `extract → validate subscription → derive
/// handle → rate-limit → build AuthContext → invoke tool` — and returns the
/// tool's result envelope, or the [`Error`] that short-circuited it.
///
/// `credentials` is `None` when the transport found no auth material on the
/// request at all (e.g. a bare HTTP request missing both headers); that is
/// reported as [`UnauthorizedReason::MissingCredentials`] rather than a
/// separate error variant, since from the caller's perspective it is the
/// same rejection as a malformed one.
/// `(tool result, rate_limit_degraded)` — the second element is set when the
/// call was only admitted because the rate limiter's backing store was
/// unreachable and the tool is read-only (fail-open). Transports that carry
/// response headers (HTTP) surface this as `X-RateLimit-Degraded: true`.
pub async fn dispatch(
    state: &AppState,
    credentials: Option<RawCredentials>,
    tool_name: &str,
    params: serde_json::Value,
) -> Result<(ToolResult, bool)> {
    let credentials = credentials.ok_or(Error::Unauthorized {
        reason: UnauthorizedReason::MissingCredentials,
    })?;

    let validation = state
        .validator()
        .validate(&credentials.email, &credentials.subscription_key)
        .await?;

    if !validation.valid {
        let reason = match validation.reason {
            Some(InvalidReason::BackendUnavailable) => {
                return Err(Error::Unavailable { component: "subscription_registry".into() });
            }
            _ => UnauthorizedReason::SubscriptionInactive,
        };
        return Err(Error::Unauthorized { reason });
    }

    let tier = validation.tier.expect("valid results always carry a tier");

    let user_handle = identity::derive_handle(&credentials.email, &state.config().identity.namespace)?;

    let tool = state
        .tools()
        .get(tool_name)
        .ok_or_else(|| Error::UnknownTool { name: tool_name.to_string() })?;

    let limits = TierCatalog.limits(tier);
    let RateDecision { allowed, retry_after_seconds, degraded, .. } =
        state.rate_limiter().check_and_record(&user_handle, &limits, tool.permission()).await?;

    if !allowed {
        return Err(Error::RateLimited { retry_after_secs: retry_after_seconds });
    }

    let ctx = AuthContext {
        user_handle,
        email_normalized: identity::normalize_email(&credentials.email)?,
        tier,
        upstream_api_key: credentials.upstream_api_key,
        upstream_api_secret: credentials.upstream_api_secret,
    };

    let result = state.tools().dispatch(&ctx, tool_name, params).await?;
    Ok((result, degraded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::{InMemoryStorage, InMemorySubscriptionRegistry};
    use crate::subscription::{SubscriptionRecord, SubscriptionStatus, SubscriptionValidator};
    use crate::tiers::Tier;
    use crate::tools::ToolRegistry;
    use std::sync::Arc;
    use std::time::Duration;

    fn state_with_seeded_subscription() -> AppState {
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

        let tools = Arc::new(ToolRegistry::with_default_tools(storage.clone(), reqwest::Client::new()));

        AppState::new(Arc::new(Config::default()), storage, validator, rate_limiter, tools)
    }

    #[tokio::test]
    async fn missing_credentials_short_circuit_before_any_lookup() {
        let state = state_with_seeded_subscription();
        let err = dispatch(&state, None, "get_journal_entries", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Unauthorized { reason: UnauthorizedReason::MissingCredentials }
        ));
    }

    #[tokio::test]
    async fn unknown_subscription_is_unauthorized() {
        let state = state_with_seeded_subscription();
        let creds = RawCredentials {
            email: "nobody@example.com".into(),
            subscription_key: "fm_sub_doesnotexist1".into(),
            upstream_api_key: None,
            upstream_api_secret: None,
        };
        let err = dispatch(&state, Some(creds), "get_journal_entries", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Unauthorized { reason: UnauthorizedReason::SubscriptionInactive }
        ));
    }

    #[tokio::test]
    async fn valid_subscription_reaches_a_read_tool_even_with_an_unreachable_limiter() {
        // The limiter's pool never actually dials Redis in this test, so the
        // read-permission tool should still execute via the fail-open path.
        let state = state_with_seeded_subscription();
        let creds = RawCredentials {
            email: "user@example.com".into(),
            subscription_key: "fm_sub_abcdefgh12345678".into(),
            upstream_api_key: None,
            upstream_api_secret: None,
        };
        let (result, degraded) = dispatch(&state, Some(creds), "get_journal_entries", serde_json::json!({}))
            .await
            .unwrap();
        assert!(result.success);
        assert!(degraded);
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected_before_rate_limiting() {
        let state = state_with_seeded_subscription();
        let creds = RawCredentials {
            email: "user@example.com".into(),
            subscription_key: "fm_sub_abcdefgh12345678".into(),
            upstream_api_key: None,
            upstream_api_secret: None,
        };
        let err = dispatch(&state, Some(creds), "nonexistent_tool", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTool { .. }));
    }
}

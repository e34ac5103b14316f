//! `/health` and `/status` handlers.
//!
//! Both are thin views over the same collaborators every `tools/call`
//! already depends on (storage, validator, rate limiter, tool registry) —
//! there is no separate health-check-only code path to drift out of sync.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

/// `GET /health` — liveness. Always 200 while the process is up; does not
/// probe any dependency, so it stays fast and cannot be dragged down by a
/// slow downstream.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        uptime_seconds: state.uptime_seconds(),
    })
}

/// One component's contribution to `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentStatus {
    fn healthy(detail: Option<String>) -> Self {
        Self { status: "healthy", detail }
    }

    fn degraded(detail: impl Into<String>) -> Self {
        Self { status: "degraded", detail: Some(detail.into()) }
    }

    fn unhealthy(detail: Option<String>) -> Self {
        Self { status: "unhealthy", detail }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusComponents {
    pub storage: ComponentStatus,
    pub validator: ComponentStatus,
    pub rate_limiter: ComponentStatus,
    pub tool_registry: ComponentStatus,
}

/// `GET /status` — readiness with per-component diagnostics.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub overall: &'static str,
    pub components: StatusComponents,
}

/// `GET /status` — probes each of the four leaf dependencies directly
/// (bypassing their caches) and reports a per-component diagnosis plus one
/// overall rollup.
///
/// A degraded rate limiter (unreachable Redis) does not by itself make the
/// deployment `unhealthy` — reads still succeed fail-open — so it only
/// downgrades `overall` to `degraded`, never `unhealthy`.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let storage = match state.storage().health().await {
        Ok(h) if h.ok => ComponentStatus::healthy(Some(format!("{}ms", h.latency_ms))),
        Ok(h) => ComponentStatus::unhealthy(Some(format!("{}ms", h.latency_ms))),
        Err(e) => ComponentStatus::unhealthy(Some(e.to_string())),
    };

    let validator = if state.validator().ping().await {
        ComponentStatus::healthy(None)
    } else {
        ComponentStatus::unhealthy(Some("subscription registry unreachable".into()))
    };

    let rate_limiter = if state.rate_limiter().ping().await {
        ComponentStatus::healthy(None)
    } else {
        ComponentStatus::degraded("rate limiter store unreachable: fails open for reads, closed for writes")
    };

    let tool_count = state.tools().list_schemas().len();
    let tool_registry = if tool_count > 0 {
        ComponentStatus::healthy(Some(format!("{tool_count} tools registered")))
    } else {
        ComponentStatus::unhealthy(Some("no tools registered".into()))
    };

    let any_unhealthy = [&storage, &validator, &tool_registry]
        .iter()
        .any(|c| c.status == "unhealthy");
    let any_degraded = [&storage, &validator, &rate_limiter, &tool_registry]
        .iter()
        .any(|c| c.status != "healthy");

    let overall = if any_unhealthy {
        "unhealthy"
    } else if any_degraded {
        "degraded"
    } else {
        "healthy"
    };

    let status_code = if overall == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status_code,
        Json(StatusResponse {
            overall,
            components: StatusComponents { storage, validator, rate_limiter, tool_registry },
        }),
    )
}

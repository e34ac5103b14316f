//! # gatekeeper-core
//!
//! Subscription-gated, multi-tenant MCP (Model Context Protocol) gateway.
//!
//! Validates a caller's email/subscription-key pair against a tiered
//! subscription registry, derives a stable opaque tenant handle, enforces
//! sliding-window rate limits per tier, and dispatches JSON-RPC tool calls
//! against a row-level-secured Postgres (or in-memory, for tests) store.
//! Served over HTTP (`POST /mcp`) or line-delimited stdio.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gatekeeper_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let state = AppState::bootstrap(config.clone()).await?;
//!     let app = protocol::http::router(state);
//!
//!     Server::new(config).serve(app).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ids;
pub mod middleware;
pub mod health;
pub mod identity;
pub mod observability;
pub mod persistence_adapter;
pub mod pool_health;
pub mod protocol;
pub mod rate_limiter;
pub mod repository;
pub mod server;
pub mod state;
pub mod storage;
pub mod subscription;
pub mod tiers;
pub mod tools;

#[cfg(feature = "database")]
pub mod database;

#[cfg(feature = "cache")]
pub mod cache;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, SecurityProfile, ServerMode};
    pub use crate::error::{Error, Result};
    pub use crate::health::{health, status};
    pub use crate::identity::{derive_handle, normalize_email, UserHandle};
    pub use crate::ids::{MakeTypedRequestId, RequestId, RequestIdError};
    pub use crate::persistence_adapter::{dispatch, AuthContext};
    pub use crate::pool_health::PoolHealthSummary;
    pub use crate::protocol;
    pub use crate::rate_limiter::{Permission, RateDecision, RateLimiter};
    pub use crate::server::Server;
    pub use crate::state::AppState;
    pub use crate::subscription::{SubscriptionValidator, ValidationResult};
    pub use crate::tiers::{Tier, TierCatalog, TierLimits};
    pub use crate::tools::{Tool, ToolRegistry, ToolResult};

    #[cfg(feature = "database")]
    pub use crate::pool_health::DatabasePoolHealth;

    #[cfg(feature = "cache")]
    pub use crate::pool_health::RedisPoolHealth;

    pub use crate::middleware::{
        request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
        RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
    };

    #[cfg(feature = "resilience")]
    pub use crate::middleware::ResilienceConfig;

    pub use crate::observability::init_tracing;

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{get, post},
        Router,
    };

    pub use serde::{Deserialize, Serialize};
    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};
    pub use tokio;
    pub use async_trait::async_trait;
    pub use thiserror::Error;
    pub use anyhow::{self, Context as AnyhowContext};
    pub use chrono::{DateTime, Duration as ChronoDuration, Utc};
    pub use uuid::Uuid;
    pub use futures::{future, stream, Future, Stream, StreamExt, TryFutureExt, TryStreamExt};
    pub use http::{Method, Uri};
}

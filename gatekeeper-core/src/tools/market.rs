//! Upstream-proxied tool: a market snapshot fetched from the third-party
//! exchange API using per-request pass-through credentials. Unlike the
//! storage-backed tools in `builtin`, this one never touches `StorageBackend`
//! — it is a thin, timed, schema-validated wrapper around one outbound HTTP
//! call, with the caller's `upstream_api_key`/`upstream_api_secret` attached
//! and never cached or logged.

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::rate_limiter::Permission;

use super::{AuthContext, Tool};

/// Gated behind the `market_snapshot` tier feature; `free` tier cannot call it.
pub struct GetMarketSnapshot {
    client: reqwest::Client,
}

impl GetMarketSnapshot {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for GetMarketSnapshot {
    fn name(&self) -> &'static str {
        "get_market_snapshot"
    }

    fn description(&self) -> &'static str {
        "Fetches a point-in-time price/volume snapshot for a symbol from the upstream exchange API."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": { "type": "string", "minLength": 1, "maxLength": 16 },
            },
            "required": ["symbol"],
            "additionalProperties": false,
        })
    }

    fn permission(&self) -> Permission {
        Permission::Read
    }

    fn required_feature(&self) -> Option<&'static str> {
        Some("market_snapshot")
    }

    async fn execute(&self, ctx: &AuthContext, params: Value) -> Result<Value> {
        let symbol = params["symbol"].as_str().ok_or_else(|| Error::InvalidParameters {
            path: "$.symbol".into(),
            message: "required".into(),
        })?;

        let api_key = ctx.upstream_api_key.as_deref().ok_or_else(|| Error::Unauthorized {
            reason: crate::error::UnauthorizedReason::MissingCredentials,
        })?;

        let mut request = self
            .client
            .get("https://api.upstream-exchange.example/v1/snapshot")
            .query(&[("symbol", symbol)])
            .header("X-Api-Key", api_key);

        if let Some(secret) = ctx.upstream_api_secret.as_deref() {
            request = request.header("X-Api-Secret", secret);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout
            } else {
                Error::Unavailable { component: "upstream_exchange".into() }
            }
        })?;

        if !response.status().is_success() {
            return Err(Error::Unavailable { component: "upstream_exchange".into() });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|_| Error::Unavailable { component: "upstream_exchange".into() })?;

        Ok(json!({ "symbol": symbol, "snapshot": body }))
    }
}

//! Shared application state, wired up once at startup and cloned into every
//! request handler.
//!
//! A single bootstrap path assembles every long-lived dependency, with one
//! concrete configuration shape and no actor supervision tree, just a
//! handful of `Arc`-shared collaborators behind trait objects.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::rate_limiter::RateLimiter;
use crate::storage::{InMemoryStorage, InMemorySubscriptionRegistry, StorageBackend};
use crate::subscription::{SubscriptionRegistry, SubscriptionValidator};
use crate::tools::ToolRegistry;

#[cfg(feature = "database")]
use crate::storage::PostgresStorage;

#[cfg(feature = "database")]
use sqlx::PgPool;

#[cfg(feature = "cache")]
use deadpool_redis::Pool as RedisPool;

/// Everything a request handler needs to service a `tools/call`.
///
/// Cheap to clone: every field is an `Arc` (or, for `started_at`, `Copy`),
/// so handing a clone to each incoming request is just a handful of
/// refcount bumps.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    storage: Arc<dyn StorageBackend>,
    validator: Arc<SubscriptionValidator>,
    rate_limiter: Arc<RateLimiter>,
    tools: Arc<ToolRegistry>,
    started_at: Instant,

    #[cfg(feature = "database")]
    db_pool: Option<PgPool>,

    #[cfg(feature = "cache")]
    redis_pool: Option<RedisPool>,
}

impl AppState {
    /// Assembles state from already-constructed collaborators. Exposed for
    /// tests that want a hand-wired `InMemoryStorage`/fake registry instead
    /// of the full [`AppState::bootstrap`] path.
    pub fn new(
        config: Arc<Config>,
        storage: Arc<dyn StorageBackend>,
        validator: Arc<SubscriptionValidator>,
        rate_limiter: Arc<RateLimiter>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            config,
            storage,
            validator,
            rate_limiter,
            tools,
            started_at: Instant::now(),
            #[cfg(feature = "database")]
            db_pool: None,
            #[cfg(feature = "cache")]
            redis_pool: None,
        }
    }

    /// Wires up every collaborator from a loaded [`Config`]:
    ///
    /// - Storage is Postgres (migrated on startup) when `config.database` is
    ///   set, otherwise the in-memory test/dev backend.
    /// - The subscription registry follows the same choice: Postgres's
    ///   `user_subscriptions` table, or an empty in-memory stand-in (callers
    ///   must seed it themselves via [`InMemorySubscriptionRegistry::seed`]
    ///   before any validation can succeed).
    /// - The rate limiter always requires `config.redis` — there is no
    ///   in-memory sliding-window implementation, so a deployment (or test)
    ///   that wants rate limiting must point `REDIS_URL` at a real instance.
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        #[cfg(feature = "database")]
        let (storage, registry, db_pool): (
            Arc<dyn StorageBackend>,
            Arc<dyn SubscriptionRegistry>,
            Option<PgPool>,
        ) = match &config.database {
            Some(db_config) => {
                let pool = crate::database::create_pool(db_config).await?;
                let postgres = Arc::new(PostgresStorage::new(pool.clone()));
                postgres.migrate().await?;
                (postgres.clone(), postgres, Some(pool))
            }
            None => {
                tracing::warn!("no DATABASE_URL configured, falling back to in-memory storage");
                let memory = Arc::new(InMemoryStorage::new());
                let registry: Arc<dyn SubscriptionRegistry> = Arc::new(InMemorySubscriptionRegistry::new());
                (memory, registry, None)
            }
        };

        #[cfg(not(feature = "database"))]
        let (storage, registry): (Arc<dyn StorageBackend>, Arc<dyn SubscriptionRegistry>) = {
            let memory = Arc::new(InMemoryStorage::new());
            let registry: Arc<dyn SubscriptionRegistry> = Arc::new(InMemorySubscriptionRegistry::new());
            (memory, registry)
        };

        let validator = Arc::new(SubscriptionValidator::new(
            registry,
            config.subscription.cache_capacity,
            std::time::Duration::from_secs(config.subscription.cache_ttl_seconds),
            std::time::Duration::from_secs(config.subscription.negative_cache_ttl_seconds),
        ));

        #[cfg(feature = "cache")]
        let (rate_limiter, redis_pool) = {
            let redis_config = config.redis.as_ref().ok_or_else(|| {
                Error::Internal(
                    "REDIS_URL must be configured: the rate limiter has no in-memory fallback".into(),
                )
            })?;
            let pool = crate::cache::create_pool(redis_config).await?;
            (Arc::new(RateLimiter::new(pool.clone())), Some(pool))
        };

        #[cfg(not(feature = "cache"))]
        let rate_limiter: Arc<RateLimiter> = {
            return Err(Error::Internal(
                "the `cache` feature must be enabled to build an AppState".into(),
            ));
        };

        let upstream_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.service.upstream_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build upstream HTTP client: {e}")))?;

        let tools = Arc::new(ToolRegistry::with_default_tools(storage.clone(), upstream_client));

        Ok(Self {
            config,
            storage,
            validator,
            rate_limiter,
            tools,
            started_at: Instant::now(),
            #[cfg(feature = "database")]
            db_pool,
            #[cfg(feature = "cache")]
            redis_pool,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn validator(&self) -> &Arc<SubscriptionValidator> {
        &self.validator
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[cfg(feature = "database")]
    pub fn db_pool(&self) -> Option<&PgPool> {
        self.db_pool.as_ref()
    }

    #[cfg(feature = "cache")]
    pub fn redis_pool(&self) -> Option<&RedisPool> {
        self.redis_pool.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;
    use crate::subscription::{SubscriptionRecord, SubscriptionStatus};
    use crate::tiers::Tier;
    use std::time::Duration;

    fn test_state() -> AppState {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
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

        // `RateLimiter` requires a real deadpool-redis pool at the type
        // level; this builds a lazily-connecting one against a URL that is
        // never dialed unless a test actually exercises a rate-limited
        // tool call.
        let redis_config = deadpool_redis::Config::from_url("redis://127.0.0.1:6399/0");
        let redis_pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .expect("lazy redis pool construction never dials the server");
        let rate_limiter = Arc::new(RateLimiter::new(redis_pool));

        let tools = Arc::new(ToolRegistry::with_default_tools(
            storage.clone(),
            reqwest::Client::new(),
        ));

        AppState::new(Arc::new(Config::default()), storage, validator, rate_limiter, tools)
    }

    #[test]
    fn uptime_starts_near_zero() {
        let state = test_state();
        assert!(state.uptime_seconds() < 5);
    }

    #[tokio::test]
    async fn wired_validator_sees_the_seeded_subscription() {
        let state = test_state();
        let result = state
            .validator()
            .validate("user@example.com", "fm_sub_abcdefgh12345678")
            .await
            .unwrap();
        assert!(result.valid);
        assert_eq!(result.tier, Some(Tier::Premium));
    }
}

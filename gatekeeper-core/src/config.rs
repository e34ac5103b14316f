//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (flat names, e.g. `DATABASE_URL`, `JWT_SECRET`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/gatekeeper-core/{service_name}/config.toml
//! 4. System directory: /etc/gatekeeper-core/{service_name}/config.toml
//! 5. Default values
//!
//! Unlike the double-underscore-splitting `ACTON_`-prefixed convention, the
//! environment names here are flat and spec-mandated, so the `Env` provider
//! is built from an explicit name map rather than `Env::prefixed(..).split("_")`.

use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Identity derivation configuration
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Subscription validation configuration
    #[serde(default)]
    pub subscription: SubscriptionConfig,

    /// JWT configuration — dormant, reserved for a future signed-token mode
    #[serde(default)]
    pub jwt: JwtConfig,

    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,

    /// Middleware configuration
    #[serde(default)]
    pub middleware: MiddlewareConfig,

    /// Database configuration (optional)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Redis configuration (optional)
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// OpenTelemetry configuration (optional)
    #[serde(default)]
    pub otlp: Option<OtlpConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Transport mode: HTTP router or stdio line loop
    #[serde(default)]
    pub mode: ServerMode,

    /// Bind host (HTTP mode only)
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on (HTTP mode only)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds (total request budget)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Per-upstream-call timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS & input-scanning stringency
    #[serde(default)]
    pub security_profile: SecurityProfile,
}

/// Transport selected for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    #[default]
    Http,
    Stdio,
}

/// CORS and input-scanning stringency, set via `SECURITY_PROFILE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityProfile {
    Strict,
    #[default]
    Moderate,
}

/// Identity derivation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Per-deployment namespace mixed into every handle derivation.
    ///
    /// Changing this is a deliberate key rotation — it is not meant to be
    /// tuned casually, only set once per deployment.
    #[serde(default = "default_identity_namespace")]
    pub namespace: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            namespace: default_identity_namespace(),
        }
    }
}

/// Subscription validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Where `SubscriptionRecord`s live, if not the primary database.
    #[serde(default)]
    pub registry_url: Option<String>,

    /// Positive-result cache TTL in seconds.
    #[serde(default = "default_subscription_cache_ttl")]
    pub cache_ttl_seconds: u64,

    /// Negative-result (not found / inactive) cache TTL in seconds.
    #[serde(default = "default_subscription_negative_cache_ttl")]
    pub negative_cache_ttl_seconds: u64,

    /// Maximum number of entries held in the in-process validation cache.
    #[serde(default = "default_subscription_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            registry_url: None,
            cache_ttl_seconds: default_subscription_cache_ttl(),
            negative_cache_ttl_seconds: default_subscription_negative_cache_ttl(),
            cache_capacity: default_subscription_cache_capacity(),
        }
    }
}

/// JWT configuration — dormant. The service authenticates by header today;
/// this is reserved so a future signed-token mode does not require a config
/// schema migration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwtConfig {
    /// Shared secret, at least 32 characters. Unused until a signed-token
    /// mode is implemented.
    #[serde(default)]
    pub secret: Option<String>,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Global floor on the per-minute sub-window, overriding tier defaults
    /// when set. `None` means "use the tier's own limits only."
    #[serde(default)]
    pub per_minute_override: Option<u32>,

    /// Rate limit window in seconds (legacy single-window knob, retained
    /// for config-file backward compatibility; the rate limiter itself
    /// always tracks hour/day/month concurrently).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute_override: None,
            window_secs: default_window_secs(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing database connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Whether database is optional (service can start without it)
    #[serde(default = "default_false")]
    pub optional: bool,

    /// Whether to initialize connection lazily (in background)
    #[serde(default = "default_lazy_init")]
    pub lazy_init: bool,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing Redis connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Whether Redis is optional (service can start without it)
    #[serde(default = "default_false")]
    pub optional: bool,

    /// Whether to initialize connection lazily (in background)
    #[serde(default = "default_lazy_init")]
    pub lazy_init: bool,
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtlpConfig {
    /// OTLP endpoint URL
    pub endpoint: String,

    /// Service name for tracing
    #[serde(default)]
    pub service_name: Option<String>,

    /// Enable tracing
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Middleware configuration (all optional, feature-gated)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// Request tracking configuration (request IDs, header propagation)
    #[serde(default)]
    pub request_tracking: RequestTrackingConfig,

    /// Resilience configuration (circuit breaker, retry, bulkhead) — applied
    /// to the upstream exchange-API client path only.
    #[serde(default)]
    pub resilience: Option<ResilienceConfig>,

    /// Request body size limit in MB
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,

    /// Enable panic recovery middleware
    #[serde(default = "default_true")]
    pub catch_panic: bool,

    /// Enable compression
    #[serde(default = "default_true")]
    pub compression: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            request_tracking: RequestTrackingConfig::default(),
            resilience: None,
            body_limit_mb: default_body_limit_mb(),
            catch_panic: true,
            compression: true,
        }
    }
}

/// Request tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTrackingConfig {
    /// Enable request ID generation
    #[serde(default = "default_true")]
    pub request_id_enabled: bool,

    /// Request ID header name
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,

    /// Enable header propagation
    #[serde(default = "default_true")]
    pub propagate_headers: bool,

    /// Enable sensitive header masking in logs
    #[serde(default = "default_true")]
    pub mask_sensitive_headers: bool,
}

impl Default for RequestTrackingConfig {
    fn default() -> Self {
        Self {
            request_id_enabled: true,
            request_id_header: default_request_id_header(),
            propagate_headers: true,
            mask_sensitive_headers: true,
        }
    }
}

/// Resilience configuration (circuit breaker, retry, bulkhead)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Enable circuit breaker
    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,

    /// Failure threshold before circuit opens (0.0-1.0)
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: f64,

    /// Minimum requests before calculating failure rate
    #[serde(default = "default_circuit_breaker_min_requests")]
    pub circuit_breaker_min_requests: u64,

    /// Duration to wait before attempting to close circuit (seconds)
    #[serde(default = "default_circuit_breaker_wait_secs")]
    pub circuit_breaker_wait_secs: u64,

    /// Enable retry logic
    #[serde(default = "default_true")]
    pub retry_enabled: bool,

    /// Maximum number of retry attempts
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Maximum delay for exponential backoff (milliseconds)
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Enable bulkhead (concurrency limiting)
    #[serde(default = "default_true")]
    pub bulkhead_enabled: bool,

    /// Maximum concurrent requests
    #[serde(default = "default_bulkhead_max_concurrent")]
    pub bulkhead_max_concurrent: usize,

    /// Maximum queued requests
    #[serde(default = "default_bulkhead_max_queued")]
    pub bulkhead_max_queued: usize,
}

impl ResilienceConfig {
    pub fn circuit_breaker_wait_duration(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_wait_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

// Default value functions

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_upstream_timeout() -> u64 {
    10
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_identity_namespace() -> String {
    crate::identity::DEFAULT_NAMESPACE.to_string()
}

fn default_subscription_cache_ttl() -> u64 {
    300
}

fn default_subscription_negative_cache_ttl() -> u64 {
    30
}

fn default_subscription_cache_capacity() -> usize {
    10_000
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_redis_max_connections() -> usize {
    20
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

fn default_lazy_init() -> bool {
    true
}

fn default_body_limit_mb() -> usize {
    10
}

fn default_request_id_header() -> String {
    "x-request-id".to_string()
}

fn default_circuit_breaker_threshold() -> f64 {
    0.5
}

fn default_circuit_breaker_min_requests() -> u64 {
    10
}

fn default_circuit_breaker_wait_secs() -> u64 {
    30
}

fn default_retry_max_attempts() -> usize {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    10000
}

fn default_bulkhead_max_concurrent() -> usize {
    100
}

fn default_bulkhead_max_queued() -> usize {
    200
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Searches for config files in this order (first found is used):
    /// 1. Current working directory: ./config.toml
    /// 2. XDG config directory: ~/.config/gatekeeper-core/{service_name}/config.toml
    /// 3. System directory: /etc/gatekeeper-core/{service_name}/config.toml
    ///
    /// Environment variables override all file-based configs.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "gatekeeper-core".to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(env_provider());

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file, bypassing XDG/system search.
    /// Useful for testing or non-standard deployments.
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(env_provider())
            .extract()?;

        Ok(config)
    }

    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("config.toml"));

        if let Some(xdg_config_home) = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| Path::new(&home).join(".config")))
        {
            paths.push(
                xdg_config_home
                    .join("gatekeeper-core")
                    .join(service_name)
                    .join("config.toml"),
            );
        }

        paths.push(PathBuf::from("/etc/gatekeeper-core").join(service_name).join("config.toml"));

        paths
    }

    /// Get database URL
    pub fn database_url(&self) -> Option<&str> {
        self.database.as_ref().map(|db| db.url.as_str())
    }

    /// Get Redis URL
    pub fn redis_url(&self) -> Option<&str> {
        self.redis.as_ref().map(|r| r.url.as_str())
    }
}

/// Builds the `figment` environment provider mapping this service's flat,
/// unprefixed env-var names onto the config struct's nested keys.
///
/// A namespaced, double-underscore-delimited convention
/// (`Env::prefixed("APP_").split("_")`) would assume every deployment uses
/// that variable shape; this service's variable names are fixed and
/// unprefixed, so each one is mapped individually instead.
fn env_provider() -> figment::providers::Env {
    figment::providers::Env::raw().map(|key| {
        let mapped = match key.as_str() {
            "DATABASE_URL" => "database.url",
            "DB_MAX_CONNECTIONS" => "database.max_connections",
            "DB_MIN_CONNECTIONS" => "database.min_connections",
            "REDIS_URL" => "redis.url",
            "SUBSCRIPTION_REGISTRY_URL" => "subscription.registry_url",
            "SUBSCRIPTION_CACHE_TTL_SECONDS" => "subscription.cache_ttl_seconds",
            "JWT_SECRET" => "jwt.secret",
            "SECURITY_PROFILE" => "service.security_profile",
            "RATE_LIMIT_PER_MINUTE" => "rate_limit.per_minute_override",
            "SERVER_MODE" => "service.mode",
            "SERVER_HOST" => "service.host",
            "SERVER_PORT" => "service.port",
            "IDENTITY_NAMESPACE" => "identity.namespace",
            "REQUEST_TIMEOUT_SECS" => "service.timeout_secs",
            "UPSTREAM_TIMEOUT_SECS" => "service.upstream_timeout_secs",
            "BODY_LIMIT_MB" => "middleware.body_limit_mb",
            "LOG_LEVEL" => "service.log_level",
            other => return other.into(),
        };
        mapped.into()
    })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "gatekeeper-core".to_string(),
                mode: ServerMode::default(),
                host: default_host(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                upstream_timeout_secs: default_upstream_timeout(),
                environment: default_environment(),
                security_profile: SecurityProfile::default(),
            },
            identity: IdentityConfig::default(),
            subscription: SubscriptionConfig::default(),
            jwt: JwtConfig::default(),
            rate_limit: RateLimitConfig::default(),
            middleware: MiddlewareConfig::default(),
            database: None,
            redis: None,
            otlp: None,
        }
    }
}

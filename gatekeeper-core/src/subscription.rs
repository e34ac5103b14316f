//! Subscription validation: registry lookup plus a bounded, TTL-aware cache.
//!
//! Sharded, lock-free reads, no global mutex on the hot path; caches
//! validation outcomes keyed on `(email, key)`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::tiers::Tier;

/// Why a [`ValidationResult`] is invalid. `None` when `valid` is `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    MalformedKey,
    NotFound,
    KeyMismatch,
    Revoked,
    Expired,
    BackendUnavailable,
}

/// Outcome of [`SubscriptionValidator::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub valid: bool,
    pub tier: Option<Tier>,
    pub reason: Option<InvalidReason>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Present only when the record's status is `grace`.
    pub grace_until: Option<DateTime<Utc>>,
    pub cached_at: DateTime<Utc>,
}

impl ValidationResult {
    fn invalid(reason: InvalidReason) -> Self {
        Self {
            valid: false,
            tier: None,
            reason: Some(reason),
            expires_at: None,
            grace_until: None,
            cached_at: Utc::now(),
        }
    }

    fn valid(tier: Tier, expires_at: Option<DateTime<Utc>>, grace_until: Option<DateTime<Utc>>) -> Self {
        Self {
            valid: true,
            tier: Some(tier),
            reason: None,
            expires_at,
            grace_until,
            cached_at: Utc::now(),
        }
    }
}

/// Row status as stored in `user_subscriptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Revoked,
    Grace,
}

/// A subscription registry row, as looked up by normalized email.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub email_normalized: String,
    pub key: String,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub grace_until: Option<DateTime<Utc>>,
}

/// Looks up a [`SubscriptionRecord`] by normalized email. Implemented by
/// the storage backend's Postgres query against `user_subscriptions`; a
/// separate trait from [`crate::storage::StorageBackend`] since a future
/// deployment may point `SUBSCRIPTION_REGISTRY_URL` at a different store
/// than the primary tenant database.
#[async_trait::async_trait]
pub trait SubscriptionRegistry: Send + Sync {
    async fn find_by_email(&self, email_normalized: &str) -> Result<Option<SubscriptionRecord>>;
}

struct CacheEntry {
    result: ValidationResult,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.inserted_at.elapsed() < self.ttl
    }
}

/// Validates `(email, key)` pairs against a [`SubscriptionRegistry`],
/// fronted by a bounded, TTL-based cache.
///
/// The cache never explicitly invalidates — only TTL expiry removes an
/// entry — so a revoked subscription remains visible as valid for up to
/// `positive_ttl` after the revocation. This is a deliberate trade against
/// registry load, per spec.
pub struct SubscriptionValidator {
    registry: Arc<dyn SubscriptionRegistry>,
    cache: DashMap<(String, String), CacheEntry>,
    capacity: usize,
    len_hint: AtomicUsize,
    positive_ttl: Duration,
    negative_ttl: Duration,
}

/// Subscription keys match `fm_sub_<token>` with `<token>` a ≥8-character
/// URL-safe identifier — syntactic validation only, performed before any
/// registry access.
fn is_well_formed_key(key: &str) -> bool {
    let Some(token) = key.strip_prefix("fm_sub_") else {
        return false;
    };
    token.len() >= 8 && token.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

impl SubscriptionValidator {
    pub fn new(
        registry: Arc<dyn SubscriptionRegistry>,
        capacity: usize,
        positive_ttl: Duration,
        negative_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            cache: DashMap::new(),
            capacity,
            len_hint: AtomicUsize::new(0),
            positive_ttl,
            negative_ttl,
        }
    }

    pub async fn validate(&self, email: &str, key: &str) -> Result<ValidationResult> {
        if !is_well_formed_key(key) {
            return Ok(ValidationResult::invalid(InvalidReason::MalformedKey));
        }

        let normalized = crate::identity::normalize_email(email)?;
        let cache_key = (normalized.clone(), key.to_string());

        if let Some(entry) = self.cache.get(&cache_key) {
            if entry.is_fresh() {
                return Ok(entry.result.clone());
            }
        }

        let record = match self.registry.find_by_email(&normalized).await {
            Ok(record) => record,
            Err(_) => return Ok(ValidationResult::invalid(InvalidReason::BackendUnavailable)),
        };

        let now = Utc::now();
        let result = match record {
            None => ValidationResult::invalid(InvalidReason::NotFound),
            Some(r) if r.key != key => ValidationResult::invalid(InvalidReason::KeyMismatch),
            Some(r) if r.status == SubscriptionStatus::Revoked => {
                ValidationResult::invalid(InvalidReason::Revoked)
            }
            Some(r) if matches!(r.expires_at, Some(exp) if exp < now) && r.status != SubscriptionStatus::Grace => {
                ValidationResult::invalid(InvalidReason::Expired)
            }
            Some(r) if r.status == SubscriptionStatus::Grace => {
                ValidationResult::valid(r.tier, r.expires_at, r.grace_until)
            }
            Some(r) => ValidationResult::valid(r.tier, r.expires_at, None),
        };

        self.insert(cache_key, result.clone());
        Ok(result)
    }

    /// Cheap registry reachability probe for `/status`; does not touch or
    /// populate the validation cache.
    pub async fn ping(&self) -> bool {
        self.registry.find_by_email("__status_probe__@invalid").await.is_ok()
    }

    fn insert(&self, key: (String, String), result: ValidationResult) {
        let ttl = if result.valid { self.positive_ttl } else { self.negative_ttl };

        if self.len_hint.load(Ordering::Relaxed) >= self.capacity {
            if let Some(evict) = self.cache.iter().min_by_key(|e| e.inserted_at).map(|e| e.key().clone()) {
                self.cache.remove(&evict);
                self.len_hint.fetch_sub(1, Ordering::Relaxed);
            }
        }

        let is_new = !self.cache.contains_key(&key);
        self.cache.insert(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
                ttl,
            },
        );
        if is_new {
            self.len_hint.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeRegistry {
        record: Mutex<Option<SubscriptionRecord>>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SubscriptionRegistry for FakeRegistry {
        async fn find_by_email(&self, _email: &str) -> Result<Option<SubscriptionRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.record.lock().unwrap().clone())
        }
    }

    fn active_record() -> SubscriptionRecord {
        SubscriptionRecord {
            email_normalized: "user@example.com".into(),
            key: "fm_sub_abcdefgh12345678".into(),
            tier: Tier::Premium,
            status: SubscriptionStatus::Active,
            expires_at: Some(Utc::now() + chrono::Duration::days(30)),
            grace_until: None,
        }
    }

    #[tokio::test]
    async fn malformed_key_never_touches_registry() {
        let registry = Arc::new(FakeRegistry {
            record: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        let validator =
            SubscriptionValidator::new(registry.clone(), 10, Duration::from_secs(300), Duration::from_secs(30));

        let result = validator.validate("user@example.com", "nope").await.unwrap();
        assert!(!result.valid);
        assert_eq!(result.reason, Some(InvalidReason::MalformedKey));
        assert_eq!(registry.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn active_record_validates_and_caches() {
        let registry = Arc::new(FakeRegistry {
            record: Mutex::new(Some(active_record())),
            calls: AtomicUsize::new(0),
        });
        let validator =
            SubscriptionValidator::new(registry.clone(), 10, Duration::from_secs(300), Duration::from_secs(30));

        let key = "fm_sub_abcdefgh12345678";
        let first = validator.validate("user@example.com", key).await.unwrap();
        assert!(first.valid);
        assert_eq!(first.tier, Some(Tier::Premium));

        *registry.record.lock().unwrap() = None;
        let second = validator.validate("user@example.com", key).await.unwrap();
        assert!(second.valid, "cache hit should not re-query the registry");
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn revoked_record_is_invalid() {
        let mut revoked = active_record();
        revoked.status = SubscriptionStatus::Revoked;
        let registry = Arc::new(FakeRegistry {
            record: Mutex::new(Some(revoked)),
            calls: AtomicUsize::new(0),
        });
        let validator =
            SubscriptionValidator::new(registry, 10, Duration::from_secs(300), Duration::from_secs(30));

        let result = validator
            .validate("user@example.com", "fm_sub_abcdefgh12345678")
            .await
            .unwrap();
        assert!(!result.valid);
        assert_eq!(result.reason, Some(InvalidReason::Revoked));
    }

    #[tokio::test]
    async fn grace_status_is_valid_with_grace_until_hint() {
        let mut grace = active_record();
        grace.status = SubscriptionStatus::Grace;
        grace.grace_until = Some(Utc::now() + chrono::Duration::days(3));
        let registry = Arc::new(FakeRegistry {
            record: Mutex::new(Some(grace)),
            calls: AtomicUsize::new(0),
        });
        let validator =
            SubscriptionValidator::new(registry, 10, Duration::from_secs(300), Duration::from_secs(30));

        let result = validator
            .validate("user@example.com", "fm_sub_abcdefgh12345678")
            .await
            .unwrap();
        assert!(result.valid);
        assert!(result.grace_until.is_some());
    }

    #[tokio::test]
    async fn backend_error_is_not_cached() {
        struct FailingRegistry(AtomicUsize);
        #[async_trait::async_trait]
        impl SubscriptionRegistry for FailingRegistry {
            async fn find_by_email(&self, _email: &str) -> Result<Option<SubscriptionRecord>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(Error::Unavailable { component: "registry".into() })
            }
        }
        let registry = Arc::new(FailingRegistry(AtomicUsize::new(0)));
        let validator =
            SubscriptionValidator::new(registry.clone(), 10, Duration::from_secs(300), Duration::from_secs(30));

        let key = "fm_sub_abcdefgh12345678";
        let first = validator.validate("user@example.com", key).await.unwrap();
        assert_eq!(first.reason, Some(InvalidReason::BackendUnavailable));
        let second = validator.validate("user@example.com", key).await.unwrap();
        assert_eq!(second.reason, Some(InvalidReason::BackendUnavailable));
        assert_eq!(registry.0.load(Ordering::SeqCst), 2, "errors must not be cached");
    }
}

//! Sliding-window rate limiting across hour/day/month windows.
//!
//! A Lua-scripted atomic increment across three keys in one round trip,
//! keeping rate-limit bookkeeping to a single call to Redis while adding
//! tier awareness and multi-window atomicity.

use deadpool_redis::{redis::Script, Pool};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::identity::UserHandle;
use crate::tiers::TierLimits;

/// One of the three tracked windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Hour,
    Day,
    Month,
}

impl Window {
    fn seconds(self) -> i64 {
        match self {
            Window::Hour => 3_600,
            Window::Day => 86_400,
            Window::Month => 30 * 86_400,
        }
    }

    fn key_suffix(self) -> &'static str {
        match self {
            Window::Hour => "hour",
            Window::Day => "day",
            Window::Month => "month",
        }
    }
}

/// Result of [`RateLimiter::check_and_record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Seconds until the tightest-breached window admits another request.
    /// `0` when `allowed` is `true`.
    pub retry_after_seconds: u64,
    /// Remaining budget in the window with the smallest limit, after this
    /// call (or before it, if rejected).
    pub remaining_in_smallest_window: i64,
    /// Set when the limiter's backing store was unreachable and this read
    /// was allowed anyway (fail-open path for read-only tools).
    pub degraded: bool,
}

/// Whether the tool being rate-limited mutates tenant data. Determines the
/// fail-open/fail-closed split when Redis is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
}

/// Atomic multi-window sliding-window counter backed by Redis.
///
/// Each call appends `now` to up to three sorted sets (one per window),
/// trims entries older than the window, and counts the remainder — all in
/// a single Lua script so concurrent callers for the same `user_handle`
/// never double-count.
pub struct RateLimiter {
    pool: Pool,
    script: Script,
}

/// Atomically, for each window key: trim entries outside the window, count
/// what remains, and — only if every window is under its limit — append
/// `now` to every window and refresh its expiry. `KEYS` are the window
/// sorted-set keys; `ARGV` is `now, limit_hour, limit_day, limit_month,
/// window_secs_hour, window_secs_day, window_secs_month`.
const CHECK_AND_RECORD_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local limits = {tonumber(ARGV[2]), tonumber(ARGV[3]), tonumber(ARGV[4])}
local windows = {tonumber(ARGV[5]), tonumber(ARGV[6]), tonumber(ARGV[7])}
local counts = {}
local oldest = {}

for i = 1, 3 do
    local key = KEYS[i]
    local window_start = now - windows[i]
    redis.call('ZREMRANGEBYSCORE', key, '-inf', window_start)
    counts[i] = redis.call('ZCARD', key)
    local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    oldest[i] = (#first > 0) and tonumber(first[2]) or now
end

local breached = -1
for i = 1, 3 do
    if limits[i] >= 0 and counts[i] >= limits[i] then
        if breached == -1 or windows[i] < windows[breached] then
            breached = i
        end
    end
end

if breached ~= -1 then
    local retry_after = oldest[breached] + windows[breached] - now
    if retry_after < 0 then retry_after = 0 end
    return {0, retry_after, limits[breached] - counts[breached]}
end

for i = 1, 3 do
    if limits[i] >= 0 then
        redis.call('ZADD', KEYS[i], now, now .. '-' .. math.random(1, 1000000000))
        redis.call('EXPIRE', KEYS[i], windows[i])
    end
end

local smallest = 1
for i = 2, 3 do
    if limits[i] >= 0 and (limits[smallest] < 0 or limits[i] < limits[smallest]) then
        smallest = i
    end
end
local remaining = (limits[smallest] < 0) and -1 or (limits[smallest] - counts[smallest] - 1)
return {1, 0, remaining}
"#;

impl RateLimiter {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            script: Script::new(CHECK_AND_RECORD_SCRIPT),
        }
    }

    pub async fn check_and_record(
        &self,
        user_handle: &UserHandle,
        limits: &TierLimits,
        permission: Permission,
    ) -> Result<RateDecision> {
        if limits.all_windows_unlimited() {
            return Ok(RateDecision {
                allowed: true,
                retry_after_seconds: 0,
                remaining_in_smallest_window: -1,
                degraded: false,
            });
        }

        let windows = [Window::Hour, Window::Day, Window::Month];
        let keys: Vec<String> = windows
            .iter()
            .map(|w| format!("ratelimit:{}:{}", user_handle.as_str(), w.key_suffix()))
            .collect();
        let window_limits = [limits.per_hour, limits.per_day, limits.per_month];
        let window_secs = [Window::Hour.seconds(), Window::Day.seconds(), Window::Month.seconds()];
        let now = chrono::Utc::now().timestamp();

        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => return self.on_backend_unavailable(permission, e.to_string()),
        };

        let mut invocation = self.script.prepare_invoke();
        for key in &keys {
            invocation.key(key.as_str());
        }
        invocation.arg(now);
        for limit in window_limits {
            invocation.arg(limit);
        }
        for secs in window_secs {
            invocation.arg(secs);
        }

        let result: deadpool_redis::redis::RedisResult<(i64, i64, i64)> =
            invocation.invoke_async(&mut conn).await;

        match result {
            Ok((allowed, retry_after, remaining)) => Ok(RateDecision {
                allowed: allowed == 1,
                retry_after_seconds: retry_after.max(0) as u64,
                remaining_in_smallest_window: remaining,
                degraded: false,
            }),
            Err(e) => self.on_backend_unavailable(permission, e.to_string()),
        }
    }

    /// Cheap reachability probe for `/status`; does not touch any user's
    /// counters.
    pub async fn ping(&self) -> bool {
        let Ok(mut conn) = self.pool.get().await else {
            return false;
        };
        deadpool_redis::redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    fn on_backend_unavailable(&self, permission: Permission, detail: String) -> Result<RateDecision> {
        match permission {
            Permission::Write => {
                tracing::error!(error = %detail, "rate limiter backend unavailable, failing closed for write");
                Err(Error::Unavailable { component: "rate_limiter".into() })
            }
            Permission::Read => {
                tracing::warn!(error = %detail, "rate limiter backend unavailable, failing open for read");
                Ok(RateDecision {
                    allowed: true,
                    retry_after_seconds: 0,
                    remaining_in_smallest_window: -1,
                    degraded: true,
                })
            }
        }
    }
}

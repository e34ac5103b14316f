//! Type-safe request identifiers.
//!
//! Request IDs are UUIDv7 (time-sortable) wrapped in a `req_` prefix, so a
//! request ID printed in a log line is self-describing and, because UUIDv7
//! embeds a millisecond timestamp, roughly sortable by creation order.
//!
//! ```rust
//! use gatekeeper_core::ids::RequestId;
//!
//! let request_id = RequestId::new();
//! assert!(request_id.as_str().starts_with("req_"));
//! ```

use std::fmt;
use std::str::FromStr;
use tower_http::request_id::{MakeRequestId, RequestId as TowerRequestId};
use uuid::Uuid;
use http::Request;

/// A type-safe request identifier for distributed tracing.
///
/// Format: `req_<uuidv7>`, e.g. `req_01893b6e-1f2a-7c3d-9e4f-5a6b7c8d9e0f`.
/// The formatted string is computed once at construction so `as_str`/`AsRef`
/// are free borrows rather than per-call allocations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// The prefix used for request IDs.
    pub const PREFIX: &'static str = "req";

    /// Creates a new request ID with a UUIDv7 (time-sortable).
    #[must_use]
    pub fn new() -> Self {
        Self(format!("{}_{}", Self::PREFIX, Uuid::now_v7()))
    }

    /// Returns the request ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the prefix portion of the ID.
    #[must_use]
    pub fn prefix(&self) -> &str {
        Self::PREFIX
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = RequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("req_")
            .ok_or_else(|| RequestIdError::InvalidPrefix { actual: s.to_string() })?;
        Uuid::from_str(rest).map_err(RequestIdError::Parse)?;
        Ok(Self(s.to_string()))
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<RequestId> for String {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

/// Error type for request ID parsing.
#[derive(Debug, thiserror::Error)]
pub enum RequestIdError {
    /// The ID did not carry the `req_` prefix.
    #[error("invalid request id, expected 'req_' prefix, got '{actual}'")]
    InvalidPrefix { actual: String },

    /// The suffix after `req_` was not a valid UUID.
    #[error("failed to parse request id: {0}")]
    Parse(#[from] uuid::Error),
}

/// A `MakeRequestId` implementation that generates `RequestId`s for tower-http.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeTypedRequestId;

impl MakeRequestId for MakeTypedRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<TowerRequestId> {
        let id = RequestId::new();
        let header_value = http::HeaderValue::from_str(id.as_str()).ok()?;
        Some(TowerRequestId::new(header_value))
    }
}

//! Deterministic, privacy-preserving identity derivation
//!
//! Maps a user's email address to a stable, opaque [`UserHandle`] that survives
//! third-party credential rotation and cannot be reversed to recover the email.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Compile-time namespace mixed into every handle derivation.
///
/// Bumping this value is a deliberate key rotation: every existing handle
/// changes, which requires a data migration. It is not meant to vary by
/// deployment; [`IdentityConfig::namespace`](crate::config::IdentityConfig)
/// is the per-deployment override.
pub const DEFAULT_NAMESPACE: &str = "fm-identity-v1";

/// Domains whose local part is normalized for `+tag` and dot-insensitivity.
///
/// This mirrors Gmail's well-known address-canonicalization rules so that
/// `a.b+promo@gmail.com` and `ab@gmail.com` resolve to the same handle.
const ALIAS_NORMALIZING_DOMAINS: &[&str] = &["gmail.com", "googlemail.com"];

/// A 64-hex-character, SHA-256-derived opaque tenant identifier.
///
/// Immutable and not reversible. Used as the sole tenant key in storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct UserHandle(String);

impl UserHandle {
    /// Returns the handle as a borrowed hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build a `UserHandle` from an already-computed 64-hex-char digest.
    ///
    /// Intended for storage layers reconstructing a handle from a persisted
    /// column; prefer [`derive_handle`] for deriving one from an email.
    pub fn from_hex_unchecked(hex: String) -> Self {
        Self(hex)
    }
}

impl fmt::Display for UserHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserHandle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Internal(format!(
                "not a valid user handle: {} chars",
                s.len()
            )));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

/// Normalizes an email address per spec: trim, lowercase, and for
/// alias-normalizing domains, strip `+tag` and dots from the local part.
///
/// Applied before every identity or subscription operation.
pub fn normalize_email(email: &str) -> Result<String> {
    let trimmed = email.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidEmail);
    }

    let lower = trimmed.to_lowercase();
    let Some((local, domain)) = lower.split_once('@') else {
        return Err(Error::InvalidEmail);
    };
    if local.is_empty() || domain.is_empty() {
        return Err(Error::InvalidEmail);
    }

    if ALIAS_NORMALIZING_DOMAINS.contains(&domain) {
        let local_no_tag = local.split('+').next().unwrap_or(local);
        let local_no_dots: String = local_no_tag.chars().filter(|c| *c != '.').collect();
        if local_no_dots.is_empty() {
            return Err(Error::InvalidEmail);
        }
        Ok(format!("{local_no_dots}@{domain}"))
    } else {
        Ok(format!("{local}@{domain}"))
    }
}

/// Derives the stable, opaque [`UserHandle`] for an email address.
///
/// Total, pure, and deterministic: the same email (under normalization)
/// always yields the same handle, using the configured `namespace`.
pub fn derive_handle(email: &str, namespace: &str) -> Result<UserHandle> {
    let normalized = normalize_email(email)?;
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b":");
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        write!(hex, "{byte:02x}").expect("writing to a String cannot fail");
    }
    Ok(UserHandle(hex))
}

//! Subscription tier catalog — a pure, in-memory table of limits and features
//!
//! Tier names are closed; adding a new one is a release, not a runtime
//! registration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A permission/feature bundle a subscription is entitled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    /// Also accepted as the string `"basic"` at the config/wire boundary.
    Starter,
    Premium,
    Enterprise,
}

impl Tier {
    /// Parses a tier name, accepting `"basic"` as an alias for `starter`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "starter" | "basic" => Some(Self::Starter),
            "premium" => Some(Self::Premium),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        };
        f.write_str(s)
    }
}

/// `-1` denotes unlimited for any of the count fields.
pub const UNLIMITED: i64 = -1;

/// The limits and feature set granted by a [`Tier`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    pub per_hour: i64,
    pub per_day: i64,
    pub per_month: i64,
    pub storage_mb: i64,
    pub features: Vec<String>,
    /// Journal entry retention, in days; `-1` for indefinite.
    pub retention_days: i64,
}

impl TierLimits {
    pub fn is_unlimited(&self, window_count: i64) -> bool {
        window_count == UNLIMITED
    }

    /// `true` if every one of the three request windows is unlimited.
    pub fn all_windows_unlimited(&self) -> bool {
        self.per_hour == UNLIMITED && self.per_day == UNLIMITED && self.per_month == UNLIMITED
    }
}

fn feats(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Pure in-memory enumeration of subscription tiers and their limits.
#[derive(Debug, Clone)]
pub struct TierCatalog;

impl TierCatalog {
    pub fn limits(&self, tier: Tier) -> TierLimits {
        match tier {
            Tier::Free => TierLimits {
                per_hour: 10,
                per_day: 50,
                per_month: 500,
                storage_mb: 10,
                features: feats(&["journal", "preferences"]),
                retention_days: 365,
            },
            Tier::Starter => TierLimits {
                per_hour: 100,
                per_day: 1_000,
                per_month: 20_000,
                storage_mb: 250,
                features: feats(&["journal", "preferences", "records", "market_snapshot"]),
                retention_days: 365 * 3,
            },
            Tier::Premium => TierLimits {
                per_hour: 1_000,
                per_day: 20_000,
                per_month: 300_000,
                storage_mb: 5_000,
                features: feats(&[
                    "journal",
                    "preferences",
                    "records",
                    "market_snapshot",
                    "bulk_export",
                ]),
                retention_days: UNLIMITED,
            },
            Tier::Enterprise => TierLimits {
                per_hour: UNLIMITED,
                per_day: UNLIMITED,
                per_month: UNLIMITED,
                storage_mb: UNLIMITED,
                features: feats(&[
                    "journal",
                    "preferences",
                    "records",
                    "market_snapshot",
                    "bulk_export",
                    "hard_delete",
                ]),
                retention_days: UNLIMITED,
            },
        }
    }

    pub fn has_feature(&self, tier: Tier, name: &str) -> bool {
        self.limits(tier).features.iter().any(|f| f == name)
    }
}

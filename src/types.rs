// =============================================================================
// Shared types used across the Pulse engine
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Tenant identifier (one dealer group / account).
pub type TenantId = String;

/// Entity identifier (one dealership rooftop within a tenant).
pub type EntityId = String;

/// The canonical set of visibility signals the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKey {
    /// AI visibility across answer engines.
    Aiv,
    /// Algorithmic trust index.
    Ati,
    /// Share of zero-click answers that surface the entity.
    ZeroClick,
    /// Health of user-generated content (reviews, Q&A).
    UgcHealth,
    /// Local / geographic trust signals.
    GeoTrust,
}

impl SignalKey {
    pub const ALL: [SignalKey; 5] = [
        SignalKey::Aiv,
        SignalKey::Ati,
        SignalKey::ZeroClick,
        SignalKey::UgcHealth,
        SignalKey::GeoTrust,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aiv => "aiv",
            Self::Ati => "ati",
            Self::ZeroClick => "zero_click",
            Self::UgcHealth => "ugc_health",
            Self::GeoTrust => "geo_trust",
        }
    }
}

impl std::fmt::Display for SignalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aiv" => Ok(Self::Aiv),
            "ati" => Ok(Self::Ati),
            "zero_click" | "zeroclick" => Ok(Self::ZeroClick),
            "ugc_health" | "ugc" => Ok(Self::UgcHealth),
            "geo_trust" | "geo" => Ok(Self::GeoTrust),
            _ => Err(()),
        }
    }
}

/// How a value on a SignalVector was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Imputation {
    /// Carried forward from the entity's most recent prior vector.
    Prior,
    /// Filled with the configured default value.
    Default,
}

/// Direction label for a score trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::Stable => write!(f, "stable"),
        }
    }
}

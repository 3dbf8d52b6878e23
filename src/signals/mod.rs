// =============================================================================
// Signals Module
// =============================================================================
//
// Ingestion boundary for collector data:
// - Canonical SignalVector schema (closed key set, clamped values)
// - Normalizer (coercion, imputation, clamping)
// - Freshness policy (age-based confidence decay)

pub mod freshness;
pub mod normalizer;
pub mod vector;

pub use freshness::FreshnessPolicy;
pub use normalizer::{RawSignalPayload, SignalNormalizer};
pub use vector::SignalVector;

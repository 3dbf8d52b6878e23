// =============================================================================
// Trend Module
// =============================================================================
//
// Score dynamics derived on read from an entity's snapshot history.

pub mod analyzer;
pub mod series;

pub use analyzer::{TrendAnalyzer, TrendReport};
pub use series::TrendSeries;

// =============================================================================
// Scoring Module
// =============================================================================
//
// - WeightSet: validated, versioned coefficients
// - Composite scorer: the one weighted-sum implementation
// - Weight store: per-tenant version arena with single-writer commits
// - Weight ledger: append-only persistence of committed versions

pub mod composite;
pub mod ledger;
pub mod store;
pub mod weights;

pub use composite::{composite_value, CompositeScorer, ScoreSnapshot};
pub use ledger::WeightLedger;
pub use store::{WeightStore, WriterRetry};
pub use weights::WeightSet;

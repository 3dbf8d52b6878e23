// =============================================================================
// Reinforcement Module
// =============================================================================
//
// - Observations: outcome records and the per-tenant intake buffer
// - Cycle: the Idle → Observing → Evaluating → Adapting → Reinforcing machine
// - Updater: one cycle under the tenant's writer lock, faults absorbed
// - Scheduler: periodic and forced cycles across tenants

pub mod cycle;
pub mod observation;
pub mod scheduler;
pub mod updater;

pub use cycle::CycleCheckpoint;
pub use observation::{OutcomeBuffer, OutcomeObservation, OutcomeSource};
pub use scheduler::{run_scheduler, trigger_cycle};
pub use updater::{CycleOutcome, CycleReport};

// =============================================================================
// Simulation Module
// =============================================================================

pub mod action;
pub mod simulator;

pub use action::{validate_actions, ScenarioActionRequest};
pub use simulator::{ScenarioSimulator, SimulationOptions};

//! Application layer containing business logic and shared state.

pub mod engine;
pub mod state;
pub mod trigger;
pub mod worker;

pub use engine::{EngineConfig, ReconciliationEngine};
pub use state::AppState;
pub use trigger::{DeliveryResult, SideEffectTrigger, TriggerConfig};
pub use worker::{ReconciliationSweeper, SweeperConfig, spawn_sweeper};

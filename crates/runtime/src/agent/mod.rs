//! Agent orchestration
//!
//! Plan generation, the run/step state machine, and the bounded
//! step-by-step executor with pause/resume/cancel and human feedback.

pub mod orchestrator;
pub mod planner;
pub mod types;

pub use orchestrator::{AgentOrchestrator, StepOutcome};
pub use planner::Planner;
pub use types::*;

//! Scenario harness
//!
//! Executes scripted multi-step scenarios against an external command-line
//! executable, and orchestrates jobs built from them: single-flight ad-hoc
//! runs, an idempotent retrying schedule queue, and directory batches.

pub mod cli;
pub mod commands;
pub mod common;
pub mod engine;
pub mod orchestrator;
pub mod scenario;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use engine::{ScenarioResult, ScenarioRunner};
pub use orchestrator::{Orchestrator, Origin};
pub use scenario::Scenario;

//! Scenario execution engine
//!
//! Leaf to root: [`variables`] resolves `{{tokens}}`, [`process`] runs the
//! target, [`extract`] turns output into variables, [`assert`] checks them
//! and [`runner`] sequences it all while publishing [`events`].

pub mod assert;
pub mod events;
pub mod expr;
pub mod extract;
pub mod process;
pub mod result;
pub mod runner;
pub mod variables;

pub use assert::{revalidate, AssertionResult};
pub use events::{EventBus, OutputStream, RunEvent};
pub use process::ProcessAdapter;
pub use result::{Response, ScenarioResult, ScenarioSummary, StepResult};
pub use runner::{RunnerState, ScenarioRunner};
pub use variables::{VariableStore, Vars};

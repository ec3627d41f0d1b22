//! `workflow` crate: declarative workflow definitions and their integrity rules.
//!
//! Nothing here executes a step; execution belongs to an external automation
//! engine. This crate only guarantees that whatever it hands out is valid.

pub mod models;
pub mod error;
pub mod validation;
pub mod result;

pub use models::{Workflow, WorkflowStep, StepType, WorkflowStatus, StepConfig};
pub use error::ValidationError;
pub use validation::{validate_step, validate_steps};
pub use result::WorkflowResult;

#[cfg(test)]
mod models_tests;

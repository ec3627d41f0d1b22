//! Validation error type for the workflow crate.

use thiserror::Error;

/// Every way a workflow, step or result can violate its integrity rules.
///
/// Returned from construction and mutation; the entity is never modified
/// when one of these is produced.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    // ------ Field errors ------

    /// A required text field is empty.
    #[error("field '{field}' must not be empty")]
    EmptyField { field: &'static str },

    /// A text field exceeds its maximum length (in characters).
    #[error("field '{field}' is {len} characters long, maximum is {max}")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// A numeric field is outside its allowed range.
    #[error("field '{field}' = {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    // ------ Step configuration errors ------

    /// The step's config lacks a key its step type requires.
    #[error("{step_type} step '{step_id}' requires '{field}' in config")]
    MissingConfigField {
        step_id: String,
        step_type: &'static str,
        field: &'static str,
    },

    /// A config key is present but holds an unusable value.
    #[error("step '{step_id}' config field '{field}' is invalid: {reason}")]
    InvalidConfigValue {
        step_id: String,
        field: &'static str,
        reason: &'static str,
    },

    // ------ Step collection errors ------

    /// Two or more steps share the same ID.
    #[error("duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    /// Two or more steps share the same execution order.
    #[error("duplicate step order {order} (steps '{first}' and '{second}')")]
    DuplicateOrder {
        order: u32,
        first: String,
        second: String,
    },

    /// A step depends on a step that isn't part of the workflow.
    #[error("step '{step_id}' depends on non-existent step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },

    /// Two steps depend on each other directly.
    #[error("circular dependency detected between '{0}' and '{1}'")]
    CircularDependency(String, String),

    // ------ Result errors ------

    /// `mark_completed` was called on a result that is already final.
    #[error("execution '{0}' has already been finalized")]
    AlreadyFinalized(String),

    /// A stored result contradicts itself (timestamps, duration, counters).
    #[error("execution '{execution_id}' is inconsistent: {reason}")]
    InconsistentResult {
        execution_id: String,
        reason: &'static str,
    },
}

//! Step validation: run whenever a step enters a workflow or the step
//! collection is replaced.
//!
//! Rules enforced on the collection:
//! 1. Every step is individually valid (field bounds + type-specific config).
//! 2. Step IDs are unique within the workflow.
//! 3. Order values are unique within the workflow.
//! 4. Every `depends_on` entry names a step in the same workflow.
//! 5. No two steps depend on each other directly.
//!
//! Rule 5 is a local check only: longer cycles (A → B → C → A) pass.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::models::{StepType, WorkflowStep, NAME_MAX};
use crate::ValidationError;

const STEP_DESCRIPTION_MAX: usize = 1000;
const TIMEOUT_RANGE: (u64, u64) = (1, 3600);
const RETRY_COUNT_MAX: u64 = 10;
const RETRY_DELAY_MAX: u64 = 300;

/// Validate a single step's fields and its type-specific config.
///
/// # Errors
/// - [`ValidationError::EmptyField`] / [`ValidationError::TooLong`] for text fields.
/// - [`ValidationError::OutOfRange`] for timeout and retry settings.
/// - [`ValidationError::MissingConfigField`] / [`ValidationError::InvalidConfigValue`]
///   when the config doesn't satisfy the step type.
pub fn validate_step(step: &WorkflowStep) -> Result<(), ValidationError> {
    check_text("id", &step.id, usize::MAX, true)?;
    check_text("name", &step.name, NAME_MAX, true)?;
    if let Some(description) = &step.description {
        check_text("description", description, STEP_DESCRIPTION_MAX, false)?;
    }
    if let Some(timeout) = step.timeout_seconds {
        check_range("timeout_seconds", timeout.into(), TIMEOUT_RANGE.0, TIMEOUT_RANGE.1)?;
    }
    check_range("retry_count", step.retry_count.into(), 0, RETRY_COUNT_MAX)?;
    check_range("retry_delay_seconds", step.retry_delay_seconds.into(), 0, RETRY_DELAY_MAX)?;

    for &field in step.step_type.required_config_fields() {
        if !step.config.contains_key(field) {
            return Err(ValidationError::MissingConfigField {
                step_id: step.id.clone(),
                step_type: step.step_type.as_str(),
                field,
            });
        }
    }

    if step.step_type == StepType::Delay {
        let positive = match step.config.get("duration_seconds") {
            Some(Value::Number(n)) => n.as_f64().is_some_and(|d| d > 0.0),
            _ => false,
        };
        if !positive {
            return Err(ValidationError::InvalidConfigValue {
                step_id: step.id.clone(),
                field: "duration_seconds",
                reason: "must be a positive number",
            });
        }
    }

    Ok(())
}

/// Validate a full step collection.
///
/// # Errors
/// Everything [`validate_step`] reports, plus
/// - [`ValidationError::DuplicateStepId`] if two steps share an ID.
/// - [`ValidationError::DuplicateOrder`] if two steps share an order.
/// - [`ValidationError::UnknownDependency`] if a dependency is missing.
/// - [`ValidationError::CircularDependency`] if two steps depend on each other.
pub fn validate_steps(steps: &[WorkflowStep]) -> Result<(), ValidationError> {
    // -----------------------------------------------------------------------
    // 1. Individual steps
    // -----------------------------------------------------------------------
    for step in steps {
        validate_step(step)?;
    }

    // -----------------------------------------------------------------------
    // 2. Unique IDs
    // -----------------------------------------------------------------------
    let mut by_id: HashMap<&str, &WorkflowStep> = HashMap::with_capacity(steps.len());
    for step in steps {
        if by_id.insert(step.id.as_str(), step).is_some() {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 3. Unique orders
    // -----------------------------------------------------------------------
    let mut by_order: HashMap<u32, &str> = HashMap::with_capacity(steps.len());
    for step in steps {
        if let Some(first) = by_order.insert(step.order, step.id.as_str()) {
            return Err(ValidationError::DuplicateOrder {
                order: step.order,
                first: first.to_owned(),
                second: step.id.clone(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // 4 + 5. Dependencies resolve and are not mutual
    // -----------------------------------------------------------------------
    for step in steps {
        let mut seen: HashSet<&str> = HashSet::new();
        for dep_id in &step.depends_on {
            if !seen.insert(dep_id.as_str()) {
                continue;
            }
            let Some(dep) = by_id.get(dep_id.as_str()) else {
                return Err(ValidationError::UnknownDependency {
                    step_id: step.id.clone(),
                    dependency: dep_id.clone(),
                });
            };
            if dep.depends_on.iter().any(|d| d == &step.id) {
                return Err(ValidationError::CircularDependency(
                    step.id.clone(),
                    dep_id.clone(),
                ));
            }
        }
    }

    Ok(())
}

/// Length check counted in characters, not bytes. Whitespace counts.
pub(crate) fn check_text(
    field: &'static str,
    value: &str,
    max: usize,
    required: bool,
) -> Result<(), ValidationError> {
    if required && value.is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    let len = value.chars().count();
    if len > max {
        return Err(ValidationError::TooLong { field, len, max });
    }
    Ok(())
}

pub(crate) fn check_range(
    field: &'static str,
    value: u64,
    min: u64,
    max: u64,
) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::OutOfRange { field, value, min, max });
    }
    Ok(())
}

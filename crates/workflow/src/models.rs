//! Core domain models for workflow definitions.
//!
//! A [`Workflow`] exclusively owns its [`WorkflowStep`]s. The step collection
//! is private so every insertion, removal and replacement goes through the
//! validation rules in [`crate::validation`]; plain metadata stays public.
//!
//! None of these types synchronise internally. Share a workflow between
//! tasks only behind a lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::validation::{check_range, check_text, validate_step, validate_steps};
use crate::ValidationError;

/// Type-specific step configuration (string key → arbitrary JSON value).
pub type StepConfig = Map<String, Value>;

pub(crate) const NAME_MAX: usize = 200;
pub(crate) const WORKFLOW_DESCRIPTION_MAX: usize = 2000;

// ---------------------------------------------------------------------------
// StepType
// ---------------------------------------------------------------------------

/// What kind of work a step declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    BrowserAction,
    ApiCall,
    DataProcessing,
    Condition,
    Loop,
    Delay,
    Notification,
    FileOperation,
    AiTask,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BrowserAction  => "browser_action",
            Self::ApiCall        => "api_call",
            Self::DataProcessing => "data_processing",
            Self::Condition      => "condition",
            Self::Loop           => "loop",
            Self::Delay          => "delay",
            Self::Notification   => "notification",
            Self::FileOperation  => "file_operation",
            Self::AiTask         => "ai_task",
        }
    }

    /// Config keys a step of this type must carry.
    pub fn required_config_fields(&self) -> &'static [&'static str] {
        match self {
            Self::BrowserAction => &["action", "target"],
            Self::ApiCall       => &["url", "method"],
            Self::Delay         => &["duration_seconds"],
            _                   => &[],
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WorkflowStatus
// ---------------------------------------------------------------------------

/// Lifecycle status shared by workflows and their execution results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft     => write!(f, "draft"),
            Self::Ready     => write!(f, "ready"),
            Self::Running   => write!(f, "running"),
            Self::Paused    => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed    => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowStep
// ---------------------------------------------------------------------------

fn default_retry_delay() -> u32 {
    1
}

fn new_step_id() -> String {
    Uuid::new_v4().to_string()
}

/// One declared unit of work inside a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    #[serde(default = "new_step_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub step_type: StepType,
    /// Execution order, unique within the owning workflow.
    /// [`WorkflowStep::AUTO_ORDER`] asks `add_step` to append after the last step.
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub config: StepConfig,
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u32,
    /// Expression evaluated by the execution engine to decide whether to run.
    #[serde(default)]
    pub condition: Option<String>,
    /// IDs of steps in the same workflow that must run first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStep {
    /// Sentinel order value: replaced by `max(existing) + 1` on insertion.
    pub const AUTO_ORDER: u32 = 0;

    /// Create a step with a fresh ID and an auto-assigned order.
    ///
    /// # Errors
    /// Any field or config violation for `step_type`.
    pub fn new(
        name: impl Into<String>,
        step_type: StepType,
        config: StepConfig,
    ) -> Result<Self, ValidationError> {
        let now = Utc::now();
        let step = Self {
            id: new_step_id(),
            name: name.into(),
            description: None,
            step_type,
            order: Self::AUTO_ORDER,
            config,
            timeout_seconds: None,
            retry_count: 0,
            retry_delay_seconds: default_retry_delay(),
            condition: None,
            depends_on: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        validate_step(&step)?;
        Ok(step)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u32) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_retries(mut self, count: u32, delay_seconds: u32) -> Self {
        self.retry_count = count;
        self.retry_delay_seconds = delay_seconds;
        self
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition = Some(expression.into());
        self
    }

    pub fn depending_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn update_timestamp(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

fn default_version() -> String {
    "1.0.0".to_string()
}

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "WorkflowRecord")]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    steps: Vec<WorkflowStep>,
    pub variables: Map<String, Value>,
    pub max_execution_time_seconds: Option<u32>,
    pub parallel_execution: bool,
    status: WorkflowStatus,
    pub tags: Vec<String>,
    /// ID of the user who owns the workflow.
    pub created_by: Option<String>,
    /// IDs of users granted access.
    pub shared_with: Vec<String>,
    pub created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_executed_at: Option<DateTime<Utc>>,
    execution_count: u64,
    success_count: u64,
}

/// Wire shape of a workflow. Every deserialized workflow passes through
/// [`Workflow::validate`] before it exists.
#[derive(Deserialize)]
struct WorkflowRecord {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    steps: Vec<WorkflowStep>,
    #[serde(default)]
    variables: Map<String, Value>,
    #[serde(default)]
    max_execution_time_seconds: Option<u32>,
    #[serde(default)]
    parallel_execution: bool,
    #[serde(default)]
    status: WorkflowStatus,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    created_by: Option<String>,
    #[serde(default)]
    shared_with: Vec<String>,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    last_executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    execution_count: u64,
    #[serde(default)]
    success_count: u64,
}

impl TryFrom<WorkflowRecord> for Workflow {
    type Error = ValidationError;

    fn try_from(r: WorkflowRecord) -> Result<Self, Self::Error> {
        let workflow = Self {
            id: r.id,
            name: r.name,
            description: r.description,
            version: r.version,
            steps: r.steps,
            variables: r.variables,
            max_execution_time_seconds: r.max_execution_time_seconds,
            parallel_execution: r.parallel_execution,
            status: r.status,
            tags: r.tags,
            created_by: r.created_by,
            shared_with: r.shared_with,
            created_at: r.created_at,
            updated_at: r.updated_at,
            last_executed_at: r.last_executed_at,
            execution_count: r.execution_count,
            success_count: r.success_count,
        };
        workflow.validate()?;
        Ok(workflow)
    }
}

impl Workflow {
    /// Create an empty workflow in `draft` status.
    ///
    /// # Errors
    /// [`ValidationError::EmptyField`] / [`ValidationError::TooLong`] for a bad name.
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        check_text("name", &name, NAME_MAX, true)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            description: None,
            version: default_version(),
            steps: Vec::new(),
            variables: Map::new(),
            max_execution_time_seconds: None,
            parallel_execution: false,
            status: WorkflowStatus::Draft,
            tags: Vec::new(),
            created_by: None,
            shared_with: Vec::new(),
            created_at: now,
            updated_at: now,
            last_executed_at: None,
            execution_count: 0,
            success_count: 0,
        })
    }

    /// Re-check every field and the full step collection.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_text("name", &self.name, NAME_MAX, true)?;
        if let Some(description) = &self.description {
            check_text("description", description, WORKFLOW_DESCRIPTION_MAX, false)?;
        }
        check_text("version", &self.version, NAME_MAX, true)?;
        if let Some(limit) = self.max_execution_time_seconds {
            check_range("max_execution_time_seconds", limit.into(), 1, u32::MAX.into())?;
        }
        if self.success_count > self.execution_count {
            return Err(ValidationError::OutOfRange {
                field: "success_count",
                value: self.success_count,
                min: 0,
                max: self.execution_count,
            });
        }
        validate_steps(&self.steps)
    }

    // ------------------------------------------------------------------
    // Step collection
    // ------------------------------------------------------------------

    /// Steps in insertion order. Use [`Workflow::get_steps_by_order`] for
    /// execution order.
    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    /// Append a step, auto-assigning its order when it carries
    /// [`WorkflowStep::AUTO_ORDER`] and the workflow already has steps.
    ///
    /// # Errors
    /// Any step or collection invariant violation; the workflow is unchanged.
    pub fn add_step(&mut self, mut step: WorkflowStep) -> Result<(), ValidationError> {
        if step.order == WorkflowStep::AUTO_ORDER {
            if let Some(max) = self.steps.iter().map(|s| s.order).max() {
                step.order = max + 1;
            }
        }

        let mut candidate = self.steps.clone();
        candidate.push(step);
        validate_steps(&candidate)?;

        self.steps = candidate;
        self.update_timestamp();
        Ok(())
    }

    /// Replace the whole step collection.
    ///
    /// # Errors
    /// Any step or collection invariant violation; the workflow is unchanged.
    pub fn set_steps(&mut self, steps: Vec<WorkflowStep>) -> Result<(), ValidationError> {
        validate_steps(&steps)?;
        self.steps = steps;
        self.update_timestamp();
        Ok(())
    }

    /// Remove a step and every dependency edge pointing at it.
    ///
    /// Returns `false` when no step has that ID.
    pub fn remove_step(&mut self, step_id: &str) -> bool {
        let before = self.steps.len();
        self.steps.retain(|s| s.id != step_id);
        if self.steps.len() == before {
            return false;
        }

        for step in &mut self.steps {
            let deps = step.depends_on.len();
            step.depends_on.retain(|d| d != step_id);
            if step.depends_on.len() != deps {
                debug!(step = %step.id, removed = step_id, "pruned dependency on removed step");
                step.update_timestamp();
            }
        }
        self.update_timestamp();
        true
    }

    pub fn get_step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Steps sorted ascending by `order`.
    pub fn get_steps_by_order(&self) -> Vec<&WorkflowStep> {
        let mut sorted: Vec<&WorkflowStep> = self.steps.iter().collect();
        sorted.sort_by_key(|s| s.order);
        sorted
    }

    // ------------------------------------------------------------------
    // Status and execution history
    // ------------------------------------------------------------------

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn set_status(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.update_timestamp();
    }

    /// Record one finished execution. Callers serialise calls per instance.
    pub fn mark_executed(&mut self, success: bool) {
        self.last_executed_at = Some(Utc::now());
        self.execution_count += 1;
        if success {
            self.success_count += 1;
        }
        self.update_timestamp();
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    /// `success_count / execution_count`, or 0 before the first execution.
    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.execution_count as f64
    }

    pub fn is_executable(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Ready | WorkflowStatus::Completed | WorkflowStatus::Failed
        ) && !self.steps.is_empty()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn last_executed_at(&self) -> Option<DateTime<Utc>> {
        self.last_executed_at
    }

    pub fn update_timestamp(&mut self) {
        self.updated_at = Utc::now();
    }
}

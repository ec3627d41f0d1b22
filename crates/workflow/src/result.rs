//! Per-execution result record.
//!
//! A `WorkflowResult` refers to its workflow by ID only. The external
//! execution engine fills it in as steps finish and finalizes it once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{ValidationError, WorkflowStatus};

/// Largest gap tolerated between a stored duration and its timestamps.
const DURATION_TOLERANCE_SECS: f64 = 1e-3;

/// The outcome of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WorkflowResultRecord")]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    status: WorkflowStatus,

    pub started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_seconds: Option<f64>,

    pub output_data: Map<String, Value>,
    pub step_results: Map<String, Value>,

    pub error_message: Option<String>,
    pub error_step_id: Option<String>,
    pub error_details: Option<Map<String, Value>>,

    pub steps_completed: u32,
    pub steps_total: u32,
}

/// Wire shape of a result; checked before it becomes a [`WorkflowResult`].
#[derive(Deserialize)]
struct WorkflowResultRecord {
    workflow_id: Uuid,
    execution_id: Uuid,
    status: WorkflowStatus,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_seconds: Option<f64>,
    output_data: Map<String, Value>,
    step_results: Map<String, Value>,
    error_message: Option<String>,
    error_step_id: Option<String>,
    error_details: Option<Map<String, Value>>,
    steps_completed: u32,
    steps_total: u32,
}

impl TryFrom<WorkflowResultRecord> for WorkflowResult {
    type Error = ValidationError;

    fn try_from(r: WorkflowResultRecord) -> Result<Self, Self::Error> {
        let inconsistent = |reason| ValidationError::InconsistentResult {
            execution_id: r.execution_id.to_string(),
            reason,
        };

        if r.steps_completed > r.steps_total {
            return Err(inconsistent("more steps completed than the workflow has"));
        }
        match (r.completed_at, r.duration_seconds) {
            (None, None) => {}
            (Some(completed_at), Some(duration)) => {
                if completed_at < r.started_at {
                    return Err(inconsistent("completed before it started"));
                }
                let elapsed = (completed_at - r.started_at)
                    .to_std()
                    .unwrap_or_default()
                    .as_secs_f64();
                if !duration.is_finite() || (duration - elapsed).abs() > DURATION_TOLERANCE_SECS {
                    return Err(inconsistent("duration does not match its timestamps"));
                }
            }
            _ => return Err(inconsistent("completion time and duration must be set together")),
        }

        Ok(Self {
            workflow_id: r.workflow_id,
            execution_id: r.execution_id,
            status: r.status,
            started_at: r.started_at,
            completed_at: r.completed_at,
            duration_seconds: r.duration_seconds,
            output_data: r.output_data,
            step_results: r.step_results,
            error_message: r.error_message,
            error_step_id: r.error_step_id,
            error_details: r.error_details,
            steps_completed: r.steps_completed,
            steps_total: r.steps_total,
        })
    }
}

impl WorkflowResult {
    /// Start a new `running` result for `steps_total` steps.
    pub fn begin(workflow_id: Uuid, steps_total: u32) -> Self {
        Self {
            workflow_id,
            execution_id: Uuid::new_v4(),
            status: WorkflowStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_seconds: None,
            output_data: Map::new(),
            step_results: Map::new(),
            error_message: None,
            error_step_id: None,
            error_details: None,
            steps_completed: 0,
            steps_total,
        }
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration_seconds
    }

    pub fn is_finalized(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Store a finished step's output.
    pub fn record_step_result(&mut self, step_id: impl Into<String>, output: Value) {
        self.step_results.insert(step_id.into(), output);
        self.steps_completed += 1;
    }

    /// Attach the error that stopped the execution.
    pub fn record_failure(
        &mut self,
        step_id: Option<String>,
        message: impl Into<String>,
        details: Option<Map<String, Value>>,
    ) {
        self.error_message = Some(message.into());
        self.error_step_id = step_id;
        self.error_details = details;
    }

    /// Fraction of steps completed, 0 when the workflow has no steps.
    pub fn success_rate(&self) -> f64 {
        if self.steps_total == 0 {
            return 0.0;
        }
        f64::from(self.steps_completed) / f64::from(self.steps_total)
    }

    /// Stamp completion time, compute duration and set the terminal status.
    ///
    /// # Errors
    /// [`ValidationError::AlreadyFinalized`] on a second call.
    pub fn mark_completed(&mut self, success: bool) -> Result<(), ValidationError> {
        if self.is_finalized() {
            return Err(ValidationError::AlreadyFinalized(self.execution_id.to_string()));
        }

        // Clock skew must never produce a negative duration.
        let completed_at = Utc::now().max(self.started_at);
        let elapsed = (completed_at - self.started_at)
            .to_std()
            .unwrap_or_default();

        self.completed_at = Some(completed_at);
        self.duration_seconds = Some(elapsed.as_secs_f64());
        self.status = if success {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mark_completed_sets_duration_from_timestamps() {
        let mut result = WorkflowResult::begin(Uuid::new_v4(), 2);
        result.mark_completed(true).unwrap();

        let completed_at = result.completed_at().unwrap();
        let expected = (completed_at - result.started_at).num_microseconds().unwrap() as f64 / 1e6;
        let duration = result.duration_seconds().unwrap();

        assert!(duration >= 0.0);
        assert!((duration - expected).abs() < 1e-3);
        assert_eq!(result.status(), WorkflowStatus::Completed);
    }

    #[test]
    fn failed_execution_is_marked_failed() {
        let mut result = WorkflowResult::begin(Uuid::new_v4(), 3);
        result.record_step_result("open", json!({ "ok": true }));
        result.record_failure(Some("click".into()), "element not found", None);
        result.mark_completed(false).unwrap();

        assert_eq!(result.status(), WorkflowStatus::Failed);
        assert_eq!(result.error_step_id.as_deref(), Some("click"));
        assert_eq!(result.steps_completed, 1);
        assert!((result.success_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn result_is_finalized_only_once() {
        let mut result = WorkflowResult::begin(Uuid::new_v4(), 0);
        result.mark_completed(true).unwrap();
        let first = result.completed_at();

        assert!(matches!(
            result.mark_completed(false),
            Err(ValidationError::AlreadyFinalized(_))
        ));
        assert_eq!(result.completed_at(), first);
        assert_eq!(result.status(), WorkflowStatus::Completed);
    }

    #[test]
    fn backdated_start_yields_positive_duration() {
        let mut result = WorkflowResult::begin(Uuid::new_v4(), 1);
        result.started_at = Utc::now() - chrono::Duration::seconds(5);
        result.mark_completed(true).unwrap();
        assert!(result.duration_seconds().unwrap() >= 5.0);
    }

    #[test]
    fn success_rate_is_zero_without_steps() {
        let result = WorkflowResult::begin(Uuid::new_v4(), 0);
        assert_eq!(result.success_rate(), 0.0);
    }

    fn stored(started: &str, completed: Option<&str>, duration: Option<f64>) -> Value {
        json!({
            "workflow_id": Uuid::new_v4(),
            "execution_id": Uuid::new_v4(),
            "status": "completed",
            "started_at": started,
            "completed_at": completed,
            "duration_seconds": duration,
            "output_data": {},
            "step_results": {},
            "steps_completed": 1,
            "steps_total": 1,
        })
    }

    fn rejection(value: Value) -> &'static str {
        match serde_json::from_value::<WorkflowResult>(value) {
            Err(e) => {
                let msg = e.to_string();
                ["completed before", "duration does not match", "set together", "more steps"]
                    .into_iter()
                    .find(|reason| msg.contains(*reason))
                    .unwrap_or_else(|| panic!("unexpected error: {msg}"))
            }
            Ok(result) => panic!("accepted inconsistent result: {result:?}"),
        }
    }

    #[test]
    fn finalized_result_survives_json() {
        let mut result = WorkflowResult::begin(Uuid::new_v4(), 2);
        result.record_step_result("open", json!({ "ok": true }));
        result.mark_completed(true).unwrap();

        let text = serde_json::to_string(&result).unwrap();
        let back: WorkflowResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn stored_result_with_matching_duration_is_accepted() {
        let value = stored("2024-01-01T00:00:00Z", Some("2024-01-01T00:00:10.5Z"), Some(10.5));
        let result: WorkflowResult = serde_json::from_value(value).unwrap();
        assert_eq!(result.duration_seconds(), Some(10.5));
        assert!(result.is_finalized());
    }

    #[test]
    fn stored_result_completed_before_start_is_rejected() {
        let mut value = stored("2024-01-01T00:00:10Z", Some("2024-01-01T00:00:00Z"), Some(-10.0));
        value["steps_completed"] = json!(5);
        value["steps_total"] = json!(1);
        assert!(serde_json::from_value::<WorkflowResult>(value.clone()).is_err());

        value["steps_completed"] = json!(1);
        assert_eq!(rejection(value), "completed before");
    }

    #[test]
    fn stored_result_with_wrong_duration_is_rejected() {
        let value = stored("2024-01-01T00:00:00Z", Some("2024-01-01T00:00:10Z"), Some(3.0));
        assert_eq!(rejection(value), "duration does not match");
    }

    #[test]
    fn stored_result_needs_completion_and_duration_together() {
        let value = stored("2024-01-01T00:00:00Z", None, Some(3.0));
        assert_eq!(rejection(value), "set together");
        let value = stored("2024-01-01T00:00:00Z", Some("2024-01-01T00:00:03Z"), None);
        assert_eq!(rejection(value), "set together");
    }

    #[test]
    fn stored_result_with_too_many_completed_steps_is_rejected() {
        let mut value = stored("2024-01-01T00:00:00Z", None, None);
        value["status"] = json!("running");
        value["steps_completed"] = json!(5);
        assert_eq!(rejection(value), "more steps");
    }
}

//! Tests for the `Workflow` aggregate: step insertion/removal, ordering,
//! execution counters and the serde boundary.

use serde_json::{json, Value};

use crate::{StepConfig, StepType, ValidationError, Workflow, WorkflowStatus, WorkflowStep};

fn step(id: &str, order: u32) -> WorkflowStep {
    WorkflowStep::new(format!("step {id}"), StepType::Notification, StepConfig::new())
        .expect("valid step")
        .with_id(id)
        .with_order(order)
}

fn workflow_with(steps: Vec<WorkflowStep>) -> Workflow {
    let mut wf = Workflow::new("test").expect("valid name");
    wf.set_steps(steps).expect("valid steps");
    wf
}

fn ids(wf: &Workflow) -> Vec<String> {
    wf.get_steps_by_order().iter().map(|s| s.id.clone()).collect()
}

// ============================================================
// add_step / get_steps_by_order
// ============================================================

#[test]
fn steps_by_order_are_strictly_ascending() {
    let mut wf = workflow_with(vec![step("c", 30), step("a", 10), step("b", 20)]);
    wf.add_step(step("d", 15)).unwrap();
    wf.add_step(step("e", WorkflowStep::AUTO_ORDER)).unwrap();

    let orders: Vec<u32> = wf.get_steps_by_order().iter().map(|s| s.order).collect();
    assert_eq!(orders, vec![10, 15, 20, 30, 31]);
    assert!(orders.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ids(&wf), vec!["a", "d", "b", "c", "e"]);
}

#[test]
fn first_step_keeps_the_sentinel_order() {
    let mut wf = Workflow::new("fresh").unwrap();
    wf.add_step(step("only", WorkflowStep::AUTO_ORDER)).unwrap();
    assert_eq!(wf.get_step("only").unwrap().order, 0);

    wf.add_step(step("next", WorkflowStep::AUTO_ORDER)).unwrap();
    assert_eq!(wf.get_step("next").unwrap().order, 1);
}

#[test]
fn duplicate_id_leaves_workflow_unchanged() {
    let mut wf = workflow_with(vec![step("a", 1), step("b", 2)]);
    let before = wf.steps().to_vec();
    let touched = wf.updated_at();

    let err = wf.add_step(step("a", 3)).unwrap_err();

    assert!(matches!(err, ValidationError::DuplicateStepId(id) if id == "a"));
    assert_eq!(wf.steps(), before.as_slice());
    assert_eq!(wf.updated_at(), touched);
}

#[test]
fn duplicate_order_leaves_workflow_unchanged() {
    let mut wf = workflow_with(vec![step("a", 1), step("b", 2)]);
    let before = wf.steps().to_vec();

    let err = wf.add_step(step("c", 2)).unwrap_err();

    assert!(matches!(err, ValidationError::DuplicateOrder { order: 2, .. }));
    assert_eq!(wf.steps(), before.as_slice());
}

#[test]
fn set_steps_rejects_mutual_dependency_atomically() {
    let mut wf = workflow_with(vec![step("keep", 1)]);
    let err = wf
        .set_steps(vec![
            step("a", 1).depending_on(["b"]),
            step("b", 2).depending_on(["a"]),
        ])
        .unwrap_err();

    assert!(matches!(err, ValidationError::CircularDependency(_, _)));
    assert_eq!(ids(&wf), vec!["keep"]);
}

#[test]
fn adding_step_with_unknown_dependency_fails() {
    let mut wf = workflow_with(vec![step("a", 1)]);
    let err = wf.add_step(step("b", 2).depending_on(["zzz"])).unwrap_err();
    assert!(matches!(err, ValidationError::UnknownDependency { .. }));
    assert_eq!(wf.steps().len(), 1);
}

// ============================================================
// remove_step
// ============================================================

#[test]
fn removing_a_step_prunes_dependencies_on_it() {
    let mut wf = workflow_with(vec![
        step("a", 1),
        step("b", 2).depending_on(["a"]),
        step("c", 3).depending_on(["a", "b"]),
    ]);

    assert!(wf.remove_step("a"));

    assert!(wf.get_step("a").is_none());
    for s in wf.steps() {
        assert!(!s.depends_on.iter().any(|d| d == "a"), "{} still depends on a", s.id);
    }
    assert_eq!(wf.get_step("c").unwrap().depends_on, vec!["b"]);
    assert_eq!(wf.validate(), Ok(()));
}

#[test]
fn removing_unknown_step_returns_false() {
    let mut wf = workflow_with(vec![step("a", 1)]);
    let touched = wf.updated_at();
    assert!(!wf.remove_step("nope"));
    assert_eq!(wf.steps().len(), 1);
    assert_eq!(wf.updated_at(), touched);
}

// ============================================================
// Execution counters and derived properties
// ============================================================

#[test]
fn mark_executed_counts_every_call() {
    let mut wf = Workflow::new("counter").unwrap();
    assert_eq!(wf.success_rate(), 0.0);

    for _ in 0..5 {
        wf.mark_executed(true);
    }

    assert_eq!(wf.execution_count(), 5);
    assert_eq!(wf.success_count(), 5);
    assert_eq!(wf.success_rate(), 1.0);
    assert!(wf.last_executed_at().is_some());
}

#[test]
fn failures_lower_the_success_rate() {
    let mut wf = Workflow::new("mixed").unwrap();
    wf.mark_executed(true);
    wf.mark_executed(false);
    wf.mark_executed(false);
    wf.mark_executed(true);

    assert_eq!(wf.execution_count(), 4);
    assert_eq!(wf.success_count(), 2);
    assert_eq!(wf.success_rate(), 0.5);
}

#[test]
fn executable_requires_status_and_steps() {
    let mut wf = Workflow::new("exec").unwrap();
    assert_eq!(wf.status(), WorkflowStatus::Draft);
    assert!(!wf.is_executable());

    wf.set_status(WorkflowStatus::Ready);
    assert!(!wf.is_executable(), "no steps yet");

    wf.add_step(step("a", 1)).unwrap();
    assert!(wf.is_executable());

    for status in [WorkflowStatus::Completed, WorkflowStatus::Failed] {
        wf.set_status(status);
        assert!(wf.is_executable());
    }
    for status in [
        WorkflowStatus::Draft,
        WorkflowStatus::Running,
        WorkflowStatus::Paused,
        WorkflowStatus::Cancelled,
    ] {
        wf.set_status(status);
        assert!(!wf.is_executable());
    }
}

// ============================================================
// Persistence boundary
// ============================================================

#[test]
fn workflow_survives_json_round_trip() {
    let mut wf = workflow_with(vec![
        step("a", 1),
        step("b", 2).depending_on(["a"]).with_timeout(30).with_retries(2, 5),
    ]);
    wf.tags = vec!["nightly".into()];
    wf.created_by = Some("user-1".into());
    wf.set_status(WorkflowStatus::Ready);
    wf.mark_executed(true);

    let text = serde_json::to_string(&wf).unwrap();
    let back: Workflow = serde_json::from_str(&text).unwrap();

    assert_eq!(back.id, wf.id);
    assert_eq!(back.steps(), wf.steps());
    assert_eq!(back.status(), WorkflowStatus::Ready);
    assert_eq!(back.execution_count(), 1);
    assert_eq!(back.updated_at(), wf.updated_at());
    assert_eq!(back.tags, wf.tags);
}

#[test]
fn invalid_json_workflow_is_rejected() {
    let doc: Value = json!({
        "name": "broken",
        "steps": [
            { "id": "a", "name": "A", "step_type": "condition", "order": 1, "depends_on": ["b"] },
            { "id": "b", "name": "B", "step_type": "condition", "order": 2, "depends_on": ["a"] }
        ]
    });
    let err = serde_json::from_value::<Workflow>(doc).unwrap_err();
    assert!(err.to_string().contains("circular dependency"));
}

#[test]
fn minimal_json_workflow_gets_defaults() {
    let doc = json!({
        "name": "login flow",
        "steps": [
            {
                "name": "open page",
                "step_type": "browser_action",
                "order": 1,
                "config": { "action": "navigate", "target": "https://example.com" }
            }
        ]
    });
    let wf: Workflow = serde_json::from_value(doc).unwrap();
    assert_eq!(wf.version, "1.0.0");
    assert_eq!(wf.status(), WorkflowStatus::Draft);
    assert_eq!(wf.steps()[0].retry_delay_seconds, 1);
    assert!(!wf.steps()[0].id.is_empty());
}

#[test]
fn status_display_matches_json_name() {
    use WorkflowStatus::*;
    for status in [Draft, Ready, Running, Paused, Completed, Failed, Cancelled] {
        assert_eq!(serde_json::to_value(status).unwrap(), json!(status.to_string()));
    }
}

//! Assignment pipeline through the engine surface

use serde_json::{json, Map};
use tramita::{
    op, ActionOperator, Assignee, AssignmentRule, AssignmentStatus, AssignmentStrategy,
    InstanceFilter, InstanceStatus, Team, Template, TerminalOperator, WorkflowEngine,
    WorkflowStartOperator, WorkflowType,
};

fn admin_template(dag_id: &str) -> Template {
    Template::builder(dag_id)
        .workflow_type(WorkflowType::Admin)
        .category("administration")
        .task(
            "verify",
            op(ActionOperator::new(|_, _| Ok(Map::new()))),
        )
        .task("done", op(TerminalOperator::new("approved")))
        .edge("verify", "done")
        .build()
        .unwrap()
}

async fn engine_with_reviewers() -> WorkflowEngine {
    let engine = WorkflowEngine::in_memory();
    engine.register_template(admin_template("admin_review")).await.unwrap();
    engine.register_assignee(Assignee::new("rev-1").roles(vec!["reviewer".into()]));
    engine.register_assignee(Assignee::new("rev-2").roles(vec!["reviewer".into()]));
    engine.register_team(
        Team::new("revisores", "Revisores").members(vec!["rev-1".into(), "rev-2".into()]),
    );
    engine
}

fn spawning_parent(child: &str, rule: AssignmentRule) -> Template {
    Template::builder("citizen_request")
        .task(
            "handoff",
            op(WorkflowStartOperator::new(child)
                .fire_and_forget()
                .assignment_rule(rule)),
        )
        .task("done", op(TerminalOperator::new("SUCCESS")))
        .edge("handoff", "done")
        .build()
        .unwrap()
}

#[tokio::test]
async fn spawned_admin_instance_lands_in_review_pipeline() {
    let engine = engine_with_reviewers().await;
    let rule = AssignmentRule::with_strategy(AssignmentStrategy::RoundRobin)
        .to_users()
        .assignee_role("reviewer");
    engine.register_template(spawning_parent("admin_review", rule)).await.unwrap();

    let id = engine
        .create_instance("citizen_request", "citizen-1", Map::new())
        .await
        .unwrap();
    engine.start(&id).await.unwrap();

    let admins = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_review".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(admins.len(), 1);
    let admin = &admins[0];

    let assignment = admin.assignment.as_ref().unwrap();
    assert_eq!(assignment.status, AssignmentStatus::PendingReview);
    assert_eq!(assignment.team_id.as_deref(), Some("revisores"));
    assert!(assignment.user_id.is_some());
}

#[tokio::test]
async fn review_pipeline_happy_path() {
    let engine = engine_with_reviewers().await;

    let id = engine
        .create_instance("admin_review", "system", Map::new())
        .await
        .unwrap();
    // Bind through a reassignment (the instance was created unassigned)
    assert!(engine.assignment().reassign(&id, None).await.unwrap());

    assert!(engine.start_review(&id, "rev-1").await.unwrap());
    assert!(engine.approve_by_reviewer(&id, "rev-1", Some("looks right".into())).await.unwrap());
    assert!(engine.final_approval(&id, "manager", None).await.unwrap());

    let instance = engine.get_instance(&id).await.unwrap();
    let assignment = instance.assignment.as_ref().unwrap();
    assert_eq!(assignment.status, AssignmentStatus::Completed);
    assert_eq!(assignment.approved_by.as_deref(), Some("manager"));
    assert_eq!(assignment.reviewed_by.as_deref(), Some("rev-1"));
}

#[tokio::test]
async fn illegal_review_calls_return_false_and_change_nothing() {
    let engine = engine_with_reviewers().await;

    let id = engine
        .create_instance("admin_review", "system", Map::new())
        .await
        .unwrap();
    engine.assignment().reassign(&id, None).await.unwrap();

    // Skipping the review stage is refused
    assert!(!engine.approve_by_reviewer(&id, "rev-1", None).await.unwrap());
    assert!(!engine.final_approval(&id, "manager", None).await.unwrap());

    let instance = engine.get_instance(&id).await.unwrap();
    assert_eq!(
        instance.assignment_status(),
        Some(AssignmentStatus::PendingReview)
    );

    // Only the reviewer who started may conclude
    assert!(engine.start_review(&id, "rev-1").await.unwrap());
    assert!(!engine
        .reject_by_reviewer(&id, "rev-2", "not yours", None)
        .await
        .unwrap());
    assert!(engine
        .reject_by_reviewer(&id, "rev-1", "incomplete file", Some("resubmit".into()))
        .await
        .unwrap());

    let instance = engine.get_instance(&id).await.unwrap();
    let assignment = instance.assignment.as_ref().unwrap();
    assert_eq!(assignment.status, AssignmentStatus::Rejected);
    assert_eq!(assignment.rejection_reason.as_deref(), Some("incomplete file"));
}

#[tokio::test]
async fn round_robin_spreads_consecutive_spawns() {
    let engine = engine_with_reviewers().await;
    let rule = AssignmentRule::with_strategy(AssignmentStrategy::RoundRobin)
        .to_users()
        .assignee_role("reviewer");
    engine.set_assignment_rule("admin_review", rule);

    for _ in 0..2 {
        let id = engine
            .create_instance("admin_review", "system", Map::new())
            .await
            .unwrap();
        engine.assignment().reassign(&id, None).await.unwrap();
    }

    let mut assigned: Vec<String> = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_review".into()),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_iter()
        .filter_map(|i| i.assignment.and_then(|a| a.user_id))
        .collect();
    assigned.sort();
    assert_eq!(assigned, vec!["rev-1", "rev-2"]);
}

#[tokio::test]
async fn per_workflow_rule_overrides_default() {
    let engine = engine_with_reviewers().await;
    engine.register_team(Team::new("backoffice", "Backoffice"));
    engine.set_assignment_rule(
        "admin_review",
        AssignmentRule::default().preferred_teams(vec!["backoffice".into()]),
    );

    let id = engine
        .create_instance("admin_review", "system", Map::new())
        .await
        .unwrap();
    engine.assignment().reassign(&id, None).await.unwrap();

    let instance = engine.get_instance(&id).await.unwrap();
    assert_eq!(
        instance.assignment.as_ref().unwrap().team_id.as_deref(),
        Some("backoffice")
    );
}

#[tokio::test]
async fn context_projection_reaches_spawned_child() {
    let engine = engine_with_reviewers().await;
    let parent = Template::builder("projecting_parent")
        .task(
            "collect",
            op(ActionOperator::new(|_, _| {
                let mut out = Map::new();
                out.insert("expediente".into(), json!("EXP-2024-001"));
                out.insert("internal_note".into(), json!("draft"));
                Ok(out)
            })),
        )
        .task(
            "handoff",
            op(WorkflowStartOperator::new("admin_review")
                .fire_and_forget()
                .no_context()
                .map_context("expediente", "case_number")),
        )
        .task("done", op(TerminalOperator::new("SUCCESS")))
        .edge("collect", "handoff")
        .edge("handoff", "done")
        .build()
        .unwrap();
    engine.register_template(parent).await.unwrap();

    let id = engine
        .create_instance("projecting_parent", "citizen-1", Map::new())
        .await
        .unwrap();
    engine.start(&id).await.unwrap();

    let children = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_review".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(children.len(), 1);
    let child = &children[0];

    assert_eq!(child.context.get("case_number"), Some(&json!("EXP-2024-001")));
    assert!(child.context.get("internal_note").is_none(), "no_context holds");
    assert_eq!(child.context.get("parent_task_id"), Some(&json!("handoff")));
}

#[tokio::test]
async fn escalated_instances_can_be_reassigned() {
    let engine = engine_with_reviewers().await;

    let id = engine
        .create_instance("admin_review", "system", Map::new())
        .await
        .unwrap();
    engine.assignment().reassign(&id, None).await.unwrap();
    engine.start_review(&id, "rev-1").await.unwrap();

    assert!(engine
        .assignment()
        .escalate(&id, "no answer in five days", "supervisor")
        .await
        .unwrap());
    let instance = engine.get_instance(&id).await.unwrap();
    assert_eq!(instance.assignment_status(), Some(AssignmentStatus::Escalated));

    // Escalated instances go back through assignment
    assert!(engine.assignment().reassign(&id, None).await.unwrap());
    let instance = engine.get_instance(&id).await.unwrap();
    assert_eq!(instance.assignment_status(), Some(AssignmentStatus::PendingReview));
    assert!(!instance.assignment.as_ref().unwrap().history.is_empty());
}

#[tokio::test]
async fn waiting_for_assignment_instances_become_startable_after_bind() {
    let engine = engine_with_reviewers().await;
    let parent = spawning_parent(
        "admin_review",
        AssignmentRule::with_strategy(AssignmentStrategy::WorkloadBased),
    );
    engine.register_template(parent).await.unwrap();

    let id = engine
        .create_instance("citizen_request", "citizen-1", Map::new())
        .await
        .unwrap();
    engine.start(&id).await.unwrap();

    let children = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_review".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let child = &children[0];
    // Assignment succeeded, so the admin child is admissible
    assert_eq!(child.status, InstanceStatus::Pending);

    engine.start(&child.instance_id).await.unwrap();
    let child = engine.get_instance(&child.instance_id).await.unwrap();
    assert_eq!(child.status, InstanceStatus::Completed);
    assert_eq!(child.terminal_status.as_deref(), Some("approved"));
}

#[tokio::test]
async fn unassignable_admin_child_stays_waiting_for_assignment() {
    let engine = WorkflowEngine::in_memory();
    engine.register_template(admin_template("admin_orphan")).await.unwrap();
    // no teams registered at all
    let parent = spawning_parent(
        "admin_orphan",
        AssignmentRule::with_strategy(AssignmentStrategy::WorkloadBased),
    );
    engine.register_template(parent).await.unwrap();

    let id = engine
        .create_instance("citizen_request", "citizen-1", Map::new())
        .await
        .unwrap();
    engine.start(&id).await.unwrap();

    let children = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_orphan".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(children[0].status, InstanceStatus::WaitingForAssignment);
    assert!(children[0].assignment.is_none());
}

//! Hook engine behavior through the public surface

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tramita::{
    op, ActionOperator, EngineConfig, EngineError, EventType, Hook, HookFilter, InstanceFilter,
    InstanceStatus, MemoryStore, Team, Template, TerminalOperator, WorkflowEngine, WorkflowType,
};

fn payload(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn process_template(dag_id: &str) -> Template {
    Template::builder(dag_id)
        .workflow_type(WorkflowType::Process)
        .task(
            "work",
            op(ActionOperator::new(|_, _| {
                let mut out = Map::new();
                out.insert("permit_id".into(), json!("P-77"));
                Ok(out)
            })),
        )
        .task("done", op(TerminalOperator::new("SUCCESS")))
        .edge("work", "done")
        .build()
        .unwrap()
}

fn admin_template(dag_id: &str) -> Template {
    Template::builder(dag_id)
        .workflow_type(WorkflowType::Admin)
        .task("audit", op(TerminalOperator::new("SUCCESS")))
        .build()
        .unwrap()
}

async fn engine_with_templates() -> WorkflowEngine {
    let engine = WorkflowEngine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
    engine.register_template(process_template("building_permit")).await.unwrap();
    engine.register_template(admin_template("admin_audit")).await.unwrap();
    engine.register_team(Team::new("auditores", "Auditores"));
    engine
}

#[tokio::test]
async fn completion_hook_starts_admin_workflow_with_context() {
    let engine = engine_with_templates().await;
    engine
        .register_hook(Hook::on_completed("audit_on_done", "building_permit", "admin_audit"))
        .await
        .unwrap();

    let id = engine
        .create_instance("building_permit", "citizen-1", Map::new())
        .await
        .unwrap();
    engine.start(&id).await.unwrap();

    // The hook created an instance of admin_audit, assigned via the service
    let admins = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_audit".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(admins.len(), 1);
    let admin = &admins[0];
    assert_eq!(admin.workflow_type, WorkflowType::Admin);
    assert!(admin.assignment.is_some());
    assert_eq!(
        admin.assignment.as_ref().unwrap().team_id.as_deref(),
        Some("auditores")
    );

    // Context: the source instance's final context plus the trigger record
    assert_eq!(admin.context.get("permit_id"), Some(&json!("P-77")));
    let trigger = admin.context.get("triggering_event").unwrap();
    assert_eq!(trigger["workflow_id"], "building_permit");
    assert_eq!(trigger["instance_id"], json!(id));

    // The event lists the triggered instance
    let events = engine.events().events_for("building_permit").await;
    let completed = events
        .iter()
        .find(|e| e.event_type == EventType::Completed)
        .unwrap();
    assert_eq!(completed.triggered_instances, vec![admin.instance_id.clone()]);
    assert!(completed.processed_at.is_some());
}

#[tokio::test]
async fn glob_and_regex_patterns_match_event_keys() {
    let engine = engine_with_templates().await;
    engine
        .register_hook(Hook::new("glob_all", "admin_audit", "COMPLETED.*"))
        .await
        .unwrap();
    engine
        .register_hook(Hook::new("regex_permits", "admin_audit", r"regex:^COMPLETED\.building_.*$"))
        .await
        .unwrap();
    engine
        .register_hook(Hook::new("unrelated", "admin_audit", "FAILED.?ermit"))
        .await
        .unwrap();

    let id = engine
        .create_instance("building_permit", "citizen-1", Map::new())
        .await
        .unwrap();
    engine.start(&id).await.unwrap();

    // glob_all and regex_permits both fire; the FAILED pattern does not
    let admins = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_audit".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(admins.len(), 2);
}

#[tokio::test]
async fn instance_scoped_pattern_targets_one_source_instance() {
    let engine = engine_with_templates().await;

    let watched = engine
        .create_instance("building_permit", "citizen-1", Map::new())
        .await
        .unwrap();
    let other = engine
        .create_instance("building_permit", "citizen-2", Map::new())
        .await
        .unwrap();

    engine
        .register_hook(Hook::new(
            "only_that_case",
            "admin_audit",
            format!("COMPLETED.building_permit.{watched}"),
        ))
        .await
        .unwrap();

    engine.start(&other).await.unwrap();
    engine.start(&watched).await.unwrap();

    let admins = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_audit".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(admins.len(), 1, "only the watched instance triggers the hook");
    assert_eq!(
        admins[0].context.get("triggering_event").unwrap()["instance_id"],
        json!(watched)
    );
}

#[tokio::test]
async fn priority_orders_triggered_instances() {
    let engine = engine_with_templates().await;
    engine
        .register_hook(
            Hook::on_completed("low", "building_permit", "admin_audit")
                .priority(1)
                .map_context("permit_id", "source_permit"),
        )
        .await
        .unwrap();
    engine
        .register_hook(Hook::on_completed("high", "building_permit", "admin_audit").priority(10))
        .await
        .unwrap();

    let id = engine
        .create_instance("building_permit", "citizen-1", Map::new())
        .await
        .unwrap();
    engine.start(&id).await.unwrap();

    let events = engine.events().events_for("building_permit").await;
    let completed = events
        .iter()
        .find(|e| e.event_type == EventType::Completed)
        .unwrap();
    assert_eq!(completed.triggered_instances.len(), 2);

    // The high-priority hook fired first
    let first = engine.get_instance(&completed.triggered_instances[0]).await.unwrap();
    let second = engine.get_instance(&completed.triggered_instances[1]).await.unwrap();
    assert!(first.created_at <= second.created_at);
    assert!(second.context.get("source_permit").is_some());
    assert!(first.context.get("source_permit").is_none());
}

#[tokio::test]
async fn conditional_hook_checks_event_data() {
    let engine = engine_with_templates().await;
    engine
        .register_hook(
            Hook::on_completed("only_p77", "building_permit", "admin_audit")
                .conditional(payload(json!({"permit_id": "P-77"}))),
        )
        .await
        .unwrap();
    engine
        .register_hook(
            Hook::on_completed("only_other", "building_permit", "admin_audit")
                .conditional(payload(json!({"permit_id": "P-99"}))),
        )
        .await
        .unwrap();

    let id = engine
        .create_instance("building_permit", "citizen-1", Map::new())
        .await
        .unwrap();
    engine.start(&id).await.unwrap();

    let admins = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_audit".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(admins.len(), 1, "only the matching conditional hook fires");
}

#[tokio::test]
async fn user_based_hook_filters_on_user_attributes() {
    let engine = engine_with_templates().await;
    engine
        .register_hook(
            Hook::new("residents_only", "admin_audit", "STARTED.*")
                .user_based(payload(json!({"resident": true}))),
        )
        .await
        .unwrap();

    engine
        .publish_event(
            EventType::Started,
            "census",
            None,
            Some("citizen-1"),
            json!({"user_attributes": {"resident": false}}),
        )
        .await
        .unwrap();
    engine
        .publish_event(
            EventType::Started,
            "census",
            None,
            Some("citizen-2"),
            json!({"user_attributes": {"resident": true}}),
        )
        .await
        .unwrap();

    let admins = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_audit".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(admins.len(), 1);
    assert_eq!(admins[0].user_id, "citizen-2");
}

#[tokio::test]
async fn entity_based_hook_requires_owned_entities() {
    use tramita::service::{EntityService, MockEntityService};

    let entity_service = Arc::new(MockEntityService::new());
    entity_service.seed_entity("address", "citizen-with-address");
    let collaborator: Arc<dyn EntityService> = entity_service.clone();

    let engine = WorkflowEngine::with_entity_service(
        Arc::new(MemoryStore::new()),
        EngineConfig::default(),
        Some(collaborator),
    );
    engine.register_template(admin_template("admin_audit")).await.unwrap();
    engine.register_team(Team::new("auditores", "Auditores"));
    engine
        .register_hook(
            Hook::new("needs_address", "admin_audit", "COMPLETED.*")
                .entity_based(vec!["address".into()]),
        )
        .await
        .unwrap();

    engine
        .publish_event(EventType::Completed, "census", None, Some("citizen-without"), json!({}))
        .await
        .unwrap();
    engine
        .publish_event(
            EventType::Completed,
            "census",
            None,
            Some("citizen-with-address"),
            json!({}),
        )
        .await
        .unwrap();

    let admins = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_audit".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(admins.len(), 1);
    assert_eq!(admins[0].user_id, "citizen-with-address");
}

#[tokio::test]
async fn disabled_hooks_never_fire() {
    let engine = engine_with_templates().await;
    engine
        .register_hook(Hook::on_completed("dormant", "building_permit", "admin_audit").disabled())
        .await
        .unwrap();

    let id = engine
        .create_instance("building_permit", "citizen-1", Map::new())
        .await
        .unwrap();
    engine.start(&id).await.unwrap();

    let admins = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_audit".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(admins.is_empty());
}

#[tokio::test]
async fn hook_validation_rejects_bad_configs() {
    let engine = engine_with_templates().await;

    let err = engine
        .register_hook(Hook::new("bad_target", "nonexistent_workflow", "COMPLETED.*"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidHook { .. }));

    let err = engine
        .register_hook(Hook::new("bad_regex", "admin_audit", "regex:([unclosed"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidHook { .. }));

    let err = engine
        .register_hook(Hook::new("", "admin_audit", "COMPLETED.*"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidHook { .. }));
}

#[tokio::test]
async fn unregister_removes_the_hook() {
    let engine = engine_with_templates().await;
    engine
        .register_hook(Hook::on_completed("temp", "building_permit", "admin_audit"))
        .await
        .unwrap();
    assert_eq!(engine.list_hooks(&HookFilter::default()).await.unwrap().len(), 1);

    engine.unregister_hook("temp").await.unwrap();
    assert!(engine.list_hooks(&HookFilter::default()).await.unwrap().is_empty());

    let err = engine.unregister_hook("temp").await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownHook(_)));
}

#[tokio::test]
async fn external_emitters_can_publish_events() {
    let engine = engine_with_templates().await;
    engine
        .register_hook(
            Hook::new("on_entity", "admin_audit", "ENTITY_CREATED.*")
                .map_context("entity_id", "entity_to_audit"),
        )
        .await
        .unwrap();

    engine
        .publish_event(
            EventType::EntityCreated,
            "registration_desk",
            None,
            Some("citizen-9"),
            json!({"entity_id": "ent-1", "entity_type": "address"}),
        )
        .await
        .unwrap();

    let admins = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_audit".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(admins.len(), 1);
    assert_eq!(admins[0].context.get("entity_to_audit"), Some(&json!("ent-1")));
    assert_eq!(admins[0].user_id, "citizen-9");
}

#[tokio::test]
async fn hook_created_instance_is_startable() {
    let engine = engine_with_templates().await;
    engine
        .register_hook(Hook::on_completed("chain", "building_permit", "admin_audit"))
        .await
        .unwrap();

    let id = engine
        .create_instance("building_permit", "citizen-1", Map::new())
        .await
        .unwrap();
    engine.start(&id).await.unwrap();

    let admins = engine
        .list_instances(&InstanceFilter {
            dag_id: Some("admin_audit".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let admin_id = admins[0].instance_id.clone();

    engine.start(&admin_id).await.unwrap();
    let admin = engine.get_instance(&admin_id).await.unwrap();
    assert_eq!(admin.status, InstanceStatus::Completed);
}

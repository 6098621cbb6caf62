//! Workflow engine - root object graph and programmatic surface
//!
//! Assembles the registry, store, event bus, hook engine, assignment
//! service and executor into one object graph (no global singletons) and
//! exposes the operations an outer service layer calls:
//!
//! - templates: `register_template`, `get_template_record`, `list_templates`
//! - instances: `create_instance`, `start`, `get_instance`,
//!   `list_instances`, `submit_input`, `cancel`
//! - hooks: `register_hook`, `unregister_hook`, `list_hooks`
//! - events: `publish_event`, `query_events`, `subscribe`
//! - assignment: directory/rule registration and the review-stage calls

use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use crate::assignment::{Assignee, AssignmentRule, AssignmentService, Team};
use crate::config::EngineConfig;
use crate::context::pending_input_key;
use crate::error::EngineError;
use crate::events::{Event, EventBus, EventType};
use crate::executor::Executor;
use crate::hooks::{Hook, HookEngine};
use crate::instance::{Instance, TaskStatus};
use crate::operator::{ApprovalDecision, Services};
use crate::registry::DagRegistry;
use crate::service::EntityService;
use crate::store::{EventFilter, HookFilter, InstanceFilter, InstanceStore, LogEntry, MemoryStore};
use crate::template::{Template, TemplateRecord};

pub struct WorkflowEngine {
    services: Services,
    hook_engine: Arc<HookEngine>,
    executor: Executor,
}

impl WorkflowEngine {
    /// Assemble an engine over the given store
    pub fn new(store: Arc<dyn InstanceStore>, config: EngineConfig) -> Self {
        Self::with_entity_service(store, config, None)
    }

    /// In-memory engine with defaults (tests, single-node tools)
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), EngineConfig::default())
    }

    pub fn with_entity_service(
        store: Arc<dyn InstanceStore>,
        config: EngineConfig,
        entity_service: Option<Arc<dyn EntityService>>,
    ) -> Self {
        let registry = Arc::new(DagRegistry::new());
        let assignment = Arc::new(AssignmentService::new(Arc::clone(&store)));
        let bus = EventBus::new(Arc::clone(&store));

        let hook_engine = Arc::new(HookEngine::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&assignment),
            entity_service,
        ));
        bus.attach_hook_engine(Arc::clone(&hook_engine));

        let services = Services {
            registry,
            store,
            bus,
            assignment,
        };
        let executor = Executor::new(services.clone(), config);

        Self {
            services,
            hook_engine,
            executor,
        }
    }

    /// Collaborator handles, for wiring and tests
    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn assignment(&self) -> &AssignmentService {
        &self.services.assignment
    }

    pub fn events(&self) -> &EventBus {
        &self.services.bus
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    pub async fn register_template(&self, template: Template) -> Result<(), EngineError> {
        let template = self.services.registry.register(template)?;
        self.services.store.upsert_template(template.record()).await
    }

    pub async fn get_template_record(&self, dag_id: &str) -> Result<Option<TemplateRecord>, EngineError> {
        self.services.store.load_template(dag_id).await
    }

    pub async fn list_templates(&self) -> Result<Vec<TemplateRecord>, EngineError> {
        self.services.store.list_templates().await
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Allocate and persist a new instance; admission is a separate call
    pub async fn create_instance(
        &self,
        dag_id: &str,
        user_id: &str,
        initial_data: Map<String, Value>,
    ) -> Result<String, EngineError> {
        let instance = self.services.registry.instantiate(dag_id, user_id, initial_data)?;
        self.services.store.create_instance(&instance).await?;
        self.services
            .store
            .append_log(LogEntry::info(
                &instance.instance_id,
                "instance_created",
                format!("instance of {dag_id} created for {user_id}"),
            ))
            .await?;
        info!(instance_id = %instance.instance_id, dag_id, user_id, "instance created");
        Ok(instance.instance_id)
    }

    /// Admit an instance to the executor
    pub async fn start(&self, instance_id: &str) -> Result<(), EngineError> {
        self.executor.submit(instance_id).await
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<Instance, EngineError> {
        self.services
            .store
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))
    }

    pub async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, EngineError> {
        self.services.store.list_instances(filter).await
    }

    pub async fn instance_logs(&self, instance_id: &str) -> Result<Vec<LogEntry>, EngineError> {
        self.services.store.logs(instance_id).await
    }

    /// Resume a waiting UserInput / AdminInput / Approval task.
    ///
    /// The payload must validate against the task's form schema, or carry a
    /// well-formed `{decision, comments?}` for approval tasks. Submitting
    /// to a task that is not waiting is rejected without any state change.
    pub async fn submit_input(
        &self,
        instance_id: &str,
        task_id: &str,
        payload: Map<String, Value>,
    ) -> Result<(), EngineError> {
        let mut instance = self.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                instance_id: instance_id.to_string(),
                reason: format!("cannot submit input in status {:?}", instance.status),
            });
        }

        let state = instance
            .task_state(task_id)
            .ok_or_else(|| EngineError::UnknownTask {
                instance_id: instance_id.to_string(),
                task_id: task_id.to_string(),
            })?;
        if state.status != TaskStatus::Waiting {
            return Err(EngineError::ResumeWithoutWait {
                instance_id: instance_id.to_string(),
                task_id: task_id.to_string(),
            });
        }

        match state.waiting_for.as_deref() {
            Some("approval") => {
                let decision = payload
                    .get("decision")
                    .and_then(Value::as_str)
                    .ok_or_else(|| EngineError::Validation(vec!["missing field: decision".into()]))?;
                ApprovalDecision::from_str(decision)
                    .map_err(|e| EngineError::Validation(vec![e]))?;
            }
            Some("input") | None => {
                let template = self
                    .services
                    .registry
                    .get(&instance.dag_id)
                    .ok_or_else(|| EngineError::UnknownTemplate(instance.dag_id.clone()))?;
                let operator = template.operator(task_id).ok_or_else(|| EngineError::UnknownTask {
                    instance_id: instance_id.to_string(),
                    task_id: task_id.to_string(),
                })?;
                if let Some(form) = operator.form_config() {
                    let errors = form.validate(&payload);
                    if !errors.is_empty() {
                        return Err(EngineError::Validation(errors));
                    }
                }
            }
            Some(other) => {
                // child_workflow waits resume on their own; input is invalid
                info!(task_id, waiting_for = other, "rejecting input for non-input wait");
                return Err(EngineError::ResumeWithoutWait {
                    instance_id: instance_id.to_string(),
                    task_id: task_id.to_string(),
                });
            }
        }

        instance
            .context
            .set(pending_input_key(task_id), Value::Object(payload));
        instance.touch();
        self.services.store.save_instance(&mut instance).await?;

        self.executor.resume(instance_id).await
    }

    pub async fn cancel(&self, instance_id: &str) -> Result<(), EngineError> {
        self.executor.cancel(instance_id).await
    }

    /// Re-admit a waiting instance (external re-notification)
    pub async fn resume(&self, instance_id: &str) -> Result<(), EngineError> {
        self.executor.resume(instance_id).await
    }

    // ------------------------------------------------------------------
    // Hooks & events
    // ------------------------------------------------------------------

    pub async fn register_hook(&self, hook: Hook) -> Result<(), EngineError> {
        self.hook_engine.register_hook(hook).await
    }

    pub async fn unregister_hook(&self, hook_id: &str) -> Result<(), EngineError> {
        self.hook_engine.unregister_hook(hook_id).await
    }

    pub async fn list_hooks(&self, filter: &HookFilter) -> Result<Vec<Hook>, EngineError> {
        self.hook_engine.list_hooks(filter).await
    }

    /// Publish an event on behalf of an external emitter
    pub async fn publish_event(
        &self,
        event_type: EventType,
        workflow_id: &str,
        instance_id: Option<&str>,
        user_id: Option<&str>,
        event_data: Value,
    ) -> Result<String, EngineError> {
        self.services
            .bus
            .publish(event_type, workflow_id, instance_id, user_id, event_data)
            .await
    }

    pub async fn query_events(&self, filter: &EventFilter) -> Result<Vec<Event>, EngineError> {
        self.services.bus.query(filter).await
    }

    /// In-process subscription for infrastructure concerns (audit, metrics)
    pub fn subscribe<F>(&self, event_type: EventType, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.services.bus.subscribe(event_type, handler);
    }

    // ------------------------------------------------------------------
    // Assignment directory and review stages
    // ------------------------------------------------------------------

    pub fn register_team(&self, team: Team) {
        self.services.assignment.register_team(team);
    }

    pub fn register_assignee(&self, assignee: Assignee) {
        self.services.assignment.register_assignee(assignee);
    }

    pub fn set_assignment_rule(&self, workflow_id: impl Into<String>, rule: AssignmentRule) {
        self.services.assignment.set_rule(workflow_id, rule);
    }

    pub async fn start_review(&self, instance_id: &str, reviewer_id: &str) -> Result<bool, EngineError> {
        self.services.assignment.start_review(instance_id, reviewer_id).await
    }

    pub async fn approve_by_reviewer(
        &self,
        instance_id: &str,
        reviewer_id: &str,
        comments: Option<String>,
    ) -> Result<bool, EngineError> {
        self.services
            .assignment
            .approve_by_reviewer(instance_id, reviewer_id, comments)
            .await
    }

    pub async fn reject_by_reviewer(
        &self,
        instance_id: &str,
        reviewer_id: &str,
        reason: &str,
        comments: Option<String>,
    ) -> Result<bool, EngineError> {
        self.services
            .assignment
            .reject_by_reviewer(instance_id, reviewer_id, reason, comments)
            .await
    }

    pub async fn final_approval(
        &self,
        instance_id: &str,
        approver_id: &str,
        comments: Option<String>,
    ) -> Result<bool, EngineError> {
        self.services
            .assignment
            .final_approval(instance_id, approver_id, comments)
            .await
    }
}

//! Workflow-start operator - spawns a child instance, optionally waits
//!
//! First entry: build the child context from a projection of the parent's,
//! create the child through the registry, hand it to the assignment
//! service, persist it. With `wait_for_completion` the task suspends on
//! `waiting_for = "child_workflow"`, parking `{child_instance_id,
//! started_at}` under a reserved context key so re-entries find it.
//!
//! Re-entry: load the child and compare against `required_status`
//! ("any" accepts every terminal status). A matching completion returns
//! Continue with the child's exportable context merged in; a mismatch,
//! child failure/cancellation, or an exceeded wait budget fails the task.
//! Budgets are checked only here - there are no background timers.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{ExecutionContext, Operator, OperatorKind, TaskResult};
use crate::assignment::AssignmentRule;
use crate::context::child_state_key;
use crate::instance::{Instance, InstanceStatus, WorkflowType};
use crate::store::InstanceStore;

/// Default wait budget: 24 hours
const DEFAULT_TIMEOUT_MINUTES: i64 = 1440;

pub struct WorkflowStartOperator {
    /// Template the child runs from
    pub workflow_id: String,
    pub wait_for_completion: bool,
    pub timeout_minutes: i64,
    /// Copy the parent's exportable context into the child wholesale
    pub pass_context: bool,
    /// parent key -> child key projection, applied after `pass_context`
    pub context_mapping: Vec<(String, String)>,
    /// Terminal status expected of the child ("any" accepts all)
    pub required_status: String,
    /// Assignment override handed to the assignment service
    pub assignment_rule: Option<AssignmentRule>,
    /// Child execution priority (1-10)
    pub priority: u8,
    /// Ask the executor to admit the child immediately after creation
    pub auto_start: bool,
}

impl WorkflowStartOperator {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            wait_for_completion: true,
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            pass_context: true,
            context_mapping: Vec::new(),
            required_status: "any".into(),
            assignment_rule: None,
            priority: 5,
            auto_start: false,
        }
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.wait_for_completion = false;
        self
    }

    pub fn timeout_minutes(mut self, minutes: i64) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    pub fn required_status(mut self, status: impl Into<String>) -> Self {
        self.required_status = status.into();
        self
    }

    pub fn map_context(mut self, parent_key: impl Into<String>, child_key: impl Into<String>) -> Self {
        self.context_mapping.push((parent_key.into(), child_key.into()));
        self
    }

    pub fn no_context(mut self) -> Self {
        self.pass_context = false;
        self
    }

    pub fn assignment_rule(mut self, rule: AssignmentRule) -> Self {
        self.assignment_rule = Some(rule);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn auto_start(mut self) -> Self {
        self.auto_start = true;
        self
    }

    fn build_child_context(&self, ctx: &ExecutionContext) -> Map<String, Value> {
        let mut child = Map::new();

        if self.pass_context {
            for (key, value) in ctx.context.exportable() {
                child.insert(key, value);
            }
        }
        for (parent_key, child_key) in &self.context_mapping {
            if let Some(value) = ctx.context.get(parent_key) {
                child.insert(child_key.clone(), value.clone());
            }
        }

        child.insert("parent_instance_id".into(), json!(ctx.instance_id));
        child.insert("parent_workflow_id".into(), json!(ctx.dag_id));
        child.insert("parent_task_id".into(), json!(ctx.task_id));
        child
    }

    async fn start_child(&self, ctx: &ExecutionContext) -> TaskResult {
        let child_context = self.build_child_context(ctx);

        let mut child: Instance = match ctx
            .services
            .registry
            .instantiate(&self.workflow_id, &ctx.user_id, child_context)
        {
            Ok(child) => child,
            Err(error) => return TaskResult::failed(format!("failed to start child workflow: {error}")),
        };

        child.parent_instance_id = Some(ctx.instance_id.clone());
        child.parent_task_id = Some(ctx.task_id.clone());
        child.priority = self.priority;
        if child.workflow_type == WorkflowType::Admin {
            child.status = InstanceStatus::WaitingForAssignment;
        }

        let assigned = ctx
            .services
            .assignment
            .bind(&mut child, self.assignment_rule.as_ref())
            .await;
        match assigned {
            Ok(true) => {
                if child.status == InstanceStatus::WaitingForAssignment {
                    child.status = InstanceStatus::Pending;
                }
            }
            Ok(false) => {
                debug!(child = %child.instance_id, "no assignment made for child workflow");
            }
            Err(error) => {
                warn!(%error, child = %child.instance_id, "assignment failed, leaving child unassigned");
            }
        }

        if let Err(error) = ctx.services.store.create_instance(&child).await {
            return TaskResult::failed(format!("failed to persist child workflow: {error}"));
        }

        info!(
            child = %child.instance_id,
            workflow = %self.workflow_id,
            parent = %ctx.instance_id,
            "child workflow created"
        );

        let mut state = Map::new();
        state.insert("child_instance_id".into(), json!(child.instance_id));
        state.insert("started_at".into(), json!(Utc::now().to_rfc3339()));
        if self.auto_start {
            state.insert("auto_start".into(), json!(true));
        }
        let mut patch = Map::new();
        patch.insert(child_state_key(&ctx.task_id), Value::Object(state));

        if !self.wait_for_completion {
            let mut data = Map::new();
            data.insert("child_instance_id".into(), json!(child.instance_id));
            data.insert("child_workflow_id".into(), json!(self.workflow_id));
            data.insert(
                "message".into(),
                json!(format!("started child workflow {}", self.workflow_id)),
            );
            return TaskResult::completed(data).with_context_patch(patch);
        }

        let mut data = Map::new();
        data.insert("child_instance_id".into(), json!(child.instance_id));
        data.insert("child_status".into(), json!(child.status));
        data.insert("message".into(), json!("waiting for child workflow"));
        TaskResult::waiting("child_workflow", data).with_context_patch(patch)
    }

    async fn check_child(&self, ctx: &ExecutionContext, state: &Map<String, Value>) -> TaskResult {
        let Some(child_id) = state.get("child_instance_id").and_then(Value::as_str) else {
            return TaskResult::failed("child workflow state lost its instance id");
        };

        let started_at = state
            .get("started_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let child = match ctx.services.store.load_instance(child_id).await {
            Ok(Some(child)) => child,
            Ok(None) => return TaskResult::failed(format!("child workflow {child_id} not found")),
            Err(error) => return TaskResult::failed(error.to_string()),
        };

        let elapsed = Utc::now() - started_at;
        if elapsed > Duration::minutes(self.timeout_minutes) {
            warn!(child = %child_id, minutes = self.timeout_minutes, "child workflow wait budget exceeded");
            return TaskResult::failed(format!(
                "timed out waiting for child workflow after {} minutes",
                self.timeout_minutes
            ));
        }

        match child.status {
            InstanceStatus::Completed => {
                let terminal = child.terminal_status.clone().unwrap_or_else(|| "completed".into());
                if self.required_status == "any" || terminal == self.required_status {
                    let mut data = Map::new();
                    data.insert("child_instance_id".into(), json!(child_id));
                    data.insert("child_status".into(), json!(terminal));
                    for (key, value) in child.context.exportable() {
                        data.entry(key).or_insert(value);
                    }
                    TaskResult::proceed(data)
                } else {
                    TaskResult::failed(format!(
                        "child workflow completed with status {terminal}, expected {}",
                        self.required_status
                    ))
                }
            }
            InstanceStatus::Failed | InstanceStatus::Cancelled => TaskResult::failed(format!(
                "child workflow {}: {}",
                match child.status {
                    InstanceStatus::Failed => "failed",
                    _ => "cancelled",
                },
                child.terminal_message.as_deref().unwrap_or("no detail")
            )),
            _ => {
                let mut data = Map::new();
                data.insert("child_instance_id".into(), json!(child_id));
                data.insert("child_status".into(), json!(child.status));
                data.insert("assignment_status".into(), json!(child.assignment_status()));
                TaskResult::waiting("child_workflow", data)
            }
        }
    }
}

#[async_trait]
impl Operator for WorkflowStartOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::WorkflowStart
    }

    async fn execute(&self, ctx: &ExecutionContext) -> TaskResult {
        let state_key = child_state_key(&ctx.task_id);
        match ctx.context.get(&state_key) {
            Some(Value::Object(state)) => {
                let state = state.clone();
                self.check_child(ctx, &state).await
            }
            _ => self.start_child(ctx).await,
        }
    }
}

//! # Operator Runtime
//!
//! Every task in a template is bound to an operator: a closed set of
//! behavioral kinds sharing one uniform contract,
//! `execute(ctx) -> TaskResult`.
//!
//! | Kind             | Behavior                                             |
//! |------------------|------------------------------------------------------|
//! | `Action`         | pure function of (inputs, context)                   |
//! | `Conditional`    | first matching predicate selects the outgoing edge   |
//! | `UserInput`      | suspends with a form schema, resumes on submission   |
//! | `AdminInput`     | as UserInput, for back-office staff                  |
//! | `Approval`       | suspends on a typed decision                         |
//! | `Integration`    | outbound call through an external-service adapter    |
//! | `Terminal`       | records the instance's terminal status               |
//! | `WorkflowStart`  | spawns a child instance, optionally waits for it     |
//! | `EntityValidation` | creates and validates entities, aggregates status  |
//!
//! Operators are pure with respect to the context snapshot they receive:
//! everything they want persisted flows back through the returned
//! [`TaskResult`]. Resumable kinds park their pending state in
//! underscore-prefixed context keys via [`TaskResult::context_patch`].

mod action;
mod approval;
mod conditional;
mod entity;
mod input;
mod integration;
mod terminal;
mod workflow_start;

pub use action::{ActionFn, ActionOperator};
pub use approval::{ApprovalDecision, ApprovalOperator};
pub use conditional::{Branch, ConditionalOperator, SELECTED_TASK_KEY};
pub use entity::{EntityMapping, EntityValidationOperator, OverallStatus};
pub use input::{AdminInputOperator, UserInputOperator};
pub use integration::IntegrationOperator;
pub use terminal::{TerminalOperator, TERMINAL_STATUS_KEY};
pub use workflow_start::WorkflowStartOperator;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::assignment::AssignmentService;
use crate::context::Context;
use crate::events::EventBus;
use crate::form::FormConfig;
use crate::registry::DagRegistry;
use crate::store::InstanceStore;

/// The closed set of operator kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    Action,
    Conditional,
    UserInput,
    AdminInput,
    Approval,
    Integration,
    Terminal,
    WorkflowStart,
    EntityValidation,
}

/// Outcome status of a single task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Task done; output merges into the context
    Completed,
    /// Done, and downstream readiness should be re-evaluated in the same
    /// tick without parking the instance in an intermediate paused state
    Continue,
    /// Task suspends; the instance yields until an external resume
    Waiting,
    /// Task failed; the instance fails unless a retry policy absorbs it
    Failed,
}

impl ResultStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, ResultStatus::Completed | ResultStatus::Continue)
    }
}

/// What an operator hands back to the executor
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub status: ResultStatus,
    /// Output data; merged into the instance context on completion
    pub data: Map<String, Value>,
    /// What a waiting task suspends on ("input", "approval", "child_workflow")
    pub waiting_for: Option<String>,
    /// Form schema embedded by input operators while waiting
    pub form_config: Option<FormConfig>,
    /// Failure message for `Failed` results
    pub error: Option<String>,
    /// Merged into the context on *every* status - the carrier for
    /// resumable operator state that must survive suspension
    pub context_patch: Map<String, Value>,
}

impl TaskResult {
    pub fn completed(data: Map<String, Value>) -> Self {
        Self {
            status: ResultStatus::Completed,
            data,
            waiting_for: None,
            form_config: None,
            error: None,
            context_patch: Map::new(),
        }
    }

    pub fn proceed(data: Map<String, Value>) -> Self {
        Self {
            status: ResultStatus::Continue,
            ..Self::completed(data)
        }
    }

    pub fn waiting(waiting_for: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            status: ResultStatus::Waiting,
            waiting_for: Some(waiting_for.into()),
            ..Self::completed(data)
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        let mut data = Map::new();
        data.insert("error".into(), Value::String(message.clone()));
        Self {
            status: ResultStatus::Failed,
            data,
            waiting_for: None,
            form_config: None,
            error: Some(message),
            context_patch: Map::new(),
        }
    }

    pub fn with_form(mut self, form: FormConfig) -> Self {
        self.form_config = Some(form);
        self
    }

    pub fn with_context_patch(mut self, patch: Map<String, Value>) -> Self {
        self.context_patch = patch;
        self
    }
}

/// Bounded retry with exponential backoff, owned by the operator and
/// executed by the executor. Retries never merge partial output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self { max_attempts, backoff }
    }

    /// Delay before the given (1-based) retry attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Collaborators an operator may legitimately reach. Assembled once by the
/// engine and threaded through explicitly - no global singletons.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<DagRegistry>,
    pub store: Arc<dyn InstanceStore>,
    pub bus: EventBus,
    pub assignment: Arc<AssignmentService>,
}

/// Per-execution view handed to an operator: identity of the running task
/// plus a snapshot of the instance context.
#[derive(Clone)]
pub struct ExecutionContext {
    pub instance_id: String,
    pub dag_id: String,
    pub user_id: String,
    pub task_id: String,
    pub context: Context,
    pub services: Services,
}

impl ExecutionContext {
    /// Resolve declared inputs from the context by name
    pub fn gather_inputs(&self, required: &[String], optional: &[String]) -> Result<Map<String, Value>, String> {
        let mut inputs = Map::new();
        for name in required {
            match self.context.get(name) {
                Some(value) => {
                    inputs.insert(name.clone(), value.clone());
                }
                None => return Err(format!("missing required input: {name}")),
            }
        }
        for name in optional {
            if let Some(value) = self.context.get(name) {
                inputs.insert(name.clone(), value.clone());
            }
        }
        Ok(inputs)
    }
}

/// Uniform task behavior. Common capabilities (`form_config`,
/// `retry_policy`) live on the trait with `None` defaults instead of being
/// probed dynamically.
#[async_trait]
pub trait Operator: Send + Sync {
    fn kind(&self) -> OperatorKind;

    async fn execute(&self, ctx: &ExecutionContext) -> TaskResult;

    /// Form schema for input-gathering kinds
    fn form_config(&self) -> Option<&FormConfig> {
        None
    }

    /// Retry policy honored by the executor on `Failed` results
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

/// Shared handle to an operator inside a template
pub type OperatorRef = Arc<dyn Operator>;

/// Convenience: wrap an operator for registration
pub fn op<O: Operator + 'static>(operator: O) -> OperatorRef {
    Arc::new(operator)
}

impl std::fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperatorKind::Action => "action",
            OperatorKind::Conditional => "conditional",
            OperatorKind::UserInput => "user_input",
            OperatorKind::AdminInput => "admin_input",
            OperatorKind::Approval => "approval",
            OperatorKind::Integration => "integration",
            OperatorKind::Terminal => "terminal",
            OperatorKind::WorkflowStart => "workflow_start",
            OperatorKind::EntityValidation => "entity_validation",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_per_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn failed_result_carries_message_in_data() {
        let result = TaskResult::failed("boom");
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(result.data["error"], "boom");
    }

    #[test]
    fn continue_counts_as_done() {
        assert!(ResultStatus::Continue.is_done());
        assert!(ResultStatus::Completed.is_done());
        assert!(!ResultStatus::Waiting.is_done());
        assert!(!ResultStatus::Failed.is_done());
    }
}

//! Human-input operators
//!
//! Both kinds suspend with an embedded form schema and resume when a
//! matching payload arrives through `submit_input`. The submitted payload
//! is parked under a reserved context key; on re-entry the operator lifts
//! it into its output so the form data lands in the instance context.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{ExecutionContext, Operator, OperatorKind, TaskResult};
use crate::context::pending_input_key;
use crate::form::FormConfig;

fn execute_input(form: &FormConfig, waiting_for: &str, ctx: &ExecutionContext) -> TaskResult {
    let key = pending_input_key(&ctx.task_id);

    if let Some(Value::Object(payload)) = ctx.context.get(&key) {
        return TaskResult::completed(payload.clone());
    }

    let mut data = Map::new();
    if let Ok(schema) = serde_json::to_value(form) {
        data.insert("form_config".into(), schema);
    }
    TaskResult::waiting(waiting_for, data).with_form(form.clone())
}

/// Citizen-facing input task
pub struct UserInputOperator {
    form: FormConfig,
}

impl UserInputOperator {
    pub fn new(form: FormConfig) -> Self {
        Self { form }
    }
}

#[async_trait]
impl Operator for UserInputOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::UserInput
    }

    fn form_config(&self) -> Option<&FormConfig> {
        Some(&self.form)
    }

    async fn execute(&self, ctx: &ExecutionContext) -> TaskResult {
        execute_input(&self.form, "input", ctx)
    }
}

/// Back-office input task; identical contract, distinct kind so templates
/// and filters can tell the audiences apart
pub struct AdminInputOperator {
    form: FormConfig,
    /// Role expected of the submitting administrator
    pub required_role: Option<String>,
}

impl AdminInputOperator {
    pub fn new(form: FormConfig) -> Self {
        Self {
            form,
            required_role: None,
        }
    }

    pub fn required_role(mut self, role: impl Into<String>) -> Self {
        self.required_role = Some(role.into());
        self
    }
}

#[async_trait]
impl Operator for AdminInputOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::AdminInput
    }

    fn form_config(&self) -> Option<&FormConfig> {
        Some(&self.form)
    }

    async fn execute(&self, ctx: &ExecutionContext) -> TaskResult {
        execute_input(&self.form, "input", ctx)
    }
}

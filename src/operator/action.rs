//! Action operator - a pure function of (inputs, context)
//!
//! Inputs are resolved by declared `required_inputs` / `optional_inputs`;
//! a missing required input fails the task before the function runs.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{ExecutionContext, Operator, OperatorKind, RetryPolicy, TaskResult};
use crate::context::Context;

/// The task body: `(inputs, context) -> outputs`
pub type ActionFn =
    Arc<dyn Fn(&Map<String, Value>, &Context) -> Result<Map<String, Value>, String> + Send + Sync>;

pub struct ActionOperator {
    action: ActionFn,
    required_inputs: Vec<String>,
    optional_inputs: Vec<String>,
    retry: Option<RetryPolicy>,
}

impl ActionOperator {
    pub fn new<F>(action: F) -> Self
    where
        F: Fn(&Map<String, Value>, &Context) -> Result<Map<String, Value>, String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            action: Arc::new(action),
            required_inputs: Vec::new(),
            optional_inputs: Vec::new(),
            retry: None,
        }
    }

    pub fn required_inputs(mut self, inputs: Vec<String>) -> Self {
        self.required_inputs = inputs;
        self
    }

    pub fn optional_inputs(mut self, inputs: Vec<String>) -> Self {
        self.optional_inputs = inputs;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[async_trait]
impl Operator for ActionOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Action
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry
    }

    async fn execute(&self, ctx: &ExecutionContext) -> TaskResult {
        let inputs = match ctx.gather_inputs(&self.required_inputs, &self.optional_inputs) {
            Ok(inputs) => inputs,
            Err(message) => return TaskResult::failed(message),
        };

        match (self.action)(&inputs, &ctx.context) {
            Ok(outputs) => TaskResult::completed(outputs),
            Err(message) => TaskResult::failed(message),
        }
    }
}

//! Conditional operator - routes execution down exactly one outgoing edge
//!
//! Predicates are evaluated in declaration order; the first match selects
//! the branch. With no match and no default branch the task fails. The
//! executor only considers the selected target ready; sibling branches
//! stay pending forever.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{ExecutionContext, Operator, OperatorKind, TaskResult};
use crate::context::Context;

/// Context key in a conditional's output naming the chosen branch target
pub const SELECTED_TASK_KEY: &str = "selected_task";

pub type Predicate = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// One guarded branch: predicate -> downstream task
pub struct Branch {
    pub name: String,
    pub predicate: Predicate,
    pub target: String,
}

pub struct ConditionalOperator {
    branches: Vec<Branch>,
    default_target: Option<String>,
}

impl ConditionalOperator {
    pub fn new() -> Self {
        Self {
            branches: Vec::new(),
            default_target: None,
        }
    }

    /// Add a branch; evaluation order is declaration order
    pub fn when<F>(mut self, name: impl Into<String>, predicate: F, target: impl Into<String>) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.branches.push(Branch {
            name: name.into(),
            predicate: Arc::new(predicate),
            target: target.into(),
        });
        self
    }

    /// Branch taken when nothing matches
    pub fn otherwise(mut self, target: impl Into<String>) -> Self {
        self.default_target = Some(target.into());
        self
    }
}

impl Default for ConditionalOperator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operator for ConditionalOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Conditional
    }

    async fn execute(&self, ctx: &ExecutionContext) -> TaskResult {
        for branch in &self.branches {
            if (branch.predicate)(&ctx.context) {
                let mut data = Map::new();
                data.insert(SELECTED_TASK_KEY.into(), Value::String(branch.target.clone()));
                data.insert("condition".into(), Value::String(branch.name.clone()));
                return TaskResult::proceed(data);
            }
        }

        match &self.default_target {
            Some(target) => {
                let mut data = Map::new();
                data.insert(SELECTED_TASK_KEY.into(), Value::String(target.clone()));
                data.insert("condition".into(), Value::String("default".into()));
                TaskResult::proceed(data)
            }
            None => TaskResult::failed("no condition matched and no default branch is declared"),
        }
    }
}

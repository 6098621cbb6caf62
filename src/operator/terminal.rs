//! Terminal operator - marks the end of a workflow path
//!
//! Returns Completed with the configured terminal status; the executor
//! recognizes the kind and completes the whole instance.

use async_trait::async_trait;
use serde_json::{json, Map};

use super::{ExecutionContext, Operator, OperatorKind, TaskResult};

/// Context/output key carrying the terminal status
pub const TERMINAL_STATUS_KEY: &str = "terminal_status";

pub struct TerminalOperator {
    pub terminal_status: String,
    pub message: Option<String>,
}

impl TerminalOperator {
    pub fn new(terminal_status: impl Into<String>) -> Self {
        Self {
            terminal_status: terminal_status.into(),
            message: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[async_trait]
impl Operator for TerminalOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Terminal
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> TaskResult {
        let mut data = Map::new();
        data.insert(TERMINAL_STATUS_KEY.into(), json!(self.terminal_status));
        if let Some(message) = &self.message {
            data.insert("terminal_message".into(), json!(message));
        }
        TaskResult::completed(data)
    }
}

//! Approval operator
//!
//! Suspends with `waiting_for = "approval"` and emits APPROVAL_REQUESTED on
//! first entry. Resumes on a typed decision supplied through
//! `submit_input`; the decision, decider and comments become the task's
//! output and APPROVAL_COMPLETED is appended.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use super::{ExecutionContext, Operator, OperatorKind, TaskResult};
use crate::context::pending_input_key;
use crate::events::EventType;

/// Typed approval decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    RequestChanges,
    Escalate,
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "APPROVED" => Ok(ApprovalDecision::Approved),
            "REJECTED" => Ok(ApprovalDecision::Rejected),
            "REQUEST_CHANGES" => Ok(ApprovalDecision::RequestChanges),
            "ESCALATE" => Ok(ApprovalDecision::Escalate),
            other => Err(format!(
                "unknown decision '{other}' (expected APPROVED, REJECTED, REQUEST_CHANGES or ESCALATE)"
            )),
        }
    }
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Approved => "APPROVED",
            ApprovalDecision::Rejected => "REJECTED",
            ApprovalDecision::RequestChanges => "REQUEST_CHANGES",
            ApprovalDecision::Escalate => "ESCALATE",
        }
    }
}

pub struct ApprovalOperator {
    /// Roles allowed to decide (advisory; identity checks live upstream)
    pub approver_roles: Vec<String>,
}

impl ApprovalOperator {
    pub fn new() -> Self {
        Self {
            approver_roles: Vec::new(),
        }
    }

    pub fn approver_roles(mut self, roles: Vec<String>) -> Self {
        self.approver_roles = roles;
        self
    }
}

impl Default for ApprovalOperator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operator for ApprovalOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Approval
    }

    async fn execute(&self, ctx: &ExecutionContext) -> TaskResult {
        let key = pending_input_key(&ctx.task_id);

        if let Some(Value::Object(payload)) = ctx.context.get(&key) {
            let decision_text = payload
                .get("decision")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let decision = match ApprovalDecision::from_str(decision_text) {
                Ok(decision) => decision,
                Err(message) => return TaskResult::failed(message),
            };

            let decided_by = payload
                .get("decided_by")
                .and_then(Value::as_str)
                .unwrap_or("system")
                .to_string();
            let comments = payload.get("comments").cloned().unwrap_or(Value::Null);
            let decided_at = Utc::now();

            let published = ctx
                .services
                .bus
                .publish(
                    EventType::ApprovalCompleted,
                    &ctx.dag_id,
                    Some(&ctx.instance_id),
                    Some(&ctx.user_id),
                    json!({
                        "approval_step": ctx.task_id,
                        "approver_id": decided_by,
                        "decision": decision.as_str(),
                        "comments": comments,
                    }),
                )
                .await;
            if let Err(error) = published {
                warn!(%error, task_id = %ctx.task_id, "failed to publish approval completion");
            }

            let mut data = Map::new();
            data.insert("decision".into(), json!(decision.as_str()));
            data.insert("decided_by".into(), json!(decided_by));
            data.insert("comments".into(), comments);
            data.insert("decided_at".into(), json!(decided_at.to_rfc3339()));
            return TaskResult::completed(data);
        }

        let published = ctx
            .services
            .bus
            .publish(
                EventType::ApprovalRequested,
                &ctx.dag_id,
                Some(&ctx.instance_id),
                Some(&ctx.user_id),
                json!({
                    "approval_step": ctx.task_id,
                    "approver_roles": self.approver_roles,
                }),
            )
            .await;
        if let Err(error) = published {
            warn!(%error, task_id = %ctx.task_id, "failed to publish approval request");
        }

        let mut data = Map::new();
        data.insert("approver_roles".into(), json!(self.approver_roles));
        TaskResult::waiting("approval", data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::ResultStatus;
    use crate::test_support::execution_context;

    #[tokio::test]
    async fn first_entry_waits_and_requests_approval() {
        let op = ApprovalOperator::new().approver_roles(vec!["reviewer".into()]);
        let ctx = execution_context().await;

        let result = op.execute(&ctx).await;
        assert_eq!(result.status, ResultStatus::Waiting);
        assert_eq!(result.waiting_for.as_deref(), Some("approval"));

        let events = ctx.services.bus.events_for(&ctx.dag_id).await;
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::ApprovalRequested));
    }

    #[tokio::test]
    async fn resume_outputs_decision_and_completes() {
        let op = ApprovalOperator::new();
        let mut ctx = execution_context().await;
        ctx.context.set(
            pending_input_key(&ctx.task_id),
            json!({"decision": "REJECTED", "comments": "missing doc", "decided_by": "admin-7"}),
        );

        let result = op.execute(&ctx).await;
        assert_eq!(result.status, ResultStatus::Completed);
        assert_eq!(result.data["decision"], "REJECTED");
        assert_eq!(result.data["decided_by"], "admin-7");
        assert_eq!(result.data["comments"], "missing doc");
        assert!(result.data.contains_key("decided_at"));

        let events = ctx.services.bus.events_for(&ctx.dag_id).await;
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::ApprovalCompleted));
    }

    #[tokio::test]
    async fn malformed_decision_fails() {
        let op = ApprovalOperator::new();
        let mut ctx = execution_context().await;
        ctx.context
            .set(pending_input_key(&ctx.task_id), json!({"decision": "MAYBE"}));

        let result = op.execute(&ctx).await;
        assert_eq!(result.status, ResultStatus::Failed);
    }
}

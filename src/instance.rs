//! Workflow instance state
//!
//! An [`Instance`] is one execution of a template on behalf of a user:
//! isolated context, per-task states, timestamps, optional parent linkage
//! and the assignment sub-record driving the admin review pipeline.
//!
//! Task state machine (per task): `pending -> executing -> {completed |
//! waiting | failed}`. A waiting task re-enters executing on resume;
//! completed and failed are absorbing.
//!
//! Review transitions are guarded: each method returns `false` without
//! mutating anything when called from an illegal state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::Context;

/// Behavioral classification of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    /// User-guided processes with approvals
    Process,
    /// Event-driven administrative tasks
    Admin,
    /// Automated document analysis pipelines
    DocumentProcessing,
    /// External system synchronization
    Integration,
    /// System monitoring and alerting
    Monitoring,
    /// Data validation and verification
    Validation,
}

/// Instance execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    WaitingForInput,
    Paused,
    WaitingForAssignment,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Terminal statuses are absorbing for the whole instance
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    /// Statuses from which `resume` may re-admit the instance
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            InstanceStatus::WaitingForInput
                | InstanceStatus::Paused
                | InstanceStatus::WaitingForAssignment
        )
    }
}

/// Per-task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Executing,
    Completed,
    Waiting,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// State of a single task within an instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskState {
    #[serde(default = "TaskState::default_status")]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub output_data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// What the task suspends on: "input", "approval", "child_workflow"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_for: Option<String>,
    /// Retry attempts consumed so far
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempts: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl TaskState {
    fn default_status() -> TaskStatus {
        TaskStatus::Pending
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

/// Assignment review stage (admin instances)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    #[default]
    PendingReview,
    UnderReview,
    ApprovedByReviewer,
    Rejected,
    ModificationRequested,
    PendingSignature,
    Completed,
    Escalated,
    OnHold,
}

/// How a binding came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    Manual,
    #[default]
    Automatic,
    Escalated,
    Reassigned,
}

/// One historical binding, appended whenever an assignment is replaced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: AssignmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_by: Option<String>,
    pub ended_at: DateTime<Utc>,
    pub reason: String,
}

/// Assignment sub-record embedded in an instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default = "Assignment::default_status")]
    pub status: AssignmentStatus,
    #[serde(default = "Assignment::default_type")]
    pub assignment_type: AssignmentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<AssignmentRecord>,

    // Review stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_comments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modification_requests: Vec<Value>,

    // Signature stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_comments: Option<String>,
}

impl Assignment {
    fn default_status() -> AssignmentStatus {
        AssignmentStatus::PendingReview
    }

    fn default_type() -> AssignmentType {
        AssignmentType::Automatic
    }

    fn archive(&mut self, reason: &str) {
        if self.team_id.is_some() || self.user_id.is_some() {
            self.history.push(AssignmentRecord {
                team_id: self.team_id.clone(),
                user_id: self.user_id.clone(),
                status: self.status,
                assigned_at: self.assigned_at,
                assigned_by: self.assigned_by.clone(),
                ended_at: Utc::now(),
                reason: reason.to_string(),
            });
        }
    }
}

/// One execution of a template for a specific user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub dag_id: String,
    pub dag_version: String,
    pub user_id: String,
    pub workflow_type: WorkflowType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,

    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_message: Option<String>,

    pub context: Context,
    pub task_states: BTreeMap<String, TaskState>,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub failed_tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<Assignment>,

    /// Execution priority (1-10, higher first)
    #[serde(default = "Instance::default_priority")]
    pub priority: u8,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Monotonic revision for optimistic concurrency (bumped by the store)
    #[serde(default)]
    pub revision: u64,
}

impl Instance {
    fn default_priority() -> u8 {
        5
    }

    /// Seed a fresh instance with every task pending
    pub fn new(
        dag_id: impl Into<String>,
        dag_version: impl Into<String>,
        workflow_type: WorkflowType,
        user_id: impl Into<String>,
        task_ids: impl IntoIterator<Item = String>,
        initial_data: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: Uuid::new_v4().to_string(),
            dag_id: dag_id.into(),
            dag_version: dag_version.into(),
            user_id: user_id.into(),
            workflow_type,
            parent_instance_id: None,
            parent_task_id: None,
            status: InstanceStatus::Pending,
            terminal_status: None,
            terminal_message: None,
            context: Context::from_map(initial_data),
            task_states: task_ids
                .into_iter()
                .map(|id| (id, TaskState::default()))
                .collect(),
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            current_task: None,
            assignment: None,
            priority: Self::default_priority(),
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            revision: 0,
        }
    }

    pub fn task_state(&self, task_id: &str) -> Option<&TaskState> {
        self.task_states.get(task_id)
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.task_states.get(task_id).map(|s| s.status)
    }

    /// Single mutation point keeping `completed_tasks` / `failed_tasks`
    /// consistent with `task_states`.
    pub fn update_task_status(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        output: Option<Map<String, Value>>,
        error: Option<String>,
    ) {
        let Some(state) = self.task_states.get_mut(task_id) else {
            return;
        };
        let now = Utc::now();
        state.status = status;
        state.error = error;
        self.updated_at = now;

        match status {
            TaskStatus::Executing => {
                state.started_at = Some(now);
                state.waiting_for = None;
                self.current_task = Some(task_id.to_string());
            }
            TaskStatus::Completed => {
                state.completed_at = Some(now);
                state.waiting_for = None;
                if let Some(data) = output {
                    self.context.merge(&data);
                    state.output_data = data;
                }
                if !self.completed_tasks.iter().any(|t| t == task_id) {
                    self.completed_tasks.push(task_id.to_string());
                }
            }
            TaskStatus::Waiting => {
                if let Some(data) = output {
                    state.output_data = data;
                }
                self.current_task = Some(task_id.to_string());
            }
            TaskStatus::Failed => {
                state.completed_at = Some(now);
                if !self.failed_tasks.iter().any(|t| t == task_id) {
                    self.failed_tasks.push(task_id.to_string());
                }
            }
            TaskStatus::Pending => {}
        }
    }

    /// Record what a waiting task suspends on
    pub fn set_waiting_for(&mut self, task_id: &str, waiting_for: impl Into<String>) {
        if let Some(state) = self.task_states.get_mut(task_id) {
            state.waiting_for = Some(waiting_for.into());
        }
    }

    pub fn is_task_waiting(&self, task_id: &str) -> bool {
        self.task_status(task_id) == Some(TaskStatus::Waiting)
    }

    pub fn has_waiting_tasks(&self) -> bool {
        self.task_states.values().any(|s| s.status == TaskStatus::Waiting)
    }

    pub fn all_tasks_completed(&self) -> bool {
        self.completed_tasks.len() == self.task_states.len()
    }

    /// Completion percentage over all tasks
    pub fn progress_percentage(&self) -> f64 {
        if self.task_states.is_empty() {
            return 0.0;
        }
        (self.completed_tasks.len() as f64 / self.task_states.len() as f64) * 100.0
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    // ------------------------------------------------------------------
    // Assignment bindings
    // ------------------------------------------------------------------

    fn assignment_mut(&mut self) -> &mut Assignment {
        self.assignment.get_or_insert_with(Assignment::default)
    }

    /// Bind to a team (clears any user binding)
    pub fn assign_to_team(
        &mut self,
        team_id: impl Into<String>,
        assigned_by: impl Into<String>,
        assignment_type: AssignmentType,
        notes: Option<String>,
    ) {
        let now = Utc::now();
        let assignment = self.assignment_mut();
        assignment.archive("reassigned");
        assignment.team_id = Some(team_id.into());
        assignment.user_id = None;
        assignment.status = AssignmentStatus::PendingReview;
        assignment.assignment_type = assignment_type;
        assignment.assigned_at = Some(now);
        assignment.assigned_by = Some(assigned_by.into());
        assignment.notes = notes;
        self.updated_at = now;
    }

    /// Bind to a specific user (keeps the team binding if one exists)
    pub fn assign_to_user(
        &mut self,
        user_id: impl Into<String>,
        assigned_by: impl Into<String>,
        assignment_type: AssignmentType,
        notes: Option<String>,
    ) {
        let now = Utc::now();
        let assignment = self.assignment_mut();
        if assignment.user_id.is_some() {
            assignment.archive("reassigned");
        }
        assignment.user_id = Some(user_id.into());
        assignment.status = AssignmentStatus::PendingReview;
        assignment.assignment_type = assignment_type;
        assignment.assigned_at = Some(now);
        assignment.assigned_by = Some(assigned_by.into());
        assignment.notes = notes;
        self.updated_at = now;
    }

    /// Remove the current binding; the instance needs reassignment
    pub fn unassign(&mut self, reason: &str) {
        if let Some(assignment) = self.assignment.as_mut() {
            assignment.archive(reason);
            assignment.team_id = None;
            assignment.user_id = None;
            assignment.status = AssignmentStatus::PendingReview;
            assignment.notes = Some("unassigned - needs reassignment".into());
            self.updated_at = Utc::now();
        }
    }

    pub fn assignment_status(&self) -> Option<AssignmentStatus> {
        self.assignment.as_ref().map(|a| a.status)
    }

    pub fn can_be_assigned(&self) -> bool {
        let stage_ok = match self.assignment_status() {
            None => true,
            Some(AssignmentStatus::PendingReview) | Some(AssignmentStatus::Escalated) => true,
            Some(_) => false,
        };
        stage_ok && !self.status.is_terminal()
    }

    // ------------------------------------------------------------------
    // Review state machine - each transition is guarded; illegal calls
    // return false and mutate nothing.
    // ------------------------------------------------------------------

    /// PENDING_REVIEW -> UNDER_REVIEW
    pub fn start_review(&mut self, reviewer_id: impl Into<String>) -> bool {
        let Some(assignment) = self.assignment.as_mut() else {
            return false;
        };
        if assignment.status != AssignmentStatus::PendingReview {
            return false;
        }
        assignment.status = AssignmentStatus::UnderReview;
        assignment.reviewed_by = Some(reviewer_id.into());
        self.updated_at = Utc::now();
        true
    }

    /// UNDER_REVIEW -> APPROVED_BY_REVIEWER (same reviewer only)
    pub fn approve_by_reviewer(&mut self, reviewer_id: &str, comments: Option<String>) -> bool {
        let Some(assignment) = self.assignment.as_mut() else {
            return false;
        };
        if assignment.status != AssignmentStatus::UnderReview
            || assignment.reviewed_by.as_deref() != Some(reviewer_id)
        {
            return false;
        }
        let now = Utc::now();
        assignment.status = AssignmentStatus::ApprovedByReviewer;
        assignment.review_comments = comments;
        assignment.reviewed_at = Some(now);
        self.updated_at = now;
        true
    }

    /// UNDER_REVIEW -> REJECTED (same reviewer only)
    pub fn reject_by_reviewer(
        &mut self,
        reviewer_id: &str,
        reason: impl Into<String>,
        comments: Option<String>,
    ) -> bool {
        let Some(assignment) = self.assignment.as_mut() else {
            return false;
        };
        if assignment.status != AssignmentStatus::UnderReview
            || assignment.reviewed_by.as_deref() != Some(reviewer_id)
        {
            return false;
        }
        let now = Utc::now();
        assignment.status = AssignmentStatus::Rejected;
        assignment.rejection_reason = Some(reason.into());
        assignment.review_comments = comments;
        assignment.reviewed_at = Some(now);
        self.updated_at = now;
        true
    }

    /// UNDER_REVIEW -> MODIFICATION_REQUESTED (same reviewer only)
    pub fn request_modifications(
        &mut self,
        reviewer_id: &str,
        modifications: Vec<Value>,
        comments: Option<String>,
    ) -> bool {
        let Some(assignment) = self.assignment.as_mut() else {
            return false;
        };
        if assignment.status != AssignmentStatus::UnderReview
            || assignment.reviewed_by.as_deref() != Some(reviewer_id)
        {
            return false;
        }
        let now = Utc::now();
        assignment.status = AssignmentStatus::ModificationRequested;
        assignment.modification_requests = modifications;
        assignment.review_comments = comments;
        assignment.reviewed_at = Some(now);
        self.updated_at = now;
        true
    }

    /// APPROVED_BY_REVIEWER -> COMPLETED (final signature)
    pub fn final_approval(&mut self, approver_id: impl Into<String>, comments: Option<String>) -> bool {
        let Some(assignment) = self.assignment.as_mut() else {
            return false;
        };
        if assignment.status != AssignmentStatus::ApprovedByReviewer {
            return false;
        }
        let now = Utc::now();
        assignment.status = AssignmentStatus::Completed;
        assignment.approved_by = Some(approver_id.into());
        assignment.approved_at = Some(now);
        assignment.approval_comments = comments;
        self.updated_at = now;
        true
    }

    /// any -> ESCALATED
    pub fn escalate(&mut self, reason: impl Into<String>, escalated_by: impl Into<String>) -> bool {
        let Some(assignment) = self.assignment.as_mut() else {
            return false;
        };
        let reason = reason.into();
        assignment.archive(&format!("escalated: {reason}"));
        assignment.status = AssignmentStatus::Escalated;
        assignment.notes = Some(format!("escalated by {}: {reason}", escalated_by.into()));
        self.updated_at = Utc::now();
        true
    }
}

//! Instance store - abstract persistence for the engine
//!
//! The storage driver is an external collaborator; [`InstanceStore`] is the
//! contract the core requires of it. [`MemoryStore`] is the in-process
//! reference implementation backing tests and single-node deployments.
//!
//! Optimistic concurrency: `save_instance` succeeds only when the caller's
//! `revision` matches the stored one, then bumps it. The executor retries
//! a whole tick on conflict; the loser's in-memory changes are discarded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::events::{Event, EventType};
use crate::hooks::Hook;
use crate::instance::{AssignmentStatus, Instance, InstanceStatus, WorkflowType};
use crate::template::TemplateRecord;

/// Query over persisted instances; `None` fields match everything
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub dag_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<InstanceStatus>,
    pub workflow_type: Option<WorkflowType>,
    pub assigned_team_id: Option<String>,
    pub assigned_user_id: Option<String>,
    pub assignment_status: Option<AssignmentStatus>,
    pub parent_instance_id: Option<String>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &Instance) -> bool {
        let assignment = instance.assignment.as_ref();
        self.dag_id.as_deref().is_none_or(|v| instance.dag_id == v)
            && self.user_id.as_deref().is_none_or(|v| instance.user_id == v)
            && self.status.is_none_or(|v| instance.status == v)
            && self.workflow_type.is_none_or(|v| instance.workflow_type == v)
            && self
                .assigned_team_id
                .as_deref()
                .is_none_or(|v| assignment.and_then(|a| a.team_id.as_deref()) == Some(v))
            && self
                .assigned_user_id
                .as_deref()
                .is_none_or(|v| assignment.and_then(|a| a.user_id.as_deref()) == Some(v))
            && self
                .assignment_status
                .is_none_or(|v| assignment.map(|a| a.status) == Some(v))
            && self
                .parent_instance_id
                .as_deref()
                .is_none_or(|v| instance.parent_instance_id.as_deref() == Some(v))
    }
}

/// Query over persisted events
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub workflow_id: Option<String>,
    pub instance_id: Option<String>,
    pub event_type: Option<EventType>,
    pub user_id: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        self.workflow_id.as_deref().is_none_or(|v| event.workflow_id == v)
            && self
                .instance_id
                .as_deref()
                .is_none_or(|v| event.instance_id.as_deref() == Some(v))
            && self.event_type.is_none_or(|v| event.event_type == v)
            && self
                .user_id
                .as_deref()
                .is_none_or(|v| event.user_id.as_deref() == Some(v))
    }
}

/// Query over registered hooks
#[derive(Debug, Clone, Default)]
pub struct HookFilter {
    pub listener_workflow_id: Option<String>,
    pub enabled_only: bool,
}

impl HookFilter {
    pub fn enabled() -> Self {
        Self {
            listener_workflow_id: None,
            enabled_only: true,
        }
    }

    pub fn matches(&self, hook: &Hook) -> bool {
        self.listener_workflow_id
            .as_deref()
            .is_none_or(|v| hook.listener_workflow_id == v)
            && (!self.enabled_only || hook.enabled)
    }
}

/// Append-only per-instance execution log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub log_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogEntry {
    pub fn info(
        instance_id: impl Into<String>,
        log_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            timestamp: Utc::now(),
            level: LogLevel::Info,
            log_type: log_type.into(),
            task_id: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn error(
        instance_id: impl Into<String>,
        log_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level: LogLevel::Error,
            ..Self::info(instance_id, log_type, message)
        }
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Abstract persistence the core requires of its storage driver
#[async_trait]
pub trait InstanceStore: Send + Sync {
    // Templates (metadata records; compiled templates live in the registry)
    async fn upsert_template(&self, record: TemplateRecord) -> Result<(), EngineError>;
    async fn load_template(&self, dag_id: &str) -> Result<Option<TemplateRecord>, EngineError>;
    async fn list_templates(&self) -> Result<Vec<TemplateRecord>, EngineError>;

    // Instances
    async fn create_instance(&self, instance: &Instance) -> Result<(), EngineError>;
    async fn load_instance(&self, instance_id: &str) -> Result<Option<Instance>, EngineError>;
    /// Revision-checked write; bumps `instance.revision` on success
    async fn save_instance(&self, instance: &mut Instance) -> Result<(), EngineError>;
    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, EngineError>;

    // Events
    async fn append_event(&self, event: &Event) -> Result<(), EngineError>;
    async fn update_event(&self, event: &Event) -> Result<(), EngineError>;
    async fn query_events(&self, filter: &EventFilter) -> Result<Vec<Event>, EngineError>;

    // Hooks
    async fn upsert_hook(&self, hook: &Hook) -> Result<(), EngineError>;
    async fn delete_hook(&self, hook_id: &str) -> Result<bool, EngineError>;
    async fn list_hooks(&self, filter: &HookFilter) -> Result<Vec<Hook>, EngineError>;

    // Instance logs (append-only)
    async fn append_log(&self, entry: LogEntry) -> Result<(), EngineError>;
    async fn logs(&self, instance_id: &str) -> Result<Vec<LogEntry>, EngineError>;
}

/// DashMap-backed in-process store
#[derive(Default)]
pub struct MemoryStore {
    templates: DashMap<String, TemplateRecord>,
    instances: DashMap<String, Instance>,
    events: DashMap<String, Event>,
    event_order: parking_lot::Mutex<Vec<String>>,
    hooks: DashMap<String, Hook>,
    logs: DashMap<String, Vec<LogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn upsert_template(&self, record: TemplateRecord) -> Result<(), EngineError> {
        self.templates.insert(record.dag_id.clone(), record);
        Ok(())
    }

    async fn load_template(&self, dag_id: &str) -> Result<Option<TemplateRecord>, EngineError> {
        Ok(self.templates.get(dag_id).map(|r| r.clone()))
    }

    async fn list_templates(&self) -> Result<Vec<TemplateRecord>, EngineError> {
        Ok(self.templates.iter().map(|r| r.clone()).collect())
    }

    async fn create_instance(&self, instance: &Instance) -> Result<(), EngineError> {
        self.instances
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn load_instance(&self, instance_id: &str) -> Result<Option<Instance>, EngineError> {
        Ok(self.instances.get(instance_id).map(|i| i.clone()))
    }

    async fn save_instance(&self, instance: &mut Instance) -> Result<(), EngineError> {
        // Entry lock makes the compare-and-bump atomic
        let mut entry = self
            .instances
            .get_mut(&instance.instance_id)
            .ok_or_else(|| EngineError::UnknownInstance(instance.instance_id.clone()))?;

        if entry.revision != instance.revision {
            return Err(EngineError::RevisionConflict {
                instance_id: instance.instance_id.clone(),
                expected: instance.revision,
            });
        }

        instance.revision += 1;
        *entry = instance.clone();
        Ok(())
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, EngineError> {
        let mut matches: Vec<Instance> = self
            .instances
            .iter()
            .filter(|i| filter.matches(i))
            .map(|i| i.clone())
            .collect();
        matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(matches)
    }

    async fn append_event(&self, event: &Event) -> Result<(), EngineError> {
        self.events.insert(event.event_id.clone(), event.clone());
        self.event_order.lock().push(event.event_id.clone());
        Ok(())
    }

    async fn update_event(&self, event: &Event) -> Result<(), EngineError> {
        self.events.insert(event.event_id.clone(), event.clone());
        Ok(())
    }

    async fn query_events(&self, filter: &EventFilter) -> Result<Vec<Event>, EngineError> {
        let order = self.event_order.lock().clone();
        Ok(order
            .iter()
            .filter_map(|id| self.events.get(id).map(|e| e.clone()))
            .filter(|e| filter.matches(e))
            .collect())
    }

    async fn upsert_hook(&self, hook: &Hook) -> Result<(), EngineError> {
        self.hooks.insert(hook.hook_id.clone(), hook.clone());
        Ok(())
    }

    async fn delete_hook(&self, hook_id: &str) -> Result<bool, EngineError> {
        Ok(self.hooks.remove(hook_id).is_some())
    }

    async fn list_hooks(&self, filter: &HookFilter) -> Result<Vec<Hook>, EngineError> {
        let mut matches: Vec<Hook> = self
            .hooks
            .iter()
            .filter(|h| filter.matches(h))
            .map(|h| h.clone())
            .collect();
        matches.sort_by(|a, b| a.hook_id.cmp(&b.hook_id));
        Ok(matches)
    }

    async fn append_log(&self, entry: LogEntry) -> Result<(), EngineError> {
        self.logs
            .entry(entry.instance_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn logs(&self, instance_id: &str) -> Result<Vec<LogEntry>, EngineError> {
        Ok(self
            .logs
            .get(instance_id)
            .map(|l| l.clone())
            .unwrap_or_default())
    }
}

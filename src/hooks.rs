//! Hook engine - event-driven workflow triggering
//!
//! A [`Hook`] binds an event pattern to a listener workflow. Every event is
//! tried under two keys: the workflow-level `"<EVENT_TYPE>.<workflow_id>"`
//! and, when the event carries one, the instance-extended
//! `"<EVENT_TYPE>.<workflow_id>.<instance_id>"`. A pattern fires when it
//! matches either, as a glob (`*`, `?`) or, with a `regex:` prefix, as a
//! regular expression compiled once and cached.
//!
//! On a matching event the hook's trigger conditions are evaluated; if they
//! hold, a new instance of the listener workflow is created with a context
//! assembled from the event, assigned through the assignment service, and
//! recorded in the event's `triggered_instances`. Hooks fire in priority
//! order (higher first, ties on `hook_id`); one hook failing never stops
//! the rest.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::assignment::AssignmentService;
use crate::error::EngineError;
use crate::events::Event;
use crate::instance::{InstanceStatus, WorkflowType};
use crate::registry::DagRegistry;
use crate::service::EntityService;
use crate::store::{HookFilter, InstanceStore};

/// Hook trigger condition kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTriggerType {
    /// Trigger whenever the pattern matches
    Always,
    /// Every entry in `conditions` must hold against the event data
    Conditional,
    /// The event's user must own at least one entity of each required type
    EntityBased,
    /// Every `user_filters` entry must equal the event's user attributes
    UserBased,
}

/// Registered event-to-workflow trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub hook_id: String,
    pub listener_workflow_id: String,
    /// Glob over the event key, or `regex:<expr>`
    pub event_pattern: String,
    #[serde(default = "Hook::default_trigger_type")]
    pub trigger_type: HookTriggerType,
    /// Higher fires first
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "Hook::default_enabled")]
    pub enabled: bool,
    /// key -> expected scalar, or `{eq|gt|in: ...}` operator map
    #[serde(default)]
    pub conditions: Map<String, Value>,
    #[serde(default)]
    pub required_entities: Vec<String>,
    /// key -> expected value among `event_data.user_attributes`
    #[serde(default)]
    pub user_filters: Map<String, Value>,
    /// Copy the whole event data into the child context
    #[serde(default = "Hook::default_pass_event_context")]
    pub pass_event_context: bool,
    /// event key -> child context key projection
    #[serde(default)]
    pub context_mapping: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Hook {
    fn default_trigger_type() -> HookTriggerType {
        HookTriggerType::Always
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_pass_event_context() -> bool {
        true
    }

    pub fn new(
        hook_id: impl Into<String>,
        listener_workflow_id: impl Into<String>,
        event_pattern: impl Into<String>,
    ) -> Self {
        Self {
            hook_id: hook_id.into(),
            listener_workflow_id: listener_workflow_id.into(),
            event_pattern: event_pattern.into(),
            trigger_type: HookTriggerType::Always,
            priority: 0,
            enabled: true,
            conditions: Map::new(),
            required_entities: Vec::new(),
            user_filters: Map::new(),
            pass_event_context: true,
            context_mapping: Vec::new(),
            description: None,
            created_at: Utc::now(),
        }
    }

    /// Hook firing when `source_workflow_id` completes
    pub fn on_completed(
        hook_id: impl Into<String>,
        source_workflow_id: &str,
        listener_workflow_id: impl Into<String>,
    ) -> Self {
        Self::new(
            hook_id,
            listener_workflow_id,
            format!("COMPLETED.{source_workflow_id}"),
        )
    }

    /// Hook firing when `source_workflow_id` fails
    pub fn on_failed(
        hook_id: impl Into<String>,
        source_workflow_id: &str,
        listener_workflow_id: impl Into<String>,
    ) -> Self {
        Self::new(
            hook_id,
            listener_workflow_id,
            format!("FAILED.{source_workflow_id}"),
        )
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn conditional(mut self, conditions: Map<String, Value>) -> Self {
        self.trigger_type = HookTriggerType::Conditional;
        self.conditions = conditions;
        self
    }

    pub fn entity_based(mut self, required_entities: Vec<String>) -> Self {
        self.trigger_type = HookTriggerType::EntityBased;
        self.required_entities = required_entities;
        self
    }

    pub fn user_based(mut self, user_filters: Map<String, Value>) -> Self {
        self.trigger_type = HookTriggerType::UserBased;
        self.user_filters = user_filters;
        self
    }

    pub fn map_context(mut self, event_key: impl Into<String>, child_key: impl Into<String>) -> Self {
        self.context_mapping.push((event_key.into(), child_key.into()));
        self
    }

    pub fn without_event_context(mut self) -> Self {
        self.pass_event_context = false;
        self
    }
}

/// Matches events against registered hooks and starts listener workflows
pub struct HookEngine {
    store: Arc<dyn InstanceStore>,
    registry: Arc<DagRegistry>,
    assignment: Arc<AssignmentService>,
    entity_service: Option<Arc<dyn EntityService>>,
    /// `regex:` patterns compiled once
    regex_cache: DashMap<String, Regex>,
}

impl HookEngine {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        registry: Arc<DagRegistry>,
        assignment: Arc<AssignmentService>,
        entity_service: Option<Arc<dyn EntityService>>,
    ) -> Self {
        Self {
            store,
            registry,
            assignment,
            entity_service,
            regex_cache: DashMap::new(),
        }
    }

    /// Validate and persist a hook
    pub async fn register_hook(&self, hook: Hook) -> Result<(), EngineError> {
        let invalid = |reason: &str| EngineError::InvalidHook {
            hook_id: hook.hook_id.clone(),
            reason: reason.to_string(),
        };

        if hook.hook_id.is_empty() || hook.listener_workflow_id.is_empty() || hook.event_pattern.is_empty() {
            return Err(invalid("hook_id, listener_workflow_id and event_pattern are required"));
        }
        if let Some(expr) = hook.event_pattern.strip_prefix("regex:") {
            Regex::new(expr).map_err(|e| invalid(&format!("regex does not compile: {e}")))?;
        }
        if self.registry.get(&hook.listener_workflow_id).is_none() {
            return Err(invalid(&format!(
                "listener workflow '{}' is not registered",
                hook.listener_workflow_id
            )));
        }

        self.store.upsert_hook(&hook).await?;
        info!(hook_id = %hook.hook_id, listener = %hook.listener_workflow_id, "registered hook");
        Ok(())
    }

    pub async fn unregister_hook(&self, hook_id: &str) -> Result<(), EngineError> {
        if self.store.delete_hook(hook_id).await? {
            info!(hook_id, "unregistered hook");
            Ok(())
        } else {
            Err(EngineError::UnknownHook(hook_id.to_string()))
        }
    }

    pub async fn list_hooks(&self, filter: &HookFilter) -> Result<Vec<Hook>, EngineError> {
        self.store.list_hooks(filter).await
    }

    /// Process one event: fire every matching hook, return the started
    /// instance ids in firing order. A pattern may target the
    /// workflow-level key or the instance-extended one.
    pub async fn process_event(&self, event: &Event) -> Result<Vec<String>, EngineError> {
        let key = event.matching_key();
        let instance_key = event.instance_matching_key();
        let mut matching: Vec<Hook> = self
            .store
            .list_hooks(&HookFilter::enabled())
            .await?
            .into_iter()
            .filter(|hook| {
                self.pattern_matches(&hook.event_pattern, &key)
                    || instance_key
                        .as_deref()
                        .is_some_and(|extended| self.pattern_matches(&hook.event_pattern, extended))
            })
            .collect();

        // Higher priority first; ties broken by hook_id for determinism
        matching.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.hook_id.cmp(&b.hook_id)));
        debug!(count = matching.len(), key = %key, "hooks matched event");

        let mut triggered = Vec::new();
        for hook in matching {
            match self.evaluate_conditions(&hook, event).await {
                Ok(true) => match self.trigger_workflow(&hook, event).await {
                    Ok(instance_id) => {
                        info!(hook_id = %hook.hook_id, instance_id = %instance_id, "hook triggered workflow");
                        triggered.push(instance_id);
                    }
                    Err(error) => {
                        warn!(hook_id = %hook.hook_id, %error, "hook failed to trigger workflow");
                    }
                },
                Ok(false) => {
                    debug!(hook_id = %hook.hook_id, "hook conditions not met");
                }
                Err(error) => {
                    warn!(hook_id = %hook.hook_id, %error, "hook condition evaluation failed");
                }
            }
        }

        Ok(triggered)
    }

    fn pattern_matches(&self, pattern: &str, key: &str) -> bool {
        if let Some(expr) = pattern.strip_prefix("regex:") {
            if let Some(re) = self.regex_cache.get(pattern) {
                return re.is_match(key);
            }
            match Regex::new(expr) {
                Ok(re) => {
                    let matched = re.is_match(key);
                    self.regex_cache.insert(pattern.to_string(), re);
                    matched
                }
                Err(error) => {
                    warn!(pattern, %error, "invalid regex pattern");
                    false
                }
            }
        } else {
            Pattern::new(pattern)
                .map(|p| p.matches(key))
                .unwrap_or(false)
        }
    }

    async fn evaluate_conditions(&self, hook: &Hook, event: &Event) -> Result<bool, EngineError> {
        match hook.trigger_type {
            HookTriggerType::Always => Ok(true),
            HookTriggerType::Conditional => Ok(evaluate_condition_map(&hook.conditions, &event.event_data)),
            HookTriggerType::UserBased => {
                if hook.user_filters.is_empty() || event.user_id.is_none() {
                    return Ok(true);
                }
                let attributes = event
                    .event_data
                    .get("user_attributes")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                Ok(hook
                    .user_filters
                    .iter()
                    .all(|(key, expected)| attributes.get(key) == Some(expected)))
            }
            HookTriggerType::EntityBased => {
                let Some(user_id) = event.user_id.as_deref() else {
                    return Ok(true);
                };
                if hook.required_entities.is_empty() {
                    return Ok(true);
                }
                let Some(entity_service) = &self.entity_service else {
                    return Ok(false);
                };
                for entity_type in &hook.required_entities {
                    let owned = entity_service.entities_owned_by(user_id, entity_type).await?;
                    if owned.is_empty() {
                        debug!(%entity_type, user_id, "required entity type missing");
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Build the child context, create and assign the listener instance
    async fn trigger_workflow(&self, hook: &Hook, event: &Event) -> Result<String, EngineError> {
        let mut initial_context = Map::new();

        if hook.pass_event_context {
            for (key, value) in &event.event_data {
                initial_context.insert(key.clone(), value.clone());
            }
            initial_context.insert(
                "triggering_event".into(),
                json!({
                    "event_id": event.event_id,
                    "event_type": event.event_type,
                    "workflow_id": event.workflow_id,
                    "instance_id": event.instance_id,
                    "timestamp": event.timestamp.to_rfc3339(),
                }),
            );
        }

        for (event_key, child_key) in &hook.context_mapping {
            if let Some(value) = event.event_data.get(event_key) {
                initial_context.insert(child_key.clone(), value.clone());
            }
        }

        let user_id = event.user_id.as_deref().unwrap_or("system");
        let mut instance = self
            .registry
            .instantiate(&hook.listener_workflow_id, user_id, initial_context)?;

        if instance.workflow_type == WorkflowType::Admin {
            instance.status = InstanceStatus::WaitingForAssignment;
        }

        match self.assignment.bind(&mut instance, None).await {
            Ok(true) => {
                if instance.status == InstanceStatus::WaitingForAssignment {
                    instance.status = InstanceStatus::Pending;
                }
            }
            Ok(false) => {}
            Err(error) => {
                warn!(%error, instance_id = %instance.instance_id, "hook-created instance left unassigned");
            }
        }

        self.store.create_instance(&instance).await?;
        Ok(instance.instance_id)
    }

    /// Hook counts grouped by listener workflow
    pub async fn statistics(&self) -> Result<Map<String, Value>, EngineError> {
        let hooks = self.store.list_hooks(&HookFilter::default()).await?;
        let enabled = hooks.iter().filter(|h| h.enabled).count();

        let mut by_workflow: Map<String, Value> = Map::new();
        for hook in &hooks {
            let count = by_workflow
                .get(&hook.listener_workflow_id)
                .and_then(Value::as_u64)
                .unwrap_or(0);
            by_workflow.insert(hook.listener_workflow_id.clone(), json!(count + 1));
        }

        let mut stats = Map::new();
        stats.insert("total_hooks".into(), json!(hooks.len()));
        stats.insert("enabled_hooks".into(), json!(enabled));
        stats.insert("disabled_hooks".into(), json!(hooks.len() - enabled));
        stats.insert("hooks_by_workflow".into(), Value::Object(by_workflow));
        Ok(stats)
    }
}

/// Evaluate a condition map against event data. Scalars compare by
/// equality; object values support the `eq`, `gt` and `in` operators.
fn evaluate_condition_map(conditions: &Map<String, Value>, data: &Map<String, Value>) -> bool {
    conditions.iter().all(|(key, expected)| {
        let actual = data.get(key);
        match expected {
            Value::Object(ops) => {
                if let Some(eq) = ops.get("eq") {
                    return actual == Some(eq);
                }
                if let Some(gt) = ops.get("gt") {
                    return match (actual.and_then(Value::as_f64), gt.as_f64()) {
                        (Some(a), Some(b)) => a > b,
                        _ => false,
                    };
                }
                if let Some(Value::Array(options)) = ops.get("in") {
                    return actual.is_some_and(|a| options.contains(a));
                }
                false
            }
            scalar => actual == Some(scalar),
        }
    })
}

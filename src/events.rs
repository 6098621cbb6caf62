//! Lifecycle events and the event bus
//!
//! Every instance lifecycle transition produces a typed [`Event`]. The bus
//! persists the event first (the record is the source of truth), then fans
//! it out: matching hooks may start listener workflows, and in-process
//! subscribers (audit, metrics) are notified. A failing hook or subscriber
//! never aborts the remainder.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::hooks::HookEngine;
use crate::store::{EventFilter, InstanceStore};

/// Lifecycle event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    Completed,
    Failed,
    Paused,
    Resumed,
    EntityCreated,
    ApprovalRequested,
    ApprovalCompleted,
}

impl EventType {
    /// Fragment used in hook matching keys: `"<EVENT_TYPE>.<workflow_id>"`
    pub fn key_fragment(&self) -> &'static str {
        match self {
            EventType::Started => "STARTED",
            EventType::Completed => "COMPLETED",
            EventType::Failed => "FAILED",
            EventType::Paused => "PAUSED",
            EventType::Resumed => "RESUMED",
            EventType::EntityCreated => "ENTITY_CREATED",
            EventType::ApprovalRequested => "APPROVAL_REQUESTED",
            EventType::ApprovalCompleted => "APPROVAL_COMPLETED",
        }
    }
}

/// A persisted workflow event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: EventType,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub event_data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// Instances started by hooks in response to this event
    #[serde(default)]
    pub triggered_instances: Vec<String>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        workflow_id: impl Into<String>,
        instance_id: Option<String>,
        user_id: Option<String>,
        event_data: Map<String, Value>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            workflow_id: workflow_id.into(),
            instance_id,
            user_id,
            event_data,
            timestamp: Utc::now(),
            processed_at: None,
            triggered_instances: Vec::new(),
        }
    }

    /// Workflow-level key hooks match against, `"<EVENT_TYPE>.<workflow_id>"`.
    /// Exact patterns like `COMPLETED.building_permit` target this form.
    pub fn matching_key(&self) -> String {
        format!("{}.{}", self.event_type.key_fragment(), self.workflow_id)
    }

    /// Instance-extended key, `"<EVENT_TYPE>.<workflow_id>.<instance_id>"`,
    /// for hooks scoped to one source instance
    pub fn instance_matching_key(&self) -> Option<String> {
        self.instance_id
            .as_ref()
            .map(|instance_id| format!("{}.{instance_id}", self.matching_key()))
    }
}

/// In-process subscriber; plain function values keyed by event type
pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

/// Central event manager: persist, trigger hooks, notify subscribers
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn InstanceStore>,
    subscribers: Arc<RwLock<FxHashMap<EventType, Vec<Subscriber>>>>,
    hook_engine: Arc<RwLock<Option<Arc<HookEngine>>>>,
}

impl EventBus {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self {
            store,
            subscribers: Arc::new(RwLock::new(FxHashMap::default())),
            hook_engine: Arc::new(RwLock::new(None)),
        }
    }

    /// Wire the hook engine in (done once by the engine assembly)
    pub fn attach_hook_engine(&self, hook_engine: Arc<HookEngine>) {
        *self.hook_engine.write() = Some(hook_engine);
    }

    /// Subscribe a handler to one event type
    pub fn subscribe<F>(&self, event_type: EventType, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .entry(event_type)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Publish an event: persist, run hooks, notify subscribers.
    /// Returns the event id.
    pub async fn publish(
        &self,
        event_type: EventType,
        workflow_id: &str,
        instance_id: Option<&str>,
        user_id: Option<&str>,
        event_data: Value,
    ) -> Result<String, EngineError> {
        let data = match event_data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".into(), other);
                map
            }
        };

        let mut event = Event::new(
            event_type,
            workflow_id,
            instance_id.map(str::to_string),
            user_id.map(str::to_string),
            data,
        );

        self.store.append_event(&event).await?;
        info!(event_type = ?event.event_type, workflow_id, "published event");

        // Hooks may start listener workflows; their failures are contained
        let hook_engine = self.hook_engine.read().clone();
        if let Some(hooks) = hook_engine {
            match hooks.process_event(&event).await {
                Ok(triggered) if !triggered.is_empty() => {
                    debug!(count = triggered.len(), event_id = %event.event_id, "hooks triggered workflows");
                    event.triggered_instances = triggered;
                    event.processed_at = Some(Utc::now());
                    self.store.update_event(&event).await?;
                }
                Ok(_) => {
                    event.processed_at = Some(Utc::now());
                    self.store.update_event(&event).await?;
                }
                Err(err) => {
                    error!(error = %err, event_id = %event.event_id, "hook processing failed");
                }
            }
        }

        let subscribers = self
            .subscribers
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        for subscriber in subscribers {
            subscriber(&event);
        }

        Ok(event.event_id)
    }

    /// Events recorded for a workflow, oldest first
    pub async fn events_for(&self, workflow_id: &str) -> Vec<Event> {
        let filter = EventFilter {
            workflow_id: Some(workflow_id.to_string()),
            ..Default::default()
        };
        self.store.query_events(&filter).await.unwrap_or_default()
    }

    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<Event>, EngineError> {
        self.store.query_events(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bus() -> EventBus {
        EventBus::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn publish_persists_event() {
        let bus = bus();
        let event_id = bus
            .publish(
                EventType::Completed,
                "building_permit",
                Some("i-1"),
                Some("u-1"),
                json!({"final_context": {"k": 1}}),
            )
            .await
            .unwrap();

        let events = bus.events_for("building_permit").await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, event_id);
        assert_eq!(events[0].event_data["final_context"]["k"], 1);
    }

    #[tokio::test]
    async fn matching_keys_cover_workflow_and_instance_forms() {
        let event = Event::new(EventType::Completed, "permit", Some("i-9".into()), None, Map::new());
        assert_eq!(event.matching_key(), "COMPLETED.permit");
        assert_eq!(
            event.instance_matching_key().as_deref(),
            Some("COMPLETED.permit.i-9")
        );

        let event = Event::new(EventType::Failed, "permit", None, None, Map::new());
        assert_eq!(event.matching_key(), "FAILED.permit");
        assert!(event.instance_matching_key().is_none());
    }

    #[tokio::test]
    async fn subscribers_receive_only_their_event_type() {
        let bus = bus();
        let completed = Arc::new(AtomicUsize::new(0));
        let seen = completed.clone();
        bus.subscribe(EventType::Completed, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(EventType::Completed, "w", None, None, json!({}))
            .await
            .unwrap();
        bus.publish(EventType::Failed, "w", None, None, json!({}))
            .await
            .unwrap();

        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn events_query_preserves_publication_order() {
        let bus = bus();
        for i in 0..3 {
            bus.publish(EventType::Started, "w", Some(&format!("i-{i}")), None, json!({}))
                .await
                .unwrap();
        }
        let events = bus.events_for("w").await;
        let ids: Vec<_> = events
            .iter()
            .map(|e| e.instance_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["i-0", "i-1", "i-2"]);
    }
}

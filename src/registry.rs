//! DAG registry - compiled template cache and instance factory
//!
//! Owns every registered [`Template`]. Templates arrive already frozen by
//! the builder session; registration only checks `dag_id` uniqueness and
//! records the metadata. Instances are produced here and handed to the
//! caller unpersisted - admission to the executor is a separate call.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::EngineError;
use crate::instance::Instance;
use crate::template::{Template, TemplateRecord};

#[derive(Default)]
pub struct DagRegistry {
    templates: DashMap<String, Arc<Template>>,
}

impl DagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a frozen template. Fails when the `dag_id` is taken.
    pub fn register(&self, template: Template) -> Result<Arc<Template>, EngineError> {
        let dag_id = template.dag_id.to_string();
        if self.templates.contains_key(&dag_id) {
            return Err(EngineError::InvalidTemplate {
                dag_id,
                reason: "a template with this dag_id is already registered".into(),
            });
        }
        let template = Arc::new(template);
        self.templates.insert(dag_id.clone(), Arc::clone(&template));
        info!(dag_id = %dag_id, tasks = template.task_count(), "registered workflow template");
        Ok(template)
    }

    pub fn get(&self, dag_id: &str) -> Option<Arc<Template>> {
        self.templates.get(dag_id).map(|t| Arc::clone(&t))
    }

    pub fn records(&self) -> Vec<TemplateRecord> {
        self.templates.iter().map(|t| t.record()).collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Allocate a fresh instance of a template: new id, initial data copied
    /// into the context, every task seeded pending. Not persisted here.
    pub fn instantiate(
        &self,
        dag_id: &str,
        user_id: &str,
        initial_data: Map<String, Value>,
    ) -> Result<Instance, EngineError> {
        let template = self
            .get(dag_id)
            .ok_or_else(|| EngineError::UnknownTemplate(dag_id.to_string()))?;

        Ok(Instance::new(
            template.dag_id.to_string(),
            template.version.clone(),
            template.workflow_type,
            user_id,
            template.task_ids().map(|id| id.to_string()),
            initial_data,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceStatus, TaskStatus, WorkflowType};
    use crate::operator::{op, TerminalOperator};
    use serde_json::json;

    fn simple_template(dag_id: &str) -> Template {
        Template::builder(dag_id)
            .workflow_type(WorkflowType::Process)
            .task("finish", op(TerminalOperator::new("SUCCESS")))
            .build()
            .unwrap()
    }

    #[test]
    fn register_and_get() {
        let registry = DagRegistry::new();
        registry.register(simple_template("permit")).unwrap();

        assert!(registry.get("permit").is_some());
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.records().len(), 1);
    }

    #[test]
    fn duplicate_dag_id_is_rejected() {
        let registry = DagRegistry::new();
        registry.register(simple_template("permit")).unwrap();
        let err = registry.register(simple_template("permit")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTemplate { .. }));
    }

    #[test]
    fn instantiate_seeds_pending_tasks_and_context() {
        let registry = DagRegistry::new();
        registry.register(simple_template("permit")).unwrap();

        let mut data = Map::new();
        data.insert("applicant".into(), json!("Ada"));
        let instance = registry.instantiate("permit", "u-1", data).unwrap();

        assert_eq!(instance.dag_id, "permit");
        assert_eq!(instance.user_id, "u-1");
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert_eq!(instance.task_status("finish"), Some(TaskStatus::Pending));
        assert_eq!(instance.context.get("applicant"), Some(&json!("Ada")));
    }

    #[test]
    fn instantiate_unknown_template_errors() {
        let registry = DagRegistry::new();
        let err = registry.instantiate("ghost", "u-1", Map::new()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownTemplate(_)));
    }
}

//! Workflow templates and the builder session
//!
//! A [`Template`] is the immutable DAG a workflow runs from: tasks bound to
//! operators plus the edge set. Templates are assembled through a
//! [`TemplateBuilder`] "session"; `build()` runs the structural checks
//! (unique ids, known edge endpoints, acyclicity, reachability) and
//! freezes the result. A frozen template is never mutated.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::graph::TaskGraph;
use crate::instance::WorkflowType;
use crate::operator::{OperatorKind, OperatorRef};

/// Identifiers for templates and tasks: word characters and dashes, no
/// leading dash (they appear in event keys and context state keys)
static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_-]*$").expect("static pattern compiles"));

/// Immutable workflow definition
pub struct Template {
    pub dag_id: Arc<str>,
    pub version: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub workflow_type: WorkflowType,
    tasks: FxHashMap<Arc<str>, OperatorRef>,
    graph: TaskGraph,
}

impl Template {
    pub fn builder(dag_id: impl Into<String>) -> TemplateBuilder {
        TemplateBuilder::new(dag_id)
    }

    pub fn operator(&self, task_id: &str) -> Option<&OperatorRef> {
        self.tasks.get(task_id)
    }

    pub fn operator_kind(&self, task_id: &str) -> Option<OperatorKind> {
        self.tasks.get(task_id).map(|op| op.kind())
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &Arc<str>> {
        self.graph.topo_order().iter()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Persistable summary of this template
    pub fn record(&self) -> TemplateRecord {
        TemplateRecord {
            dag_id: self.dag_id.to_string(),
            version: self.version.clone(),
            description: self.description.clone(),
            category: self.category.clone(),
            tags: self.tags.clone(),
            workflow_type: self.workflow_type,
            task_count: self.tasks.len(),
        }
    }
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("dag_id", &self.dag_id)
            .field("version", &self.version)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

/// Stored metadata for a registered template (the compiled template with
/// its operators lives only in the registry cache)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub dag_id: String,
    pub version: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub workflow_type: WorkflowType,
    pub task_count: usize,
}

/// Scoped builder session for assembling a template
pub struct TemplateBuilder {
    dag_id: String,
    version: String,
    description: String,
    category: String,
    tags: Vec<String>,
    workflow_type: WorkflowType,
    tasks: Vec<(Arc<str>, OperatorRef)>,
    edges: Vec<(Arc<str>, Arc<str>)>,
    duplicate: Option<String>,
}

impl TemplateBuilder {
    pub fn new(dag_id: impl Into<String>) -> Self {
        Self {
            dag_id: dag_id.into(),
            version: "1.0.0".into(),
            description: String::new(),
            category: "general".into(),
            tags: Vec::new(),
            workflow_type: WorkflowType::Process,
            tasks: Vec::new(),
            edges: Vec::new(),
            duplicate: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn workflow_type(mut self, workflow_type: WorkflowType) -> Self {
        self.workflow_type = workflow_type;
        self
    }

    /// Register a task under a unique id
    pub fn task(mut self, task_id: impl Into<String>, operator: OperatorRef) -> Self {
        let id: Arc<str> = Arc::from(task_id.into());
        if self.tasks.iter().any(|(existing, _)| *existing == id) {
            self.duplicate.get_or_insert(id.to_string());
        } else {
            self.tasks.push((id, operator));
        }
        self
    }

    /// Declare an edge from -> to
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((Arc::from(from.into()), Arc::from(to.into())));
        self
    }

    /// Validate and freeze. Fails with `InvalidTemplate` on duplicate task
    /// ids, unknown edge endpoints, cycles, or unreachable tasks.
    pub fn build(self) -> Result<Template, EngineError> {
        let invalid = |reason: String| EngineError::InvalidTemplate {
            dag_id: self.dag_id.clone(),
            reason,
        };

        if let Some(dup) = &self.duplicate {
            return Err(invalid(format!("duplicate task id: {dup}")));
        }
        if !ID_PATTERN.is_match(&self.dag_id) {
            return Err(invalid(format!("invalid dag_id: '{}'", self.dag_id)));
        }
        if let Some((bad, _)) = self.tasks.iter().find(|(id, _)| !ID_PATTERN.is_match(id)) {
            return Err(invalid(format!("invalid task id: '{bad}'")));
        }

        let task_ids: Vec<Arc<str>> = self.tasks.iter().map(|(id, _)| Arc::clone(id)).collect();
        let graph = TaskGraph::build(&task_ids, &self.edges).map_err(|e| invalid(e.to_string()))?;

        Ok(Template {
            dag_id: Arc::from(self.dag_id.as_str()),
            version: self.version,
            description: self.description,
            category: self.category,
            tags: self.tags,
            workflow_type: self.workflow_type,
            tasks: self.tasks.into_iter().collect(),
            graph,
        })
    }
}

//! # Tramita Workflow Engine
//!
//! DAG workflow engine for citizen-service processes: declaratively
//! defined templates, many concurrent instances, persisted transitions,
//! suspension at human-input boundaries, event-driven chaining and an
//! assignment/review pipeline for administrative work.
//!
//! ## Architecture
//!
//! | Component | Module | Responsibility |
//! |-----------|--------|----------------|
//! | DAG registry | [`registry`] | compiled templates, validation, instances |
//! | Operators | [`operator`] | the nine task kinds behind one `execute(ctx)` |
//! | Executor | [`executor`] | ready-set scheduling, persistence, suspension |
//! | Event bus | [`events`] | typed lifecycle events, subscribers |
//! | Hook engine | [`hooks`] | pattern matching, workflow chaining |
//! | Assignment | [`assignment`] | team/user binding, review state machine |
//! | Store | [`store`] | abstract persistence, optimistic concurrency |
//!
//! ## Quick start
//!
//! ```rust
//! use serde_json::Map;
//! use tramita::{op, ActionOperator, Template, TerminalOperator, WorkflowEngine};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let engine = WorkflowEngine::in_memory();
//!
//! let template = Template::builder("hello")
//!     .task("greet", op(ActionOperator::new(|_, _| {
//!         let mut out = serde_json::Map::new();
//!         out.insert("greeting".into(), serde_json::json!("hola"));
//!         Ok(out)
//!     })))
//!     .task("done", op(TerminalOperator::new("SUCCESS")))
//!     .edge("greet", "done")
//!     .build()?;
//!
//! engine.register_template(template).await?;
//! let id = engine.create_instance("hello", "citizen-1", Map::new()).await?;
//! engine.start(&id).await?;
//!
//! let instance = engine.get_instance(&id).await?;
//! assert_eq!(instance.terminal_status.as_deref(), Some("SUCCESS"));
//! # Ok::<(), tramita::EngineError>(())
//! # }).unwrap();
//! ```

pub mod assignment;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod form;
pub mod graph;
pub mod hooks;
pub mod instance;
pub mod operator;
pub mod registry;
pub mod service;
pub mod store;
pub mod template;

#[cfg(test)]
pub(crate) mod test_support;

// Engine surface
pub use engine::WorkflowEngine;
pub use error::EngineError;
// Model types
pub use config::EngineConfig;
pub use context::Context;
pub use form::{FieldSpec, FieldType, FormConfig};
pub use instance::{
    Assignment, AssignmentStatus, AssignmentType, Instance, InstanceStatus, TaskState, TaskStatus,
    WorkflowType,
};
pub use template::{Template, TemplateBuilder, TemplateRecord};
// Operators
pub use operator::{
    op, ActionOperator, AdminInputOperator, ApprovalDecision, ApprovalOperator, ConditionalOperator,
    EntityMapping, EntityValidationOperator, IntegrationOperator, Operator, OperatorKind,
    ResultStatus, RetryPolicy, TaskResult, TerminalOperator, UserInputOperator,
    WorkflowStartOperator,
};
// Events & hooks
pub use events::{Event, EventBus, EventType};
pub use hooks::{Hook, HookEngine, HookTriggerType};
// Assignment
pub use assignment::{Assignee, AssignmentRule, AssignmentService, AssignmentStrategy, Team};
// Persistence
pub use store::{EventFilter, HookFilter, InstanceFilter, InstanceStore, LogEntry, MemoryStore};

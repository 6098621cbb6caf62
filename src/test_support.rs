//! Shared fixtures for unit tests

use std::sync::Arc;

use crate::assignment::AssignmentService;
use crate::context::Context;
use crate::events::EventBus;
use crate::hooks::HookEngine;
use crate::operator::{ExecutionContext, Services};
use crate::registry::DagRegistry;
use crate::store::{InstanceStore, MemoryStore};

/// Wired-up collaborators over an in-memory store
pub(crate) struct TestHarness {
    pub services: Services,
}

impl TestHarness {
    pub async fn new() -> Self {
        let store: Arc<dyn InstanceStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(DagRegistry::new());
        let assignment = Arc::new(AssignmentService::new(store.clone()));
        let bus = EventBus::new(store.clone());
        let hook_engine = Arc::new(HookEngine::new(
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&assignment),
            None,
        ));
        bus.attach_hook_engine(hook_engine);

        Self {
            services: Services {
                registry,
                store,
                bus,
                assignment,
            },
        }
    }
}

/// Execution context for a lone operator under test
pub(crate) async fn execution_context_with(harness: &TestHarness) -> ExecutionContext {
    ExecutionContext {
        instance_id: "test-instance".into(),
        dag_id: "test_workflow".into(),
        user_id: "test-user".into(),
        task_id: "task_under_test".into(),
        context: Context::new(),
        services: harness.services.clone(),
    }
}

pub(crate) async fn execution_context() -> ExecutionContext {
    let harness = TestHarness::new().await;
    execution_context_with(&harness).await
}

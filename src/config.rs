//! Engine configuration and safety limits

/// Tunables for the executor and its persistence discipline
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Instances processed in parallel; excess submissions queue FIFO
    pub max_concurrent_instances: usize,

    /// Ready tasks admitted per instance per tick (instances linearize
    /// their tasks at the default of 1)
    pub tasks_per_tick: usize,

    /// Whole-tick retries after an optimistic-concurrency conflict
    pub max_save_attempts: u32,

    /// Upper bound on task executions per drive, against runaway loops
    pub max_task_executions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_instances: 10,
            tasks_per_tick: 1,
            max_save_attempts: 3,
            max_task_executions: 1000,
        }
    }
}

impl EngineConfig {
    /// Tighter bounds for tests
    pub fn testing() -> Self {
        Self {
            max_concurrent_instances: 2,
            tasks_per_tick: 1,
            max_save_attempts: 2,
            max_task_executions: 100,
        }
    }
}

//! Executor - per-instance scheduler
//!
//! Owns the set of in-flight instances: admits ready tasks in topological
//! order, runs their operators, persists every transition, suspends on
//! WAITING and re-admits on resume. Within one instance, tasks are
//! linearized; across instances, a fair semaphore caps parallelism and
//! queues excess submissions FIFO.
//!
//! Persistence discipline: each task execution is one revision-checked
//! write (task state + context delta together). On a conflict the whole
//! tick is retried against a fresh read, a bounded number of times.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::context::{child_state_key, pending_input_key};
use crate::error::EngineError;
use crate::events::EventType;
use crate::instance::{Instance, InstanceStatus, TaskStatus};
use crate::operator::{
    ExecutionContext, OperatorKind, ResultStatus, Services, TaskResult, SELECTED_TASK_KEY,
    TERMINAL_STATUS_KEY,
};
use crate::store::{InstanceStore, LogEntry};
use crate::template::Template;

/// What a single drive pass over one instance produced
enum RunOutcome {
    /// Instance reached a terminal state or suspended
    Settled,
    /// A save lost the optimistic-concurrency race; re-read and re-tick
    Conflict,
}

pub struct Executor {
    services: Services,
    config: EngineConfig,
    permits: Arc<Semaphore>,
}

impl Executor {
    pub fn new(services: Services, config: EngineConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_instances));
        Self {
            services,
            config,
            permits,
        }
    }

    /// Admit a pending instance and run it until it suspends or terminates
    #[instrument(skip(self))]
    pub async fn submit(&self, instance_id: &str) -> Result<(), EngineError> {
        let instance = self.load(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                instance_id: instance_id.to_string(),
                reason: format!("cannot submit an instance in status {:?}", instance.status),
            });
        }
        self.drive(instance_id).await
    }

    /// Re-admit a waiting instance (form submission, approval decision,
    /// child completion)
    #[instrument(skip(self))]
    pub async fn resume(&self, instance_id: &str) -> Result<(), EngineError> {
        let instance = self.load(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                instance_id: instance_id.to_string(),
                reason: format!("cannot resume an instance in status {:?}", instance.status),
            });
        }
        self.drive(instance_id).await
    }

    /// Mark an instance CANCELLED; any in-flight task result is discarded
    /// when its revision-checked write loses against this one.
    #[instrument(skip(self))]
    pub async fn cancel(&self, instance_id: &str) -> Result<(), EngineError> {
        loop {
            let mut instance = self.load(instance_id).await?;
            if instance.status.is_terminal() {
                return Ok(());
            }
            instance.status = InstanceStatus::Cancelled;
            instance.completed_at = Some(Utc::now());
            instance.touch();
            match self.services.store.save_instance(&mut instance).await {
                Ok(()) => {
                    info!(instance_id, "instance cancelled");
                    self.services
                        .store
                        .append_log(LogEntry::info(instance_id, "instance_cancelled", "cancelled by caller"))
                        .await?;
                    return Ok(());
                }
                Err(err) if err.is_retryable() => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn load(&self, instance_id: &str) -> Result<Instance, EngineError> {
        self.services
            .store
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))
    }

    /// Cooperative scheduling loop: run the given instance to quiescence,
    /// then any follow-up work it produced (children to auto-start,
    /// parents to re-admit).
    async fn drive(&self, instance_id: &str) -> Result<(), EngineError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::other("executor shut down"))?;

        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(instance_id.to_string());

        while let Some(id) = queue.pop_front() {
            let mut attempts = 0u32;
            loop {
                let mut followups = Vec::new();
                match self.run_instance(&id, &mut followups).await? {
                    RunOutcome::Settled => {
                        queue.extend(followups);
                        break;
                    }
                    RunOutcome::Conflict => {
                        attempts += 1;
                        if attempts >= self.config.max_save_attempts {
                            self.escalate_conflict(&id).await?;
                            break;
                        }
                        debug!(instance_id = %id, attempts, "tick lost revision race, retrying");
                    }
                }
            }
        }
        Ok(())
    }

    /// A bounded number of conflicts means another writer owns the
    /// instance; most often a cancel. Failing it is the escalation of
    /// last resort when it is still live.
    async fn escalate_conflict(&self, instance_id: &str) -> Result<(), EngineError> {
        let mut instance = self.load(instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(());
        }
        warn!(instance_id, "persistence conflicts exhausted, failing instance");
        instance.status = InstanceStatus::Failed;
        instance.terminal_message = Some("persistence conflict retries exhausted".into());
        instance.completed_at = Some(Utc::now());
        self.services.store.save_instance(&mut instance).await?;
        Ok(())
    }

    /// One pass: promote to RUNNING, drain ready tasks, settle.
    async fn run_instance(
        &self,
        instance_id: &str,
        followups: &mut Vec<String>,
    ) -> Result<RunOutcome, EngineError> {
        let mut instance = self.load(instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(RunOutcome::Settled);
        }

        let template = self
            .services
            .registry
            .get(&instance.dag_id)
            .ok_or_else(|| EngineError::UnknownTemplate(instance.dag_id.clone()))?;

        // Promote to RUNNING (covers both first admission and resume)
        if instance.status != InstanceStatus::Running {
            let resumed = instance.status.is_resumable();
            instance.status = InstanceStatus::Running;
            if instance.started_at.is_none() {
                instance.started_at = Some(Utc::now());
            }
            instance.touch();
            match self.services.store.save_instance(&mut instance).await {
                Ok(()) => {}
                Err(err) if err.is_retryable() => return Ok(RunOutcome::Conflict),
                Err(err) => return Err(err),
            }
            let event_type = if resumed { EventType::Resumed } else { EventType::Started };
            self.publish_lifecycle(&instance, event_type).await;
        }

        let mut executions = 0usize;
        loop {
            if executions >= self.config.max_task_executions {
                return self
                    .fail_instance(&mut instance, None, "task execution budget exhausted", followups)
                    .await;
            }

            let ready = self.ready_tasks(&template, &instance);
            let Some(task_id) = ready.first().cloned() else {
                return self.settle_exhausted(&mut instance, &template, followups).await;
            };

            executions += 1;
            match self
                .execute_task(&template, &mut instance, &task_id, followups)
                .await?
            {
                Some(outcome) => return Ok(outcome),
                None => continue,
            }
        }
    }

    /// Ready-set rule: pending with every upstream completed (a waiting
    /// upstream does not count), gated by conditional branch selection;
    /// waiting tasks are always resumable.
    fn ready_tasks(&self, template: &Template, instance: &Instance) -> Vec<String> {
        let graph = template.graph();
        let mut ready = Vec::new();

        for task_id in graph.topo_order() {
            let status = instance.task_status(task_id).unwrap_or(TaskStatus::Pending);
            match status {
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Executing => continue,
                TaskStatus::Waiting => {
                    ready.push(task_id.to_string());
                    continue;
                }
                TaskStatus::Pending => {}
            }

            let mut admissible = true;
            for upstream in graph.predecessors(task_id) {
                if instance.task_status(upstream) != Some(TaskStatus::Completed) {
                    admissible = false;
                    break;
                }
                if template.operator_kind(upstream) == Some(OperatorKind::Conditional) {
                    let selected = instance
                        .task_state(upstream)
                        .and_then(|s| s.output_data.get(SELECTED_TASK_KEY))
                        .and_then(Value::as_str);
                    if selected != Some(task_id.as_ref()) {
                        admissible = false;
                        break;
                    }
                }
            }
            if admissible {
                ready.push(task_id.to_string());
            }

            if ready.len() >= self.config.tasks_per_tick {
                break;
            }
        }
        ready
    }

    /// Run one task through its operator and apply the result.
    /// `Some(outcome)` settles the instance; `None` keeps draining.
    async fn execute_task(
        &self,
        template: &Template,
        instance: &mut Instance,
        task_id: &str,
        followups: &mut Vec<String>,
    ) -> Result<Option<RunOutcome>, EngineError> {
        let operator = template.operator(task_id).ok_or_else(|| EngineError::UnknownTask {
            instance_id: instance.instance_id.clone(),
            task_id: task_id.to_string(),
        })?;

        let was_waiting = instance.task_status(task_id) == Some(TaskStatus::Waiting);
        instance.update_task_status(task_id, TaskStatus::Executing, None, None);
        self.services
            .store
            .append_log(
                LogEntry::info(&instance.instance_id, "task_started", format!("executing {task_id}"))
                    .task(task_id),
            )
            .await?;

        let exec_ctx = ExecutionContext {
            instance_id: instance.instance_id.clone(),
            dag_id: instance.dag_id.clone(),
            user_id: instance.user_id.clone(),
            task_id: task_id.to_string(),
            context: instance.context.clone(),
            services: self.services.clone(),
        };

        let mut result = operator.execute(&exec_ctx).await;

        // Bounded transparent retries; no partial output is merged
        if let Some(policy) = operator.retry_policy() {
            let mut attempt = 1;
            while result.status == ResultStatus::Failed && attempt < policy.max_attempts {
                let delay = policy.delay_for(attempt);
                debug!(task_id, attempt, ?delay, "retrying failed task");
                tokio::time::sleep(delay).await;
                result = operator.execute(&exec_ctx).await;
                attempt += 1;
                if let Some(state) = instance.task_states.get_mut(task_id) {
                    state.attempts = attempt;
                }
            }
        }

        // Resumable-operator state survives regardless of the outcome
        if !result.context_patch.is_empty() {
            instance.context.merge(&result.context_patch);
            self.collect_child_followups(&result, task_id, followups);
        }

        match result.status {
            ResultStatus::Completed | ResultStatus::Continue => {
                if was_waiting {
                    instance.context.remove(&pending_input_key(task_id));
                }
                instance.update_task_status(task_id, TaskStatus::Completed, Some(result.data.clone()), None);
                self.services
                    .store
                    .append_log(
                        LogEntry::info(&instance.instance_id, "task_completed", format!("{task_id} completed"))
                            .task(task_id),
                    )
                    .await?;

                if operator.kind() == OperatorKind::Terminal {
                    return self.complete_instance(instance, &result, followups).await.map(Some);
                }

                match self.services.store.save_instance(instance).await {
                    Ok(()) => Ok(None),
                    Err(err) if err.is_retryable() => Ok(Some(RunOutcome::Conflict)),
                    Err(err) => Err(err),
                }
            }
            ResultStatus::Waiting => {
                let waiting_for = result.waiting_for.clone().unwrap_or_else(|| "input".into());
                instance.update_task_status(task_id, TaskStatus::Waiting, Some(result.data.clone()), None);
                instance.set_waiting_for(task_id, waiting_for.as_str());
                instance.status = if waiting_for == "child_workflow" {
                    InstanceStatus::Paused
                } else {
                    InstanceStatus::WaitingForInput
                };
                instance.touch();

                match self.services.store.save_instance(instance).await {
                    Ok(()) => {}
                    Err(err) if err.is_retryable() => return Ok(Some(RunOutcome::Conflict)),
                    Err(err) => return Err(err),
                }
                self.services
                    .store
                    .append_log(
                        LogEntry::info(
                            &instance.instance_id,
                            "task_waiting",
                            format!("{task_id} suspended waiting for {waiting_for}"),
                        )
                        .task(task_id),
                    )
                    .await?;
                self.publish_lifecycle(instance, EventType::Paused).await;
                info!(instance_id = %instance.instance_id, task_id, %waiting_for, "instance suspended");
                Ok(Some(RunOutcome::Settled))
            }
            ResultStatus::Failed => {
                let message = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "operator failed without a message".into());
                instance.update_task_status(
                    task_id,
                    TaskStatus::Failed,
                    Some(result.data.clone()),
                    Some(message.clone()),
                );
                self.services
                    .store
                    .append_log(
                        LogEntry::error(&instance.instance_id, "task_failed", &message).task(task_id),
                    )
                    .await?;
                self.fail_instance(instance, Some(task_id), &message, followups)
                    .await
                    .map(Some)
            }
        }
    }

    /// A workflow-start operator may ask for its freshly created child to
    /// be admitted right away. Only a patch that just parked the child
    /// state counts - re-entries do not re-admit.
    fn collect_child_followups(&self, result: &TaskResult, task_id: &str, followups: &mut Vec<String>) {
        let state = result
            .context_patch
            .get(&child_state_key(task_id))
            .and_then(Value::as_object);
        if let Some(state) = state {
            let auto_start = state.get("auto_start").and_then(Value::as_bool).unwrap_or(false);
            if auto_start {
                if let Some(child_id) = state.get("child_instance_id").and_then(Value::as_str) {
                    followups.push(child_id.to_string());
                }
            }
        }
    }

    /// No ready task left: suspended if something waits, terminal otherwise
    async fn settle_exhausted(
        &self,
        instance: &mut Instance,
        _template: &Template,
        followups: &mut Vec<String>,
    ) -> Result<RunOutcome, EngineError> {
        if instance.has_waiting_tasks() {
            let waiting_for = instance
                .task_states
                .values()
                .find(|s| s.status == TaskStatus::Waiting)
                .and_then(|s| s.waiting_for.clone())
                .unwrap_or_else(|| "input".into());
            instance.status = if waiting_for == "child_workflow" {
                InstanceStatus::Paused
            } else {
                InstanceStatus::WaitingForInput
            };
            instance.touch();
            match self.services.store.save_instance(instance).await {
                Ok(()) => Ok(RunOutcome::Settled),
                Err(err) if err.is_retryable() => Ok(RunOutcome::Conflict),
                Err(err) => Err(err),
            }
        } else if !instance.failed_tasks.is_empty() {
            let message = format!("tasks failed: {}", instance.failed_tasks.join(", "));
            self.fail_instance(instance, None, &message, followups).await
        } else {
            // All reachable tasks completed without a terminal operator
            let result = TaskResult::completed(Default::default());
            self.complete_instance(instance, &result, followups).await
        }
    }

    async fn complete_instance(
        &self,
        instance: &mut Instance,
        result: &TaskResult,
        followups: &mut Vec<String>,
    ) -> Result<RunOutcome, EngineError> {
        instance.status = InstanceStatus::Completed;
        instance.terminal_status = result
            .data
            .get(TERMINAL_STATUS_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| instance.terminal_status.clone());
        instance.terminal_message = result
            .data
            .get("terminal_message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| instance.terminal_message.clone());
        instance.completed_at = Some(Utc::now());
        instance.touch();

        match self.services.store.save_instance(instance).await {
            Ok(()) => {}
            Err(err) if err.is_retryable() => return Ok(RunOutcome::Conflict),
            Err(err) => return Err(err),
        }

        info!(
            instance_id = %instance.instance_id,
            terminal_status = instance.terminal_status.as_deref().unwrap_or("-"),
            "instance completed"
        );
        self.services
            .store
            .append_log(LogEntry::info(
                &instance.instance_id,
                "instance_completed",
                format!(
                    "completed with terminal status {}",
                    instance.terminal_status.as_deref().unwrap_or("-")
                ),
            ))
            .await?;
        self.publish_lifecycle(instance, EventType::Completed).await;

        if let Some(parent) = &instance.parent_instance_id {
            followups.push(parent.clone());
        }
        Ok(RunOutcome::Settled)
    }

    async fn fail_instance(
        &self,
        instance: &mut Instance,
        task_id: Option<&str>,
        message: &str,
        followups: &mut Vec<String>,
    ) -> Result<RunOutcome, EngineError> {
        instance.status = InstanceStatus::Failed;
        instance.terminal_message = Some(message.to_string());
        instance.completed_at = Some(Utc::now());
        instance.touch();

        match self.services.store.save_instance(instance).await {
            Ok(()) => {}
            Err(err) if err.is_retryable() => return Ok(RunOutcome::Conflict),
            Err(err) => return Err(err),
        }

        warn!(instance_id = %instance.instance_id, task_id = task_id.unwrap_or("-"), message, "instance failed");
        self.services
            .store
            .append_log(LogEntry::error(&instance.instance_id, "instance_failed", message))
            .await?;

        let event = self
            .services
            .bus
            .publish(
                EventType::Failed,
                &instance.dag_id,
                Some(&instance.instance_id),
                Some(&instance.user_id),
                json!({
                    "error_message": message,
                    "failed_task": task_id,
                }),
            )
            .await;
        if let Err(error) = event {
            warn!(%error, "failed to publish failure event");
        }

        // Re-admit a parent waiting on this child so it fails fast instead
        // of discovering the outcome on a later external resume
        if let Some(parent) = &instance.parent_instance_id {
            followups.push(parent.clone());
        }
        Ok(RunOutcome::Settled)
    }

    async fn publish_lifecycle(&self, instance: &Instance, event_type: EventType) {
        let event_data = match event_type {
            EventType::Completed => Value::Object(instance.context.exportable()),
            EventType::Started => json!({
                "initial_context": instance.context.exportable(),
            }),
            _ => json!({}),
        };
        let published = self
            .services
            .bus
            .publish(
                event_type,
                &instance.dag_id,
                Some(&instance.instance_id),
                Some(&instance.user_id),
                event_data,
            )
            .await;
        if let Err(error) = published {
            warn!(%error, instance_id = %instance.instance_id, "failed to publish lifecycle event");
        }
    }
}

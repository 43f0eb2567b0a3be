//! Task queue and dispatcher.
//!
//! The orchestrator owns the submission path (quota checks, durable
//! queued records, priority queues) and one dispatch loop per
//! (tenant, agent kind) partition. Execution failures are classified:
//! transient failures retry as fresh linked tasks with exponential
//! backoff, permanent ones terminate, cancellations are terminal.

mod status_manager;
mod task_queue;
mod task_records;

pub use status_manager::StatusManager;
pub use task_queue::{QueueKey, TaskQueue};
pub use task_records::TaskRecords;

use super::{
    analytics::AnalyticsAgent, content::ContentAgent, marketing::MarketingAgent,
    operations::OperationsAgent, sales::SalesAgent, Agent, AgentContext, AgentError, ControlOp,
};
use crate::{
    cache::ResponseCache,
    clock::{Clock, IdSource},
    constants,
    models::{
        AgentDescriptor, AgentKind, FailureClass, Priority, Task, TaskFailure, TaskPayload,
        TaskState,
    },
    providers::ModelRegistry,
    store::RecordStore,
    telemetry::{metric, MetricSink},
    tenancy::Tenant,
    CoreError, Result,
};
use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AgentOrchestrator {
    agents: Arc<HashMap<AgentKind, Arc<dyn Agent>>>,
    queue: Arc<TaskQueue>,
    statuses: Arc<StatusManager>,
    records: Arc<TaskRecords>,
    tenants: Arc<crate::tenancy::TenantStore>,
    cache: Arc<ResponseCache>,
    registry: Arc<ModelRegistry>,
    metrics: MetricSink,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
    cancel: CancellationToken,
    daily: Arc<Mutex<HashMap<String, (NaiveDate, u64)>>>,
    active_kinds: Arc<Mutex<HashMap<String, HashSet<AgentKind>>>>,
    workers: Arc<Mutex<HashMap<QueueKey, JoinHandle<()>>>>,
    running_tasks: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl AgentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RecordStore>,
        tenants: Arc<crate::tenancy::TenantStore>,
        cache: Arc<ResponseCache>,
        registry: Arc<ModelRegistry>,
        metrics: MetricSink,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
        cancel: CancellationToken,
    ) -> Self {
        let mut agents: HashMap<AgentKind, Arc<dyn Agent>> = HashMap::new();
        agents.insert(AgentKind::Sales, Arc::new(SalesAgent::new(vec![])));
        agents.insert(AgentKind::Marketing, Arc::new(MarketingAgent::new(vec![])));
        agents.insert(AgentKind::Content, Arc::new(ContentAgent::new(vec![])));
        agents.insert(AgentKind::Analytics, Arc::new(AnalyticsAgent::new(vec![])));
        agents.insert(AgentKind::Operations, Arc::new(OperationsAgent::new(vec![])));
        info!("registered {} agents", agents.len());

        Self {
            agents: Arc::new(agents),
            queue: Arc::new(TaskQueue::new(constants::MAX_QUEUE_DEPTH)),
            statuses: Arc::new(StatusManager::new()),
            records: Arc::new(TaskRecords::new(store, clock.clone())),
            tenants,
            cache,
            registry,
            metrics,
            clock,
            ids,
            cancel,
            daily: Arc::new(Mutex::new(HashMap::new())),
            active_kinds: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            running_tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn records(&self) -> &TaskRecords {
        &self.records
    }

    /// Submission entry point. The task is persisted in `queued` state
    /// before this returns; quota rejections fail fast.
    pub async fn submit_task(
        &self,
        tenant: &Tenant,
        submitter: &str,
        kind: AgentKind,
        payload: TaskPayload,
        priority: Priority,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Task> {
        self.submit_task_in_collaboration(tenant, submitter, kind, payload, priority, deadline, None)
            .await
    }

    /// As `submit_task`, additionally linking the record to an owning
    /// collaboration.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_task_in_collaboration(
        &self,
        tenant: &Tenant,
        submitter: &str,
        kind: AgentKind,
        payload: TaskPayload,
        priority: Priority,
        deadline: Option<DateTime<Utc>>,
        collaboration_id: Option<String>,
    ) -> Result<Task> {
        if !self.agents.contains_key(&kind) {
            return Err(CoreError::validation(
                "agent_kind",
                format!("no agent registered for `{kind}`"),
            ));
        }

        let now = self.clock.now();
        if let Some(deadline) = deadline {
            if deadline <= now {
                return Err(CoreError::validation(
                    "deadline",
                    "must be in the future",
                ));
            }
        }

        self.count_daily_submission(tenant).await?;
        if let Err(e) = self.check_agent_quota(tenant, kind).await {
            self.uncount_daily_submission(&tenant.id).await;
            return Err(e);
        }

        let task = Task {
            id: self.ids.next_id(),
            tenant_id: tenant.id.clone(),
            agent_kind: kind,
            submitter: submitter.to_string(),
            payload,
            priority,
            created_at: now,
            updated_at: now,
            deadline,
            state: TaskState::Queued,
            attempt_count: 0,
            parent_id: None,
            collaboration_id,
            result: None,
            error: None,
        };

        if let Err(e) = self.submit_prepared(task.clone()).await {
            self.uncount_daily_submission(&tenant.id).await;
            return Err(e);
        }
        Ok(task)
    }

    /// Persist and enqueue an already-built task, spawning the partition
    /// worker on first use. Shared by submission and the retry path.
    async fn submit_prepared(&self, task: Task) -> Result<()> {
        self.records.insert(&task).await?;
        let key = (task.tenant_id.clone(), task.agent_kind);
        if let Err(e) = self.queue.enqueue(task.clone()).await {
            // Compensate the durable record so a rejected submit leaves
            // no trace.
            let _ = self.records.remove(&task.id).await;
            return Err(e);
        }
        self.ensure_worker(key).await;
        debug!(task = %task.id, "task submitted");
        Ok(())
    }

    async fn check_agent_quota(&self, tenant: &Tenant, kind: AgentKind) -> Result<()> {
        let Some(max_agents) = tenant.quotas().max_agents else {
            return Ok(());
        };
        let mut active = self.active_kinds.lock().await;
        let kinds = active.entry(tenant.id.clone()).or_default();
        if !kinds.contains(&kind) && kinds.len() as u32 >= max_agents {
            return Err(CoreError::quota("max_agents", 0));
        }
        kinds.insert(kind);
        Ok(())
    }

    async fn count_daily_submission(&self, tenant: &Tenant) -> Result<()> {
        let now = self.clock.now();
        let today = now.date_naive();
        let mut daily = self.daily.lock().await;
        let entry = daily.entry(tenant.id.clone()).or_insert((today, 0));
        if entry.0 != today {
            *entry = (today, 0);
        }
        if entry.1 >= tenant.quotas().tasks_per_day {
            let midnight = today
                .succ_opt()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
                .unwrap_or(now);
            let retry_after = (midnight - now).num_seconds().max(1) as u64;
            return Err(CoreError::quota("tasks_per_day", retry_after));
        }
        entry.1 += 1;
        Ok(())
    }

    /// Test hook: place a tenant's daily counter at an arbitrary value.
    #[cfg(test)]
    pub(crate) async fn set_daily_count(&self, tenant_id: &str, count: u64) {
        let today = self.clock.now().date_naive();
        self.daily
            .lock()
            .await
            .insert(tenant_id.to_string(), (today, count));
    }

    async fn uncount_daily_submission(&self, tenant_id: &str) {
        let mut daily = self.daily.lock().await;
        if let Some(entry) = daily.get_mut(tenant_id) {
            entry.1 = entry.1.saturating_sub(1);
        }
    }

    fn ensure_worker<'a>(
        &'a self,
        key: QueueKey,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut workers = self.workers.lock().await;
            if workers.contains_key(&key) {
                return;
            }
            let orchestrator = self.clone();
            let loop_key = key.clone();
            let handle = tokio::spawn(async move { orchestrator.dispatch_loop(loop_key).await });
            workers.insert(key, handle);
        })
    }

    /// One loop per partition: honours pause/stop, the tier's concurrency
    /// bound (re-read each cycle so tier changes apply on next dispatch),
    /// and the shared shutdown token.
    async fn dispatch_loop(self, key: QueueKey) {
        info!(tenant = %key.0, kind = %key.1, "dispatcher started");
        let poll = Duration::from_millis(constants::TASK_POLL_INTERVAL_MS);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.cancel.cancelled() => break,
            }

            let quotas = match self.tenants.get_tenant(&key.0).await {
                Ok(tenant) => tenant.quotas(),
                Err(e) => {
                    warn!(tenant = %key.0, "dispatcher cannot load tenant: {e}");
                    continue;
                }
            };

            while self
                .statuses
                .can_dispatch(&key, quotas.concurrent_tasks_per_agent)
                .await
            {
                let Some(task) = self.queue.dequeue(&key).await else {
                    break;
                };
                self.statuses.inc_running(&key).await;
                let worker = self.clone();
                let task_key = key.clone();
                tokio::spawn(async move {
                    worker.execute_task(task, quotas).await;
                    worker.statuses.dec_running(&task_key).await;
                });
            }
        }

        self.statuses.mark_stopped(&key).await;
        info!(tenant = %key.0, kind = %key.1, "dispatcher stopped");
    }

    async fn execute_task(&self, task: Task, quotas: crate::tenancy::QuotaBundle) {
        let key = (task.tenant_id.clone(), task.agent_kind);

        let queue_wait_ms = (self.clock.now() - task.created_at).num_milliseconds().max(0) as f64;
        self.emit_metric(&task, metric::QUEUE_WAIT_MS, queue_wait_ms, &[]);

        // Leaving the queue exactly once: the transition refuses tasks
        // already running or terminal.
        let task = match self
            .records
            .transition(&task.id, TaskState::Running, |t| t.attempt_count += 1)
            .await
        {
            Ok(task) => task,
            Err(e) => {
                warn!(task = %task.id, "skipping dispatch: {e}");
                return;
            }
        };

        let task_cancel = self.cancel.child_token();
        self.running_tasks
            .lock()
            .await
            .insert(task.id.clone(), task_cancel.clone());

        let ctx = AgentContext {
            tenant_id: task.tenant_id.clone(),
            cancel: task_cancel.clone(),
            deadline: task.deadline,
            cache: self.cache.clone(),
            cache_entry_quota: quotas.cache_entries,
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            clock: self.clock.clone(),
        };

        let agent = match self.agents.get(&task.agent_kind) {
            Some(agent) => agent.clone(),
            None => {
                error!(task = %task.id, "no agent for dispatched task");
                let _ = self.fail_task(&task, FailureClass::Permanent, "agent missing").await;
                return;
            }
        };

        let started = self.clock.monotonic();
        let outcome = match task.deadline {
            Some(deadline) => {
                let remaining = (deadline - self.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                match tokio::time::timeout(remaining, agent.handle(&task, &ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(AgentError::Provider(
                        crate::providers::ProviderError::Timeout,
                    )),
                }
            }
            None => agent.handle(&task, &ctx).await,
        };
        let execution_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.emit_metric(&task, metric::EXECUTION_MS, execution_ms, &[]);

        self.running_tasks.lock().await.remove(&task.id);

        match outcome {
            Ok(output) => {
                let result = self
                    .records
                    .transition(&task.id, TaskState::Succeeded, |t| t.result = Some(output))
                    .await;
                if let Err(e) = result {
                    error!(task = %task.id, "failed to record success: {e}");
                }
                self.statuses.record_completion(&key, execution_ms).await;
                self.emit_metric(&task, metric::OUTCOME, 1.0, &[("outcome", "succeeded")]);
                info!(task = %task.id, "task succeeded in {execution_ms:.0}ms");
            }
            Err(e) => {
                // A cancel triggered through the task token outranks the
                // agent's own error classification; a process-wide
                // shutdown does not mark user cancellation.
                let class = if task_cancel.is_cancelled() && !self.cancel.is_cancelled() {
                    FailureClass::Cancelled
                } else {
                    e.classify()
                };
                self.handle_failure(&key, task, class, &e.to_string()).await;
            }
        }
    }

    async fn handle_failure(&self, key: &QueueKey, task: Task, class: FailureClass, message: &str) {
        match class {
            FailureClass::Cancelled => {
                let _ = self
                    .records
                    .transition(&task.id, TaskState::Cancelled, |t| {
                        t.error = Some(TaskFailure {
                            class,
                            message: message.to_string(),
                            failed_at: t.updated_at,
                        });
                    })
                    .await;
                self.emit_metric(&task, metric::OUTCOME, 1.0, &[("outcome", "cancelled")]);
                info!(task = %task.id, "task cancelled");
            }
            FailureClass::Permanent | FailureClass::Transient => {
                self.statuses.record_failure(key).await;
                let _ = self.fail_task(&task, class, message).await;
                self.emit_metric(&task, metric::OUTCOME, 1.0, &[("outcome", "failed")]);
                warn!(task = %task.id, ?class, "task failed: {message}");

                if class == FailureClass::Transient {
                    self.maybe_schedule_retry(&task).await;
                }
            }
        }
    }

    async fn fail_task(&self, task: &Task, class: FailureClass, message: &str) -> Result<Task> {
        self.records
            .transition(&task.id, TaskState::Failed, |t| {
                t.error = Some(TaskFailure {
                    class,
                    message: message.to_string(),
                    failed_at: t.updated_at,
                });
            })
            .await
    }

    /// Retry budget: at most `RETRY_MAX_ATTEMPTS` executions across the
    /// whole chain, and never past the task's deadline. Each retry is a
    /// fresh task linked via `parent_id`, queued after a jittered
    /// exponential backoff.
    async fn maybe_schedule_retry(&self, failed: &Task) {
        let attempts = failed.attempt_count;
        if attempts >= constants::RETRY_MAX_ATTEMPTS {
            debug!(task = %failed.id, "retry budget exhausted");
            return;
        }

        let delay = backoff_delay(attempts);
        let now = self.clock.now();
        if let Some(deadline) = failed.deadline {
            let resume_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            if resume_at >= deadline {
                debug!(task = %failed.id, "retry would violate deadline");
                return;
            }
        }

        let retry = Task {
            id: self.ids.next_id(),
            parent_id: Some(failed.id.clone()),
            attempt_count: attempts,
            state: TaskState::Queued,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            ..failed.clone()
        };

        self.emit_metric(failed, metric::RETRY, attempts as f64, &[]);
        let orchestrator = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = orchestrator.submit_prepared(retry).await {
                        error!("failed to queue retry: {e}");
                    }
                }
                _ = orchestrator.cancel.cancelled() => {}
            }
        });
    }

    fn emit_metric(&self, task: &Task, name: &str, value: f64, labels: &[(&str, &str)]) {
        let mut sample = crate::telemetry::sample(
            self.clock.as_ref(),
            &task.tenant_id,
            Some(task.agent_kind),
            name,
            value,
        );
        for (k, v) in labels {
            sample.labels.insert((*k).to_string(), (*v).to_string());
        }
        self.metrics.record(sample);
    }

    /// Cancel a task. Queued tasks are pulled from their partition;
    /// running tasks get their context token triggered and settle as
    /// cancelled when the agent yields.
    pub async fn cancel_task(&self, tenant_id: &str, task_id: &str) -> Result<Task> {
        let task = self.records.load(tenant_id, task_id).await?;
        match task.state {
            TaskState::Queued => {
                let key = (task.tenant_id.clone(), task.agent_kind);
                self.queue.remove(&key, task_id).await;
                self.records
                    .transition(task_id, TaskState::Cancelled, |t| {
                        t.error = Some(TaskFailure {
                            class: FailureClass::Cancelled,
                            message: "cancelled before dispatch".to_string(),
                            failed_at: t.updated_at,
                        });
                    })
                    .await
            }
            TaskState::Running => {
                if let Some(token) = self.running_tasks.lock().await.get(task_id) {
                    token.cancel();
                }
                Ok(task)
            }
            _ => Err(CoreError::conflict(format!(
                "task {task_id} is already terminal"
            ))),
        }
    }

    pub async fn control(&self, tenant_id: &str, kind: AgentKind, op: ControlOp) -> Result<()> {
        let agent = self
            .agents
            .get(&kind)
            .ok_or_else(|| CoreError::not_found(format!("agent {kind}")))?;
        let key = (tenant_id.to_string(), kind);
        self.statuses.apply_control(&key, op).await;
        agent.on_control(op).await;
        Ok(())
    }

    pub async fn agent_statuses(&self, tenant_id: &str) -> Vec<AgentDescriptor> {
        let snapshot = self.statuses.tenant_snapshot(tenant_id).await;
        let mut descriptors: Vec<AgentDescriptor> = snapshot
            .into_iter()
            .filter_map(|(kind, (state, metrics))| {
                self.agents.get(&kind).map(|agent| AgentDescriptor {
                    kind,
                    capabilities: agent.capabilities(),
                    state,
                    metrics,
                })
            })
            .collect();
        descriptors.sort_by_key(|d| d.kind);
        descriptors
    }

    pub async fn get_task(&self, tenant_id: &str, task_id: &str) -> Result<Task> {
        self.records.load(tenant_id, task_id).await
    }

    pub async fn queue_depth(&self, tenant_id: &str, kind: AgentKind) -> usize {
        self.queue.depth(&(tenant_id.to_string(), kind)).await
    }

    /// Retention pass: terminal tasks older than the window are removed.
    pub async fn prune_old_tasks(&self) -> Result<usize> {
        let cutoff = self.clock.now() - chrono::Duration::hours(constants::TASK_RETENTION_HOURS);
        self.records.prune_terminal_before(cutoff).await
    }

    /// Cancel workers and join them. Safe to call once at shutdown.
    pub async fn shutdown(&self) {
        info!("shutting down agent orchestrator");
        self.cancel.cancel();
        let workers: Vec<(QueueKey, JoinHandle<()>)> =
            self.workers.lock().await.drain().collect();
        for (key, handle) in workers {
            if let Err(e) = handle.await {
                warn!(tenant = %key.0, kind = %key.1, "worker join failed: {e}");
            }
        }
        info!("agent orchestrator shut down");
    }
}

fn backoff_delay(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(10);
    let base = constants::RETRY_BASE_MS
        .saturating_mul(u64::from(constants::RETRY_FACTOR).saturating_pow(exponent));
    let capped = base.min(constants::RETRY_CAP_MS);
    let jitter: f64 = rand::thread_rng().gen_range(-constants::RETRY_JITTER..=constants::RETRY_JITTER);
    Duration::from_millis(((capped as f64) * (1.0 + jitter)).max(1.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SystemClock, UuidSource};
    use crate::providers::{entry, Capability, LocalTemplateProvider, ModelProvider};
    use crate::store::MemoryStore;
    use crate::tenancy::{NewTenant, SubscriptionTier, TenantStore};
    use serde_json::json;

    async fn harness() -> (AgentOrchestrator, Tenant, CancellationToken) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids: Arc<dyn IdSource> = Arc::new(UuidSource);
        let tenants = Arc::new(TenantStore::new(store.clone(), clock.clone(), ids.clone()));
        let tenant = tenants
            .create_tenant(NewTenant {
                display_name: "Acme".to_string(),
                primary_domain: "acme.example".to_string(),
                branding: serde_json::Value::Null,
                subscription_tier: SubscriptionTier::Starter,
                feature_flags: vec![],
            })
            .await
            .unwrap();

        let registry = ModelRegistry::new(
            vec![
                entry(
                    "atlas",
                    "local",
                    &[Capability::Text, Capability::Reasoning, Capability::LongContext],
                    1.0,
                    true,
                ),
                entry("fallback", "local", &[Capability::Text], 0.1, true),
            ],
            vec![Arc::new(LocalTemplateProvider::new("local")) as Arc<dyn ModelProvider>],
            "fallback",
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let orchestrator = AgentOrchestrator::new(
            store,
            tenants,
            Arc::new(ResponseCache::new(1024, 1024 * 1024)),
            Arc::new(registry),
            MetricSink::disconnected(),
            clock,
            ids,
            cancel.clone(),
        );
        (orchestrator, tenant, cancel)
    }

    fn sales_payload() -> TaskPayload {
        TaskPayload::new("Qualify the Fenwick account")
            .with_input("operation", json!("qualify_lead"))
    }

    #[tokio::test]
    async fn submitted_task_is_durably_queued() {
        let (orchestrator, tenant, cancel) = harness().await;
        let task = orchestrator
            .submit_task(
                &tenant,
                "u-1",
                AgentKind::Sales,
                sales_payload(),
                Priority::Normal,
                None,
            )
            .await
            .unwrap();

        let stored = orchestrator.get_task(&tenant.id, &task.id).await.unwrap();
        assert!(matches!(
            stored.state,
            TaskState::Queued | TaskState::Running | TaskState::Succeeded
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn past_deadline_is_rejected_not_queued() {
        let (orchestrator, tenant, cancel) = harness().await;
        let err = orchestrator
            .submit_task(
                &tenant,
                "u-1",
                AgentKind::Sales,
                sales_payload(),
                Priority::Normal,
                Some(Utc::now() - chrono::Duration::seconds(5)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));

        let tasks = orchestrator
            .records()
            .list(&tenant.id, None, None, None)
            .await
            .unwrap();
        assert!(tasks.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn submitted_task_executes_to_success() {
        let (orchestrator, tenant, cancel) = harness().await;
        let task = orchestrator
            .submit_task(
                &tenant,
                "u-1",
                AgentKind::Sales,
                sales_payload(),
                Priority::Normal,
                None,
            )
            .await
            .unwrap();

        let mut state = TaskState::Queued;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            state = orchestrator.get_task(&tenant.id, &task.id).await.unwrap().state;
            if state.is_terminal() {
                break;
            }
        }
        assert_eq!(state, TaskState::Succeeded);

        let done = orchestrator.get_task(&tenant.id, &task.id).await.unwrap();
        assert_eq!(done.attempt_count, 1);
        assert!(done.result.is_some());
        cancel.cancel();
    }

    #[tokio::test]
    async fn paused_agent_stalls_without_draining() {
        let (orchestrator, tenant, cancel) = harness().await;
        orchestrator
            .control(&tenant.id, AgentKind::Content, ControlOp::Pause)
            .await
            .unwrap();

        let task = orchestrator
            .submit_task(
                &tenant,
                "u-1",
                AgentKind::Content,
                TaskPayload::new("Draft the launch email").with_input("format", json!("email")),
                Priority::Normal,
                None,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let stalled = orchestrator.get_task(&tenant.id, &task.id).await.unwrap();
        assert_eq!(stalled.state, TaskState::Queued);

        orchestrator
            .control(&tenant.id, AgentKind::Content, ControlOp::Resume)
            .await
            .unwrap();
        let mut state = TaskState::Queued;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            state = orchestrator.get_task(&tenant.id, &task.id).await.unwrap().state;
            if state.is_terminal() {
                break;
            }
        }
        assert_eq!(state, TaskState::Succeeded);
        cancel.cancel();
    }

    #[tokio::test]
    async fn queued_task_can_be_cancelled() {
        let (orchestrator, tenant, cancel) = harness().await;
        orchestrator
            .control(&tenant.id, AgentKind::Sales, ControlOp::Pause)
            .await
            .unwrap();

        let task = orchestrator
            .submit_task(
                &tenant,
                "u-1",
                AgentKind::Sales,
                sales_payload(),
                Priority::Normal,
                None,
            )
            .await
            .unwrap();

        let cancelled = orchestrator.cancel_task(&tenant.id, &task.id).await.unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);
        cancel.cancel();
    }

    #[tokio::test]
    async fn starter_tenant_is_limited_to_three_agent_kinds() {
        let (orchestrator, tenant, cancel) = harness().await;
        for kind in [AgentKind::Sales, AgentKind::Marketing, AgentKind::Content] {
            let payload = match kind {
                AgentKind::Content => {
                    TaskPayload::new("draft something").with_input("format", json!("email"))
                }
                AgentKind::Sales => sales_payload(),
                _ => TaskPayload::new("plan something"),
            };
            orchestrator
                .submit_task(&tenant, "u-1", kind, payload, Priority::Normal, None)
                .await
                .unwrap();
        }

        let err = orchestrator
            .submit_task(
                &tenant,
                "u-1",
                AgentKind::Operations,
                TaskPayload::new("onboard someone"),
                Priority::Normal,
                None,
            )
            .await
            .unwrap_err();
        match err {
            CoreError::QuotaExceeded { dimension, .. } => assert_eq!(dimension, "max_agents"),
            other => panic!("expected quota error, got {other:?}"),
        }
        cancel.cancel();
    }

    #[test]
    fn backoff_grows_and_respects_cap_and_jitter() {
        for attempts in 1..=6u32 {
            let nominal = (constants::RETRY_BASE_MS
                * u64::from(constants::RETRY_FACTOR).pow(attempts.saturating_sub(1).min(10)))
            .min(constants::RETRY_CAP_MS) as f64;
            let delay = backoff_delay(attempts).as_millis() as f64;
            assert!(delay >= nominal * (1.0 - constants::RETRY_JITTER) - 1.0);
            assert!(delay <= nominal * (1.0 + constants::RETRY_JITTER) + 1.0);
        }
    }
}

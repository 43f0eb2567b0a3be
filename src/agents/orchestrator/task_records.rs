use crate::{
    clock::Clock,
    models::{AgentKind, Task, TaskState},
    store::{collections, Filter, RecordStore, Sort, StoreError},
    CoreError, Result,
};
use std::sync::Arc;
use tracing::debug;

/// Durable task records in the `tasks` collection.
///
/// Enforces the state machine: a task enters exactly once (`Conflict` on
/// duplicate ids), transitions follow `queued -> running -> terminal` or
/// `queued -> cancelled`, and terminal records are immutable.
pub struct TaskRecords {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl TaskRecords {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Persist a fresh task. The durability boundary for submission:
    /// callers only report success after this returns.
    pub async fn insert(&self, task: &Task) -> Result<()> {
        if self.store.get(collections::TASKS, &task.id).await.is_ok() {
            return Err(CoreError::conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        self.store
            .put(collections::TASKS, &task.id, serde_json::to_value(task)?)
            .await?;
        Ok(())
    }

    /// Load a task scoped to a tenant. Cross-tenant ids read as absent.
    pub async fn load(&self, tenant_id: &str, task_id: &str) -> Result<Task> {
        let record = self
            .store
            .get(collections::TASKS, task_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => CoreError::not_found(format!("task {task_id}")),
                other => other.into(),
            })?;
        let task: Task = record.decode()?;
        if task.tenant_id != tenant_id {
            return Err(CoreError::not_found(format!("task {task_id}")));
        }
        Ok(task)
    }

    /// Apply a state transition with optimistic concurrency. `mutate` runs
    /// after the transition check so it can attach results or errors.
    pub async fn transition<F>(&self, task_id: &str, next: TaskState, mutate: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let record = self
            .store
            .get(collections::TASKS, task_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => CoreError::not_found(format!("task {task_id}")),
                other => other.into(),
            })?;
        let mut task: Task = record.decode()?;

        if !task.state.can_transition_to(next) {
            return Err(CoreError::conflict(format!(
                "task {task_id} cannot move {:?} -> {next:?}",
                task.state
            )));
        }

        task.state = next;
        task.updated_at = self.clock.now();
        mutate(&mut task);

        match self
            .store
            .update(
                collections::TASKS,
                task_id,
                record.version,
                serde_json::to_value(&task)?,
            )
            .await
        {
            Ok(_) => {
                debug!(task = %task_id, state = ?next, "task transitioned");
                Ok(task)
            }
            Err(StoreError::Conflict) => Err(CoreError::conflict(format!(
                "task {task_id} changed concurrently"
            ))),
            Err(other) => Err(other.into()),
        }
    }

    /// Hard-delete a record, used to compensate a submission that failed
    /// after the durable insert.
    pub async fn remove(&self, task_id: &str) -> Result<()> {
        self.store
            .delete(collections::TASKS, task_id)
            .await
            .map_err(Into::into)
    }

    pub async fn list(
        &self,
        tenant_id: &str,
        agent_kind: Option<AgentKind>,
        state: Option<TaskState>,
        limit: Option<usize>,
    ) -> Result<Vec<Task>> {
        let mut filter = Filter::new().eq("tenant_id", tenant_id);
        if let Some(kind) = agent_kind {
            filter = filter.eq("agent_kind", kind.as_str());
        }
        if let Some(state) = state {
            filter = filter.eq("state", serde_json::to_value(state)?);
        }
        let records = self
            .store
            .query(
                collections::TASKS,
                &filter,
                Sort::Asc("created_at".into()),
                limit,
            )
            .await?;
        records.iter().map(|r| Ok(r.decode()?)).collect()
    }

    /// Remove terminal tasks older than the cutoff; active tasks are never
    /// pruned.
    pub async fn prune_terminal_before(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<usize> {
        let records = self
            .store
            .query(
                collections::TASKS,
                &Filter::new().range(
                    "updated_at",
                    None,
                    Some(serde_json::json!(cutoff.to_rfc3339())),
                ),
                Sort::Unsorted,
                None,
            )
            .await?;

        let mut removed = 0;
        for record in records {
            let Ok(task) = record.decode::<Task>() else {
                continue;
            };
            if task.is_terminal() {
                if self.store.delete(collections::TASKS, &task.id).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::models::{Priority, TaskPayload};
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn records() -> TaskRecords {
        TaskRecords::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock))
    }

    fn task(id: &str) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            tenant_id: "t-1".to_string(),
            agent_kind: AgentKind::Sales,
            submitter: "u-1".to_string(),
            payload: TaskPayload::new("objective"),
            priority: Priority::Normal,
            created_at: now,
            updated_at: now,
            deadline: None,
            state: TaskState::Queued,
            attempt_count: 0,
            parent_id: None,
            collaboration_id: None,
            result: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let records = records();
        records.insert(&task("a")).await.unwrap();
        let err = records.insert(&task("a")).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn cross_tenant_load_reads_as_absent() {
        let records = records();
        records.insert(&task("a")).await.unwrap();

        let err = records.load("t-2", "a").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn terminal_tasks_are_immutable() {
        let records = records();
        records.insert(&task("a")).await.unwrap();
        records
            .transition("a", TaskState::Running, |t| t.attempt_count += 1)
            .await
            .unwrap();
        records
            .transition("a", TaskState::Succeeded, |_| {})
            .await
            .unwrap();

        let err = records
            .transition("a", TaskState::Running, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn queued_to_succeeded_is_illegal() {
        let records = records();
        records.insert(&task("a")).await.unwrap();
        let err = records
            .transition("a", TaskState::Succeeded, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn prune_removes_only_old_terminal_tasks() {
        let records = records();
        records.insert(&task("done")).await.unwrap();
        records
            .transition("done", TaskState::Running, |_| {})
            .await
            .unwrap();
        records
            .transition("done", TaskState::Succeeded, |_| {})
            .await
            .unwrap();
        records.insert(&task("active")).await.unwrap();

        let removed = records
            .prune_terminal_before(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(records.load("t-1", "active").await.is_ok());
    }
}

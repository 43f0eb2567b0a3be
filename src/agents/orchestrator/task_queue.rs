use crate::{
    models::{AgentKind, Task},
    CoreError, Result,
};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

/// Queue partition key: one FIFO per (tenant, agent kind).
pub type QueueKey = (String, AgentKind);

/// Priority FIFO per partition, ordered by `(-priority, created_at)`.
/// Single-writer/single-reader per partition: the submit path pushes, the
/// partition's dispatcher pops.
pub struct TaskQueue {
    queues: Mutex<HashMap<QueueKey, VecDeque<Task>>>,
    max_depth: usize,
}

impl TaskQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_depth,
        }
    }

    /// Insert keeping the partition ordered: behind every task of equal
    /// or higher priority, ahead of strictly lower ones.
    pub async fn enqueue(&self, task: Task) -> Result<usize> {
        let key = (task.tenant_id.clone(), task.agent_kind);
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(key).or_default();

        if queue.len() >= self.max_depth {
            return Err(CoreError::quota("queue_depth", 1));
        }

        let position = queue
            .iter()
            .position(|existing| existing.priority < task.priority)
            .unwrap_or(queue.len());
        debug!(task = %task.id, position, "task enqueued");
        queue.insert(position, task);
        Ok(position)
    }

    pub async fn dequeue(&self, key: &QueueKey) -> Option<Task> {
        let mut queues = self.queues.lock().await;
        queues.get_mut(key).and_then(|queue| queue.pop_front())
    }

    pub async fn depth(&self, key: &QueueKey) -> usize {
        let queues = self.queues.lock().await;
        queues.get(key).map(|q| q.len()).unwrap_or(0)
    }

    /// Pull a specific queued task out of its partition, for cancellation.
    pub async fn remove(&self, key: &QueueKey, task_id: &str) -> Option<Task> {
        let mut queues = self.queues.lock().await;
        let queue = queues.get_mut(key)?;
        let index = queue.iter().position(|t| t.id == task_id)?;
        queue.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, TaskPayload, TaskState};
    use chrono::Utc;

    fn task(id: &str, priority: Priority) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            tenant_id: "t-1".to_string(),
            agent_kind: AgentKind::Sales,
            submitter: "u-1".to_string(),
            payload: TaskPayload::new("objective"),
            priority,
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

    fn key() -> QueueKey {
        ("t-1".to_string(), AgentKind::Sales)
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first() {
        let queue = TaskQueue::new(16);
        queue.enqueue(task("low", Priority::Low)).await.unwrap();
        queue.enqueue(task("critical", Priority::Critical)).await.unwrap();
        queue.enqueue(task("normal", Priority::Normal)).await.unwrap();

        assert_eq!(queue.dequeue(&key()).await.unwrap().id, "critical");
        assert_eq!(queue.dequeue(&key()).await.unwrap().id, "normal");
        assert_eq!(queue.dequeue(&key()).await.unwrap().id, "low");
    }

    #[tokio::test]
    async fn equal_priority_preserves_submission_order() {
        let queue = TaskQueue::new(16);
        for id in ["first", "second", "third"] {
            queue.enqueue(task(id, Priority::Normal)).await.unwrap();
        }

        assert_eq!(queue.dequeue(&key()).await.unwrap().id, "first");
        assert_eq!(queue.dequeue(&key()).await.unwrap().id, "second");
        assert_eq!(queue.dequeue(&key()).await.unwrap().id, "third");
    }

    #[tokio::test]
    async fn partitions_are_isolated() {
        let queue = TaskQueue::new(16);
        queue.enqueue(task("a", Priority::Normal)).await.unwrap();
        let mut other = task("b", Priority::Normal);
        other.tenant_id = "t-2".to_string();
        queue.enqueue(other).await.unwrap();

        assert_eq!(queue.depth(&key()).await, 1);
        assert_eq!(queue.depth(&("t-2".to_string(), AgentKind::Sales)).await, 1);
    }

    #[tokio::test]
    async fn full_partition_rejects() {
        let queue = TaskQueue::new(2);
        queue.enqueue(task("a", Priority::Normal)).await.unwrap();
        queue.enqueue(task("b", Priority::Normal)).await.unwrap();
        let err = queue.enqueue(task("c", Priority::Normal)).await.unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn remove_pulls_queued_task() {
        let queue = TaskQueue::new(16);
        queue.enqueue(task("a", Priority::Normal)).await.unwrap();
        queue.enqueue(task("b", Priority::Normal)).await.unwrap();

        let removed = queue.remove(&key(), "a").await.unwrap();
        assert_eq!(removed.id, "a");
        assert_eq!(queue.depth(&key()).await, 1);
    }
}

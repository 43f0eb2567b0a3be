//! Collaboration coordinator.
//!
//! Multi-agent sessions: an orchestrating user initiates a collaboration,
//! appends steps (each backed by a regular task), and reads an aggregate
//! status derived from the child task states. The coordinator imposes no
//! ordering across steps; sequencing is the orchestrator's choice. A
//! failed step never auto-cancels its siblings.

use crate::{
    agents::AgentOrchestrator,
    clock::{Clock, IdSource},
    models::{AgentKind, Priority, Task, TaskPayload, TaskState},
    store::{collections, RecordStore, StoreError},
    tenancy::Tenant,
    CoreError, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationStatus {
    Pending,
    InProgress,
    Succeeded,
    Partial,
    Failed,
}

/// One step of the flow: which agent kind ran it and the task that backs
/// it. Tasks are referenced weakly by id; they never point back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabStep {
    pub agent_kind: AgentKind,
    pub task_id: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaboration {
    pub id: String,
    pub tenant_id: String,
    pub orchestrator_user: String,
    pub participants: Vec<AgentKind>,
    pub goal: String,
    #[serde(default)]
    pub steps: Vec<CollabStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct CollaborationCoordinator {
    store: Arc<dyn RecordStore>,
    orchestrator: AgentOrchestrator,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl CollaborationCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        orchestrator: AgentOrchestrator,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            clock,
            ids,
        }
    }

    pub async fn initiate(
        &self,
        tenant: &Tenant,
        orchestrator_user: &str,
        participants: Vec<AgentKind>,
        goal: String,
    ) -> Result<Collaboration> {
        if participants.is_empty() {
            return Err(CoreError::validation(
                "participants",
                "at least one agent kind is required",
            ));
        }
        if goal.trim().is_empty() {
            return Err(CoreError::validation("goal", "must not be empty"));
        }

        let now = self.clock.now();
        let collaboration = Collaboration {
            id: self.ids.next_id(),
            tenant_id: tenant.id.clone(),
            orchestrator_user: orchestrator_user.to_string(),
            participants,
            goal,
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.store
            .put(
                collections::COLLABORATIONS,
                &collaboration.id,
                serde_json::to_value(&collaboration)?,
            )
            .await?;
        info!(collab = %collaboration.id, tenant = %tenant.id, "collaboration initiated");
        Ok(collaboration)
    }

    async fn load_scoped(&self, tenant_id: &str, collab_id: &str) -> Result<(Collaboration, u64)> {
        let record = self
            .store
            .get(collections::COLLABORATIONS, collab_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => CoreError::not_found(format!("collaboration {collab_id}")),
                other => other.into(),
            })?;
        let collaboration: Collaboration = record.decode()?;
        if collaboration.tenant_id != tenant_id {
            return Err(CoreError::not_found(format!("collaboration {collab_id}")));
        }
        Ok((collaboration, record.version))
    }

    /// Append a step and submit its backing task. Does not wait for prior
    /// steps; the orchestrating user sequences by observing completions.
    pub async fn add_step(
        &self,
        tenant: &Tenant,
        collab_id: &str,
        agent_kind: AgentKind,
        payload: TaskPayload,
        submitter: &str,
    ) -> Result<Task> {
        let (collaboration, _) = self.load_scoped(&tenant.id, collab_id).await?;
        if !collaboration.participants.contains(&agent_kind) {
            return Err(CoreError::validation(
                "agent_kind",
                format!("`{agent_kind}` is not a participant of this collaboration"),
            ));
        }

        let task = self
            .orchestrator
            .submit_task_in_collaboration(
                tenant,
                submitter,
                agent_kind,
                payload,
                Priority::Normal,
                None,
                Some(collab_id.to_string()),
            )
            .await?;

        // Re-read + versioned append, retrying once around concurrent
        // add_step calls.
        for _ in 0..2 {
            let (mut current, version) = self.load_scoped(&tenant.id, collab_id).await?;
            current.steps.push(CollabStep {
                agent_kind,
                task_id: task.id.clone(),
                added_at: self.clock.now(),
            });
            current.updated_at = self.clock.now();
            match self
                .store
                .update(
                    collections::COLLABORATIONS,
                    collab_id,
                    version,
                    serde_json::to_value(&current)?,
                )
                .await
            {
                Ok(_) => return Ok(task),
                Err(StoreError::Conflict) => continue,
                Err(other) => return Err(other.into()),
            }
        }
        Err(CoreError::conflict(format!(
            "collaboration {collab_id} changed concurrently"
        )))
    }

    /// Delegation: one agent hands work to another kind, optionally inside
    /// an existing collaboration. The caller is permission-checked at the
    /// surface; here we only attribute the delegation.
    pub async fn delegate(
        &self,
        tenant: &Tenant,
        from_agent: AgentKind,
        to_agent: AgentKind,
        payload: TaskPayload,
        in_collab: Option<&str>,
        submitter: &str,
    ) -> Result<Task> {
        let attributed =
            payload.with_input("delegated_from", json!(from_agent.as_str()));
        match in_collab {
            Some(collab_id) => {
                self.add_step(tenant, collab_id, to_agent, attributed, submitter)
                    .await
            }
            None => {
                self.orchestrator
                    .submit_task(tenant, submitter, to_agent, attributed, Priority::Normal, None)
                    .await
            }
        }
    }

    /// Aggregate status over the child tasks. An empty flow is `Pending`,
    /// never an error.
    pub async fn status(
        &self,
        tenant_id: &str,
        collab_id: &str,
    ) -> Result<(Collaboration, CollaborationStatus)> {
        let (collaboration, _) = self.load_scoped(tenant_id, collab_id).await?;
        if collaboration.steps.is_empty() {
            return Ok((collaboration, CollaborationStatus::Pending));
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut active = 0usize;
        for step in &collaboration.steps {
            match self
                .orchestrator
                .get_task(tenant_id, &step.task_id)
                .await
            {
                Ok(task) => match task.state {
                    TaskState::Succeeded => succeeded += 1,
                    TaskState::Failed | TaskState::Cancelled => failed += 1,
                    TaskState::Queued | TaskState::Running => active += 1,
                },
                // A pruned or missing child counts as failed rather than
                // erroring the aggregate.
                Err(_) => failed += 1,
            }
        }

        let status = if active > 0 {
            CollaborationStatus::InProgress
        } else if failed > 0 && succeeded > 0 {
            CollaborationStatus::Partial
        } else if failed > 0 {
            CollaborationStatus::Failed
        } else {
            CollaborationStatus::Succeeded
        };
        Ok((collaboration, status))
    }
}

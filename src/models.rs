use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};

/// The fixed set of domain agents the control plane ships with.
///
/// Every task is addressed to exactly one kind; each tenant owns one
/// logical agent per kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Sales,
    Marketing,
    Content,
    Analytics,
    Operations,
}

impl AgentKind {
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Sales,
        AgentKind::Marketing,
        AgentKind::Content,
        AgentKind::Analytics,
        AgentKind::Operations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Sales => "sales",
            AgentKind::Marketing => "marketing",
            AgentKind::Content => "content",
            AgentKind::Analytics => "analytics",
            AgentKind::Operations => "operations",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sales" => Ok(AgentKind::Sales),
            "marketing" => Ok(AgentKind::Marketing),
            "content" => Ok(AgentKind::Content),
            "analytics" => Ok(AgentKind::Analytics),
            "operations" => Ok(AgentKind::Operations),
            _ => Err(format!("unknown agent kind: {s}")),
        }
    }
}

/// Task priority. Higher priorities dispatch first; ties break by
/// submission time.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Task lifecycle states.
///
/// Legal transitions are `queued -> running -> (succeeded | failed |
/// cancelled)` and `queued -> cancelled`. Terminal states are immutable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Queued, TaskState::Running)
                | (TaskState::Queued, TaskState::Cancelled)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::Failed)
                | (TaskState::Running, TaskState::Cancelled)
        )
    }
}

/// Kind-specific work description. `objective` is free text; `inputs`
/// carries structured fields each agent interprets for itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskPayload {
    pub objective: String,
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
}

impl TaskPayload {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            inputs: HashMap::new(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).and_then(|v| v.as_str())
    }
}

/// How a failed task failed. Drives the dispatcher's retry decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub class: FailureClass,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

/// Structured result of a successful task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub content: String,
    pub model_used: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub completed_at: DateTime<Utc>,
}

/// The fundamental unit of agent work.
///
/// Retries never mutate a terminal task; the dispatcher creates a fresh
/// task linked through `parent_id` and carries the attempt count forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub tenant_id: String,
    pub agent_kind: AgentKind,
    pub submitter: String,
    pub payload: TaskPayload,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    pub state: TaskState,
    pub attempt_count: u32,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub collaboration_id: Option<String>,
    #[serde(default)]
    pub result: Option<TaskOutput>,
    #[serde(default)]
    pub error: Option<TaskFailure>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Agent availability as reported through the status endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Busy,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentMetrics {
    pub completed: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
}

/// Snapshot of one tenant's agent of a given kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub kind: AgentKind,
    pub capabilities: Vec<String>,
    pub state: AgentState,
    pub metrics: AgentMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_kind_round_trips_through_str() {
        for kind in AgentKind::ALL {
            assert_eq!(kind.as_str().parse::<AgentKind>().unwrap(), kind);
        }
        assert!("janitor".parse::<AgentKind>().is_err());
    }

    #[test]
    fn priority_orders_low_to_critical() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn terminal_states_accept_no_transition() {
        for terminal in [TaskState::Succeeded, TaskState::Failed, TaskState::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                TaskState::Queued,
                TaskState::Running,
                TaskState::Succeeded,
                TaskState::Failed,
                TaskState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn queued_may_cancel_without_running() {
        assert!(TaskState::Queued.can_transition_to(TaskState::Cancelled));
        assert!(!TaskState::Queued.can_transition_to(TaskState::Succeeded));
    }
}

use super::task_queue::QueueKey;
use crate::{
    models::{AgentKind, AgentMetrics, AgentState},
    agents::ControlOp,
};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Control-plane state of one (tenant, kind) agent, independent of the
/// in-flight task count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlState {
    Active,
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
struct StatusEntry {
    control: ControlState,
    running: u32,
    completed: u64,
    failed: u64,
    avg_latency_ms: f64,
}

impl Default for StatusEntry {
    fn default() -> Self {
        Self {
            control: ControlState::Active,
            running: 0,
            completed: 0,
            failed: 0,
            avg_latency_ms: 0.0,
        }
    }
}

impl StatusEntry {
    fn state(&self) -> AgentState {
        match self.control {
            ControlState::Paused => AgentState::Paused,
            ControlState::Stopped => AgentState::Stopped,
            ControlState::Active if self.running > 0 => AgentState::Busy,
            ControlState::Active => AgentState::Idle,
        }
    }
}

/// Tracks per (tenant, kind) agent state and metrics. The agent identity
/// survives reset: only the metrics are zeroed.
pub struct StatusManager {
    entries: RwLock<HashMap<QueueKey, StatusEntry>>,
}

impl StatusManager {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// True when the partition may take another task.
    pub async fn can_dispatch(&self, key: &QueueKey, max_concurrent: u32) -> bool {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) => entry.control == ControlState::Active && entry.running < max_concurrent,
            None => true,
        }
    }

    pub async fn apply_control(&self, key: &QueueKey, op: ControlOp) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_default();
        match op {
            ControlOp::Pause => entry.control = ControlState::Paused,
            ControlOp::Resume => entry.control = ControlState::Active,
            ControlOp::Reset => {
                // Queued tasks stay queued; identity is preserved.
                entry.completed = 0;
                entry.failed = 0;
                entry.avg_latency_ms = 0.0;
            }
        }
        info!(tenant = %key.0, kind = %key.1, op = ?op, "agent control applied");
    }

    pub async fn mark_stopped(&self, key: &QueueKey) {
        let mut entries = self.entries.write().await;
        entries.entry(key.clone()).or_default().control = ControlState::Stopped;
    }

    pub async fn inc_running(&self, key: &QueueKey) {
        let mut entries = self.entries.write().await;
        entries.entry(key.clone()).or_default().running += 1;
    }

    pub async fn dec_running(&self, key: &QueueKey) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.running = entry.running.saturating_sub(1);
        }
    }

    pub async fn record_completion(&self, key: &QueueKey, latency_ms: f64) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_default();
        entry.completed += 1;
        entry.avg_latency_ms = (entry.avg_latency_ms * (entry.completed - 1) as f64 + latency_ms)
            / entry.completed as f64;
        debug!(tenant = %key.0, kind = %key.1, latency_ms, "task completion recorded");
    }

    pub async fn record_failure(&self, key: &QueueKey) {
        let mut entries = self.entries.write().await;
        entries.entry(key.clone()).or_default().failed += 1;
    }

    pub async fn state(&self, key: &QueueKey) -> AgentState {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|e| e.state())
            .unwrap_or(AgentState::Idle)
    }

    pub async fn metrics(&self, key: &QueueKey) -> AgentMetrics {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|e| AgentMetrics {
                completed: e.completed,
                failed: e.failed,
                avg_latency_ms: e.avg_latency_ms,
            })
            .unwrap_or_default()
    }

    pub async fn tenant_snapshot(&self, tenant_id: &str) -> HashMap<AgentKind, (AgentState, AgentMetrics)> {
        let entries = self.entries.read().await;
        AgentKind::ALL
            .iter()
            .map(|kind| {
                let key = (tenant_id.to_string(), *kind);
                let (state, metrics) = entries
                    .get(&key)
                    .map(|e| {
                        (
                            e.state(),
                            AgentMetrics {
                                completed: e.completed,
                                failed: e.failed,
                                avg_latency_ms: e.avg_latency_ms,
                            },
                        )
                    })
                    .unwrap_or((AgentState::Idle, AgentMetrics::default()));
                (*kind, (state, metrics))
            })
            .collect()
    }
}

impl Default for StatusManager {
    fn default() -> Self {
        Self::new()
    }
}

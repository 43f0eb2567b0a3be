//! Agent framework.
//!
//! Agents are pure stateless workers behind a uniform contract: they
//! receive a task and a context, compose prompts, call the model registry
//! through the context (which walks fallback chains and honours
//! cancellation), and return a structured result. They never touch the
//! queue or persistence directly.

pub mod analytics;
pub mod content;
pub mod marketing;
pub mod operations;
pub mod orchestrator;
pub mod sales;

pub use orchestrator::AgentOrchestrator;

use crate::{
    cache::ResponseCache,
    clock::Clock,
    constants,
    models::{AgentDescriptor, AgentKind, AgentMetrics, AgentState, FailureClass, Task, TaskOutput, TaskPayload},
    providers::{
        Capability, InvokeOptions, ModelEntry, ModelRegistry, ProviderError, ProviderResponse,
        RegistrySnapshot,
    },
    telemetry::{metric, MetricSample, MetricSink},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Control operations the orchestrator can apply to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOp {
    Pause,
    Resume,
    Reset,
}

impl FromStr for ControlOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(ControlOp::Pause),
            "resume" => Ok(ControlOp::Resume),
            "reset" => Ok(ControlOp::Reset),
            _ => Err(format!("unknown control op: {s}")),
        }
    }
}

/// Errors surfaced by `Agent::handle`. The dispatcher classifies them to
/// decide between retry, terminal failure, and cancellation.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("provider failure: {0}")]
    Provider(#[from] ProviderError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("cancelled")]
    Cancelled,

    #[error("agent failure: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn classify(&self) -> FailureClass {
        match self {
            AgentError::Provider(e) if e.falls_back() => FailureClass::Transient,
            AgentError::Provider(_) => FailureClass::Permanent,
            AgentError::InvalidPayload(_) => FailureClass::Permanent,
            AgentError::Internal(_) => FailureClass::Permanent,
            AgentError::Cancelled => FailureClass::Cancelled,
        }
    }
}

/// Everything an agent may touch while handling a task.
#[derive(Clone)]
pub struct AgentContext {
    pub tenant_id: String,
    pub cancel: CancellationToken,
    pub deadline: Option<DateTime<Utc>>,
    pub cache: Arc<ResponseCache>,
    /// The tenant tier's cache-entry allowance; memoisation stops (reads
    /// still hit) once the tenant reaches it.
    pub cache_entry_quota: u64,
    pub registry: Arc<ModelRegistry>,
    pub metrics: MetricSink,
    pub clock: Arc<dyn Clock>,
}

/// Result of a (possibly cached) model completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub model_used: String,
    pub from_cache: bool,
    pub fallbacks: u32,
}

impl AgentContext {
    /// Cancellation checkpoint; agents call this between provider calls.
    pub fn ensure_live(&self) -> Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    /// Fingerprint for an idempotent sub-result: tenant first, then agent
    /// kind, then a hash over the payload and the model chain identity.
    pub fn cache_key(&self, kind: AgentKind, payload: &TaskPayload, chain: &[ModelEntry]) -> String {
        let mut hasher = DefaultHasher::new();
        payload.objective.hash(&mut hasher);
        let mut inputs: Vec<_> = payload.inputs.iter().collect();
        inputs.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in inputs {
            key.hash(&mut hasher);
            value.to_string().hash(&mut hasher);
        }
        RegistrySnapshot::chain_id(chain).hash(&mut hasher);
        format!("{}:{}:{:016x}", self.tenant_id, kind, hasher.finish())
    }

    /// Walk a fallback chain. `Unavailable`/`Timeout` advance to the next
    /// entry and record a fallback sample; other failures propagate.
    pub async fn invoke_chain(
        &self,
        kind: AgentKind,
        chain: &[ModelEntry],
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<(ProviderResponse, String, u32), AgentError> {
        if chain.is_empty() {
            return Err(AgentError::Internal("empty model chain".to_string()));
        }

        let mut fallbacks = 0u32;
        for (index, entry) in chain.iter().enumerate() {
            self.ensure_live()?;

            let attempt = tokio::select! {
                result = self.registry.invoke_entry(entry, prompt, options) => result,
                _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            };

            match attempt {
                Ok(response) => return Ok((response, entry.name.clone(), fallbacks)),
                Err(e) if e.falls_back() && index + 1 < chain.len() => {
                    let next = &chain[index + 1];
                    debug!(from = %entry.name, to = %next.name, "provider fallback");
                    let mut sample = MetricSample {
                        timestamp: self.clock.now(),
                        tenant_id: self.tenant_id.clone(),
                        agent_kind: Some(kind),
                        name: metric::PROVIDER_FALLBACK.to_string(),
                        value: 1.0,
                        labels: Default::default(),
                    };
                    sample.labels.insert("from".to_string(), entry.name.clone());
                    sample.labels.insert("to".to_string(), next.name.clone());
                    self.metrics.record(sample);
                    fallbacks += 1;
                }
                Err(e) => return Err(AgentError::Provider(e)),
            }
        }
        unreachable!("chain walk returns before exhausting entries");
    }

    /// Cache-aware completion: select a chain for `required`, look up the
    /// fingerprint, invoke on miss, memoise the result.
    pub async fn complete(
        &self,
        kind: AgentKind,
        required: Capability,
        preferences: &[String],
        payload: &TaskPayload,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<Completion, AgentError> {
        let snapshot = self.registry.snapshot();
        let chain = snapshot.select_chain(required, preferences);
        let key = self.cache_key(kind, payload, &chain);

        if let Some(cached) = self.cache.get(&key) {
            let content = cached["content"].as_str().unwrap_or_default().to_string();
            let model_used = cached["model_used"].as_str().unwrap_or_default().to_string();
            return Ok(Completion {
                content,
                model_used,
                from_cache: true,
                fallbacks: 0,
            });
        }

        let (response, model_used, fallbacks) =
            self.invoke_chain(kind, &chain, prompt, options).await?;
        if self.cache.entries_for(&self.tenant_id) < self.cache_entry_quota {
            self.cache.put(
                &key,
                json!({"content": response.content, "model_used": model_used}),
                Duration::from_secs(constants::AGENT_CACHE_TTL_SECS),
            );
        }

        Ok(Completion {
            content: response.content,
            model_used,
            from_cache: false,
            fallbacks,
        })
    }

    /// Assemble the standard output record agents return.
    pub fn output(&self, completion: Completion, extra: &[(&str, String)]) -> TaskOutput {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("from_cache".to_string(), completion.from_cache.to_string());
        metadata.insert("fallbacks".to_string(), completion.fallbacks.to_string());
        for (key, value) in extra {
            metadata.insert((*key).to_string(), value.clone());
        }
        TaskOutput {
            content: completion.content,
            model_used: completion.model_used,
            metadata,
            completed_at: self.clock.now(),
        }
    }
}

/// Uniform agent contract.
#[async_trait]
pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Human-readable capability labels for the status surface.
    fn capabilities(&self) -> Vec<String>;

    fn describe(&self) -> AgentDescriptor {
        AgentDescriptor {
            kind: self.kind(),
            capabilities: self.capabilities(),
            state: AgentState::Idle,
            metrics: AgentMetrics::default(),
        }
    }

    async fn handle(&self, task: &Task, ctx: &AgentContext) -> Result<TaskOutput, AgentError>;

    /// Agents are stateless, so the default control handler is a no-op;
    /// the orchestrator tracks pause/resume/reset state.
    async fn on_control(&self, _op: ControlOp) {}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_ops_parse() {
        assert_eq!("pause".parse::<ControlOp>().unwrap(), ControlOp::Pause);
        assert_eq!("resume".parse::<ControlOp>().unwrap(), ControlOp::Resume);
        assert_eq!("reset".parse::<ControlOp>().unwrap(), ControlOp::Reset);
        assert!("drain".parse::<ControlOp>().is_err());
    }

    #[test]
    fn classification_follows_provider_error_kind() {
        assert_eq!(
            AgentError::Provider(ProviderError::Timeout).classify(),
            FailureClass::Transient
        );
        assert_eq!(
            AgentError::Provider(ProviderError::Unavailable("down".into())).classify(),
            FailureClass::Transient
        );
        assert_eq!(
            AgentError::Provider(ProviderError::Rejected("bad".into())).classify(),
            FailureClass::Permanent
        );
        assert_eq!(
            AgentError::Provider(ProviderError::Fatal("broken".into())).classify(),
            FailureClass::Permanent
        );
        assert_eq!(
            AgentError::InvalidPayload("missing".into()).classify(),
            FailureClass::Permanent
        );
        assert_eq!(AgentError::Cancelled.classify(), FailureClass::Cancelled);
    }
}

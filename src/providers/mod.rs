//! Model provider registry.
//!
//! A catalogue of model entries keyed by capability tags, plus the
//! provider trait each backend implements. Selection returns an ordered
//! fallback chain that always terminates in the safe default entry;
//! callers walk the chain on `Unavailable`/`Timeout` and propagate
//! everything else.

mod http;
mod local;

pub use http::HttpModelProvider;
pub use local::LocalTemplateProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, RwLock},
};
use thiserror::Error;

/// What a model entry can do.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    Vision,
    Reasoning,
    Code,
    Multimodal,
    LongContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    pub provider_id: String,
    pub capabilities: BTreeSet<Capability>,
    pub context_window: u32,
    pub cost_weight: f32,
    pub available: bool,
}

impl ModelEntry {
    pub fn satisfies(&self, required: Capability) -> bool {
        self.capabilities.contains(&required)
    }
}

/// Provider invocation failures.
///
/// `Unavailable` and `Timeout` permit walking to the next chain entry;
/// `Rejected`, `QuotaExceeded`, and `Fatal` propagate to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("provider quota exceeded")]
    QuotaExceeded,

    #[error("provider timed out")]
    Timeout,

    #[error("fatal provider failure: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn falls_back(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_) | ProviderError::Timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub struct InvokeOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
        }
    }
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn invoke(
        &self,
        entry: &ModelEntry,
        prompt: &str,
        options: &InvokeOptions,
    ) -> std::result::Result<ProviderResponse, ProviderError>;
}

/// Immutable view of the catalogue at one point in time. Selection over a
/// snapshot is deterministic.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    entries: Vec<ModelEntry>,
    safe_default: String,
}

impl RegistrySnapshot {
    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Ordered fallback chain for `required`: preferred entries first (in
    /// the caller's order), then remaining satisfying entries by ascending
    /// cost weight, with the safe default always last.
    pub fn select_chain(&self, required: Capability, preferences: &[String]) -> Vec<ModelEntry> {
        let mut chain: Vec<ModelEntry> = Vec::new();

        for name in preferences {
            if let Some(entry) = self.entry(name) {
                if entry.available && entry.satisfies(required) && !chain.contains(entry) {
                    chain.push(entry.clone());
                }
            }
        }

        let mut rest: Vec<&ModelEntry> = self
            .entries
            .iter()
            .filter(|e| {
                e.available
                    && e.satisfies(required)
                    && e.name != self.safe_default
                    && !chain.iter().any(|c| c.name == e.name)
            })
            .collect();
        rest.sort_by(|a, b| {
            a.cost_weight
                .partial_cmp(&b.cost_weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        chain.extend(rest.into_iter().cloned());

        if !chain.iter().any(|e| e.name == self.safe_default) {
            if let Some(default) = self.entry(&self.safe_default) {
                chain.push(default.clone());
            }
        }
        chain
    }

    /// Stable identifier for a chain, used in cache fingerprints.
    pub fn chain_id(chain: &[ModelEntry]) -> String {
        chain
            .iter()
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
            .join(">")
    }
}

/// The registry proper. Read-mostly: reads clone an `Arc` snapshot,
/// availability updates replace the whole snapshot (copy-on-write).
pub struct ModelRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    providers: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ModelRegistry {
    pub fn new(
        entries: Vec<ModelEntry>,
        providers: Vec<Arc<dyn ModelProvider>>,
        safe_default: impl Into<String>,
    ) -> crate::Result<Self> {
        let safe_default = safe_default.into();
        let providers: HashMap<String, Arc<dyn ModelProvider>> = providers
            .into_iter()
            .map(|p| (p.id().to_string(), p))
            .collect();

        let default_entry = entries
            .iter()
            .find(|e| e.name == safe_default)
            .ok_or_else(|| {
                crate::CoreError::Configuration(format!(
                    "safe default model `{safe_default}` is not in the catalogue"
                ))
            })?;
        if !default_entry.available {
            return Err(crate::CoreError::Configuration(format!(
                "safe default model `{safe_default}` must be flagged available"
            )));
        }
        for entry in &entries {
            if !providers.contains_key(&entry.provider_id) {
                return Err(crate::CoreError::Configuration(format!(
                    "model `{}` references unknown provider `{}`",
                    entry.name, entry.provider_id
                )));
            }
        }

        Ok(Self {
            snapshot: RwLock::new(Arc::new(RegistrySnapshot {
                entries,
                safe_default,
            })),
            providers,
        })
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Flip one entry's availability. Readers holding the previous
    /// snapshot are unaffected.
    pub fn set_availability(&self, name: &str, available: bool) {
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = (**guard).clone();
        if let Some(entry) = next.entries.iter_mut().find(|e| e.name == name) {
            entry.available = available;
            *guard = Arc::new(next);
        }
    }

    /// Invoke a single entry through its provider. Chain walking is the
    /// caller's responsibility.
    pub async fn invoke_entry(
        &self,
        entry: &ModelEntry,
        prompt: &str,
        options: &InvokeOptions,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let provider = self.providers.get(&entry.provider_id).ok_or_else(|| {
            ProviderError::Fatal(format!("no provider registered as `{}`", entry.provider_id))
        })?;
        provider.invoke(entry, prompt, options).await
    }
}

#[cfg(test)]
pub(crate) fn entry(
    name: &str,
    provider_id: &str,
    capabilities: &[Capability],
    cost_weight: f32,
    available: bool,
) -> ModelEntry {
    ModelEntry {
        name: name.to_string(),
        provider_id: provider_id.to_string(),
        capabilities: capabilities.iter().copied().collect(),
        context_window: 32_768,
        cost_weight,
        available,
    }
}

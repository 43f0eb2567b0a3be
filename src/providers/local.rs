use super::{InvokeOptions, ModelEntry, ModelProvider, ProviderError, ProviderResponse, Usage};
use async_trait::async_trait;

/// The always-available tail of every fallback chain.
///
/// Produces a deterministic, clearly-labelled template answer from the
/// prompt itself. It never fails, which is what makes the "chain ends in
/// a safe default" guarantee hold.
pub struct LocalTemplateProvider {
    id: String,
}

impl LocalTemplateProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl ModelProvider for LocalTemplateProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        entry: &ModelEntry,
        prompt: &str,
        options: &InvokeOptions,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let excerpt: String = prompt.chars().take(240).collect();
        let content = format!(
            "[degraded response from {}] The request could not reach a full-capability \
             model. Summary of the request: {excerpt}",
            entry.name
        );
        let completion_tokens = (content.len() / 4).min(options.max_tokens as usize) as u32;

        Ok(ProviderResponse {
            content,
            usage: Usage {
                prompt_tokens: (prompt.len() / 4) as u32,
                completion_tokens,
            },
        })
    }
}

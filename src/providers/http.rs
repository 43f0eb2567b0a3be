use super::{InvokeOptions, ModelEntry, ModelProvider, ProviderError, ProviderResponse, Usage};
use crate::config::ProviderConfig;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Remote model backend speaking a generic JSON completion protocol.
///
/// Provider-specific failures that testing showed to be catalogue drift
/// (model not found, parameter unsupported) map to `Unavailable` so the
/// caller degrades along the chain instead of surfacing provider detail.
pub struct HttpModelProvider {
    id: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    content: String,
    #[serde(default)]
    usage: UsageBody,
}

#[derive(Debug, Deserialize, Default)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl HttpModelProvider {
    pub fn new(id: impl Into<String>, config: &ProviderConfig) -> crate::Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            crate::CoreError::Configuration(
                "HTTP provider requires MERIDIAN_PROVIDER_API_KEY".to_string(),
            )
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(crate::CoreError::ProviderTransport)?;

        Ok(Self {
            id: id.into(),
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ModelProvider for HttpModelProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        entry: &ModelEntry,
        prompt: &str,
        options: &InvokeOptions,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let url = format!("{}/v1/completions", self.base_url);
        debug!(model = %entry.name, "invoking remote model");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": entry.name,
                "prompt": prompt,
                "max_tokens": options.max_tokens,
                "temperature": options.temperature,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Unavailable(format!("transport failure: {e}"))
                }
            })?;

        let status = response.status();
        match status.as_u16() {
            200 => {
                let body: CompletionBody = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::Fatal(format!("malformed response body: {e}")))?;
                Ok(ProviderResponse {
                    content: body.content,
                    usage: Usage {
                        prompt_tokens: body.usage.prompt_tokens,
                        completion_tokens: body.usage.completion_tokens,
                    },
                })
            }
            400 => Err(ProviderError::Rejected(
                "request failed upstream validation".to_string(),
            )),
            // Catalogue drift: the model or one of its parameters is not
            // served here right now. Degrade, don't surface.
            404 | 422 => {
                warn!(model = %entry.name, status = %status, "model rejected by provider, treating as unavailable");
                Err(ProviderError::Unavailable(format!(
                    "model `{}` not served",
                    entry.name
                )))
            }
            408 | 504 => Err(ProviderError::Timeout),
            429 => Err(ProviderError::QuotaExceeded),
            500..=599 => Err(ProviderError::Unavailable(format!(
                "upstream error {status}"
            ))),
            _ => Err(ProviderError::Fatal(format!(
                "unexpected provider status {status}"
            ))),
        }
    }
}

use super::{Agent, AgentContext, AgentError};
use crate::{
    models::{AgentKind, Task, TaskOutput},
    providers::{Capability, InvokeOptions},
};
use async_trait::async_trait;

const SUPPORTED_FORMATS: &[&str] = &["blog_post", "email", "landing_page", "social_post", "whitepaper"];

/// Content agent: drafting across a fixed set of formats. Long formats
/// route through the long-context capability.
pub struct ContentAgent {
    preferences: Vec<String>,
}

impl ContentAgent {
    pub fn new(preferences: Vec<String>) -> Self {
        Self { preferences }
    }
}

#[async_trait]
impl Agent for ContentAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Content
    }

    fn capabilities(&self) -> Vec<String> {
        SUPPORTED_FORMATS.iter().map(|f| format!("draft_{f}")).collect()
    }

    async fn handle(&self, task: &Task, ctx: &AgentContext) -> Result<TaskOutput, AgentError> {
        let format = task.payload.input_str("format").unwrap_or("blog_post");
        if !SUPPORTED_FORMATS.contains(&format) {
            return Err(AgentError::InvalidPayload(format!(
                "unsupported content format `{format}`"
            )));
        }
        ctx.ensure_live()?;

        let tone = task.payload.input_str("tone").unwrap_or("clear and direct");
        let prompt = format!(
            "Draft a {format} in a {tone} tone.\nBrief: {}",
            task.payload.objective
        );
        let required = if format == "whitepaper" {
            Capability::LongContext
        } else {
            Capability::Text
        };
        let options = InvokeOptions {
            max_tokens: if format == "whitepaper" { 4096 } else { 1024 },
            ..InvokeOptions::default()
        };

        let completion = ctx
            .complete(
                self.kind(),
                required,
                &self.preferences,
                &task.payload,
                &prompt,
                &options,
            )
            .await?;

        Ok(ctx.output(completion, &[("format", format.to_string())]))
    }
}

use super::{Agent, AgentContext, AgentError};
use crate::{
    models::{AgentKind, Task, TaskOutput},
    providers::{Capability, InvokeOptions},
};
use async_trait::async_trait;

/// Marketing agent: campaign planning and channel mix recommendations.
pub struct MarketingAgent {
    preferences: Vec<String>,
}

impl MarketingAgent {
    pub fn new(preferences: Vec<String>) -> Self {
        Self { preferences }
    }
}

#[async_trait]
impl Agent for MarketingAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Marketing
    }

    fn capabilities(&self) -> Vec<String> {
        vec![
            "campaign_planning".to_string(),
            "channel_mix".to_string(),
        ]
    }

    async fn handle(&self, task: &Task, ctx: &AgentContext) -> Result<TaskOutput, AgentError> {
        ctx.ensure_live()?;

        let audience = task.payload.input_str("audience").unwrap_or("the target audience");
        let budget = task.payload.input_str("budget").unwrap_or("an unspecified budget");
        let prompt = format!(
            "Plan a marketing campaign. Goal: {}\nAudience: {audience}\nBudget: {budget}\n\
             Recommend a channel mix with rough budget split and a launch sequence.",
            task.payload.objective
        );

        let completion = ctx
            .complete(
                self.kind(),
                Capability::Text,
                &self.preferences,
                &task.payload,
                &prompt,
                &InvokeOptions::default(),
            )
            .await?;

        Ok(ctx.output(completion, &[]))
    }
}

use super::{Agent, AgentContext, AgentError};
use crate::{
    models::{AgentKind, Task, TaskOutput},
    providers::{Capability, InvokeOptions},
};
use async_trait::async_trait;

/// Analytics agent: shapes reports from supplied numeric inputs.
///
/// Requires a `series` input holding an array of numbers; the agent
/// computes the descriptive statistics itself and asks the model only for
/// the narrative.
pub struct AnalyticsAgent {
    preferences: Vec<String>,
}

impl AnalyticsAgent {
    pub fn new(preferences: Vec<String>) -> Self {
        Self { preferences }
    }

    fn extract_series(task: &Task) -> Result<Vec<f64>, AgentError> {
        let series = task
            .payload
            .inputs
            .get("series")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                AgentError::InvalidPayload("`series` input with numeric values is required".into())
            })?;
        let numbers: Vec<f64> = series.iter().filter_map(|v| v.as_f64()).collect();
        if numbers.len() != series.len() || numbers.is_empty() {
            return Err(AgentError::InvalidPayload(
                "`series` must be a non-empty array of numbers".into(),
            ));
        }
        Ok(numbers)
    }

    fn describe(numbers: &[f64]) -> (f64, f64, f64, f64) {
        let sum: f64 = numbers.iter().sum();
        let mean = sum / numbers.len() as f64;
        let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
        let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (sum, mean, min, max)
    }
}

#[async_trait]
impl Agent for AnalyticsAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Analytics
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["report_shaping".to_string(), "trend_narrative".to_string()]
    }

    async fn handle(&self, task: &Task, ctx: &AgentContext) -> Result<TaskOutput, AgentError> {
        let numbers = Self::extract_series(task)?;
        ctx.ensure_live()?;

        let (sum, mean, min, max) = Self::describe(&numbers);
        let metric_name = task.payload.input_str("metric").unwrap_or("the metric");
        let prompt = format!(
            "Write a short analytical report on {metric_name}.\nGoal: {}\n\
             Observations: n={}, sum={sum:.2}, mean={mean:.2}, min={min:.2}, max={max:.2}.\n\
             Focus on what changed and what to watch next.",
            task.payload.objective,
            numbers.len(),
        );

        let completion = ctx
            .complete(
                self.kind(),
                Capability::Reasoning,
                &self.preferences,
                &task.payload,
                &prompt,
                &InvokeOptions::default(),
            )
            .await?;

        Ok(ctx.output(
            completion,
            &[
                ("sample_count", numbers.len().to_string()),
                ("mean", format!("{mean:.4}")),
            ],
        ))
    }
}

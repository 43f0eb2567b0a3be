use super::{Agent, AgentContext, AgentError};
use crate::{
    models::{AgentKind, Task, TaskOutput, TaskPayload},
    providers::{Capability, InvokeOptions},
};
use async_trait::async_trait;

/// Operations agent: workflow automation descriptors, invoice processing,
/// client onboarding plans.
pub struct OperationsAgent {
    preferences: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpsOperation {
    WorkflowDescriptor,
    InvoiceProcessing,
    ClientOnboarding,
}

impl OpsOperation {
    fn parse(payload: &TaskPayload) -> Result<Self, AgentError> {
        match payload.input_str("operation").unwrap_or("workflow") {
            "workflow" => Ok(OpsOperation::WorkflowDescriptor),
            "invoice" => Ok(OpsOperation::InvoiceProcessing),
            "onboarding" => Ok(OpsOperation::ClientOnboarding),
            other => Err(AgentError::InvalidPayload(format!(
                "unknown operations task `{other}`"
            ))),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            OpsOperation::WorkflowDescriptor => "workflow",
            OpsOperation::InvoiceProcessing => "invoice",
            OpsOperation::ClientOnboarding => "onboarding",
        }
    }
}

impl OperationsAgent {
    pub fn new(preferences: Vec<String>) -> Self {
        Self { preferences }
    }

    fn compose_prompt(operation: OpsOperation, payload: &TaskPayload) -> String {
        match operation {
            OpsOperation::WorkflowDescriptor => format!(
                "Produce a step-by-step workflow automation descriptor (trigger, steps, \
                 owners, failure handling) for: {}",
                payload.objective
            ),
            OpsOperation::InvoiceProcessing => {
                let vendor = payload.input_str("vendor").unwrap_or("the vendor");
                format!(
                    "Extract and verify the key fields of an invoice from {vendor} and list \
                     any discrepancies to flag.\nDetails: {}",
                    payload.objective
                )
            }
            OpsOperation::ClientOnboarding => {
                let client = payload.input_str("client").unwrap_or("the client");
                format!(
                    "Build a client onboarding checklist for {client} with owners and a \
                     two-week timeline.\nScope: {}",
                    payload.objective
                )
            }
        }
    }
}

#[async_trait]
impl Agent for OperationsAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Operations
    }

    fn capabilities(&self) -> Vec<String> {
        vec![
            "workflow_automation".to_string(),
            "invoice_processing".to_string(),
            "client_onboarding".to_string(),
        ]
    }

    async fn handle(&self, task: &Task, ctx: &AgentContext) -> Result<TaskOutput, AgentError> {
        let operation = OpsOperation::parse(&task.payload)?;
        ctx.ensure_live()?;

        let prompt = Self::compose_prompt(operation, &task.payload);
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

        Ok(ctx.output(completion, &[("operation", operation.label().to_string())]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testkit;
    use serde_json::json;

    #[tokio::test]
    async fn onboarding_plan_is_labelled() {
        let agent = OperationsAgent::new(vec![]);
        let payload = TaskPayload::new("Standard rollout, two workspaces")
            .with_input("operation", json!("onboarding"))
            .with_input("client", json!("Voss Logistics"));
        let task = testkit::task(AgentKind::Operations, payload);

        let output = agent.handle(&task, &testkit::context()).await.unwrap();
        assert_eq!(output.metadata["operation"], "onboarding");
    }
}

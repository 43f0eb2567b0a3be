use super::{Agent, AgentContext, AgentError};
use crate::{
    models::{AgentKind, Task, TaskOutput, TaskPayload},
    providers::{Capability, InvokeOptions},
};
use async_trait::async_trait;

/// Sales agent: lead qualification, pipeline analysis, proposal drafting.
///
/// The payload's `operation` input selects the mode; lead and company
/// details ride along in the remaining inputs.
pub struct SalesAgent {
    preferences: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SalesOperation {
    QualifyLead,
    PipelineAnalysis,
    ProposalDraft,
}

impl SalesOperation {
    fn parse(payload: &TaskPayload) -> Result<Self, AgentError> {
        match payload.input_str("operation").unwrap_or("qualify_lead") {
            "qualify_lead" => Ok(SalesOperation::QualifyLead),
            "pipeline_analysis" => Ok(SalesOperation::PipelineAnalysis),
            "proposal_draft" => Ok(SalesOperation::ProposalDraft),
            other => Err(AgentError::InvalidPayload(format!(
                "unknown sales operation `{other}`"
            ))),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            SalesOperation::QualifyLead => "qualify_lead",
            SalesOperation::PipelineAnalysis => "pipeline_analysis",
            SalesOperation::ProposalDraft => "proposal_draft",
        }
    }
}

impl SalesAgent {
    pub fn new(preferences: Vec<String>) -> Self {
        Self { preferences }
    }

    fn compose_prompt(operation: SalesOperation, payload: &TaskPayload) -> String {
        let lead = payload.input_str("lead").unwrap_or("the prospect");
        let company = payload.input_str("company").unwrap_or("their company");
        match operation {
            SalesOperation::QualifyLead => format!(
                "Qualify the following sales lead and score it from 1 to 10 with reasoning.\n\
                 Lead: {lead}\nCompany: {company}\nContext: {}",
                payload.objective
            ),
            SalesOperation::PipelineAnalysis => format!(
                "Analyse this sales pipeline and identify stalled deals, conversion \
                 bottlenecks, and the three highest-leverage next actions.\n{}",
                payload.objective
            ),
            SalesOperation::ProposalDraft => format!(
                "Draft a concise commercial proposal for {company}, addressed to {lead}.\n\
                 Requirements: {}",
                payload.objective
            ),
        }
    }
}

#[async_trait]
impl Agent for SalesAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Sales
    }

    fn capabilities(&self) -> Vec<String> {
        vec![
            "lead_qualification".to_string(),
            "pipeline_analysis".to_string(),
            "proposal_drafting".to_string(),
        ]
    }

    async fn handle(&self, task: &Task, ctx: &AgentContext) -> Result<TaskOutput, AgentError> {
        let operation = SalesOperation::parse(&task.payload)?;
        ctx.ensure_live()?;

        let prompt = Self::compose_prompt(operation, &task.payload);
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

        Ok(ctx.output(completion, &[("operation", operation.label().to_string())]))
    }
}

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::agent::TaskInfo;
use crate::monitoring::types::{
    AgentStateAnalysis, ConductorJudgment, EnrichedTask, GuardianJudgment,
};
use crate::util::truncate;
use crate::{olog_trace, Error, Result};

use super::prompt::{self, SYSTEM_PROMPT};
use super::{
    AgentStateRequest, Capability, CoherenceRequest, ReasoningOracle, TrajectoryRequest,
};

/// A text-in, text-out model backend.
#[async_trait]
pub trait Completion: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

const LLM_CAPABILITIES: &[Capability] = &[
    Capability::EnrichTask,
    Capability::AnalyzeAgentState,
    Capability::AnalyzeAgentTrajectory,
    Capability::AnalyzeSystemCoherence,
    Capability::GenerateAgentPrompt,
];

/// Oracle that asks a language model and parses its JSON answer.
///
/// Embeddings are not available through a completion backend.
pub struct LlmOracle<C> {
    backend: C,
}

impl<C: Completion> LlmOracle<C> {
    pub fn new(backend: C) -> Self {
        Self { backend }
    }

    async fn ask<T: DeserializeOwned>(&self, prompt: String) -> Result<T> {
        let text = self.backend.complete(SYSTEM_PROMPT, &prompt).await?;
        olog_trace!("{} answered: {}", self.backend.name(), truncate(&text, 500));
        parse_json(&text)
    }
}

#[async_trait]
impl<C: Completion> ReasoningOracle for LlmOracle<C> {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn capabilities(&self) -> &[Capability] {
        LLM_CAPABILITIES
    }

    async fn enrich_task(&self, task: &TaskInfo) -> Result<EnrichedTask> {
        self.ask(prompt::enrich_task(task)).await
    }

    async fn analyze_agent_state(&self, request: &AgentStateRequest) -> Result<AgentStateAnalysis> {
        self.ask(prompt::agent_state(request)).await
    }

    async fn analyze_agent_trajectory(
        &self,
        request: &TrajectoryRequest,
    ) -> Result<GuardianJudgment> {
        self.ask(prompt::trajectory(request)).await
    }

    async fn analyze_system_coherence(
        &self,
        request: &CoherenceRequest,
    ) -> Result<ConductorJudgment> {
        self.ask(prompt::coherence(request)).await
    }

    async fn generate_agent_prompt(&self, task: &TaskInfo) -> Result<String> {
        let text = self
            .backend
            .complete(SYSTEM_PROMPT, &prompt::agent_prompt(task))
            .await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::MalformedResponse("empty agent prompt".to_string()));
        }
        Ok(text.to_string())
    }
}

/// Locate the JSON object in a model reply, tolerating code fences and
/// surrounding prose.
pub fn extract_json(text: &str) -> Result<&str> {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(&text[start..=end]),
        _ => Err(Error::MalformedResponse(format!(
            "no JSON object in reply: {}",
            truncate(text.trim(), 120)
        ))),
    }
}

fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    let json = extract_json(text)?;
    serde_json::from_str(json).map_err(|e| Error::MalformedResponse(e.to_string()))
}

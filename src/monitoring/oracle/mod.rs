//! Reasoning oracle: the pluggable judgment provider behind the Guardian and
//! the Conductor.
//!
//! Providers implement [`ReasoningOracle`] and may support only some
//! capabilities. Callers never talk to a provider directly; they go through
//! [`OracleClient`], which adds timeouts, retries, response validation and
//! the safe fallback judgments.

mod anthropic;
mod claude;
mod factory;
mod heuristic;
mod llm;
mod prompt;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentId, TaskInfo};
use crate::config::{OracleConfig, SystemGoals};
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::util::with_timeout;
use crate::{olog_debug, olog_warn, Error, Result};

use super::trajectory::TrajectorySnapshot;
use super::types::{
    AgentStateAnalysis, AgentSummary, ConductorJudgment, EnrichedTask, GuardianJudgment,
};

pub use anthropic::AnthropicClient;
pub use claude::{ClaudeHeadless, ClaudeResponse, ResultType};
pub use factory::create_oracle;
pub use heuristic::{HeuristicOracle, EMBEDDING_DIMENSIONS};
pub use llm::{extract_json, Completion, LlmOracle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    EnrichTask,
    GenerateEmbedding,
    AnalyzeAgentState,
    AnalyzeAgentTrajectory,
    AnalyzeSystemCoherence,
    GenerateAgentPrompt,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::EnrichTask,
        Capability::GenerateEmbedding,
        Capability::AnalyzeAgentState,
        Capability::AnalyzeAgentTrajectory,
        Capability::AnalyzeSystemCoherence,
        Capability::GenerateAgentPrompt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::EnrichTask => "enrich_task",
            Capability::GenerateEmbedding => "generate_embedding",
            Capability::AnalyzeAgentState => "analyze_agent_state",
            Capability::AnalyzeAgentTrajectory => "analyze_agent_trajectory",
            Capability::AnalyzeSystemCoherence => "analyze_system_coherence",
            Capability::GenerateAgentPrompt => "generate_agent_prompt",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to the per-cycle trajectory analysis.
#[derive(Debug, Clone, Serialize)]
pub struct TrajectoryRequest {
    pub agent_id: AgentId,
    pub task: TaskInfo,
    /// Only the lines appended since the previous cycle; may be empty.
    pub new_output: Vec<String>,
    pub trajectory: TrajectorySnapshot,
}

/// Input to the coarse state analysis.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStateRequest {
    pub agent_id: AgentId,
    pub task: TaskInfo,
    pub output: Vec<String>,
    /// Consecutive cycles in which the output did not change.
    pub idle_cycles: u32,
}

/// Input to the system-wide coherence analysis.
#[derive(Debug, Clone, Serialize)]
pub struct CoherenceRequest {
    pub agents: Vec<AgentSummary>,
    pub goals: SystemGoals,
}

/// A judgment provider. Unsupported capabilities return `Error::Unsupported`.
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    fn unsupported(&self, capability: Capability) -> Error {
        Error::Unsupported {
            provider: self.name().to_string(),
            capability: capability.as_str(),
        }
    }

    async fn enrich_task(&self, _task: &TaskInfo) -> Result<EnrichedTask> {
        Err(self.unsupported(Capability::EnrichTask))
    }

    async fn generate_embedding(&self, _text: &str) -> Result<Vec<f32>> {
        Err(self.unsupported(Capability::GenerateEmbedding))
    }

    async fn analyze_agent_state(&self, _request: &AgentStateRequest) -> Result<AgentStateAnalysis> {
        Err(self.unsupported(Capability::AnalyzeAgentState))
    }

    async fn analyze_agent_trajectory(
        &self,
        _request: &TrajectoryRequest,
    ) -> Result<GuardianJudgment> {
        Err(self.unsupported(Capability::AnalyzeAgentTrajectory))
    }

    async fn analyze_system_coherence(
        &self,
        _request: &CoherenceRequest,
    ) -> Result<ConductorJudgment> {
        Err(self.unsupported(Capability::AnalyzeSystemCoherence))
    }

    async fn generate_agent_prompt(&self, _task: &TaskInfo) -> Result<String> {
        Err(self.unsupported(Capability::GenerateAgentPrompt))
    }
}

/// A judgment as delivered to the Guardian or Conductor.
#[derive(Debug, Clone)]
pub struct Judged<T> {
    pub value: T,
    pub attempts: u32,
    /// The value is the safe default, not a provider answer.
    pub fell_back: bool,
    pub error: Option<String>,
}

/// Resilient front for a [`ReasoningOracle`].
///
/// Analysis calls never fail: after the last attempt (or a non-retryable
/// error) the capability's fallback judgment is returned instead.
/// Once the cancellation token fires, no new attempt is started.
#[derive(Clone)]
pub struct OracleClient {
    provider: Arc<dyn ReasoningOracle>,
    policy: RetryPolicy,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl OracleClient {
    pub fn new(provider: Arc<dyn ReasoningOracle>, policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            provider,
            policy,
            call_timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn from_config(provider: Arc<dyn ReasoningOracle>, config: &OracleConfig) -> Self {
        Self::new(provider, RetryPolicy::for_oracle(config), config.call_timeout())
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.provider.supports(capability)
    }

    pub async fn analyze_trajectory(&self, request: &TrajectoryRequest) -> Judged<GuardianJudgment> {
        if self.cancel.is_cancelled() {
            return self.cancelled(Capability::AnalyzeAgentTrajectory, GuardianJudgment::fallback);
        }
        let provider = self.provider.as_ref();
        let limit = self.call_timeout;
        let outcome = self
            .policy
            .run(
                &self.cancel,
                |attempt| async move {
                    let judgment =
                        with_timeout(limit, provider.analyze_agent_trajectory(request)).await?;
                    checked(judgment, GuardianJudgment::validate, Capability::AnalyzeAgentTrajectory, attempt)
                },
                Error::is_transient,
            )
            .await;
        self.settle(Capability::AnalyzeAgentTrajectory, outcome, GuardianJudgment::fallback)
    }

    pub async fn analyze_coherence(&self, request: &CoherenceRequest) -> Judged<ConductorJudgment> {
        if self.cancel.is_cancelled() {
            return self.cancelled(Capability::AnalyzeSystemCoherence, ConductorJudgment::fallback);
        }
        let provider = self.provider.as_ref();
        let limit = self.call_timeout;
        let outcome = self
            .policy
            .run(
                &self.cancel,
                |attempt| async move {
                    let judgment =
                        with_timeout(limit, provider.analyze_system_coherence(request)).await?;
                    checked(judgment, ConductorJudgment::validate, Capability::AnalyzeSystemCoherence, attempt)
                },
                Error::is_transient,
            )
            .await;
        self.settle(Capability::AnalyzeSystemCoherence, outcome, ConductorJudgment::fallback)
    }

    pub async fn analyze_state(&self, request: &AgentStateRequest) -> Judged<AgentStateAnalysis> {
        if self.cancel.is_cancelled() {
            return self.cancelled(Capability::AnalyzeAgentState, |_| AgentStateAnalysis::fallback());
        }
        let provider = self.provider.as_ref();
        let limit = self.call_timeout;
        let outcome = self
            .policy
            .run(
                &self.cancel,
                |attempt| async move {
                    let analysis = with_timeout(limit, provider.analyze_agent_state(request)).await?;
                    checked(analysis, AgentStateAnalysis::validate, Capability::AnalyzeAgentState, attempt)
                },
                Error::is_transient,
            )
            .await;
        self.settle(Capability::AnalyzeAgentState, outcome, |_| AgentStateAnalysis::fallback())
    }

    pub async fn enrich_task(&self, task: &TaskInfo) -> Result<EnrichedTask> {
        let provider = self.provider.as_ref();
        let limit = self.call_timeout;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.policy
            .run(
                &self.cancel,
                |_| with_timeout(limit, provider.enrich_task(task)),
                Error::is_transient,
            )
            .await
            .result
    }

    pub async fn generate_agent_prompt(&self, task: &TaskInfo) -> Result<String> {
        let provider = self.provider.as_ref();
        let limit = self.call_timeout;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.policy
            .run(
                &self.cancel,
                |_| with_timeout(limit, provider.generate_agent_prompt(task)),
                Error::is_transient,
            )
            .await
            .result
    }

    fn cancelled<T>(&self, capability: Capability, fallback: impl FnOnce(u32) -> T) -> Judged<T> {
        olog_debug!("oracle: {} skipped, shutting down", capability);
        Judged {
            value: fallback(0),
            attempts: 0,
            fell_back: true,
            error: Some(Error::Cancelled.to_string()),
        }
    }

    fn settle<T>(
        &self,
        capability: Capability,
        outcome: RetryOutcome<T, Error>,
        fallback: impl FnOnce(u32) -> T,
    ) -> Judged<T> {
        match outcome.result {
            Ok(value) => Judged {
                value,
                attempts: outcome.attempts,
                fell_back: false,
                error: None,
            },
            Err(err) => {
                olog_warn!(
                    "oracle {}: {} failed after {} attempt(s), using fallback: {}",
                    self.provider.name(),
                    capability,
                    outcome.attempts,
                    err
                );
                Judged {
                    value: fallback(outcome.attempts),
                    attempts: outcome.attempts,
                    fell_back: true,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

fn checked<T>(
    value: T,
    validate: fn(&T) -> Result<()>,
    capability: Capability,
    attempt: u32,
) -> Result<T> {
    match validate(&value) {
        Ok(()) => {
            olog_debug!("oracle: {} answered on attempt {}", capability, attempt);
            Ok(value)
        }
        Err(err) => {
            olog_warn!("data quality: {} attempt {}: {}", capability, attempt, err);
            Err(err)
        }
    }
}

//! State machine enums and judgment value objects.
//!
//! Judgments arrive from the reasoning oracle as untrusted JSON. Each one has
//! a `validate()` that the oracle client runs at the boundary, and a
//! `fallback()` that is returned when no valid judgment could be obtained.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{AgentId, AgentRole, TaskInfo};
use crate::{Error, Result};

/// Guardian's classification of an agent for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Healthy,
    StuckWaiting,
    StuckError,
    StuckConfused,
    /// Terminal for the cycle: only recreation or termination follows.
    Unrecoverable,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Healthy => "healthy",
            AgentState::StuckWaiting => "stuck_waiting",
            AgentState::StuckError => "stuck_error",
            AgentState::StuckConfused => "stuck_confused",
            AgentState::Unrecoverable => "unrecoverable",
        }
    }

    pub fn allows_soft_intervention(&self) -> bool {
        !matches!(self, AgentState::Unrecoverable)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload-free decision tag, as reported by the coarse state analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Continue,
    Nudge,
    Answer,
    Restart,
    Recreate,
}

/// What the Guardian does about an agent this cycle.
///
/// `Nudge` and `Answer` always carry a non-empty message; build them with
/// [`MonitoringDecision::nudge`] / [`MonitoringDecision::answer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitoringDecision {
    Continue,
    Nudge { message: String },
    Answer { message: String },
    Restart,
    Recreate,
}

impl MonitoringDecision {
    pub fn nudge(message: impl Into<String>) -> Result<Self> {
        let message = non_empty(message.into(), "nudge")?;
        Ok(MonitoringDecision::Nudge { message })
    }

    pub fn answer(message: impl Into<String>) -> Result<Self> {
        let message = non_empty(message.into(), "answer")?;
        Ok(MonitoringDecision::Answer { message })
    }

    pub fn kind(&self) -> DecisionKind {
        match self {
            MonitoringDecision::Continue => DecisionKind::Continue,
            MonitoringDecision::Nudge { .. } => DecisionKind::Nudge,
            MonitoringDecision::Answer { .. } => DecisionKind::Answer,
            MonitoringDecision::Restart => DecisionKind::Restart,
            MonitoringDecision::Recreate => DecisionKind::Recreate,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            MonitoringDecision::Nudge { message } | MonitoringDecision::Answer { message } => {
                Some(message)
            }
            _ => None,
        }
    }
}

impl fmt::Display for MonitoringDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind() {
            DecisionKind::Continue => "CONTINUE",
            DecisionKind::Nudge => "NUDGE",
            DecisionKind::Answer => "ANSWER",
            DecisionKind::Restart => "RESTART",
            DecisionKind::Recreate => "RECREATE",
        };
        f.write_str(label)
    }
}

fn non_empty(message: String, what: &str) -> Result<String> {
    if message.trim().is_empty() {
        Err(Error::Validation(format!("{} requires a message", what)))
    } else {
        Ok(message)
    }
}

/// The Conductor's action for one system-wide cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemDecision {
    Continue,
    /// `targets` is never empty and never contains an agent from `kept`.
    TerminateDuplicate {
        targets: Vec<AgentId>,
        kept: Vec<AgentId>,
    },
    CoordinateResources {
        needs: Vec<CoordinationNeed>,
    },
    CreateMissingTask {
        hints: Vec<String>,
    },
    Escalate {
        reason: String,
    },
}

impl SystemDecision {
    pub fn label(&self) -> &'static str {
        match self {
            SystemDecision::Continue => "CONTINUE",
            SystemDecision::TerminateDuplicate { .. } => "TERMINATE_DUPLICATE",
            SystemDecision::CoordinateResources { .. } => "COORDINATE_RESOURCES",
            SystemDecision::CreateMissingTask { .. } => "CREATE_MISSING_TASK",
            SystemDecision::Escalate { .. } => "ESCALATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryPhase {
    Exploration,
    InformationGathering,
    Planning,
    Implementation,
    Verification,
    Completed,
    #[default]
    Unknown,
}

impl TrajectoryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrajectoryPhase::Exploration => "exploration",
            TrajectoryPhase::InformationGathering => "information_gathering",
            TrajectoryPhase::Planning => "planning",
            TrajectoryPhase::Implementation => "implementation",
            TrajectoryPhase::Verification => "verification",
            TrajectoryPhase::Completed => "completed",
            TrajectoryPhase::Unknown => "unknown",
        }
    }

    /// How far along the task an agent in this phase is; used to pick which
    /// of two duplicated agents to keep.
    pub fn progress_rank(&self) -> u8 {
        match self {
            TrajectoryPhase::Unknown => 0,
            TrajectoryPhase::Exploration => 1,
            TrajectoryPhase::InformationGathering => 2,
            TrajectoryPhase::Planning => 3,
            TrajectoryPhase::Implementation => 4,
            TrajectoryPhase::Verification => 5,
            TrajectoryPhase::Completed => 6,
        }
    }
}

impl fmt::Display for TrajectoryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteeringType {
    Stuck,
    Drifting,
    ViolatingConstraints,
    OverEngineering,
    Confused,
}

impl SteeringType {
    /// Upper-case label used in the steering message header.
    pub fn label(&self) -> &'static str {
        match self {
            SteeringType::Stuck => "STUCK",
            SteeringType::Drifting => "DRIFTING",
            SteeringType::ViolatingConstraints => "VIOLATING_CONSTRAINTS",
            SteeringType::OverEngineering => "OVER_ENGINEERING",
            SteeringType::Confused => "CONFUSED",
        }
    }
}

/// Per-cycle trajectory judgment for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianJudgment {
    pub current_phase: TrajectoryPhase,
    pub trajectory_aligned: bool,
    pub alignment_score: f64,
    #[serde(default)]
    pub alignment_issues: Vec<String>,
    pub needs_steering: bool,
    #[serde(default)]
    pub steering_type: Option<SteeringType>,
    #[serde(default)]
    pub steering_recommendation: Option<String>,
    #[serde(default)]
    pub trajectory_summary: String,
}

impl GuardianJudgment {
    /// Safe default: aligned, no steering, middling score.
    pub fn fallback(attempts: u32) -> Self {
        Self {
            current_phase: TrajectoryPhase::Unknown,
            trajectory_aligned: true,
            alignment_score: 0.5,
            alignment_issues: Vec::new(),
            needs_steering: false,
            steering_type: None,
            steering_recommendation: None,
            trajectory_summary: format!("Analysis failed after {} attempts", attempts),
        }
    }

    /// `needs_steering` holds exactly when both a type and a non-empty recommendation are set.
    pub fn steering_is_consistent(&self) -> bool {
        let has_recommendation = self
            .steering_recommendation
            .as_deref()
            .map(|r| !r.trim().is_empty())
            .unwrap_or(false);
        self.needs_steering == (self.steering_type.is_some() && has_recommendation)
    }

    pub fn validate(&self) -> Result<()> {
        check_score("alignment_score", self.alignment_score)?;
        if !self.steering_is_consistent() {
            return Err(Error::ContractViolation(format!(
                "needs_steering={} but steering_type={:?}, steering_recommendation={:?}",
                self.needs_steering, self.steering_type, self.steering_recommendation
            )));
        }
        Ok(())
    }

    pub fn recommendation(&self) -> Option<&str> {
        self.steering_recommendation.as_deref()
    }
}

/// A set of agents doing the same work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawDuplicate")]
pub struct DuplicateGroup {
    pub agents: Vec<String>,
    pub work: String,
}

/// Providers report duplicates as id lists, pairs, groups or bare descriptions.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuplicate {
    Ids(Vec<String>),
    Pair {
        agent1: String,
        agent2: String,
        #[serde(default)]
        work: String,
    },
    Group {
        agents: Vec<String>,
        #[serde(default)]
        work: String,
    },
    Description(String),
}

impl From<RawDuplicate> for DuplicateGroup {
    fn from(raw: RawDuplicate) -> Self {
        match raw {
            RawDuplicate::Ids(agents) => Self {
                agents,
                work: String::new(),
            },
            RawDuplicate::Pair {
                agent1,
                agent2,
                work,
            } => Self {
                agents: vec![agent1, agent2],
                work,
            },
            RawDuplicate::Group { agents, work } => Self { agents, work },
            RawDuplicate::Description(work) => Self {
                agents: Vec::new(),
                work,
            },
        }
    }
}

/// A resource several agents are contending for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawCoordinationNeed")]
pub struct CoordinationNeed {
    pub resource: String,
    pub agents: Vec<String>,
    pub action: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCoordinationNeed {
    Detailed {
        #[serde(default)]
        resource: String,
        #[serde(default)]
        agents: Vec<String>,
        #[serde(default)]
        action: String,
    },
    Text(String),
}

impl From<RawCoordinationNeed> for CoordinationNeed {
    fn from(raw: RawCoordinationNeed) -> Self {
        match raw {
            RawCoordinationNeed::Detailed {
                resource,
                agents,
                action,
            } => Self {
                resource,
                agents,
                action,
            },
            RawCoordinationNeed::Text(resource) => Self {
                resource,
                agents: Vec::new(),
                action: String::new(),
            },
        }
    }
}

/// System-wide coherence judgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConductorJudgment {
    pub coherence_score: f64,
    #[serde(default)]
    pub duplicates: Vec<DuplicateGroup>,
    #[serde(default)]
    pub alignment_issues: Vec<String>,
    #[serde(default)]
    pub termination_recommendations: Vec<String>,
    #[serde(default)]
    pub coordination_needs: Vec<CoordinationNeed>,
    #[serde(default)]
    pub system_summary: String,
}

impl ConductorJudgment {
    /// Safe default: moderate coherence and nothing to act on.
    pub fn fallback(attempts: u32) -> Self {
        Self {
            coherence_score: 0.7,
            duplicates: Vec::new(),
            alignment_issues: Vec::new(),
            termination_recommendations: Vec::new(),
            coordination_needs: Vec::new(),
            system_summary: format!(
                "Analysis failed after {} attempts - assuming moderate coherence",
                attempts
            ),
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_score("coherence_score", self.coherence_score)
    }
}

/// Coarse state/decision pair used as a cheap first-pass check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStateAnalysis {
    pub state: AgentState,
    pub decision: DecisionKind,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reasoning: String,
    pub confidence: f64,
}

impl AgentStateAnalysis {
    pub fn fallback() -> Self {
        Self {
            state: AgentState::Healthy,
            decision: DecisionKind::Continue,
            message: String::new(),
            reasoning: "Analysis failed, assuming healthy".to_string(),
            confidence: 0.1,
        }
    }

    /// Unrecoverable agents only get process-level decisions.
    pub fn validate(&self) -> Result<()> {
        check_score("confidence", self.confidence)?;
        let soft = matches!(self.decision, DecisionKind::Nudge | DecisionKind::Answer);
        if soft && !self.state.allows_soft_intervention() {
            return Err(Error::ContractViolation(format!(
                "{} cannot be paired with {:?}",
                self.state, self.decision
            )));
        }
        self.to_decision().map(|_| ())
    }

    pub fn to_decision(&self) -> Result<MonitoringDecision> {
        match self.decision {
            DecisionKind::Continue => Ok(MonitoringDecision::Continue),
            DecisionKind::Nudge => MonitoringDecision::nudge(self.message.clone())
                .map_err(|e| Error::ContractViolation(e.to_string())),
            DecisionKind::Answer => MonitoringDecision::answer(self.message.clone())
                .map_err(|e| Error::ContractViolation(e.to_string())),
            DecisionKind::Restart => Ok(MonitoringDecision::Restart),
            DecisionKind::Recreate => Ok(MonitoringDecision::Recreate),
        }
    }
}

/// Latest Guardian view of one agent, as handed to the Conductor.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent_id: AgentId,
    pub task: TaskInfo,
    pub role: AgentRole,
    pub created_at: DateTime<Utc>,
    pub state: AgentState,
    pub judgment: Option<GuardianJudgment>,
}

impl AgentSummary {
    pub fn phase(&self) -> TrajectoryPhase {
        self.judgment
            .as_ref()
            .map(|j| j.current_phase)
            .unwrap_or_default()
    }
}

/// Result of the `enrich_task` capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTask {
    pub enriched_description: String,
    #[serde(default)]
    pub completion_criteria: Vec<String>,
    #[serde(default)]
    pub estimated_complexity: u8,
}

impl EnrichedTask {
    /// Fill in what the task declaration left out. Declared values win.
    pub fn apply_to(&self, task: &mut TaskInfo) {
        if task.complexity.is_none() && (1..=10).contains(&self.estimated_complexity) {
            task.complexity = Some(self.estimated_complexity);
        }
        if task.done_definition.is_none() && !self.completion_criteria.is_empty() {
            task.done_definition = Some(self.completion_criteria.join("; "));
        }
    }
}

fn check_score(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::ContractViolation(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )))
    }
}

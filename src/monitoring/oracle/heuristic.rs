//! Offline provider built on output pattern matching.
//!
//! Needs no network or model, so it is the default provider and what the
//! monitor falls back to in tests. Its judgments are deliberately modest:
//! it steers only when the output shows something concrete (a question, an
//! error, a constraint being broken).

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use crate::agent::{AgentId, TaskInfo};
use crate::monitoring::signals;
use crate::monitoring::types::{
    AgentState, AgentStateAnalysis, ConductorJudgment, DecisionKind, DuplicateGroup,
    EnrichedTask, GuardianJudgment, SteeringType, TrajectoryPhase,
};
use crate::util::truncate;
use crate::Result;

use super::{AgentStateRequest, Capability, CoherenceRequest, ReasoningOracle, TrajectoryRequest};

pub const EMBEDDING_DIMENSIONS: usize = 256;

/// Lines from the end of the new output inspected for blocking signals.
const TAIL_LINES: usize = 12;

#[derive(Debug, Clone, Default)]
pub struct HeuristicOracle;

impl HeuristicOracle {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReasoningOracle for HeuristicOracle {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn capabilities(&self) -> &[Capability] {
        &Capability::ALL
    }

    async fn enrich_task(&self, task: &TaskInfo) -> Result<EnrichedTask> {
        let description = task.description.trim();
        let mut criteria: Vec<String> = task
            .done_definition
            .iter()
            .flat_map(|d| d.split(['\n', ';']))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if criteria.is_empty() {
            criteria.push("The described change is implemented and builds cleanly".to_string());
        }
        let words = description.split_whitespace().count();
        let complexity = task
            .complexity
            .unwrap_or_else(|| (words / 25 + 1).min(10) as u8)
            .clamp(1, 10);
        Ok(EnrichedTask {
            enriched_description: description.to_string(),
            completion_criteria: criteria,
            estimated_complexity: complexity,
        })
    }

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        Ok(embed(text))
    }

    async fn analyze_agent_state(&self, request: &AgentStateRequest) -> Result<AgentStateAnalysis> {
        Ok(classify_state(request))
    }

    async fn analyze_agent_trajectory(
        &self,
        request: &TrajectoryRequest,
    ) -> Result<GuardianJudgment> {
        Ok(judge_trajectory(request))
    }

    async fn analyze_system_coherence(
        &self,
        request: &CoherenceRequest,
    ) -> Result<ConductorJudgment> {
        Ok(judge_coherence(request))
    }

    async fn generate_agent_prompt(&self, task: &TaskInfo) -> Result<String> {
        let mut prompt = format!("You are working on task {}.\n\n{}\n", task.task_id, task.description.trim());
        if let Some(done) = &task.done_definition {
            prompt.push_str(&format!("\nYou are done when: {}\n", done.trim()));
        }
        prompt.push_str(
            "\nWork autonomously. Do not wait for confirmation; when a choice is needed, \
             pick the option that best serves the task and continue.",
        );
        Ok(prompt)
    }
}

fn judge_trajectory(request: &TrajectoryRequest) -> GuardianJudgment {
    let previous = request.trajectory.phase;
    if request.new_output.iter().all(|l| l.trim().is_empty()) {
        return GuardianJudgment {
            current_phase: previous,
            trajectory_aligned: true,
            alignment_score: 0.6,
            alignment_issues: Vec::new(),
            needs_steering: false,
            steering_type: None,
            steering_recommendation: None,
            trajectory_summary: "No new output since the last check".to_string(),
        };
    }

    let inferred = signals::infer_phase(&request.new_output);
    let phase = if inferred == TrajectoryPhase::Unknown {
        previous
    } else {
        inferred
    };
    let tail_start = request.new_output.len().saturating_sub(TAIL_LINES);
    let tail = &request.new_output[tail_start..];
    let tail_text = tail.join("\n");
    let all_text = request.new_output.join("\n");

    let steer = |kind: SteeringType, score: f64, issue: String, advice: String| GuardianJudgment {
        current_phase: phase,
        trajectory_aligned: !matches!(
            kind,
            SteeringType::Drifting | SteeringType::ViolatingConstraints
        ),
        alignment_score: score,
        alignment_issues: vec![issue.clone()],
        needs_steering: true,
        steering_type: Some(kind),
        steering_recommendation: Some(advice),
        trajectory_summary: issue,
    };

    if signals::is_waiting_for_input(&tail_text) {
        if let Some(question) = signals::extract_question(&tail_text) {
            return steer(
                SteeringType::Stuck,
                0.5,
                format!("Waiting on: {}", truncate(&question, 120)),
                format!(
                    "You asked \"{}\". Choose the option that best serves the task ({}) and keep going without waiting for confirmation.",
                    truncate(&question, 120),
                    truncate(request.task.description.trim(), 120)
                ),
            );
        }
    }

    if let Some(pattern) = signals::transient_pattern(&tail_text) {
        return steer(
            SteeringType::Stuck,
            0.5,
            format!("Hit a transient failure ({})", pattern),
            "That failure looks temporary. Wait a moment, then retry the last step.".to_string(),
        );
    }

    if let Some(constraint) = signals::violated_constraint(&request.trajectory.constraints, &all_text) {
        return steer(
            SteeringType::ViolatingConstraints,
            0.3,
            format!("Output conflicts with constraint: {}", constraint),
            format!("Stop and undo that. The task requires: {}", constraint),
        );
    }

    if let Some(error) = signals::last_error(tail) {
        return steer(
            SteeringType::Stuck,
            0.45,
            format!("Last step failed: {}", truncate(&error, 120)),
            format!(
                "The last step failed with \"{}\". Read the error, fix the cause and re-run.",
                truncate(&error, 160)
            ),
        );
    }

    GuardianJudgment {
        current_phase: phase,
        trajectory_aligned: true,
        alignment_score: if phase == TrajectoryPhase::Unknown { 0.7 } else { 0.8 },
        alignment_issues: Vec::new(),
        needs_steering: false,
        steering_type: None,
        steering_recommendation: None,
        trajectory_summary: format!("Progressing ({})", phase),
    }
}

fn classify_state(request: &AgentStateRequest) -> AgentStateAnalysis {
    let start = request.output.len().saturating_sub(TAIL_LINES);
    let tail = &request.output[start..];
    let text = tail.join("\n");

    let analysis = |state, decision, message: &str, reasoning: String, confidence| AgentStateAnalysis {
        state,
        decision,
        message: message.to_string(),
        reasoning,
        confidence,
    };

    if let Some(pattern) = signals::fatal_pattern(&text) {
        return analysis(
            AgentState::StuckError,
            DecisionKind::Restart,
            "",
            format!("Fatal condition in output: {}", pattern),
            0.7,
        );
    }
    if signals::is_waiting_for_input(&text) {
        let (message, confidence) = if signals::is_yes_no(&text) {
            ("y", 0.85)
        } else if signals::offers_options(&text) {
            ("1", 0.8)
        } else {
            ("Use your best judgment and continue with the task.", 0.6)
        };
        return analysis(
            AgentState::StuckWaiting,
            DecisionKind::Answer,
            message,
            "Agent is waiting for input".to_string(),
            confidence,
        );
    }
    if let Some(error) = signals::last_error(tail) {
        return analysis(
            AgentState::StuckError,
            DecisionKind::Nudge,
            "The last command failed. Read the error output, fix the cause and continue.",
            format!("Error in output: {}", truncate(&error, 120)),
            0.6,
        );
    }
    if request.idle_cycles >= 2 {
        return analysis(
            AgentState::StuckWaiting,
            DecisionKind::Nudge,
            "Please continue with the task.",
            format!("No output change for {} checks", request.idle_cycles),
            0.5,
        );
    }
    analysis(
        AgentState::Healthy,
        DecisionKind::Continue,
        "",
        "Output is progressing".to_string(),
        0.7,
    )
}

fn judge_coherence(request: &CoherenceRequest) -> ConductorJudgment {
    let total = request.agents.len();
    let mut by_task: BTreeMap<String, Vec<&AgentId>> = BTreeMap::new();
    for agent in &request.agents {
        by_task
            .entry(normalize(&agent.task.description))
            .or_default()
            .push(&agent.agent_id);
    }

    let mut duplicates = Vec::new();
    let mut flagged: HashSet<&AgentId> = HashSet::new();
    for (work, ids) in &by_task {
        if ids.len() > 1 && !work.is_empty() {
            flagged.extend(ids.iter().copied());
            duplicates.push(DuplicateGroup {
                agents: ids.iter().map(|id| id.to_string()).collect(),
                work: truncate(work, 120),
            });
        }
    }

    let mut alignment_issues = Vec::new();
    let mut unhealthy = 0usize;
    for agent in &request.agents {
        if agent.state != AgentState::Healthy {
            unhealthy += 1;
            alignment_issues.push(format!("agent {} is {}", agent.agent_id.short(), agent.state));
        }
        if let Some(judgment) = &agent.judgment {
            if !judgment.trajectory_aligned {
                alignment_issues.push(format!(
                    "agent {} drifting: {}",
                    agent.agent_id.short(),
                    truncate(&judgment.trajectory_summary, 100)
                ));
            }
        }
    }

    let coherence = if total == 0 {
        1.0
    } else {
        let duplicate_share = flagged.len() as f64 / total as f64;
        let unhealthy_share = unhealthy as f64 / total as f64;
        (1.0 - 0.6 * duplicate_share - 0.3 * unhealthy_share).clamp(0.0, 1.0)
    };

    ConductorJudgment {
        coherence_score: coherence,
        system_summary: format!(
            "{} agents, {} duplicate group(s), {} unhealthy",
            total,
            duplicates.len(),
            unhealthy
        ),
        duplicates,
        alignment_issues,
        termination_recommendations: Vec::new(),
        coordination_needs: Vec::new(),
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hashed bag-of-words, L2-normalized.
fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0f32; EMBEDDING_DIMENSIONS];
    for word in normalize(text).split(' ').filter(|w| !w.is_empty()) {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        let bucket = (hasher.finish() % EMBEDDING_DIMENSIONS as u64) as usize;
        vector[bucket] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

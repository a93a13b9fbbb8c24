//! System-wide arbitration across all supervised agents.
//!
//! The Conductor never acts on a fallback judgment: a failed coherence
//! analysis always maps to `SystemDecision::Continue`.

use std::cmp::Ordering;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::agent::AgentId;
use crate::config::{ConductorConfig, SystemGoals};
use crate::util::truncate;
use crate::{olog, olog_debug, olog_warn, Error, Result};

use super::oracle::{CoherenceRequest, OracleClient};
use super::types::{AgentSummary, ConductorJudgment, CoordinationNeed, SystemDecision};

/// Result of one Conductor cycle.
#[derive(Debug, Clone)]
pub struct ConductorReport {
    pub at: DateTime<Utc>,
    pub agents: usize,
    /// `None` when the cycle was skipped without consulting the oracle.
    pub judgment: Option<ConductorJudgment>,
    pub fell_back: bool,
    pub decision: SystemDecision,
}

pub struct Conductor {
    config: ConductorConfig,
    goals: SystemGoals,
    missing_task: Regex,
    last_analysis: Option<(DateTime<Utc>, ConductorJudgment)>,
}

impl Conductor {
    pub fn new(config: ConductorConfig, goals: SystemGoals) -> Result<Self> {
        let missing_task = Regex::new(&config.missing_task_pattern)
            .map_err(|e| Error::Validation(format!("conductor.missing_task_pattern: {}", e)))?;
        Ok(Self {
            config,
            goals,
            missing_task,
            last_analysis: None,
        })
    }

    pub fn last_analysis(&self) -> Option<&(DateTime<Utc>, ConductorJudgment)> {
        self.last_analysis.as_ref()
    }

    pub async fn evaluate(&mut self, summaries: Vec<AgentSummary>, oracle: &OracleClient) -> ConductorReport {
        let at = Utc::now();
        let agents = summaries.len();
        if agents < 2 {
            olog_debug!("conductor: {} agent(s), nothing to arbitrate", agents);
            return ConductorReport {
                at,
                agents,
                judgment: None,
                fell_back: false,
                decision: SystemDecision::Continue,
            };
        }

        let request = CoherenceRequest {
            agents: summaries,
            goals: self.goals.clone(),
        };
        let judged = oracle.analyze_coherence(&request).await;
        let judgment = judged.value;

        let decision = if judged.fell_back {
            olog_warn!("conductor: coherence analysis failed, continuing ({})", judgment.system_summary);
            SystemDecision::Continue
        } else {
            self.last_analysis = Some((at, judgment.clone()));
            decide(&judgment, &request.agents, &self.config, &self.missing_task)
        };

        if !judged.fell_back && judgment.coherence_score < self.config.report_threshold {
            olog_warn!("{}", render_report(&judgment, &request.agents));
        }
        olog!(
            "conductor @{}: {} agents, coherence {:.2} -> {}",
            at.format("%H:%M:%S"),
            agents,
            judgment.coherence_score,
            decision.label()
        );

        ConductorReport {
            at,
            agents,
            judgment: Some(judgment),
            fell_back: judged.fell_back,
            decision,
        }
    }

    /// One-line status of the latest successful analysis.
    pub fn system_summary(&self, now: DateTime<Utc>) -> String {
        match &self.last_analysis {
            Some((at, judgment)) => format!(
                "Last analysis: {}s ago | {} duplicates | Coherence: {:.2}",
                now.signed_duration_since(*at).num_seconds().max(0),
                judgment.duplicates.len(),
                judgment.coherence_score
            ),
            None => "No analysis yet".to_string(),
        }
    }
}

/// Map a coherence judgment onto one system-wide action.
///
/// Precedence: duplicates, resource coordination, missing work, low coherence.
pub fn decide(
    judgment: &ConductorJudgment,
    agents: &[AgentSummary],
    config: &ConductorConfig,
    missing_task: &Regex,
) -> SystemDecision {
    if !judgment.duplicates.is_empty() {
        let groups = resolve_duplicates(judgment, agents);
        if groups.is_empty() {
            return SystemDecision::Escalate {
                reason: format!(
                    "duplicates reported for unknown agents: {}",
                    judgment
                        .duplicates
                        .iter()
                        .map(|d| if d.agents.is_empty() { d.work.clone() } else { d.agents.join(", ") })
                        .collect::<Vec<_>>()
                        .join("; ")
                ),
            };
        }

        let mut targets = Vec::new();
        let mut kept = Vec::new();
        for group in groups {
            let (winner, losers) = split_duplicate_group(group);
            kept.push(winner.agent_id.clone());
            targets.extend(
                losers
                    .into_iter()
                    .filter(|a| !a.role.is_protected())
                    .map(|a| a.agent_id.clone()),
            );
        }
        if !targets.is_empty() {
            return SystemDecision::TerminateDuplicate { targets, kept };
        }
    }

    if !judgment.coordination_needs.is_empty() {
        return SystemDecision::CoordinateResources {
            needs: judgment.coordination_needs.clone(),
        };
    }

    let hints: Vec<String> = judgment
        .alignment_issues
        .iter()
        .filter(|issue| missing_task.is_match(issue))
        .cloned()
        .collect();
    if !hints.is_empty() {
        return SystemDecision::CreateMissingTask { hints };
    }

    if judgment.coherence_score < config.coherence_escalation_threshold {
        return SystemDecision::Escalate {
            reason: format!(
                "system coherence {:.2} below {:.2}: {}",
                judgment.coherence_score,
                config.coherence_escalation_threshold,
                truncate(&judgment.system_summary, 200)
            ),
        };
    }

    SystemDecision::Continue
}

/// Map reported ids onto known agents and merge groups that share one.
/// Groups with fewer than two known agents are dropped.
fn resolve_duplicates<'a>(judgment: &ConductorJudgment, agents: &'a [AgentSummary]) -> Vec<Vec<&'a AgentSummary>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for reported in &judgment.duplicates {
        let mut members: Vec<usize> = reported
            .agents
            .iter()
            .filter_map(|name| lookup(agents, name))
            .collect();
        members.sort_unstable();
        members.dedup();
        if members.len() < 2 {
            continue;
        }

        let (overlapping, mut disjoint): (Vec<_>, Vec<_>) = groups
            .into_iter()
            .partition(|g| g.iter().any(|m| members.contains(m)));
        for group in overlapping {
            members.extend(group);
        }
        members.sort_unstable();
        members.dedup();
        disjoint.push(members);
        groups = disjoint;
    }

    groups
        .into_iter()
        .map(|g| g.into_iter().map(|i| &agents[i]).collect())
        .collect()
}

fn lookup(agents: &[AgentSummary], name: &str) -> Option<usize> {
    let name = name.trim();
    agents
        .iter()
        .position(|a| a.agent_id.as_str() == name)
        .or_else(|| agents.iter().position(|a| a.agent_id.short() == name))
}

/// Most advanced phase wins, then earliest creation, then lowest id.
fn keep_order(a: &AgentSummary, b: &AgentSummary) -> Ordering {
    b.phase()
        .progress_rank()
        .cmp(&a.phase().progress_rank())
        .then(a.created_at.cmp(&b.created_at))
        .then_with(|| a.agent_id.cmp(&b.agent_id))
}

fn split_duplicate_group(mut group: Vec<&AgentSummary>) -> (&AgentSummary, Vec<&AgentSummary>) {
    group.sort_by(|a, b| keep_order(a, b));
    let winner = group.remove(0);
    (winner, group)
}

/// Per-agent messages for one contended resource; the first agent listed
/// gets priority.
pub fn coordination_messages(need: &CoordinationNeed) -> Vec<(AgentId, String)> {
    let Some(first) = need.agents.first() else {
        return Vec::new();
    };
    need.agents
        .iter()
        .enumerate()
        .map(|(i, agent)| {
            let message = if i == 0 {
                format!(
                    "[CONDUCTOR]: Resource coordination for {}. You have priority access.",
                    need.resource
                )
            } else {
                format!(
                    "[CONDUCTOR]: Resource coordination for {}. Please wait for agent {} to complete.",
                    need.resource, first
                )
            };
            (AgentId::from(agent.as_str()), message)
        })
        .collect()
}

/// Multi-line report written to the log when coherence is poor.
pub fn render_report(judgment: &ConductorJudgment, agents: &[AgentSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Conductor report ===");
    let _ = writeln!(out, "Coherence: {:.2}", judgment.coherence_score);
    let _ = writeln!(out, "Summary: {}", judgment.system_summary);
    let _ = writeln!(out, "Agents:");
    for agent in agents {
        let _ = writeln!(
            out,
            "  {} [{}] {} / {} - {}",
            agent.agent_id.short(),
            agent.task.task_id,
            agent.state,
            agent.phase(),
            truncate(agent.task.description.trim(), 80)
        );
    }
    if !judgment.duplicates.is_empty() {
        let _ = writeln!(out, "Duplicates:");
        for dup in &judgment.duplicates {
            let _ = writeln!(out, "  [{}] {}", dup.agents.join(", "), dup.work);
        }
    }
    if !judgment.alignment_issues.is_empty() {
        let _ = writeln!(out, "Alignment issues:");
        for issue in &judgment.alignment_issues {
            let _ = writeln!(out, "  - {}", issue);
        }
    }
    if !judgment.coordination_needs.is_empty() {
        let _ = writeln!(out, "Coordination needs:");
        for need in &judgment.coordination_needs {
            let _ = writeln!(out, "  - {} ({})", need.resource, need.agents.join(", "));
        }
    }
    out.trim_end().to_string()
}

//! Per-agent Guardian: one read, diff, judge, classify, act pass per cycle.
//!
//! A Guardian owns its agent's [`TrajectoryContext`] and streak counters. It
//! lives in the registry between cycles and is checked out for the duration
//! of one, so an agent never has two cycles in flight.
//!
//! Nothing here returns an error to the caller. Every failure is folded into
//! the [`CycleReport`] as a state, a decision and an [`Intervention`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentId, TaskInfo};
use crate::config::{DeliveryConfig, MonitorConfig};
use crate::retry::RetryPolicy;
use crate::util::{truncate, with_timeout};
use crate::{olog, olog_debug, olog_warn, Error};

use super::delivery::{deliver_with_retry, SteeringMessage};
use super::escalation::{Escalation, EscalationSink};
use super::inspector::SessionInspector;
use super::lifecycle::AgentLifecycleManager;
use super::oracle::{AgentStateRequest, OracleClient, TrajectoryRequest};
use super::registry::{AgentRegistryEntry, RestartVerdict, SharedRegistry};
use super::trajectory::{JudgmentSummary, TrajectoryContext};
use super::types::{
    AgentState, DecisionKind, GuardianJudgment, MonitoringDecision, SteeringType, TrajectoryPhase,
};

/// Our own steering lines carry this prefix; they are not agent output.
const STEERING_PREFIX: &str = "[GUARDIAN ";

const STUCK_LABEL: &str = "STUCK";

const IDLE_NUDGE: &str = "No new output for a while. If you are blocked, say what you need; \
otherwise continue with the next step of your task.";

/// Everything a Guardian cycle talks to. Cheap to clone.
#[derive(Clone)]
pub struct GuardianDeps {
    pub monitor: MonitorConfig,
    pub delivery: DeliveryConfig,
    pub oracle: OracleClient,
    pub inspector: Arc<dyn SessionInspector>,
    pub lifecycle: Arc<dyn AgentLifecycleManager>,
    pub escalations: Arc<dyn EscalationSink>,
    pub registry: SharedRegistry,
    /// Fires on shutdown. Retries stop; attempts in flight finish.
    pub cancel: CancellationToken,
}

/// What was done about the cycle's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intervention {
    None,
    Delivered { attempts: u32 },
    Suppressed { reason: String },
    DeliveryFailed { attempts: u32 },
    Restarted { restart_count: u32 },
    Recreated { replacement: AgentId },
    RestartRefused { restarts: u32 },
    /// The session is gone for good; the agent was deregistered.
    AgentGone,
    DispatchFailed { error: String },
}

impl fmt::Display for Intervention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intervention::None => f.write_str("none"),
            Intervention::Delivered { attempts } => write!(f, "delivered ({} attempt(s))", attempts),
            Intervention::Suppressed { reason } => write!(f, "suppressed: {}", reason),
            Intervention::DeliveryFailed { attempts } => {
                write!(f, "delivery failed after {} attempts", attempts)
            }
            Intervention::Restarted { restart_count } => write!(f, "restarted (#{})", restart_count),
            Intervention::Recreated { replacement } => {
                write!(f, "recreated as {}", replacement.short())
            }
            Intervention::RestartRefused { restarts } => {
                write!(f, "restart refused, ceiling reached ({} restarts)", restarts)
            }
            Intervention::AgentGone => f.write_str("agent gone"),
            Intervention::DispatchFailed { error } => write!(f, "dispatch failed: {}", error),
        }
    }
}

/// Result of one Guardian cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub agent_id: AgentId,
    pub at: DateTime<Utc>,
    pub previous_state: AgentState,
    pub state: AgentState,
    pub decision: MonitoringDecision,
    pub judgment: Option<GuardianJudgment>,
    /// The judgment is the oracle client's safe default.
    pub fell_back: bool,
    pub new_lines: usize,
    pub intervention: Intervention,
}

impl CycleReport {
    pub fn state_changed(&self) -> bool {
        self.previous_state != self.state
    }
}

/// A classified cycle before anything is done about it.
#[derive(Debug, Clone, PartialEq)]
struct Verdict {
    state: AgentState,
    decision: MonitoringDecision,
    /// Steering header label for nudges.
    label: &'static str,
}

impl Verdict {
    fn new(state: AgentState, decision: MonitoringDecision) -> Self {
        Self {
            state,
            decision,
            label: STUCK_LABEL,
        }
    }

    fn healthy() -> Self {
        Self::new(AgentState::Healthy, MonitoringDecision::Continue)
    }

    fn nudge(state: AgentState, message: Option<&str>, label: &'static str) -> Self {
        let decision = MonitoringDecision::nudge(message.unwrap_or_default())
            .unwrap_or_else(|_| MonitoringDecision::Nudge {
                message: IDLE_NUDGE.to_string(),
            });
        Self {
            state,
            decision,
            label,
        }
    }
}

pub struct Guardian {
    context: TrajectoryContext,
    identical_output_cycles: u32,
    confused_streak: u32,
    low_score_streak: u32,
    last_steering: Option<DateTime<Utc>>,
    retired: bool,
}

impl Guardian {
    pub fn new(task: &TaskInfo, history_cap: usize) -> Self {
        Self {
            context: TrajectoryContext::new(task, history_cap),
            identical_output_cycles: 0,
            confused_streak: 0,
            low_score_streak: 0,
            last_steering: None,
            retired: false,
        }
    }

    pub fn context(&self) -> &TrajectoryContext {
        &self.context
    }

    /// Consecutive cycles that saw no new output.
    pub fn identical_output_cycles(&self) -> u32 {
        self.identical_output_cycles
    }

    /// Set once the agent has been replaced; the Guardian is then discarded.
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub async fn run_cycle(&mut self, agent: &AgentRegistryEntry, deps: &GuardianDeps) -> CycleReport {
        let now = Utc::now();
        let cfg = &deps.monitor;

        // Only a missing session is retried no further; everything else may clear up.
        let read = RetryPolicy::for_session_read(cfg)
            .run(
                &deps.cancel,
                |_| {
                    with_timeout(
                        cfg.session_read_timeout(),
                        deps.inspector.read_recent_output(&agent.session, cfg.output_lines),
                    )
                },
                |err| !matches!(err, Error::SessionUnavailable(_)),
            )
            .await;
        let lines = match read.result {
            Ok(lines) => lines,
            Err(err @ Error::SessionUnavailable(_)) => {
                olog_warn!("guardian {}: session is gone: {}", agent.agent_id.short(), err);
                self.context.record(JudgmentSummary::observation(
                    now,
                    self.context.phase(),
                    format!("Session unavailable: {}", err),
                ));
                let verdict = Verdict::new(AgentState::StuckError, MonitoringDecision::Restart);
                let context = format!("The agent process exited or its session disappeared ({}).", err);
                let intervention = self.act(agent, &verdict, &[], &context, deps, now).await;
                return self.report(agent, now, verdict, None, false, 0, intervention);
            }
            Err(err) => {
                olog_warn!(
                    "guardian {}: session read failed after {} attempt(s), skipping cycle: {}",
                    agent.agent_id.short(),
                    read.attempts,
                    err
                );
                self.context.record(JudgmentSummary::observation(
                    now,
                    self.context.phase(),
                    format!("Session unreadable: {}", err),
                ));
                let verdict = Verdict::new(agent.state, MonitoringDecision::Continue);
                return self.report(agent, now, verdict, None, false, 0, Intervention::None);
            }
        };

        let fresh: Vec<String> = self
            .context
            .incorporate(&lines)
            .into_iter()
            .filter(|l| !l.contains(STEERING_PREFIX))
            .collect();
        self.identical_output_cycles = if fresh.is_empty() {
            self.identical_output_cycles + 1
        } else {
            1
        };

        if let Some(limit) = cfg.task_timeout(&agent.task) {
            if agent.age(now) > limit {
                let minutes = limit.as_secs() / 60;
                olog!(
                    "guardian {}: task {} exceeded {} minutes",
                    agent.agent_id.short(),
                    agent.task.task_id,
                    minutes
                );
                self.context.record(JudgmentSummary::observation(
                    now,
                    self.context.phase(),
                    format!("Task timed out after {} minutes", minutes),
                ));
                let verdict = Verdict::new(AgentState::Unrecoverable, MonitoringDecision::Recreate);
                let context = format!(
                    "The task timed out after {} minutes without completing. Start over with a fresh approach.",
                    minutes
                );
                let intervention = self.act(agent, &verdict, &lines, &context, deps, now).await;
                return self.report(agent, now, verdict, None, false, fresh.len(), intervention);
            }
        }

        if cfg.first_pass_check {
            if let Some((verdict, summary)) = self.first_pass(agent, &lines, &fresh, deps).await {
                self.context
                    .record(JudgmentSummary::observation(now, self.context.phase(), summary));
                let intervention = self.act(agent, &verdict, &lines, "", deps, now).await;
                return self.report(agent, now, verdict, None, false, fresh.len(), intervention);
            }
        }

        let request = TrajectoryRequest {
            agent_id: agent.agent_id.clone(),
            task: agent.task.clone(),
            new_output: fresh.clone(),
            trajectory: self.context.snapshot(),
        };
        let judged = deps.oracle.analyze_trajectory(&request).await;
        let judgment = judged.value;

        // A fallback judgment never drives an action and never moves a streak.
        let verdict = if judged.fell_back {
            Verdict::healthy()
        } else {
            self.classify(&judgment, fresh.is_empty(), cfg)
        };
        self.context.set_phase(judgment.current_phase);
        self.context.record(JudgmentSummary::from_judgment(now, &judgment));

        let failure_context = failure_context(&judgment);
        let intervention = self
            .act(agent, &verdict, &lines, &failure_context, deps, now)
            .await;
        self.report(
            agent,
            now,
            verdict,
            Some(judgment),
            judged.fell_back,
            fresh.len(),
            intervention,
        )
    }

    /// Cheap coarse check. `Some` short-circuits the trajectory call.
    async fn first_pass(
        &self,
        agent: &AgentRegistryEntry,
        lines: &[String],
        fresh: &[String],
        deps: &GuardianDeps,
    ) -> Option<(Verdict, String)> {
        let request = AgentStateRequest {
            agent_id: agent.agent_id.clone(),
            task: agent.task.clone(),
            output: lines.to_vec(),
            idle_cycles: self.identical_output_cycles,
        };
        let judged = deps.oracle.analyze_state(&request).await;
        let analysis = judged.value;
        if judged.fell_back || analysis.confidence < deps.monitor.first_pass_confidence {
            return None;
        }

        match (analysis.state, analysis.decision) {
            (AgentState::Healthy, DecisionKind::Continue) if !fresh.is_empty() => Some((
                Verdict::healthy(),
                format!("First pass: healthy ({})", truncate(&analysis.reasoning, 120)),
            )),
            // An unrecoverable agent gets a new process, never a typed answer.
            (state, DecisionKind::Answer) if state.allows_soft_intervention() => {
                let decision = analysis.to_decision().ok()?;
                Some((
                    Verdict::new(state, decision),
                    format!("First pass: answered question ({})", truncate(&analysis.reasoning, 120)),
                ))
            }
            _ => None,
        }
    }

    fn classify(&mut self, judgment: &GuardianJudgment, output_unchanged: bool, cfg: &MonitorConfig) -> Verdict {
        if judgment.alignment_score < cfg.low_alignment_threshold {
            self.low_score_streak += 1;
        } else {
            self.low_score_streak = 0;
        }
        let confused = judgment.needs_steering && judgment.steering_type == Some(SteeringType::Confused);
        if confused {
            self.confused_streak += 1;
        } else {
            self.confused_streak = 0;
        }

        if self.low_score_streak >= cfg.low_alignment_cycles {
            return Verdict::new(AgentState::Unrecoverable, MonitoringDecision::Recreate);
        }

        if judgment.needs_steering {
            if let Some(kind) = judgment.steering_type {
                let recommendation = judgment.recommendation();
                return match kind {
                    SteeringType::Stuck => {
                        Verdict::nudge(AgentState::StuckWaiting, recommendation, kind.label())
                    }
                    SteeringType::Drifting
                    | SteeringType::OverEngineering
                    | SteeringType::ViolatingConstraints => {
                        Verdict::nudge(AgentState::StuckConfused, recommendation, kind.label())
                    }
                    SteeringType::Confused if self.confused_streak >= cfg.confused_cycles => {
                        Verdict::new(AgentState::StuckConfused, MonitoringDecision::Restart)
                    }
                    SteeringType::Confused => {
                        Verdict::nudge(AgentState::StuckConfused, recommendation, kind.label())
                    }
                };
            }
        }

        if output_unchanged
            && self.identical_output_cycles >= cfg.stuck_waiting_cycles
            && judgment.current_phase != TrajectoryPhase::Completed
        {
            return Verdict::nudge(AgentState::StuckWaiting, Some(IDLE_NUDGE), STUCK_LABEL);
        }

        if judgment.trajectory_aligned {
            Verdict::healthy()
        } else {
            Verdict::new(AgentState::StuckConfused, MonitoringDecision::Continue)
        }
    }

    async fn act(
        &mut self,
        agent: &AgentRegistryEntry,
        verdict: &Verdict,
        window: &[String],
        failure_context: &str,
        deps: &GuardianDeps,
        now: DateTime<Utc>,
    ) -> Intervention {
        match &verdict.decision {
            MonitoringDecision::Continue => Intervention::None,
            MonitoringDecision::Nudge { message } => {
                if let Some(reason) = self.suppression(window, deps, now) {
                    olog!("guardian {}: nudge suppressed ({})", agent.agent_id.short(), reason);
                    return Intervention::Suppressed { reason };
                }
                let steering = SteeringMessage::new(verdict.label, message.as_str());
                let delivered = deliver_with_retry(
                    &deps.cancel,
                    deps.lifecycle.as_ref(),
                    deps.inspector.as_ref(),
                    &agent.agent_id,
                    &agent.session,
                    &steering.text(),
                    &steering.header(),
                    &deps.delivery,
                )
                .await;
                match delivered {
                    Ok(attempts) => {
                        self.last_steering = Some(now);
                        Intervention::Delivered { attempts }
                    }
                    Err(Error::DeliveryFailed { attempts, .. }) => Intervention::DeliveryFailed { attempts },
                    Err(Error::AgentGone { .. }) => self.forget(agent, deps).await,
                    Err(err) => Intervention::DispatchFailed {
                        error: err.to_string(),
                    },
                }
            }
            MonitoringDecision::Answer { message } => {
                if shows_queued(window, &deps.monitor.queued_message_marker) {
                    return Intervention::Suppressed {
                        reason: "previous message still queued".to_string(),
                    };
                }
                let sent = with_timeout(
                    deps.delivery.send_timeout(),
                    deps.lifecycle.send_message(&agent.agent_id, &agent.session, message),
                )
                .await;
                match sent {
                    Ok(()) => Intervention::Delivered { attempts: 1 },
                    Err(Error::AgentGone { .. }) => self.forget(agent, deps).await,
                    Err(err) => Intervention::DispatchFailed {
                        error: err.to_string(),
                    },
                }
            }
            MonitoringDecision::Restart | MonitoringDecision::Recreate => {
                self.replace_process(agent, &verdict.decision, failure_context, deps, now)
                    .await
            }
        }
    }

    fn suppression(&self, window: &[String], deps: &GuardianDeps, now: DateTime<Utc>) -> Option<String> {
        if shows_queued(window, &deps.monitor.queued_message_marker) {
            return Some("previous message still queued".to_string());
        }
        let cooldown = chrono::Duration::from_std(deps.monitor.steering_cooldown()).ok()?;
        match self.last_steering {
            Some(at) if now.signed_duration_since(at) < cooldown => {
                Some(format!("steered {}s ago", now.signed_duration_since(at).num_seconds()))
            }
            _ => None,
        }
    }

    async fn replace_process(
        &mut self,
        agent: &AgentRegistryEntry,
        decision: &MonitoringDecision,
        failure_context: &str,
        deps: &GuardianDeps,
        now: DateTime<Utc>,
    ) -> Intervention {
        let cfg = &deps.monitor;
        let verdict = deps.registry.write().await.try_begin_restart(
            &agent.agent_id,
            now,
            cfg.restart_ceiling,
            cfg.restart_window(),
        );
        let restart_count = match verdict {
            RestartVerdict::Allowed { restart_count } => restart_count,
            RestartVerdict::CeilingReached {
                restarts,
                newly_fatal,
            } => {
                if newly_fatal {
                    deps.escalations.escalate(Escalation::guardian(
                        &agent.agent_id,
                        format!(
                            "restart ceiling reached ({} restarts within {}s); automatic restarts stopped. Last context: {}",
                            restarts,
                            cfg.restart_window_secs,
                            truncate(failure_context, 200)
                        ),
                    ));
                }
                return Intervention::RestartRefused { restarts };
            }
            RestartVerdict::NotRegistered => {
                return Intervention::Suppressed {
                    reason: "agent no longer registered".to_string(),
                };
            }
        };

        if *decision == MonitoringDecision::Recreate {
            let prompt = match deps.oracle.generate_agent_prompt(&agent.task).await {
                Ok(prompt) if !prompt.trim().is_empty() => Some(prompt),
                Ok(_) => None,
                Err(err) => {
                    olog_debug!(
                        "guardian {}: no generated prompt for replacement: {}",
                        agent.agent_id.short(),
                        err
                    );
                    None
                }
            };
            let recreated = deps
                .lifecycle
                .recreate(
                    &agent.agent_id,
                    &agent.session,
                    &agent.task,
                    failure_context,
                    prompt.as_deref(),
                )
                .await;
            return match recreated {
                Ok(replacement) => {
                    deps.registry
                        .write()
                        .await
                        .replace_agent(&agent.agent_id, &replacement);
                    self.retired = true;
                    Intervention::Recreated {
                        replacement: replacement.agent_id,
                    }
                }
                Err(Error::AgentGone { .. }) => self.forget(agent, deps).await,
                Err(err) => Intervention::DispatchFailed {
                    error: err.to_string(),
                },
            };
        }

        let restarted = deps
            .lifecycle
            .restart(&agent.agent_id, &agent.session, &agent.task, failure_context)
            .await;
        match restarted {
            Ok(()) => {
                self.context.reset_marker();
                self.identical_output_cycles = 0;
                self.confused_streak = 0;
                self.low_score_streak = 0;
                self.last_steering = None;
                Intervention::Restarted { restart_count }
            }
            Err(Error::AgentGone { .. }) => self.forget(agent, deps).await,
            Err(err) => Intervention::DispatchFailed {
                error: err.to_string(),
            },
        }
    }

    async fn forget(&mut self, agent: &AgentRegistryEntry, deps: &GuardianDeps) -> Intervention {
        olog!("guardian {}: session gone, deregistering", agent.agent_id.short());
        deps.registry.write().await.remove(&agent.agent_id);
        self.retired = true;
        Intervention::AgentGone
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        agent: &AgentRegistryEntry,
        at: DateTime<Utc>,
        verdict: Verdict,
        judgment: Option<GuardianJudgment>,
        fell_back: bool,
        new_lines: usize,
        intervention: Intervention,
    ) -> CycleReport {
        let state = match intervention {
            Intervention::RestartRefused { .. } => AgentState::Unrecoverable,
            _ => verdict.state,
        };
        let report = CycleReport {
            agent_id: agent.agent_id.clone(),
            at,
            previous_state: agent.state,
            state,
            decision: verdict.decision,
            judgment,
            fell_back,
            new_lines,
            intervention,
        };
        log_report(&report);
        report
    }
}

fn shows_queued(window: &[String], marker: &str) -> bool {
    !marker.is_empty() && window.iter().any(|l| l.contains(marker))
}

fn failure_context(judgment: &GuardianJudgment) -> String {
    let mut context = judgment.trajectory_summary.trim().to_string();
    if !judgment.alignment_issues.is_empty() {
        if !context.is_empty() {
            context.push_str(" Issues: ");
        }
        context.push_str(&judgment.alignment_issues.join("; "));
    }
    context
}

fn log_report(report: &CycleReport) {
    let id = report.agent_id.short();
    let at = report.at.format("%H:%M:%S");
    if report.state_changed() {
        olog!("guardian {} @{}: {} -> {}", id, at, report.previous_state, report.state);
    }
    let summary = report
        .judgment
        .as_ref()
        .map(|j| {
            format!(
                "{} {:.2} {}",
                j.current_phase,
                j.alignment_score,
                truncate(&j.trajectory_summary, 80)
            )
        })
        .unwrap_or_else(|| "no judgment".to_string());
    if report.fell_back {
        olog_warn!("guardian {} @{}: fallback judgment ({})", id, at, summary);
    }
    match (&report.decision, &report.intervention) {
        (MonitoringDecision::Continue, Intervention::None) => olog_debug!(
            "guardian {} @{}: {} CONTINUE, {} new line(s) | {}",
            id,
            at,
            report.state,
            report.new_lines,
            summary
        ),
        (decision, intervention) => olog!(
            "guardian {} @{}: {} {} -> {} | {}",
            id,
            at,
            report.state,
            decision,
            intervention,
            summary
        ),
    }
}

//! Test fixtures for integration tests.
//!
//! Provides:
//! - `ScriptedOracle`: plays back queued judgments and counts calls
//! - `FakeSessions`: in-memory agent sessions acting as both inspector and
//!   lifecycle manager, with injectable read failures and exited processes
//! - `Harness`: a `Monitor` wired to the fakes plus every output channel

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use overseer::agent::{AgentId, TaskInfo};
use overseer::config::Config;
use overseer::monitoring::oracle::{AgentStateRequest, CoherenceRequest, TrajectoryRequest};
use overseer::monitoring::{
    AgentLifecycleManager, AgentRegistryEntry, AgentState, AgentStateAnalysis, Capability,
    ChannelEscalationSink, ChannelTaskCreator, Collaborators, ConductorJudgment, DecisionKind, Escalation,
    GuardianJudgment, Monitor, MonitorEvent, OracleClient, ReasoningOracle, Replacement,
    SessionHandle, SessionInspector, SteeringType, TrajectoryPhase,
};
use overseer::retry::RetryPolicy;
use overseer::{Error, Result};

/// One scripted provider answer.
#[derive(Debug, Clone)]
pub enum Script<T> {
    Reply(T),
    /// A transient failure (unparseable output).
    Fail(String),
    /// Never answers; the client's call timeout has to cut it off.
    Hang,
    /// Answers after a delay.
    Slow(Duration, T),
}

/// A reasoning provider that plays back queued answers.
///
/// When a queue runs dry the provider answers with a healthy judgment.
pub struct ScriptedOracle {
    state: Mutex<VecDeque<Script<AgentStateAnalysis>>>,
    trajectory: Mutex<VecDeque<Script<GuardianJudgment>>>,
    coherence: Mutex<VecDeque<Script<ConductorJudgment>>>,
    /// Agents whose trajectory call panics.
    panic_for: Mutex<HashSet<AgentId>>,
    requests: Mutex<Vec<TrajectoryRequest>>,
    /// Brief returned by `generate_agent_prompt`; unsupported when unset.
    agent_prompt: Mutex<Option<String>>,
    state_calls: AtomicUsize,
    trajectory_calls: AtomicUsize,
    coherence_calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(VecDeque::new()),
            trajectory: Mutex::new(VecDeque::new()),
            coherence: Mutex::new(VecDeque::new()),
            panic_for: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
            agent_prompt: Mutex::new(None),
            state_calls: AtomicUsize::new(0),
            trajectory_calls: AtomicUsize::new(0),
            coherence_calls: AtomicUsize::new(0),
        })
    }

    pub fn push_state(&self, script: Script<AgentStateAnalysis>) {
        self.state.lock().unwrap().push_back(script);
    }

    pub fn set_agent_prompt(&self, prompt: &str) {
        *self.agent_prompt.lock().unwrap() = Some(prompt.to_string());
    }

    pub fn state_calls(&self) -> usize {
        self.state_calls.load(Ordering::SeqCst)
    }

    pub fn push_trajectory(&self, script: Script<GuardianJudgment>) {
        self.trajectory.lock().unwrap().push_back(script);
    }

    pub fn push_coherence(&self, script: Script<ConductorJudgment>) {
        self.coherence.lock().unwrap().push_back(script);
    }

    pub fn panic_for(&self, agent: &AgentId) {
        self.panic_for.lock().unwrap().insert(agent.clone());
    }

    pub fn trajectory_calls(&self) -> usize {
        self.trajectory_calls.load(Ordering::SeqCst)
    }

    pub fn coherence_calls(&self) -> usize {
        self.coherence_calls.load(Ordering::SeqCst)
    }

    /// Every trajectory request seen so far, in call order.
    pub fn requests(&self) -> Vec<TrajectoryRequest> {
        self.requests.lock().unwrap().clone()
    }

    async fn play<T>(script: Option<Script<T>>, default: T) -> Result<T> {
        match script {
            None => Ok(default),
            Some(Script::Reply(value)) => Ok(value),
            Some(Script::Fail(reason)) => Err(Error::MalformedResponse(reason)),
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Slow(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
        }
    }
}

#[async_trait]
impl ReasoningOracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> &[Capability] {
        &[
            Capability::AnalyzeAgentState,
            Capability::AnalyzeAgentTrajectory,
            Capability::AnalyzeSystemCoherence,
            Capability::GenerateAgentPrompt,
        ]
    }

    async fn analyze_agent_state(&self, _request: &AgentStateRequest) -> Result<AgentStateAnalysis> {
        self.state_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.state.lock().unwrap().pop_front();
        Self::play(script, AgentStateAnalysis::fallback()).await
    }

    async fn generate_agent_prompt(&self, _task: &TaskInfo) -> Result<String> {
        match self.agent_prompt.lock().unwrap().clone() {
            Some(prompt) => Ok(prompt),
            None => Err(self.unsupported(Capability::GenerateAgentPrompt)),
        }
    }

    async fn analyze_agent_trajectory(&self, request: &TrajectoryRequest) -> Result<GuardianJudgment> {
        self.trajectory_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if self.panic_for.lock().unwrap().contains(&request.agent_id) {
            panic!("scripted oracle exploded for {}", request.agent_id);
        }
        let script = self.trajectory.lock().unwrap().pop_front();
        Self::play(script, healthy()).await
    }

    async fn analyze_system_coherence(&self, _request: &CoherenceRequest) -> Result<ConductorJudgment> {
        self.coherence_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.coherence.lock().unwrap().pop_front();
        Self::play(script, coherent(0.9)).await
    }
}

/// An aligned agent making progress.
pub fn healthy() -> GuardianJudgment {
    GuardianJudgment {
        current_phase: TrajectoryPhase::Implementation,
        trajectory_aligned: true,
        alignment_score: 0.9,
        alignment_issues: Vec::new(),
        needs_steering: false,
        steering_type: None,
        steering_recommendation: None,
        trajectory_summary: "implementing the task".to_string(),
    }
}

/// Misaligned with the given score, no steering advice.
pub fn misaligned(score: f64) -> GuardianJudgment {
    GuardianJudgment {
        trajectory_aligned: false,
        alignment_score: score,
        alignment_issues: vec!["rewriting unrelated modules".to_string()],
        trajectory_summary: "wandering off task".to_string(),
        ..healthy()
    }
}

pub fn steering(kind: SteeringType, recommendation: &str) -> GuardianJudgment {
    GuardianJudgment {
        trajectory_aligned: false,
        alignment_score: 0.5,
        needs_steering: true,
        steering_type: Some(kind),
        steering_recommendation: Some(recommendation.to_string()),
        trajectory_summary: format!("needs {}", kind.label()),
        ..healthy()
    }
}

/// A confident first-pass answer.
pub fn state_analysis(state: AgentState, decision: DecisionKind, message: &str) -> AgentStateAnalysis {
    AgentStateAnalysis {
        state,
        decision,
        message: message.to_string(),
        reasoning: "output is clear".to_string(),
        confidence: 0.95,
    }
}

pub fn coherent(score: f64) -> ConductorJudgment {
    ConductorJudgment {
        coherence_score: score,
        duplicates: Vec::new(),
        alignment_issues: Vec::new(),
        termination_recommendations: Vec::new(),
        coordination_needs: Vec::new(),
        system_summary: "agents working on distinct tasks".to_string(),
    }
}

/// A failure injected into session reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailure {
    /// The read outlives its deadline.
    Timeout,
    /// tmux itself errors (server busy, socket trouble).
    Tmux,
}

/// In-memory agent sessions.
///
/// Sent text is appended to the target pane when echo is on, so read-back
/// verification succeeds. Every lifecycle call is recorded. A closed session
/// cannot be brought back; a session whose process exited can be restarted.
pub struct FakeSessions {
    panes: Mutex<HashMap<String, Vec<String>>>,
    /// Sessions whose process has exited but whose pane is kept.
    exited: Mutex<HashSet<String>>,
    read_failures: Mutex<HashMap<String, VecDeque<ReadFailure>>>,
    reads: AtomicUsize,
    echo: AtomicBool,
    replacements: AtomicUsize,
    pub sent: Mutex<Vec<(AgentId, String)>>,
    pub restarted: Mutex<Vec<AgentId>>,
    pub recreated: Mutex<Vec<AgentId>>,
    /// Prompt handed to each recreation, in call order.
    pub recreate_prompts: Mutex<Vec<Option<String>>>,
    pub terminated: Mutex<Vec<AgentId>>,
    pub killed: Mutex<Vec<SessionHandle>>,
}

impl FakeSessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            panes: Mutex::new(HashMap::new()),
            exited: Mutex::new(HashSet::new()),
            read_failures: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            echo: AtomicBool::new(true),
            replacements: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            restarted: Mutex::new(Vec::new()),
            recreated: Mutex::new(Vec::new()),
            recreate_prompts: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
        })
    }

    /// Make the next `count` reads of `session` fail with `failure`.
    pub fn fail_reads(&self, session: &str, count: usize, failure: ReadFailure) {
        self.read_failures
            .lock()
            .unwrap()
            .entry(session.to_string())
            .or_default()
            .extend(std::iter::repeat(failure).take(count));
    }

    /// The agent process exits; the pane and its last output stay.
    pub fn exit_process(&self, session: &str) {
        self.exited.lock().unwrap().insert(session.to_string());
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn open(&self, session: &str, lines: &[&str]) {
        self.panes
            .lock()
            .unwrap()
            .insert(session.to_string(), lines.iter().map(|l| l.to_string()).collect());
    }

    pub fn append(&self, session: &str, lines: &[&str]) {
        if let Some(pane) = self.panes.lock().unwrap().get_mut(session) {
            pane.extend(lines.iter().map(|l| l.to_string()));
        }
    }

    pub fn close(&self, session: &str) {
        self.panes.lock().unwrap().remove(session);
    }

    pub fn is_open(&self, session: &str) -> bool {
        self.panes.lock().unwrap().contains_key(session)
    }

    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::SeqCst);
    }

    pub fn sends_to(&self, agent: &AgentId) -> usize {
        self.sent.lock().unwrap().iter().filter(|(a, _)| a == agent).count()
    }

    pub fn session_names(&self) -> Vec<String> {
        self.panes.lock().unwrap().keys().cloned().collect()
    }

    /// Restarts, recreates and terminations combined.
    pub fn lifecycle_calls(&self) -> usize {
        self.restarted.lock().unwrap().len()
            + self.recreated.lock().unwrap().len()
            + self.terminated.lock().unwrap().len()
    }

    fn require(&self, agent: &AgentId, session: &SessionHandle) -> Result<()> {
        if self.is_open(session.name()) {
            Ok(())
        } else {
            Err(Error::AgentGone { id: agent.clone() })
        }
    }
}

#[async_trait]
impl SessionInspector for FakeSessions {
    async fn read_recent_output(&self, session: &SessionHandle, max_lines: usize) -> Result<Vec<String>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .read_failures
            .lock()
            .unwrap()
            .get_mut(session.name())
            .and_then(VecDeque::pop_front);
        match failure {
            Some(ReadFailure::Timeout) => return Err(Error::Timeout(Duration::from_secs(5))),
            Some(ReadFailure::Tmux) => return Err(Error::Tmux("server exited unexpectedly".to_string())),
            None => {}
        }
        if self.exited.lock().unwrap().contains(session.name()) {
            return Err(Error::SessionUnavailable(session.name().to_string()));
        }
        let panes = self.panes.lock().unwrap();
        let pane = panes
            .get(session.name())
            .ok_or_else(|| Error::SessionUnavailable(session.name().to_string()))?;
        let start = pane.len().saturating_sub(max_lines);
        Ok(pane[start..].to_vec())
    }
}

#[async_trait]
impl AgentLifecycleManager for FakeSessions {
    async fn send_message(&self, agent: &AgentId, session: &SessionHandle, text: &str) -> Result<()> {
        self.require(agent, session)?;
        self.sent.lock().unwrap().push((agent.clone(), text.to_string()));
        if self.echo.load(Ordering::SeqCst) {
            let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
            self.append(session.name(), &lines);
        }
        Ok(())
    }

    async fn restart(
        &self,
        agent: &AgentId,
        session: &SessionHandle,
        _task: &TaskInfo,
        _failure_context: &str,
    ) -> Result<()> {
        self.require(agent, session)?;
        self.exited.lock().unwrap().remove(session.name());
        self.restarted.lock().unwrap().push(agent.clone());
        self.append(session.name(), &["$ claude --continue", "Resuming task"]);
        Ok(())
    }

    async fn recreate(
        &self,
        agent: &AgentId,
        session: &SessionHandle,
        _task: &TaskInfo,
        _failure_context: &str,
        prompt: Option<&str>,
    ) -> Result<Replacement> {
        self.recreated.lock().unwrap().push(agent.clone());
        self.recreate_prompts.lock().unwrap().push(prompt.map(String::from));
        let n = self.replacements.fetch_add(1, Ordering::SeqCst) + 1;
        let agent_id = AgentId::from(format!("{}-r{}", agent, n));
        let name = format!("{}-r{}", session.name(), n);
        self.close(session.name());
        self.open(&name, &["$ claude", "Starting fresh on the task"]);
        Ok(Replacement {
            agent_id,
            session: SessionHandle::new(name),
        })
    }

    async fn terminate(&self, agent: &AgentId, session: &SessionHandle) -> Result<()> {
        self.require(agent, session)?;
        self.terminated.lock().unwrap().push(agent.clone());
        self.close(session.name());
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionHandle>> {
        Ok(self
            .session_names()
            .into_iter()
            .filter(|name| name.starts_with("overseer_"))
            .map(SessionHandle::new)
            .collect())
    }

    async fn kill_session(&self, session: &SessionHandle) -> Result<()> {
        self.killed.lock().unwrap().push(session.clone());
        self.close(session.name());
        Ok(())
    }
}

/// Config tuned for tests: no settle delay, immediate oracle retries,
/// no steering cooldown and every agent due on the first sweep.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.monitor.min_agent_age_secs = 0;
    config.monitor.steering_cooldown_secs = 0;
    config.monitor.first_pass_check = false;
    config.monitor.history_cap = 5;
    config.monitor.session_read_retry_ms = 0;
    config.monitor.agent_timeout_mins = 0;
    config.delivery.settle_ms = 0;
    config.oracle.retry_delay_ms = 0;
    config.oracle.max_attempts = 3;
    config.oracle.timeout_secs = 5;
    config
}

/// A monitor wired to fakes, with every output channel exposed.
pub struct Harness {
    pub monitor: Monitor,
    pub events: mpsc::UnboundedReceiver<MonitorEvent>,
    pub escalations: mpsc::UnboundedReceiver<Escalation>,
    pub tasks: mpsc::UnboundedReceiver<Vec<String>>,
    pub oracle: Arc<ScriptedOracle>,
    pub sessions: Arc<FakeSessions>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let oracle = ScriptedOracle::new();
        let sessions = FakeSessions::new();
        let (sink, escalations) = ChannelEscalationSink::new();
        let (creator, tasks) = ChannelTaskCreator::new();
        let client = OracleClient::new(
            oracle.clone(),
            RetryPolicy::fixed(config.oracle.max_attempts, Duration::ZERO),
            config.oracle.call_timeout(),
        );
        let (monitor, events) = Monitor::new(
            &config,
            Collaborators {
                oracle: client,
                inspector: sessions.clone(),
                lifecycle: sessions.clone(),
                escalations: Arc::new(sink),
                tasks: Arc::new(creator),
            },
        )
        .expect("test config is valid");
        Self {
            monitor,
            events,
            escalations,
            tasks,
            oracle,
            sessions,
        }
    }

    /// Open a session for `id` and register the agent.
    pub async fn add_agent(&self, id: &str, lines: &[&str]) -> AgentId {
        self.add_agent_created(id, lines, Utc::now()).await
    }

    pub async fn add_agent_created(&self, id: &str, lines: &[&str], created_at: DateTime<Utc>) -> AgentId {
        let agent_id = AgentId::from(id);
        let session = format!("overseer_{}", id);
        self.sessions.open(&session, lines);
        let entry = AgentRegistryEntry::new(
            agent_id.clone(),
            TaskInfo::new(format!("task-{}", id), "Add CSV export to the report module"),
            SessionHandle::new(session),
        )
        .with_created_at(created_at);
        self.monitor
            .register_entry(entry)
            .await
            .expect("agent registers");
        agent_id
    }

    /// Drain every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<MonitorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn drain_escalations(&mut self) -> Vec<Escalation> {
        let mut out = Vec::new();
        while let Ok(escalation) = self.escalations.try_recv() {
            out.push(escalation);
        }
        out
    }
}

pub fn session_of(id: &str) -> String {
    format!("overseer_{}", id)
}

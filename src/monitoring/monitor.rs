//! The monitoring loop: owns the registry and drives Guardian sweeps and
//! Conductor cycles on two independent intervals.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentId, TaskInfo};
use crate::config::Config;
use crate::util::with_timeout;
use crate::{olog, olog_debug, olog_error, olog_warn, Error, Result};

use super::conductor::{coordination_messages, Conductor, ConductorReport};
use super::escalation::{Escalation, EscalationSink, TaskCreator};
use super::guardian::{CycleReport, Guardian, GuardianDeps, Intervention};
use super::inspector::{SessionHandle, SessionInspector};
use super::lifecycle::AgentLifecycleManager;
use super::oracle::OracleClient;
use super::registry::{AgentRegistry, AgentRegistryEntry, SharedRegistry};
use super::types::SystemDecision;

/// Lifecycle of the loop itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Stopped => "stopped",
            LoopState::Starting => "starting",
            LoopState::Running => "running",
            LoopState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Events emitted by the monitor.
///
/// These let an operator surface (log tailer, dashboard, tests) follow what
/// the core is doing without polling the registry.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A Guardian cycle finished.
    Evaluated(CycleReport),
    /// A steering message could not be verified after every attempt.
    DeliveryFailed { agent_id: AgentId, attempts: u32 },
    /// A Guardian cycle panicked; the agent gets a fresh Guardian next sweep.
    EvaluationPanicked { agent_id: AgentId, error: String },
    /// An agent left the registry because of a decision or a dead session.
    AgentRemoved { agent_id: AgentId, reason: String },
    /// A recreated agent took over its predecessor's task.
    AgentReplaced { old: AgentId, new: AgentId },
    /// A Conductor cycle finished.
    SystemEvaluated(ConductorReport),
    /// An agent session nobody owned was killed.
    SessionReaped { session: SessionHandle },
}

/// Outcome of one Guardian sweep.
#[derive(Debug, Default)]
pub struct SweepSummary {
    pub reports: Vec<CycleReport>,
    pub panicked: Vec<AgentId>,
    /// Checked out but cancelled before the cycle started.
    pub cancelled: Vec<AgentId>,
}

impl SweepSummary {
    pub fn report_for(&self, id: &AgentId) -> Option<&CycleReport> {
        self.reports.iter().find(|r| &r.agent_id == id)
    }
}

/// External collaborators the monitor acts through.
#[derive(Clone)]
pub struct Collaborators {
    pub oracle: OracleClient,
    pub inspector: Arc<dyn SessionInspector>,
    pub lifecycle: Arc<dyn AgentLifecycleManager>,
    pub escalations: Arc<dyn EscalationSink>,
    pub tasks: Arc<dyn TaskCreator>,
}

pub struct Monitor {
    deps: GuardianDeps,
    tasks: Arc<dyn TaskCreator>,
    conductor: Mutex<Conductor>,
    /// When each unowned session was first seen.
    orphans: Mutex<HashMap<SessionHandle, DateTime<Utc>>>,
    permits: Arc<Semaphore>,
    events: mpsc::UnboundedSender<MonitorEvent>,
    state: Arc<watch::Sender<LoopState>>,
}

impl Monitor {
    pub fn new(config: &Config, parts: Collaborators) -> Result<(Self, mpsc::UnboundedReceiver<MonitorEvent>)> {
        config.validate()?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LoopState::Stopped);
        let cancel = CancellationToken::new();
        let monitor = Self {
            deps: GuardianDeps {
                monitor: config.monitor.clone(),
                delivery: config.delivery.clone(),
                oracle: parts.oracle.with_cancellation(cancel.clone()),
                inspector: parts.inspector,
                lifecycle: parts.lifecycle,
                escalations: parts.escalations,
                registry: AgentRegistry::shared(),
                cancel,
            },
            tasks: parts.tasks,
            conductor: Mutex::new(Conductor::new(config.conductor.clone(), config.goals.clone())?),
            orphans: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(config.monitor.max_concurrent_evaluations.max(1))),
            events,
            state: Arc::new(state),
        };
        Ok((monitor, events_rx))
    }

    pub fn registry(&self) -> SharedRegistry {
        self.deps.registry.clone()
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub async fn register_agent(&self, agent_id: AgentId, task: TaskInfo, session: SessionHandle) -> Result<()> {
        self.register_entry(AgentRegistryEntry::new(agent_id, task, session)).await
    }

    pub async fn register_entry(&self, entry: AgentRegistryEntry) -> Result<()> {
        let id = entry.agent_id.clone();
        if self.deps.registry.write().await.register(entry) {
            Ok(())
        } else {
            Err(Error::Validation(format!("agent {} is already registered", id)))
        }
    }

    /// Remove an agent whose task reached a terminal status.
    pub async fn deregister_agent(&self, agent_id: &AgentId) -> bool {
        let removed = self.deps.registry.write().await.remove(agent_id).is_some();
        if removed {
            self.emit(MonitorEvent::AgentRemoved {
                agent_id: agent_id.clone(),
                reason: "deregistered".to_string(),
            });
        }
        removed
    }

    /// Evaluate every due agent once and wait for all cycles to finish.
    ///
    /// Once the monitor is shutting down, agents still waiting for a permit
    /// are handed back unevaluated.
    pub async fn run_guardian_sweep(&self) -> SweepSummary {
        let cfg = &self.deps.monitor;
        let cancel = &self.deps.cancel;
        let checkouts = self
            .deps
            .registry
            .write()
            .await
            .checkout_due(Utc::now(), cfg.min_agent_age());
        if checkouts.is_empty() {
            return SweepSummary::default();
        }
        olog_debug!("guardian sweep: {} agent(s)", checkouts.len());

        let mut handles = Vec::with_capacity(checkouts.len());
        for checkout in checkouts {
            let agent_id = checkout.entry.agent_id.clone();
            let deps = self.deps.clone();
            let permits = self.permits.clone();
            let cancel = cancel.clone();
            handles.push((
                agent_id,
                tokio::spawn(async move {
                    let entry = checkout.entry;
                    let guardian = checkout.guardian;
                    let _permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return (guardian, None),
                        permit = permits.acquire_owned() => permit.ok(),
                    };
                    let mut guardian =
                        guardian.unwrap_or_else(|| Guardian::new(&entry.task, deps.monitor.history_cap));
                    let report = guardian.run_cycle(&entry, &deps).await;
                    (Some(guardian), Some(report))
                }),
            ));
        }

        let finished = join_all(
            handles
                .into_iter()
                .map(|(agent_id, handle)| async move { (agent_id, handle.await) }),
        )
        .await;

        let mut summary = SweepSummary::default();
        for (agent_id, joined) in finished {
            match joined {
                Ok((Some(guardian), Some(report))) => {
                    self.deps.registry.write().await.checkin(guardian, &report);
                    self.publish(&report);
                    summary.reports.push(report);
                }
                Ok((guardian, _)) => {
                    self.deps.registry.write().await.restore(&agent_id, guardian);
                    summary.cancelled.push(agent_id);
                }
                Err(err) => {
                    olog_error!("guardian {}: cycle aborted: {}", agent_id.short(), err);
                    self.deps.registry.write().await.release_lost(&agent_id);
                    self.emit(MonitorEvent::EvaluationPanicked {
                        agent_id: agent_id.clone(),
                        error: err.to_string(),
                    });
                    summary.panicked.push(agent_id);
                }
            }
        }
        summary
    }

    fn publish(&self, report: &CycleReport) {
        match &report.intervention {
            Intervention::DeliveryFailed { attempts } => self.emit(MonitorEvent::DeliveryFailed {
                agent_id: report.agent_id.clone(),
                attempts: *attempts,
            }),
            Intervention::AgentGone => self.emit(MonitorEvent::AgentRemoved {
                agent_id: report.agent_id.clone(),
                reason: "session gone".to_string(),
            }),
            Intervention::Recreated { replacement } => self.emit(MonitorEvent::AgentReplaced {
                old: report.agent_id.clone(),
                new: replacement.clone(),
            }),
            _ => {}
        }
        self.emit(MonitorEvent::Evaluated(report.clone()));
    }

    /// One system-wide evaluation plus dispatch of its decision.
    pub async fn run_conductor_cycle(&self) -> ConductorReport {
        // The read lock is held only for the copy.
        let snapshot = self.deps.registry.read().await.conductor_snapshot();
        let report = self
            .conductor
            .lock()
            .await
            .evaluate(snapshot, &self.deps.oracle)
            .await;
        self.dispatch_system_decision(&report.decision).await;
        self.emit(MonitorEvent::SystemEvaluated(report.clone()));
        report
    }

    /// Kill agent sessions that no registered agent owns once they have been
    /// unowned for the grace period. Returns the sessions killed.
    pub async fn reap_orphan_sessions(&self) -> Vec<SessionHandle> {
        let sessions = match self.deps.lifecycle.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                olog_warn!("orphan check: listing sessions failed: {}", e);
                return Vec::new();
            }
        };
        let owned: Vec<SessionHandle> = {
            let registry = self.deps.registry.read().await;
            registry
                .ids()
                .iter()
                .filter_map(|id| registry.get(id).map(|e| e.session.clone()))
                .collect()
        };

        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.deps.monitor.orphan_grace())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut due = Vec::new();
        {
            let mut orphans = self.orphans.lock().await;
            orphans.retain(|session, _| sessions.contains(session) && !owned.contains(session));
            for session in sessions.into_iter().filter(|s| !owned.contains(s)) {
                let first_seen = *orphans.entry(session.clone()).or_insert(now);
                if now.signed_duration_since(first_seen) >= grace {
                    due.push(session);
                }
            }
        }

        let mut reaped = Vec::new();
        for session in due {
            if self.deps.cancel.is_cancelled() {
                break;
            }
            match self.deps.lifecycle.kill_session(&session).await {
                Ok(()) => {
                    olog!("monitor: killed orphaned session {}", session);
                    self.orphans.lock().await.remove(&session);
                    self.emit(MonitorEvent::SessionReaped {
                        session: session.clone(),
                    });
                    reaped.push(session);
                }
                Err(e) => olog_warn!("monitor: failed to kill orphaned session {}: {}", session, e),
            }
        }
        reaped
    }

    pub async fn system_summary(&self) -> String {
        self.conductor.lock().await.system_summary(Utc::now())
    }

    pub async fn dispatch_system_decision(&self, decision: &SystemDecision) {
        match decision {
            SystemDecision::Continue => {}
            SystemDecision::TerminateDuplicate { targets, kept } => {
                olog!(
                    "conductor: terminating duplicates {:?}, keeping {:?}",
                    targets.iter().map(AgentId::short).collect::<Vec<_>>(),
                    kept.iter().map(AgentId::short).collect::<Vec<_>>()
                );
                for target in targets {
                    self.terminate(target).await;
                }
            }
            SystemDecision::CoordinateResources { needs } => {
                for need in needs {
                    for (agent, message) in coordination_messages(need) {
                        self.send_coordination(&agent, &message).await;
                    }
                }
            }
            SystemDecision::CreateMissingTask { hints } => {
                if let Err(e) = self.tasks.create_task(hints).await {
                    olog_warn!("conductor: missing-task request failed: {}", e);
                }
            }
            SystemDecision::Escalate { reason } => {
                self.deps.escalations.escalate(Escalation::conductor(reason.clone()));
            }
        }
    }

    async fn terminate(&self, target: &AgentId) {
        let session = match self.deps.registry.read().await.get(target) {
            Some(entry) => entry.session.clone(),
            None => {
                olog_debug!("conductor: {} already gone", target.short());
                return;
            }
        };
        match self.deps.lifecycle.terminate(target, &session).await {
            Ok(()) | Err(Error::AgentGone { .. }) => {
                self.deps.registry.write().await.remove(target);
                self.emit(MonitorEvent::AgentRemoved {
                    agent_id: target.clone(),
                    reason: "duplicate".to_string(),
                });
            }
            Err(e) => olog_error!("conductor: failed to terminate {}: {}", target.short(), e),
        }
    }

    async fn send_coordination(&self, agent: &AgentId, message: &str) {
        let found = self
            .deps
            .registry
            .read()
            .await
            .resolve(agent.as_str())
            .map(|e| (e.agent_id.clone(), e.session.clone()));
        let Some((id, session)) = found else {
            olog_warn!("conductor: coordination target {} not registered", agent);
            return;
        };
        let sent = with_timeout(
            self.deps.delivery.send_timeout(),
            self.deps.lifecycle.send_message(&id, &session, message),
        )
        .await;
        if let Err(e) = sent {
            olog_warn!("conductor: coordination message to {} failed: {}", id.short(), e);
        }
    }

    fn set_state(&self, state: LoopState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            olog!("monitor: {} -> {}", previous, state);
        }
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }

    /// Run the loop on the current runtime until the returned handle is shut down.
    pub fn spawn(self) -> MonitorHandle {
        let cancel = self.deps.cancel.clone();
        let token = cancel.clone();
        let monitor = Arc::new(self);
        let state = monitor.state.clone();
        let shutdown_timeout = monitor.deps.monitor.shutdown_timeout();
        let loop_monitor = monitor.clone();

        let task = tokio::spawn(async move {
            let monitor = loop_monitor;
            monitor.set_state(LoopState::Starting);
            let mut guardian_tick = interval(monitor.deps.monitor.guardian_interval());
            let mut conductor_tick = interval(monitor.deps.monitor.conductor_interval());
            guardian_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            conductor_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The Conductor needs Guardian judgments first; skip its immediate tick.
            conductor_tick.tick().await;
            monitor.set_state(LoopState::Running);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        olog_debug!("monitor loop cancelled");
                        break;
                    }
                    _ = guardian_tick.tick() => {
                        monitor.run_guardian_sweep().await;
                        if monitor.deps.monitor.reap_orphan_sessions && !token.is_cancelled() {
                            monitor.reap_orphan_sessions().await;
                        }
                    }
                    _ = conductor_tick.tick() => {
                        monitor.run_conductor_cycle().await;
                    }
                }
            }
            monitor.set_state(LoopState::Stopped);
        });

        MonitorHandle {
            cancel,
            task,
            state,
            monitor,
            shutdown_timeout,
        }
    }
}

/// Handle to a running monitor, used for graceful shutdown.
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state: Arc<watch::Sender<LoopState>>,
    monitor: Arc<Monitor>,
    shutdown_timeout: Duration,
}

impl MonitorHandle {
    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Stop scheduling and wait for in-flight cycles, at most the shutdown timeout.
    ///
    /// Cycles still running when the timeout elapses are left to finish on
    /// their own; they are never aborted mid-effect.
    pub async fn shutdown(self) -> Result<()> {
        let previous = self.state.send_replace(LoopState::Stopping);
        olog!("monitor: {} -> {}", previous, LoopState::Stopping);
        self.cancel.cancel();
        match tokio::time::timeout(self.shutdown_timeout, self.task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.state.send_replace(LoopState::Stopped);
                Err(Error::TaskJoin(e.to_string()))
            }
            Err(_) => {
                olog_warn!(
                    "monitor: in-flight work still running after {:?}, stopping anyway",
                    self.shutdown_timeout
                );
                self.state.send_replace(LoopState::Stopped);
                Err(Error::Timeout(self.shutdown_timeout))
            }
        }
    }
}

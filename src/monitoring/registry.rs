//! The agent registry: the one piece of mutable state shared between the
//! monitoring loop, the Guardians and the Conductor.
//!
//! Shared as `Arc<RwLock<AgentRegistry>>`. Callers hold the lock only long
//! enough to copy or update entries, never across an oracle call.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::agent::{AgentId, AgentRole, TaskInfo};
use crate::{olog, olog_debug};

use super::guardian::{CycleReport, Guardian};
use super::inspector::SessionHandle;
use super::lifecycle::Replacement;
use super::types::{AgentState, AgentSummary, GuardianJudgment};

pub type SharedRegistry = Arc<RwLock<AgentRegistry>>;

/// Everything the core tracks about one supervised agent.
#[derive(Debug, Clone)]
pub struct AgentRegistryEntry {
    pub agent_id: AgentId,
    pub task: TaskInfo,
    pub session: SessionHandle,
    pub role: AgentRole,
    pub created_at: DateTime<Utc>,
    pub last_evaluated: Option<DateTime<Utc>>,
    pub state: AgentState,
    pub restart_count: u32,
    pub last_restart: Option<DateTime<Utc>>,
    /// Restart times inside the rolling window, oldest first.
    pub restart_history: VecDeque<DateTime<Utc>>,
    /// Latest judgment that came from the oracle (fallbacks are not kept).
    pub last_judgment: Option<GuardianJudgment>,
    /// Restart ceiling reached; no more automatic restarts.
    pub fatal: bool,
}

impl AgentRegistryEntry {
    pub fn new(agent_id: AgentId, task: TaskInfo, session: SessionHandle) -> Self {
        Self {
            agent_id,
            task,
            session,
            role: AgentRole::Worker,
            created_at: Utc::now(),
            last_evaluated: None,
            state: AgentState::Healthy,
            restart_count: 0,
            last_restart: None,
            restart_history: VecDeque::new(),
            last_judgment: None,
            fatal: false,
        }
    }

    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent_id: self.agent_id.clone(),
            task: self.task.clone(),
            role: self.role,
            created_at: self.created_at,
            state: self.state,
            judgment: self.last_judgment.clone(),
        }
    }
}

/// Outcome of asking to restart (or recreate) an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartVerdict {
    Allowed { restart_count: u32 },
    /// `newly_fatal` is true only the first time the ceiling is hit.
    CeilingReached { restarts: u32, newly_fatal: bool },
    NotRegistered,
}

/// An entry copied out for one Guardian cycle together with its Guardian.
pub struct Checkout {
    pub entry: AgentRegistryEntry,
    /// `None` on the agent's first cycle, or after a lost cycle.
    pub guardian: Option<Guardian>,
}

#[derive(Default)]
pub struct AgentRegistry {
    entries: BTreeMap<AgentId, AgentRegistryEntry>,
    guardians: HashMap<AgentId, Guardian>,
    checked_out: HashSet<AgentId>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Add an agent. Returns false (and changes nothing) if the id is taken.
    pub fn register(&mut self, entry: AgentRegistryEntry) -> bool {
        if self.entries.contains_key(&entry.agent_id) {
            return false;
        }
        olog!(
            "Registered agent {} (task {}, session {})",
            entry.agent_id.short(),
            entry.task.task_id,
            entry.session
        );
        self.entries.insert(entry.agent_id.clone(), entry);
        true
    }

    /// Drop an agent and its trajectory context.
    pub fn remove(&mut self, id: &AgentId) -> Option<AgentRegistryEntry> {
        self.guardians.remove(id);
        let removed = self.entries.remove(id);
        if removed.is_some() {
            olog!("Removed agent {}", id.short());
        }
        removed
    }

    pub fn get(&self, id: &AgentId) -> Option<&AgentRegistryEntry> {
        self.entries.get(id)
    }

    /// Look an agent up by full id, or by the short form used in log lines and prompts.
    pub fn resolve(&self, name: &str) -> Option<&AgentRegistryEntry> {
        let name = name.trim();
        self.entries
            .get(&AgentId::from(name))
            .or_else(|| self.entries.values().find(|e| e.agent_id.short() == name))
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<AgentId> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_checked_out(&self, id: &AgentId) -> bool {
        self.checked_out.contains(id)
    }

    pub fn has_guardian(&self, id: &AgentId) -> bool {
        self.guardians.contains_key(id)
    }

    /// The parked Guardian of an agent that is not mid-cycle.
    pub fn guardian(&self, id: &AgentId) -> Option<&Guardian> {
        self.guardians.get(id)
    }

    /// Take every agent that is old enough and not already mid-cycle.
    pub fn checkout_due(&mut self, now: DateTime<Utc>, min_age: Duration) -> Vec<Checkout> {
        let due: Vec<AgentId> = self
            .entries
            .values()
            .filter(|e| !self.checked_out.contains(&e.agent_id) && e.age(now) >= min_age)
            .map(|e| e.agent_id.clone())
            .collect();

        due.into_iter()
            .filter_map(|id| {
                let entry = self.entries.get(&id)?.clone();
                self.checked_out.insert(id.clone());
                Some(Checkout {
                    guardian: self.guardians.remove(&id),
                    entry,
                })
            })
            .collect()
    }

    /// Return a Guardian after its cycle and record the cycle's result.
    ///
    /// The Guardian is kept only if the agent is still registered and was not
    /// replaced during the cycle.
    pub fn checkin(&mut self, guardian: Guardian, report: &CycleReport) {
        let id = &report.agent_id;
        self.checked_out.remove(id);
        let Some(entry) = self.entries.get_mut(id) else {
            olog_debug!("checkin: {} no longer registered, dropping guardian", id.short());
            return;
        };
        entry.last_evaluated = Some(report.at);
        entry.state = report.state;
        if let (Some(judgment), false) = (&report.judgment, report.fell_back) {
            entry.last_judgment = Some(judgment.clone());
        }
        if !guardian.is_retired() {
            self.guardians.insert(id.clone(), guardian);
        }
    }

    /// Hand back a Guardian whose cycle was cancelled before it started.
    pub fn restore(&mut self, id: &AgentId, guardian: Option<Guardian>) {
        self.checked_out.remove(id);
        if let Some(guardian) = guardian {
            if self.entries.contains_key(id) {
                self.guardians.insert(id.clone(), guardian);
            }
        }
    }

    /// Clear the checkout of a cycle that never came back (panicked).
    pub fn release_lost(&mut self, id: &AgentId) {
        self.checked_out.remove(id);
        self.guardians.remove(id);
    }

    /// Count a restart against the rolling-window ceiling.
    pub fn try_begin_restart(
        &mut self,
        id: &AgentId,
        now: DateTime<Utc>,
        ceiling: u32,
        window: Duration,
    ) -> RestartVerdict {
        let Some(entry) = self.entries.get_mut(id) else {
            return RestartVerdict::NotRegistered;
        };
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500));
        while entry
            .restart_history
            .front()
            .is_some_and(|t| now.signed_duration_since(*t) > window)
        {
            entry.restart_history.pop_front();
        }

        let recent = entry.restart_history.len() as u32;
        if entry.fatal || recent >= ceiling {
            let newly_fatal = !entry.fatal;
            entry.fatal = true;
            entry.state = AgentState::Unrecoverable;
            return RestartVerdict::CeilingReached {
                restarts: recent,
                newly_fatal,
            };
        }

        entry.restart_history.push_back(now);
        entry.restart_count += 1;
        entry.last_restart = Some(now);
        RestartVerdict::Allowed {
            restart_count: entry.restart_count,
        }
    }

    /// Swap a recreated agent for its replacement, keeping task, role and
    /// restart history.
    pub fn replace_agent(&mut self, old: &AgentId, replacement: &Replacement) -> Option<&AgentRegistryEntry> {
        let previous = self.entries.remove(old)?;
        self.guardians.remove(old);
        let entry = AgentRegistryEntry {
            agent_id: replacement.agent_id.clone(),
            session: replacement.session.clone(),
            created_at: Utc::now(),
            last_evaluated: None,
            state: AgentState::Healthy,
            last_judgment: None,
            ..previous
        };
        olog!(
            "Agent {} replaced by {} (restarts so far: {})",
            old.short(),
            entry.agent_id.short(),
            entry.restart_count
        );
        let id = entry.agent_id.clone();
        self.entries.insert(id.clone(), entry);
        self.entries.get(&id)
    }

    /// Summaries of every agent, for the Conductor.
    pub fn conductor_snapshot(&self) -> Vec<AgentSummary> {
        self.entries.values().map(AgentRegistryEntry::summary).collect()
    }
}

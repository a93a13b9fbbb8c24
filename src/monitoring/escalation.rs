//! Outbound notifications: human escalations and missing-task requests.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::agent::AgentId;
use crate::{olog, olog_critical, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationSource {
    Guardian,
    Conductor,
}

impl fmt::Display for EscalationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationSource::Guardian => f.write_str("guardian"),
            EscalationSource::Conductor => f.write_str("conductor"),
        }
    }
}

/// A problem the monitor will not try to solve on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub at: DateTime<Utc>,
    pub source: EscalationSource,
    pub agent_id: Option<AgentId>,
    pub reason: String,
}

impl Escalation {
    pub fn guardian(agent_id: &AgentId, reason: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            source: EscalationSource::Guardian,
            agent_id: Some(agent_id.clone()),
            reason: reason.into(),
        }
    }

    pub fn conductor(reason: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            source: EscalationSource::Conductor,
            agent_id: None,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.agent_id {
            Some(id) => write!(f, "[{}] agent {}: {}", self.source, id, self.reason),
            None => write!(f, "[{}] {}", self.source, self.reason),
        }
    }
}

pub trait EscalationSink: Send + Sync {
    fn escalate(&self, escalation: Escalation);
}

/// Writes escalations to the log at critical severity.
#[derive(Debug, Default)]
pub struct LogEscalationSink;

impl EscalationSink for LogEscalationSink {
    fn escalate(&self, escalation: Escalation) {
        olog_critical!("{}", escalation);
    }
}

/// Logs, then forwards escalations to a receiver (UI, pager bridge, tests).
#[derive(Debug, Clone)]
pub struct ChannelEscalationSink {
    tx: mpsc::UnboundedSender<Escalation>,
}

impl ChannelEscalationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Escalation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EscalationSink for ChannelEscalationSink {
    fn escalate(&self, escalation: Escalation) {
        olog_critical!("{}", escalation);
        let _ = self.tx.send(escalation);
    }
}

/// Receives requests for work no agent is covering.
#[async_trait]
pub trait TaskCreator: Send + Sync {
    async fn create_task(&self, hints: &[String]) -> Result<()>;
}

/// Records missing-task hints in the log only.
#[derive(Debug, Default)]
pub struct LogTaskCreator;

#[async_trait]
impl TaskCreator for LogTaskCreator {
    async fn create_task(&self, hints: &[String]) -> Result<()> {
        olog!("Missing task requested: {}", hints.join("; "));
        Ok(())
    }
}

/// Forwards missing-task hints to the planner side.
#[derive(Debug, Clone)]
pub struct ChannelTaskCreator {
    tx: mpsc::UnboundedSender<Vec<String>>,
}

impl ChannelTaskCreator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskCreator for ChannelTaskCreator {
    async fn create_task(&self, hints: &[String]) -> Result<()> {
        self.tx
            .send(hints.to_vec())
            .map_err(|_| crate::Error::Validation("task receiver dropped".to_string()))
    }
}

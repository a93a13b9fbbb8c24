//! Agent and task identity as seen by the monitoring core.
//!
//! Agents are external processes; the core only knows their identifier, the
//! task they were assigned and the command used to (re)launch them.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AgentConfig;

/// Identifier of a supervised agent.
///
/// Identifiers come from the task-assignment collaborator, so any string is
/// accepted; [`AgentId::generate`] mints a fresh one for recreated agents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for session names and log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of the task an agent is working on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The slice of ticket data the monitoring core needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub description: String,
    #[serde(default)]
    pub done_definition: Option<String>,
    /// Relative complexity, 1-10, when the planner provided one.
    #[serde(default)]
    pub complexity: Option<u8>,
}

impl TaskInfo {
    pub fn new(task_id: impl Into<TaskId>, description: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            description: description.into(),
            done_definition: None,
            complexity: None,
        }
    }

    pub fn with_done_definition(mut self, done: impl Into<String>) -> Self {
        self.done_definition = Some(done.into());
        self
    }
}

/// What kind of work an agent does. Validators are never terminated as duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    #[default]
    Worker,
    Validator,
}

impl AgentRole {
    pub fn is_protected(&self) -> bool {
        matches!(self, AgentRole::Validator)
    }
}

/// Builds the command line for launching an agent process.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    base_command: Vec<String>,
}

impl AgentCommand {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            base_command: config
                .command
                .split_whitespace()
                .map(String::from)
                .collect(),
        }
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("claude")
    }

    /// Full argv, optionally with the task prompt appended as the last argument.
    pub fn command(&self, prompt: Option<&str>) -> Vec<String> {
        let mut cmd = self.base_command.clone();
        if let Some(p) = prompt {
            cmd.push(p.to_string());
        }
        cmd
    }

    /// Command for a replacement agent: the task prompt plus what went wrong last time.
    ///
    /// `brief` replaces the task description as the prompt when given.
    pub fn recovery_command(&self, task: &TaskInfo, failure_context: &str, brief: Option<&str>) -> Vec<String> {
        let base = brief.unwrap_or(&task.description).trim();
        let prompt = if failure_context.is_empty() {
            base.to_string()
        } else {
            format!(
                "{}\n\nA previous attempt at this task was abandoned: {}",
                base, failure_context
            )
        };
        self.command(Some(&prompt))
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

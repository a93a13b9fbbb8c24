//! The agent-control surface the monitoring core acts through.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::agent::{AgentCommand, AgentId, TaskInfo};
use crate::config::{AgentConfig, DeliveryConfig};
use crate::tmux::Tmux;
use crate::util::blocking_with_timeout;
use crate::{olog, olog_warn, Error, Result};

use super::inspector::SessionHandle;

/// A fresh agent that took over a recreated one's task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub agent_id: AgentId,
    pub session: SessionHandle,
}

/// Operations on agent processes.
///
/// `send_message` returns `Error::AgentGone` when the session no longer
/// exists. `restart` and `recreate` bring up a new session when the old one
/// is gone and return `Error::AgentGone` only when that fails too.
#[async_trait]
pub trait AgentLifecycleManager: Send + Sync {
    /// Type `text` into the agent's session and submit it.
    async fn send_message(&self, agent: &AgentId, session: &SessionHandle, text: &str) -> Result<()>;

    /// Replace the process but keep the agent id and session.
    async fn restart(
        &self,
        agent: &AgentId,
        session: &SessionHandle,
        task: &TaskInfo,
        failure_context: &str,
    ) -> Result<()>;

    /// Tear the agent down and start a new one on the same task.
    ///
    /// `prompt` is a generated brief for the new agent; without one the task
    /// description is used.
    async fn recreate(
        &self,
        agent: &AgentId,
        session: &SessionHandle,
        task: &TaskInfo,
        failure_context: &str,
        prompt: Option<&str>,
    ) -> Result<Replacement>;

    async fn terminate(&self, agent: &AgentId, session: &SessionHandle) -> Result<()>;

    /// Every agent session this manager started, owned or not.
    async fn list_sessions(&self) -> Result<Vec<SessionHandle>>;

    /// Kill a session that no registered agent owns.
    async fn kill_session(&self, session: &SessionHandle) -> Result<()>;
}

/// Lifecycle manager for agents running in tmux sessions.
pub struct TmuxLifecycleManager {
    command: AgentCommand,
    session_prefix: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl TmuxLifecycleManager {
    pub fn new(agent: &AgentConfig, delivery: &DeliveryConfig) -> Result<Self> {
        Ok(Self {
            command: AgentCommand::from_config(agent),
            session_prefix: agent.session_prefix.clone(),
            working_dir: agent.effective_working_dir()?,
            timeout: delivery.send_timeout(),
        })
    }

    /// Start a new agent session for `task` and return its handle.
    pub async fn spawn(&self, agent: &AgentId, task: &TaskInfo, session: Option<&str>) -> Result<SessionHandle> {
        let name = session
            .map(String::from)
            .unwrap_or_else(|| Tmux::session_name(&self.session_prefix, agent.short()));
        let cwd = self.working_dir.clone();
        let argv = self.command.command(Some(task.description.trim()));
        let session_name = name.clone();
        blocking_with_timeout(self.timeout, move || {
            Tmux::create_session(&session_name, &cwd, &argv)
        })
        .await?;
        olog!("Spawned agent {} in session {}", agent.short(), name);
        Ok(SessionHandle::new(name))
    }

    async fn exists(&self, session: &SessionHandle) -> Result<bool> {
        let name = session.name().to_string();
        blocking_with_timeout(self.timeout, move || Ok(Tmux::session_exists(&name))).await
    }

    async fn ensure_exists(&self, agent: &AgentId, session: &SessionHandle) -> Result<()> {
        if self.exists(session).await? {
            Ok(())
        } else {
            Err(Error::AgentGone { id: agent.clone() })
        }
    }
}

#[async_trait]
impl AgentLifecycleManager for TmuxLifecycleManager {
    async fn send_message(&self, agent: &AgentId, session: &SessionHandle, text: &str) -> Result<()> {
        self.ensure_exists(agent, session).await?;
        let name = session.name().to_string();
        let text = text.to_string();
        blocking_with_timeout(self.timeout, move || {
            Tmux::send_literal(&name, &text)?;
            Tmux::send_enter(&name)
        })
        .await
        .map_err(|e| vanished(agent, e))
    }

    async fn restart(
        &self,
        agent: &AgentId,
        session: &SessionHandle,
        task: &TaskInfo,
        failure_context: &str,
    ) -> Result<()> {
        let name = session.name().to_string();
        let cwd = self.working_dir.clone();
        let argv = self.command.recovery_command(task, failure_context, None);
        if self.exists(session).await? {
            blocking_with_timeout(self.timeout, move || Tmux::respawn_pane(&name, &cwd, &argv))
                .await
                .map_err(|e| vanished(agent, e))?;
            olog!("Restarted agent {} in {}", agent.short(), session);
            return Ok(());
        }

        // The session went away with its process; bring it back under the same name.
        let created = blocking_with_timeout(self.timeout, move || Tmux::create_session(&name, &cwd, &argv)).await;
        match created {
            Ok(()) => {
                olog!("Restarted agent {} in new session {}", agent.short(), session);
                Ok(())
            }
            Err(e) => {
                olog_warn!("Restart: could not recreate session {}: {}", session, e);
                Err(Error::AgentGone { id: agent.clone() })
            }
        }
    }

    async fn recreate(
        &self,
        agent: &AgentId,
        session: &SessionHandle,
        task: &TaskInfo,
        failure_context: &str,
        prompt: Option<&str>,
    ) -> Result<Replacement> {
        let replacement_id = AgentId::generate();
        let new_name = Tmux::session_name(&self.session_prefix, replacement_id.short());
        let cwd = self.working_dir.clone();
        let argv = self.command.recovery_command(task, failure_context, prompt);
        let create_name = new_name.clone();
        blocking_with_timeout(self.timeout, move || {
            Tmux::create_session(&create_name, &cwd, &argv)
        })
        .await?;

        if let Err(e) = self.terminate(agent, session).await {
            olog_warn!("Recreate: old session {} not killed: {}", session, e);
        }
        olog!(
            "Recreated agent {} as {} in {}",
            agent.short(),
            replacement_id.short(),
            new_name
        );
        Ok(Replacement {
            agent_id: replacement_id,
            session: SessionHandle::new(new_name),
        })
    }

    async fn terminate(&self, agent: &AgentId, session: &SessionHandle) -> Result<()> {
        let name = session.name().to_string();
        blocking_with_timeout(self.timeout, move || Tmux::kill_session(&name)).await?;
        olog!("Terminated agent {}", agent.short());
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionHandle>> {
        let prefix = Tmux::session_name(&self.session_prefix, "");
        let names = blocking_with_timeout(self.timeout, Tmux::list_sessions).await?;
        Ok(names
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .map(SessionHandle::new)
            .collect())
    }

    async fn kill_session(&self, session: &SessionHandle) -> Result<()> {
        let name = session.name().to_string();
        blocking_with_timeout(self.timeout, move || Tmux::kill_session(&name)).await
    }
}

/// A session that disappears between the existence check and the call.
fn vanished(agent: &AgentId, err: Error) -> Error {
    match err {
        Error::SessionUnavailable(_) => Error::AgentGone { id: agent.clone() },
        other => other,
    }
}

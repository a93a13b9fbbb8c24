//! Read-only access to an agent's terminal session.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tmux::Tmux;
use crate::util::blocking_with_timeout;
use crate::{olog_trace, Error, Result};

/// Name of the terminal session an agent runs in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of recent session output. Implementations must not change the session.
#[async_trait]
pub trait SessionInspector: Send + Sync {
    /// Up to `max_lines` lines, most recent last.
    ///
    /// A session that no longer exists, or whose process has exited, yields
    /// `Error::SessionUnavailable`.
    async fn read_recent_output(
        &self,
        session: &SessionHandle,
        max_lines: usize,
    ) -> Result<Vec<String>>;
}

/// Inspector backed by `tmux capture-pane`.
pub struct TmuxInspector {
    timeout: Duration,
}

impl TmuxInspector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SessionInspector for TmuxInspector {
    async fn read_recent_output(
        &self,
        session: &SessionHandle,
        max_lines: usize,
    ) -> Result<Vec<String>> {
        let name = session.name().to_string();
        let raw = blocking_with_timeout(self.timeout, move || {
            if !Tmux::session_exists(&name) || Tmux::pane_dead(&name)? {
                return Err(Error::SessionUnavailable(name));
            }
            Tmux::capture_pane_tail(&name, max_lines)
        })
        .await?;
        let lines = tail_lines(&raw, max_lines);
        olog_trace!("inspector: {} -> {} lines", session, lines.len());
        Ok(lines)
    }
}

/// Split captured text into lines, dropping the blank padding tmux adds below
/// the cursor, and keep only the last `max_lines`.
pub fn tail_lines(raw: &str, max_lines: usize) -> Vec<String> {
    let mut lines: Vec<String> = raw.lines().map(|l| l.trim_end().to_string()).collect();
    while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
        lines.pop();
    }
    if lines.len() > max_lines {
        lines.drain(..lines.len() - max_lines);
    }
    lines
}

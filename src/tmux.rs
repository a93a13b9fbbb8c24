use std::path::Path;
use std::process::{Command, Output};

use crate::{olog_debug, olog_trace, olog_warn, Error, Result};

/// Synchronous calls to the `tmux` binary, one child process per call.
///
/// Async callers go through `util::blocking_with_timeout`. A target that no
/// longer exists is reported as `Error::SessionUnavailable`.
pub struct Tmux;

impl Tmux {
    pub fn create_session(name: &str, cwd: &Path, cmd: &[String]) -> Result<()> {
        let line = command_line(cmd)?;
        let cwd = cwd.display().to_string();
        olog_debug!("tmux: new-session {} in {}: {}", name, cwd, line);
        finish(
            run(&["new-session", "-d", "-s", name, "-c", &cwd, &line])?,
            name,
            "new-session",
        )?;
        // The pane outlives the agent process so its last words stay readable.
        if let Err(e) = run(&["set-option", "-t", name, "remain-on-exit", "on"]) {
            olog_warn!("tmux: remain-on-exit for {}: {}", name, e);
        }
        Ok(())
    }

    /// Kill the pane's process and start `cmd` in its place, keeping the session.
    pub fn respawn_pane(name: &str, cwd: &Path, cmd: &[String]) -> Result<()> {
        let line = command_line(cmd)?;
        let cwd = cwd.display().to_string();
        olog_debug!("tmux: respawn-pane {}: {}", name, line);
        finish(
            run(&["respawn-pane", "-k", "-t", name, "-c", &cwd, &line])?,
            name,
            "respawn-pane",
        )
    }

    /// Kill a session. Killing one that is already gone is not an error.
    pub fn kill_session(name: &str) -> Result<()> {
        olog_debug!("tmux: kill-session {}", name);
        match finish(run(&["kill-session", "-t", name])?, name, "kill-session") {
            Err(Error::SessionUnavailable(_)) => {
                olog_debug!("tmux: {} was already gone", name);
                Ok(())
            }
            other => other,
        }
    }

    /// Plain text (no escape codes) of the last `lines` lines of a pane.
    pub fn capture_pane_tail(name: &str, lines: usize) -> Result<String> {
        let start = format!("-{}", lines);
        let output = run(&["capture-pane", "-p", "-J", "-t", name, "-S", &start])?;
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        finish(output, name, "capture-pane")?;
        olog_trace!("tmux: captured {} bytes from {}", text.len(), name);
        Ok(text)
    }

    /// Whether the pane's process has exited. With `remain-on-exit` the
    /// session outlives it, so existence alone says nothing about the agent.
    pub fn pane_dead(name: &str) -> Result<bool> {
        let output = run(&["display-message", "-p", "-t", name, "#{pane_dead}"])?;
        let flag = String::from_utf8_lossy(&output.stdout).into_owned();
        finish(output, name, "display-message")?;
        Ok(flag_set(&flag))
    }

    pub fn session_exists(name: &str) -> bool {
        run(&["has-session", "-t", name])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Type `text` literally, without pressing Enter.
    pub fn send_literal(name: &str, text: &str) -> Result<()> {
        olog_debug!("tmux: send-keys -l {} ({} bytes)", name, text.len());
        finish(run(&["send-keys", "-t", name, "-l", text])?, name, "send-keys")
    }

    pub fn send_enter(name: &str) -> Result<()> {
        finish(run(&["send-keys", "-t", name, "Enter"])?, name, "send-keys Enter")
    }

    /// Names of all sessions; empty when no server is running.
    pub fn list_sessions() -> Result<Vec<String>> {
        let output = run(&["list-sessions", "-F", "#{session_name}"])?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn is_available() -> bool {
        run(&["-V"]).map(|o| o.status.success()).unwrap_or(false)
    }

    /// `<prefix>_<id>`, with characters tmux treats specially replaced.
    pub fn session_name(prefix: &str, short_id: &str) -> String {
        format!("{}_{}", sanitize(prefix), sanitize(short_id))
    }
}

fn run(args: &[&str]) -> Result<Output> {
    Ok(Command::new("tmux").args(args).output()?)
}

fn finish(output: Output, target: &str, action: &str) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_missing_session(&stderr) {
        return Err(Error::SessionUnavailable(target.to_string()));
    }
    olog_warn!("tmux: {} {} failed: {}", action, target, stderr.trim());
    Err(Error::Tmux(format!("{} {}: {}", action, target, stderr.trim())))
}

fn flag_set(format_output: &str) -> bool {
    format_output.trim() == "1"
}

fn is_missing_session(stderr: &str) -> bool {
    [
        "session not found",
        "can't find session",
        "can't find pane",
        "no server running",
    ]
    .iter()
    .any(|needle| stderr.contains(needle))
}

/// One shell-quoted command line for tmux to hand to `sh -c`.
fn command_line(cmd: &[String]) -> Result<String> {
    if cmd.is_empty() {
        return Err(Error::Validation("agent command is empty".to_string()));
    }
    Ok(cmd.iter().map(|arg| quote(arg)).collect::<Vec<_>>().join(" "))
}

fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':'));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

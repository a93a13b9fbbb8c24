use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::{AgentRole, TaskInfo};
use crate::{olog_debug, Error, Result};

/// Process-wide configuration, read once at startup and handed to every component.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub conductor: ConductorConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub goals: SystemGoals,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Agents declared up front for `overseer run`.
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

/// Cadence, thresholds and limits for the Guardian and the monitoring loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub guardian_interval_secs: u64,
    pub conductor_interval_secs: u64,
    pub max_concurrent_evaluations: usize,
    pub session_read_timeout_ms: u64,
    /// Reads that fail for any reason other than a missing session are retried.
    pub session_read_attempts: u32,
    pub session_read_retry_ms: u64,
    pub output_lines: usize,
    pub history_cap: usize,
    /// Agents younger than this are left alone while they boot.
    pub min_agent_age_secs: u64,
    /// Consecutive cycles observing the same output before the agent counts as waiting.
    pub stuck_waiting_cycles: u32,
    pub confused_cycles: u32,
    pub low_alignment_cycles: u32,
    pub low_alignment_threshold: f64,
    pub restart_ceiling: u32,
    pub restart_window_secs: u64,
    pub steering_cooldown_secs: u64,
    /// Text the agent UI shows while an earlier message is still queued.
    pub queued_message_marker: String,
    pub first_pass_check: bool,
    pub first_pass_confidence: f64,
    /// Base time allowed on a task, scaled by its complexity. 0 disables the check.
    pub agent_timeout_mins: u64,
    /// Kill prefixed tmux sessions that no registered agent owns.
    pub reap_orphan_sessions: bool,
    /// How long a session must stay unowned before it is killed.
    pub orphan_grace_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            guardian_interval_secs: 30,
            conductor_interval_secs: 300,
            max_concurrent_evaluations: 4,
            session_read_timeout_ms: 5_000,
            session_read_attempts: 3,
            session_read_retry_ms: 500,
            output_lines: 200,
            history_cap: 10,
            min_agent_age_secs: 0,
            stuck_waiting_cycles: 2,
            confused_cycles: 3,
            low_alignment_cycles: 3,
            low_alignment_threshold: 0.2,
            restart_ceiling: 3,
            restart_window_secs: 3_600,
            steering_cooldown_secs: 300,
            queued_message_marker: "Press up to edit queued messages".to_string(),
            first_pass_check: false,
            first_pass_confidence: 0.8,
            agent_timeout_mins: 30,
            reap_orphan_sessions: true,
            orphan_grace_secs: 120,
            shutdown_timeout_secs: 30,
        }
    }
}

impl MonitorConfig {
    pub fn guardian_interval(&self) -> Duration {
        Duration::from_secs(self.guardian_interval_secs)
    }

    pub fn conductor_interval(&self) -> Duration {
        Duration::from_secs(self.conductor_interval_secs)
    }

    pub fn session_read_timeout(&self) -> Duration {
        Duration::from_millis(self.session_read_timeout_ms)
    }

    pub fn session_read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.session_read_retry_ms)
    }

    /// Time allowed on `task`: the base timeout times `1 + complexity / 10`,
    /// with complexity 5 when the task has none.
    pub fn task_timeout(&self, task: &TaskInfo) -> Option<Duration> {
        if self.agent_timeout_mins == 0 {
            return None;
        }
        let complexity = f64::from(task.complexity.unwrap_or(5).min(10));
        let minutes = self.agent_timeout_mins as f64 * (1.0 + complexity / 10.0);
        Some(Duration::from_secs_f64(minutes * 60.0))
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    pub fn min_agent_age(&self) -> Duration {
        Duration::from_secs(self.min_agent_age_secs)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    pub fn steering_cooldown(&self) -> Duration {
        Duration::from_secs(self.steering_cooldown_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Delivery-with-verification settings for steering messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub settle_ms: u64,
    pub verify_lines: usize,
    pub send_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            settle_ms: 1_000,
            verify_lines: 200,
            send_timeout_ms: 5_000,
        }
    }
}

impl DeliveryConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub coherence_escalation_threshold: f64,
    /// Below this coherence a detailed report is written to the log.
    pub report_threshold: f64,
    /// Regex matched against alignment issues to spot unassigned work.
    pub missing_task_pattern: String,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            coherence_escalation_threshold: 0.3,
            report_threshold: 0.5,
            missing_task_pattern:
                r"(?i)\b(missing|unassigned|not (?:yet )?assigned|no agent|nobody|uncovered)\b"
                    .to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Which reasoning provider to use and how to call it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// `heuristic`, `claude-cli` or `anthropic`.
    pub provider: String,
    pub model: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub backoff: BackoffKind,
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub binary: Option<String>,
    pub max_tokens: u32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: "heuristic".to_string(),
            model: None,
            timeout_secs: 30,
            max_attempts: 3,
            retry_delay_ms: 1_000,
            backoff: BackoffKind::Fixed,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: None,
            binary: None,
            max_tokens: 2_048,
        }
    }
}

impl OracleConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Declared objectives the Conductor measures coherence against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemGoals {
    pub primary: String,
    pub constraints: String,
    pub coordination: String,
}

impl Default for SystemGoals {
    fn default() -> Self {
        Self {
            primary: "Complete all assigned tasks efficiently".to_string(),
            constraints: "No duplicate work, efficient resource usage".to_string(),
            coordination: "All agents working toward collective objectives".to_string(),
        }
    }
}

/// How agent processes are launched when the tmux lifecycle manager restarts them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    pub session_prefix: String,
    pub working_dir: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            session_prefix: "ovs_agent".to_string(),
            working_dir: None,
        }
    }
}

impl AgentConfig {
    pub fn effective_working_dir(&self) -> Result<PathBuf> {
        match &self.working_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(std::env::current_dir()?),
        }
    }
}

/// An agent declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub task_id: String,
    pub description: String,
    #[serde(default)]
    pub done_definition: Option<String>,
    /// 1-10; estimated by the oracle when absent.
    #[serde(default)]
    pub complexity: Option<u8>,
    /// Existing tmux session to watch; a new one is spawned when `spawn` is set.
    pub session: String,
    #[serde(default)]
    pub role: AgentRole,
    #[serde(default)]
    pub spawn: bool,
}

impl Config {
    pub fn overseer_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".overseer"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::overseer_dir()?.join("overseer.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        olog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            olog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        olog_debug!(
            "Config loaded: provider={}, guardian={}s, conductor={}s, agents={}",
            config.oracle.provider,
            config.monitor.guardian_interval_secs,
            config.monitor.conductor_interval_secs,
            config.agents.len()
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::overseer_dir()?;
        if !dir.exists() {
            olog_debug!("Creating overseer directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, self.to_toml()?)?;
        olog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.monitor;
        check_unit("monitor.low_alignment_threshold", m.low_alignment_threshold)?;
        check_unit("monitor.first_pass_confidence", m.first_pass_confidence)?;
        check_unit(
            "conductor.coherence_escalation_threshold",
            self.conductor.coherence_escalation_threshold,
        )?;
        check_unit("conductor.report_threshold", self.conductor.report_threshold)?;

        let positive = [
            ("monitor.max_concurrent_evaluations", m.max_concurrent_evaluations as u64),
            ("monitor.history_cap", m.history_cap as u64),
            ("monitor.guardian_interval_secs", m.guardian_interval_secs),
            ("monitor.conductor_interval_secs", m.conductor_interval_secs),
            ("monitor.session_read_attempts", m.session_read_attempts as u64),
            ("oracle.max_attempts", self.oracle.max_attempts as u64),
            ("delivery.max_attempts", self.delivery.max_attempts as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Validation(format!("{} must be at least 1", name)));
            }
        }

        regex::Regex::new(&self.conductor.missing_task_pattern).map_err(|e| {
            Error::Validation(format!("conductor.missing_task_pattern: {}", e))
        })?;
        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )))
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

//! Claude Code headless backend.
//!
//! Runs `claude -p <prompt> --output-format json` and unwraps the result
//! envelope. Each call is a fresh process with no session continuity.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::{olog_debug, Error, Result};

use super::llm::Completion;

#[derive(Debug, Clone, PartialEq)]
pub enum ResultType {
    Success { output: String },
    Error { message: String },
}

/// Parsed `--output-format json` envelope.
#[derive(Debug, Clone)]
pub struct ClaudeResponse {
    pub session_id: Option<String>,
    pub result: ResultType,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
}

impl ClaudeResponse {
    pub fn output(&self) -> Option<&str> {
        match &self.result {
            ResultType::Success { output } => Some(output),
            ResultType::Error { .. } => None,
        }
    }

    fn failure(message: String) -> Self {
        Self {
            session_id: None,
            result: ResultType::Error { message },
            cost_usd: None,
            duration_ms: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    subtype: Option<String>,
    result: Option<String>,
    session_id: Option<String>,
    total_cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClaudeHeadless {
    binary: PathBuf,
    model: Option<String>,
    timeout: Duration,
}

impl ClaudeHeadless {
    /// Locate `claude` on PATH.
    pub fn new() -> Result<Self> {
        let binary = which::which("claude").map_err(|_| Error::ClaudeBinaryNotFound)?;
        Ok(Self::with_binary(binary))
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            model: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub async fn execute(&self, prompt: &str) -> Result<ClaudeResponse> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("json")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }

        olog_debug!("claude: running {} ({} prompt bytes)", self.binary.display(), prompt.len());
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Ok(response) = Self::parse_json_response(&stdout) {
            return Ok(response);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "claude exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Ok(ClaudeResponse::failure(message));
        }
        Ok(ClaudeResponse {
            session_id: None,
            result: ResultType::Success {
                output: stdout.trim().to_string(),
            },
            cost_usd: None,
            duration_ms: None,
        })
    }

    pub fn parse_json_response(json: &str) -> Result<ClaudeResponse> {
        let raw: Envelope = serde_json::from_str(json.trim())?;
        let result = match (raw.subtype.as_deref(), raw.is_error) {
            (Some("success"), false) => ResultType::Success {
                output: raw.result.unwrap_or_default(),
            },
            (Some(_), _) | (None, true) => ResultType::Error {
                message: raw
                    .error
                    .or(raw.result)
                    .unwrap_or_else(|| "claude reported an error".to_string()),
            },
            (None, false) => match (raw.error, raw.result) {
                (Some(error), _) => ResultType::Error { message: error },
                (None, Some(result)) => ResultType::Success { output: result },
                (None, None) => ResultType::Error {
                    message: "Unknown response format".to_string(),
                },
            },
        };
        Ok(ClaudeResponse {
            session_id: raw.session_id,
            result,
            cost_usd: raw.total_cost_usd,
            duration_ms: raw.duration_ms,
        })
    }
}

#[async_trait]
impl Completion for ClaudeHeadless {
    fn name(&self) -> &str {
        "claude-cli"
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let response = self.execute(&format!("{}\n\n{}", system, prompt)).await?;
        if let Some(cost) = response.cost_usd {
            olog_debug!("claude: call cost ${:.4}", cost);
        }
        match response.result {
            ResultType::Success { output } => Ok(output),
            ResultType::Error { message } => Err(Error::Oracle(message)),
        }
    }
}

use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("Session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled by shutdown")]
    Cancelled,

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Claude binary not found in PATH")]
    ClaudeBinaryNotFound,

    #[error("API key not set (expected in ${0})")]
    MissingApiKey(String),

    #[error("Unknown oracle provider: {0}")]
    UnknownProvider(String),

    #[error("Provider '{provider}' does not support {capability}")]
    Unsupported {
        provider: String,
        capability: &'static str,
    },

    #[error("Malformed oracle response: {0}")]
    MalformedResponse(String),

    #[error("Oracle response violates contract: {0}")]
    ContractViolation(String),

    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Provider rejected request: {0}")]
    Rejected(String),

    #[error("Message not visible in session output yet")]
    DeliveryUnverified,

    #[error("Delivery to agent {agent_id} failed after {attempts} attempts")]
    DeliveryFailed { agent_id: AgentId, attempts: u32 },

    #[error("Agent not found: {id}")]
    AgentNotFound { id: AgentId },

    #[error("Agent {id} is gone and cannot be restarted")]
    AgentGone { id: AgentId },
}

impl Error {
    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Error::Unsupported { .. }
                | Error::UnknownProvider(_)
                | Error::MissingApiKey(_)
                | Error::Rejected(_)
                | Error::ClaudeBinaryNotFound
                | Error::Validation(_)
                | Error::AgentGone { .. }
                | Error::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::OracleConfig;
use crate::{olog, Error, Result};

use super::anthropic::AnthropicClient;
use super::claude::ClaudeHeadless;
use super::heuristic::HeuristicOracle;
use super::llm::LlmOracle;
use super::ReasoningOracle;

/// Build the provider named in the config.
pub fn create_oracle(config: &OracleConfig) -> Result<Arc<dyn ReasoningOracle>> {
    let provider = config.provider.trim().to_ascii_lowercase();
    let oracle: Arc<dyn ReasoningOracle> = match provider.as_str() {
        "heuristic" | "offline" => Arc::new(HeuristicOracle::new()),
        "claude-cli" | "claude" => {
            let backend = match &config.binary {
                Some(path) => ClaudeHeadless::with_binary(PathBuf::from(path)),
                None => ClaudeHeadless::new()?,
            };
            Arc::new(LlmOracle::new(
                backend
                    .with_timeout(config.call_timeout())
                    .with_model(config.model.clone()),
            ))
        }
        "anthropic" => {
            let api_key = std::env::var(&config.api_key_env)
                .ok()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| Error::MissingApiKey(config.api_key_env.clone()))?;
            Arc::new(LlmOracle::new(AnthropicClient::new(
                api_key,
                config.base_url.as_deref(),
                config.model.clone(),
                config.max_tokens,
                config.call_timeout(),
            )?))
        }
        other => return Err(Error::UnknownProvider(other.to_string())),
    };
    olog!("Oracle provider: {}", oracle.name());
    Ok(oracle)
}

//! Steering message delivery with read-back verification.
//!
//! A send only counts once the message header is visible in the agent's
//! session. Typing into a busy terminal is unreliable, so each attempt is
//! send, settle, then look.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentId;
use crate::config::DeliveryConfig;
use crate::retry::RetryPolicy;
use crate::util::with_timeout;
use crate::{olog_debug, olog_warn, Error, Result};

use super::inspector::{SessionHandle, SessionInspector};
use super::lifecycle::AgentLifecycleManager;

/// A steering message tagged with a per-delivery nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteeringMessage {
    nonce: String,
    label: String,
    body: String,
}

impl SteeringMessage {
    pub fn new(label: impl Into<String>, body: impl Into<String>) -> Self {
        let nonce = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self::with_nonce(nonce, label, body)
    }

    pub fn with_nonce(nonce: impl Into<String>, label: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            nonce: nonce.into(),
            label: label.into(),
            body: body.into(),
        }
    }

    /// `[GUARDIAN <nonce> - <LABEL>]`, also the string searched for on read-back.
    pub fn header(&self) -> String {
        format!("[GUARDIAN {} - {}]", self.nonce, self.label)
    }

    pub fn text(&self) -> String {
        format!("\n{}: {}\n", self.header(), self.body.trim())
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// Send `text` until `marker` shows up in the session output.
///
/// Returns the number of attempts used. When attempts run out the error is
/// `DeliveryFailed`; a vanished agent surfaces as `AgentGone` immediately.
/// No resend is started once `cancel` has fired.
#[allow(clippy::too_many_arguments)]
pub async fn deliver_with_retry(
    cancel: &CancellationToken,
    lifecycle: &dyn AgentLifecycleManager,
    inspector: &dyn SessionInspector,
    agent: &AgentId,
    session: &SessionHandle,
    text: &str,
    marker: &str,
    config: &DeliveryConfig,
) -> Result<u32> {
    let policy = RetryPolicy::for_delivery(config);
    let outcome = policy
        .run(
            cancel,
            |attempt| async move {
                with_timeout(config.send_timeout(), lifecycle.send_message(agent, session, text))
                    .await?;
                tokio::time::sleep(config.settle()).await;
                let lines = inspector
                    .read_recent_output(session, config.verify_lines)
                    .await?;
                if lines.iter().any(|line| line.contains(marker)) {
                    olog_debug!("delivery: {} verified on attempt {}", agent.short(), attempt);
                    Ok(())
                } else {
                    Err(Error::DeliveryUnverified)
                }
            },
            |err| !matches!(err, Error::AgentGone { .. }),
        )
        .await;

    match outcome.result {
        Ok(()) => Ok(outcome.attempts),
        Err(err @ Error::AgentGone { .. }) => Err(err),
        Err(err) => {
            olog_warn!(
                "delivery: {} unverified after {} attempts (last: {})",
                agent.short(),
                outcome.attempts,
                err
            );
            Err(Error::DeliveryFailed {
                agent_id: agent.clone(),
                attempts: outcome.attempts,
            })
        }
    }
}

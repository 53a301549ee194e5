//! Agent session: the one capability the director needs from the code-editing
//! agent. Send an instruction, get a response back.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;

use crate::core::budget::CancelSignal;
use crate::core::types::AgentResponse;
use crate::io::config::{ForemanConfig, InteractionMode};
use crate::io::file_exchange::FileExchangeSession;
use crate::io::ui_driver::UiDriverSession;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("agent did not respond within {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("agent transport failed: {0}")]
    Transport(String),
    #[error("interaction cancelled")]
    Cancelled,
}

/// Delivers instructions to the agent and waits for its reply.
///
/// Implementations must return within their configured response timeout and
/// stop waiting once `cancel` trips.
pub trait AgentSession: Send + Sync {
    fn send(&self, instruction: &str, cancel: &CancelSignal) -> Result<AgentResponse, SessionError>;
}

/// Build the session selected by `interaction_mode`.
pub fn open_session(cfg: &ForemanConfig, workspace: &Path) -> Result<Box<dyn AgentSession>> {
    let session: Box<dyn AgentSession> = match cfg.interaction_mode {
        InteractionMode::FileBased => Box::new(FileExchangeSession::open(
            workspace.join(&cfg.file_exchange.dir),
            Duration::from_secs(cfg.file_exchange.response_timeout_secs),
            Duration::from_millis(cfg.file_exchange.poll_interval_ms),
        )?),
        InteractionMode::UiAutomation => Box::new(UiDriverSession::new(
            cfg.ui_driver.clone(),
            workspace.to_path_buf(),
        )),
    };
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_based_mode_creates_exchange_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = ForemanConfig::default();
        open_session(&cfg, temp.path()).expect("session");
        assert!(temp.path().join(".foreman/exchange").is_dir());
    }

    #[test]
    fn timeout_message_names_seconds() {
        let err = SessionError::Timeout(Duration::from_secs(90));
        assert_eq!(err.to_string(), "agent did not respond within 90s");
    }
}

//! UI-automation agent session.
//!
//! The agent's chat UI is driven through an operator-supplied driver program:
//!
//! - `<driver> read` prints the visible transcript,
//! - `<driver> type` reads an instruction on stdin and submits it.
//!
//! After typing, the transcript is polled until it differs from the baseline
//! and stays identical for `settle_polls` consecutive reads. The response is
//! the text that appeared after the baseline.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::core::budget::CancelSignal;
use crate::core::types::AgentResponse;
use crate::io::config::UiDriverConfig;
use crate::io::process::HelperCommand;
use crate::io::session::{AgentSession, SessionError};

#[derive(Debug)]
pub struct UiDriverSession {
    config: UiDriverConfig,
    workdir: PathBuf,
    /// The UI is a single conversation; sends are serialized.
    ui: Mutex<()>,
}

impl UiDriverSession {
    pub fn new(config: UiDriverConfig, workdir: PathBuf) -> Self {
        Self {
            config,
            workdir,
            ui: Mutex::new(()),
        }
    }

    fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.config.response_timeout_secs)
    }

    fn helper(&self, timeout: Duration) -> HelperCommand<'_> {
        HelperCommand {
            argv: &self.config.command,
            workdir: &self.workdir,
            timeout,
            output_limit_bytes: self.config.output_limit_bytes,
        }
    }

    fn invoke(
        &self,
        action: &str,
        stdin: Option<&[u8]>,
        deadline: Instant,
    ) -> Result<String, SessionError> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        if timeout.is_zero() {
            return Err(SessionError::Timeout(self.response_timeout()));
        }
        let output = self
            .helper(timeout)
            .run(&[action], stdin)
            .map_err(|err| SessionError::Transport(format!("driver {action}: {err:#}")))?;
        if output.timed_out {
            return Err(SessionError::Timeout(self.response_timeout()));
        }
        if !output.status.success() {
            return Err(SessionError::Transport(format!(
                "driver {action} exited with {:?}: {}",
                output.status.code(),
                output.stderr_tail()
            )));
        }
        Ok(output.stdout_text())
    }

    fn timed_out(&self, cancel: &CancelSignal) -> SessionError {
        if cancel.is_cancelled() {
            SessionError::Cancelled
        } else {
            SessionError::Timeout(self.response_timeout())
        }
    }
}

impl AgentSession for UiDriverSession {
    #[instrument(skip_all)]
    fn send(
        &self,
        instruction: &str,
        cancel: &CancelSignal,
    ) -> Result<AgentResponse, SessionError> {
        let _ui = self
            .ui
            .lock()
            .map_err(|_| SessionError::Transport("ui driver lock poisoned".to_string()))?;
        let started = Instant::now();
        let deadline = started + cancel.bound(self.response_timeout());
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        let baseline = self.invoke("read", None, deadline)?;
        self.invoke("type", Some(instruction.as_bytes()), deadline)?;
        info!(chars = instruction.len(), "instruction typed");

        let mut last = baseline.clone();
        let mut stable_reads = 0u32;
        loop {
            if cancel.is_flagged() {
                return Err(SessionError::Cancelled);
            }
            if Instant::now() >= deadline || !cancel.sleep(poll_interval) {
                return Err(self.timed_out(cancel));
            }
            let transcript = match self.invoke("read", None, deadline) {
                Ok(transcript) => transcript,
                Err(SessionError::Timeout(_)) => return Err(self.timed_out(cancel)),
                Err(err) => return Err(err),
            };
            if transcript != baseline && transcript == last {
                stable_reads += 1;
            } else {
                stable_reads = 0;
            }
            last = transcript;
            debug!(stable_reads, "polled transcript");
            if stable_reads + 1 >= self.config.settle_polls && last != baseline {
                let text = new_suffix(&baseline, &last);
                if text.is_empty() {
                    warn!("transcript changed but no new suffix; using full transcript");
                }
                let text = if text.is_empty() { last.trim() } else { text };
                return Ok(AgentResponse::new(text, started.elapsed()));
            }
        }
    }
}

/// Text appended after `baseline`, or the whole transcript when the UI
/// rewrote earlier content.
fn new_suffix<'a>(baseline: &str, transcript: &'a str) -> &'a str {
    transcript
        .strip_prefix(baseline)
        .unwrap_or(transcript)
        .trim()
}

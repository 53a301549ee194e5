//! File-based agent session: instructions and responses are exchanged as
//! numbered markdown files in a directory the agent watches.
//!
//! - `instruction-<seq>.md` is written atomically by foreman.
//! - `response-<seq>.md` is written by the agent. It is read once the agent
//!   creates `response-<seq>.done`, or once its size is unchanged between two
//!   polls.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::budget::CancelSignal;
use crate::core::types::AgentResponse;
use crate::io::fs_util::write_atomic;
use crate::io::session::{AgentSession, SessionError};

#[derive(Debug)]
pub struct FileExchangeSession {
    dir: PathBuf,
    response_timeout: Duration,
    poll_interval: Duration,
    seq: AtomicU64,
}

impl FileExchangeSession {
    /// Open the exchange directory, continuing numbering after existing instructions.
    pub fn open(dir: PathBuf, response_timeout: Duration, poll_interval: Duration) -> Result<Self> {
        fs::create_dir_all(&dir).with_context(|| format!("create exchange dir {}", dir.display()))?;
        let last = highest_sequence(&dir)?;
        debug!(dir = %dir.display(), last, "opened file exchange");
        Ok(Self {
            dir,
            response_timeout,
            poll_interval,
            seq: AtomicU64::new(last),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn instruction_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("instruction-{seq}.md"))
    }

    pub fn response_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("response-{seq}.md"))
    }

    pub fn done_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("response-{seq}.done"))
    }

    /// Response text once it is complete; `None` while absent or still growing.
    fn poll_response(
        &self,
        seq: u64,
        last_len: &mut Option<u64>,
    ) -> Result<Option<String>, SessionError> {
        let path = self.response_path(seq);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(SessionError::Transport(format!(
                    "stat {}: {err}",
                    path.display()
                )));
            }
        };
        let len = meta.len();
        let settled = self.done_path(seq).exists() || (len > 0 && *last_len == Some(len));
        *last_len = Some(len);
        if !settled {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .map_err(|err| SessionError::Transport(format!("read {}: {err}", path.display())))
    }
}

impl AgentSession for FileExchangeSession {
    #[instrument(skip_all, fields(dir = %self.dir.display()))]
    fn send(
        &self,
        instruction: &str,
        cancel: &CancelSignal,
    ) -> Result<AgentResponse, SessionError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        let path = self.instruction_path(seq);
        write_atomic(&path, instruction.as_bytes())
            .map_err(|err| SessionError::Transport(format!("{err:#}")))?;
        info!(seq, path = %path.display(), "instruction written");

        let deadline = started + cancel.bound(self.response_timeout);
        let mut last_len = None;
        loop {
            if cancel.is_flagged() {
                return Err(SessionError::Cancelled);
            }
            if let Some(text) = self.poll_response(seq, &mut last_len)? {
                let response = AgentResponse::new(text, started.elapsed());
                info!(seq, elapsed_ms = response.elapsed_ms, "response received");
                return Ok(response);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(if cancel.is_cancelled() {
                    SessionError::Cancelled
                } else {
                    SessionError::Timeout(self.response_timeout)
                });
            }
            cancel.sleep(self.poll_interval.min(deadline - now));
        }
    }
}

fn highest_sequence(dir: &Path) -> Result<u64> {
    let mut highest = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name();
        let seq = name
            .to_str()
            .and_then(|n| n.strip_prefix("instruction-"))
            .and_then(|n| n.strip_suffix(".md"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(seq) = seq {
            highest = highest.max(seq);
        }
    }
    Ok(highest)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn session(dir: &Path, timeout_ms: u64) -> FileExchangeSession {
        FileExchangeSession::open(
            dir.to_path_buf(),
            Duration::from_millis(timeout_ms),
            Duration::from_millis(10),
        )
        .expect("open")
    }

    #[test]
    fn reads_response_after_done_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = session(temp.path(), 5_000);
        let agent_dir = temp.path().to_path_buf();

        let agent = thread::spawn(move || {
            let instruction = agent_dir.join("instruction-1.md");
            while !instruction.exists() {
                thread::sleep(Duration::from_millis(5));
            }
            let body = fs::read_to_string(&instruction).expect("read instruction");
            fs::write(agent_dir.join("response-1.md"), format!("did: {body}")).expect("respond");
            fs::write(agent_dir.join("response-1.done"), "").expect("done");
        });

        let response = session
            .send("build the thing", &CancelSignal::new())
            .expect("response");
        agent.join().expect("agent thread");
        assert_eq!(response.text, "did: build the thing");
    }

    #[test]
    fn stable_response_without_marker_is_accepted() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("response-1.md"), "finished").expect("prewrite");
        let session = session(temp.path(), 5_000);

        let response = session.send("go", &CancelSignal::new()).expect("response");
        assert_eq!(response.text, "finished");
    }

    #[test]
    fn times_out_without_response() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = session(temp.path(), 50);
        let err = session.send("go", &CancelSignal::new()).expect_err("timeout");
        assert_eq!(err, SessionError::Timeout(Duration::from_millis(50)));
        assert!(temp.path().join("instruction-1.md").exists());
    }

    #[test]
    fn cancelled_signal_stops_waiting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = session(temp.path(), 5_000);
        let cancel = CancelSignal::new();
        cancel.cancel();
        let err = session.send("go", &cancel).expect_err("cancelled");
        assert_eq!(err, SessionError::Cancelled);
    }

    /// Numbering continues after instructions left by an earlier run.
    #[test]
    fn sequence_resumes_after_existing_instructions() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("instruction-7.md"), "old").expect("old instruction");
        fs::write(temp.path().join("response-8.md"), "new").expect("response");
        let session = session(temp.path(), 5_000);

        let response = session.send("next", &CancelSignal::new()).expect("response");
        assert_eq!(response.text, "new");
        assert!(temp.path().join("instruction-8.md").exists());
    }
}

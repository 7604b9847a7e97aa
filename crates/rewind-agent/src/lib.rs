mod config;
mod process;

pub use config::{
    SupervisorConfig, DEFAULT_AGENT_BIN, DEFAULT_HANG_PROBE, DEFAULT_SHUTDOWN_GRACE,
    DEFAULT_TURN_TIMEOUT,
};

use chrono::{DateTime, Utc};
use process::{ExitKind, LiveProcess, RunEnd, StopRequest};
use rewind_core::Turn;
use rewind_session::{ConversationHandle, SessionError, SessionHub, TurnOutcome, TurnStart};
use rewind_storage::RecoveryReason;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("agent command is empty")]
    EmptyCommand,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("turn exceeded {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("agent exited with {code:?}: {stderr_tail}")]
    NonZeroExit {
        code: Option<i32>,
        stderr_tail: String,
    },
    #[error("turn cancelled")]
    Cancelled,
    #[error("conversation {0} already has a running agent")]
    AlreadyRunning(String),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// Snapshot of a live agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub conversation_id: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub bytes_received: u64,
    pub hanging: bool,
}

struct RunningEntry {
    generation: u64,
    live: Arc<LiveProcess>,
    stop: Option<oneshot::Sender<StopRequest>>,
}

/// Runs agent turns, at most one per conversation, and owns the table of live
/// processes.
pub struct Supervisor {
    hub: Arc<SessionHub>,
    config: SupervisorConfig,
    running: Mutex<HashMap<String, RunningEntry>>,
    generation: AtomicU64,
}

impl Supervisor {
    pub fn new(hub: Arc<SessionHub>, config: SupervisorConfig) -> Self {
        Self {
            hub,
            config,
            running: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }

    /// Runs one turn of `conversation_id` to completion and returns the finished
    /// assistant turn.
    pub async fn start(&self, conversation_id: &str, prompt: &str) -> Result<Turn, SupervisorError> {
        if self.config.agent_command.is_empty() {
            return Err(SupervisorError::EmptyCommand);
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        let live = Arc::new(LiveProcess::new());
        let generation = self.register(conversation_id, live.clone(), stop_tx)?;
        let _registration = Registration {
            running: &self.running,
            conversation_id,
            generation,
        };

        let handle = self.hub.conversation(conversation_id, None).await?;
        let start = handle.begin_turn(prompt).await?;
        let end = match process::run_turn(&self.config, &handle, &start, prompt, live, stop_rx).await
        {
            Ok(end) => end,
            Err(err) => {
                warn!(
                    event = "agent_spawn_failed",
                    conversation_id = %conversation_id,
                    error = %err,
                );
                if let Err(finish_err) = handle.finish_turn(TurnOutcome::Failed).await {
                    warn!(
                        event = "turn_finish_failed",
                        conversation_id = %conversation_id,
                        error = %finish_err,
                    );
                }
                return Err(err);
            }
        };
        self.settle(&handle, &start, end).await
    }

    async fn settle(
        &self,
        handle: &ConversationHandle,
        start: &TurnStart,
        end: RunEnd,
    ) -> Result<Turn, SupervisorError> {
        match end {
            RunEnd::Exited {
                kind: ExitKind::Success,
                ..
            } => Ok(handle.finish_turn(TurnOutcome::Completed).await?),
            RunEnd::Exited {
                kind: ExitKind::Interrupted,
                ..
            } => {
                info!(
                    event = "agent_interrupted",
                    conversation_id = %start.conversation_id,
                );
                Ok(handle.finish_turn(TurnOutcome::Interrupted).await?)
            }
            RunEnd::Exited {
                kind: ExitKind::Failed { code },
                stderr_tail,
            } => {
                handle
                    .finish_turn(TurnOutcome::Abandoned(RecoveryReason::NonZeroExit))
                    .await?;
                Err(SupervisorError::NonZeroExit { code, stderr_tail })
            }
            RunEnd::TimedOut => {
                handle
                    .finish_turn(TurnOutcome::Abandoned(RecoveryReason::Timeout))
                    .await?;
                Err(SupervisorError::Timeout(self.config.turn_timeout))
            }
            RunEnd::Stopped(request) => {
                let reason = match request {
                    StopRequest::Cancel => RecoveryReason::Cancelled,
                    StopRequest::Shutdown => RecoveryReason::Shutdown,
                };
                handle.finish_turn(TurnOutcome::Abandoned(reason)).await?;
                Err(SupervisorError::Cancelled)
            }
            RunEnd::Lost(err) => {
                handle
                    .finish_turn(TurnOutcome::Abandoned(RecoveryReason::NonZeroExit))
                    .await?;
                Err(SupervisorError::Io(err))
            }
        }
    }

    /// Terminates the running agent of `conversation_id`. Returns false when nothing
    /// was running.
    pub fn stop(&self, conversation_id: &str) -> bool {
        let entry = self.lock_running().remove(conversation_id);
        let Some(mut entry) = entry else {
            return false;
        };
        if let Some(stop) = entry.stop.take() {
            let _ = stop.send(StopRequest::Cancel);
        }
        info!(event = "agent_stop", conversation_id = %conversation_id);
        true
    }

    pub fn status(&self, conversation_id: &str) -> Option<ProcessStatus> {
        self.lock_running()
            .get(conversation_id)
            .map(|entry| process_status(conversation_id, &entry.live))
    }

    pub fn running(&self) -> Vec<ProcessStatus> {
        let mut statuses = self
            .lock_running()
            .iter()
            .map(|(conversation_id, entry)| process_status(conversation_id, &entry.live))
            .collect::<Vec<_>>();
        statuses.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        statuses
    }

    /// Signals every live agent and waits, up to the configured grace, for their turns
    /// to settle. Each settled turn leaves its recovery state behind.
    pub async fn shutdown(&self) -> usize {
        let signalled = {
            let mut running = self.lock_running();
            let mut signalled = 0;
            for entry in running.values_mut() {
                if let Some(stop) = entry.stop.take() {
                    if stop.send(StopRequest::Shutdown).is_ok() {
                        signalled += 1;
                    }
                }
            }
            signalled
        };
        if signalled > 0 {
            info!(event = "supervisor_shutdown", processes = signalled);
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        while !self.lock_running().is_empty() {
            if Instant::now() >= deadline {
                warn!(
                    event = "supervisor_shutdown_timeout",
                    remaining = self.lock_running().len(),
                );
                break;
            }
            sleep(SHUTDOWN_POLL).await;
        }
        signalled
    }

    fn register(
        &self,
        conversation_id: &str,
        live: Arc<LiveProcess>,
        stop: oneshot::Sender<StopRequest>,
    ) -> Result<u64, SupervisorError> {
        let mut running = self.lock_running();
        if running.contains_key(conversation_id) {
            return Err(SupervisorError::AlreadyRunning(conversation_id.to_string()));
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        running.insert(
            conversation_id.to_string(),
            RunningEntry {
                generation,
                live,
                stop: Some(stop),
            },
        );
        Ok(generation)
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<String, RunningEntry>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn process_status(conversation_id: &str, live: &LiveProcess) -> ProcessStatus {
    ProcessStatus {
        conversation_id: conversation_id.to_string(),
        pid: live.pid(),
        started_at: live.started_at,
        bytes_received: live.bytes_received(),
        hanging: live.is_hanging(),
    }
}

/// Removes the running-table entry when a turn settles, unless `stop` already did.
struct Registration<'a> {
    running: &'a Mutex<HashMap<String, RunningEntry>>,
    conversation_id: &'a str,
    generation: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if running
            .get(self.conversation_id)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            running.remove(self.conversation_id);
        }
    }
}

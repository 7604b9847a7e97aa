use crate::revert::ConversationState;
use crate::worker::{ConversationHandle, ConversationWorker};
use crate::SessionError;
use rewind_core::{ConversationStatus, FileSystem, TurnCompletion, TurnIndex, TurnRole, TurnWarning};
use rewind_storage::{ConversationSummary, RecoveryState, RewindStore};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tracing::{error, info};

const COMMAND_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnView {
    pub index: TurnIndex,
    pub id: String,
    pub role: TurnRole,
    pub completion: TurnCompletion,
    pub text: String,
    pub has_checkpoints: bool,
    pub warnings: Vec<TurnWarning>,
}

/// Read-only snapshot of a conversation for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationView {
    pub conversation_id: String,
    pub status: ConversationStatus,
    pub state: ConversationState,
    pub external_session_id: Option<String>,
    pub turn_in_flight: bool,
    pub turns: Vec<TurnView>,
}

type WorkerSlot = Arc<OnceCell<ConversationHandle>>;

/// Owns one worker per open conversation. Workers for different conversations run
/// independently and each keeps its own database connection. The table lock only
/// guards slot lookup; a worker starts outside it.
pub struct SessionHub {
    db_path: PathBuf,
    fs: Arc<dyn FileSystem>,
    workers: Mutex<HashMap<String, WorkerSlot>>,
}

impl SessionHub {
    pub fn new(db_path: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Result<Self, SessionError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Migrations run once here so workers never race on them.
        RewindStore::open(&db_path)?;
        Ok(Self {
            db_path,
            fs,
            workers: Mutex::new(HashMap::new()),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Returns the handle for `conversation_id`, starting its worker on first use.
    /// Unknown conversations are created when `cwd` is given.
    pub async fn conversation(
        &self,
        conversation_id: &str,
        cwd: Option<PathBuf>,
    ) -> Result<ConversationHandle, SessionError> {
        let slot = self.slot(conversation_id).await;
        match slot
            .get_or_try_init(|| self.spawn_worker(conversation_id, cwd))
            .await
        {
            Ok(handle) => Ok(handle.clone()),
            Err(err) => {
                let mut workers = self.workers.lock().await;
                if workers
                    .get(conversation_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot))
                {
                    workers.remove(conversation_id);
                }
                Err(err)
            }
        }
    }

    /// Slot for `conversation_id`, replacing one whose worker has exited.
    async fn slot(&self, conversation_id: &str) -> WorkerSlot {
        let mut workers = self.workers.lock().await;
        if let Some(slot) = workers.get(conversation_id) {
            match slot.get() {
                Some(handle) if handle.is_closed() => {}
                _ => return slot.clone(),
            }
        }
        let slot = WorkerSlot::default();
        workers.insert(conversation_id.to_string(), slot.clone());
        slot
    }

    async fn spawn_worker(
        &self,
        conversation_id: &str,
        cwd: Option<PathBuf>,
    ) -> Result<ConversationHandle, SessionError> {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();
        let db_path = self.db_path.clone();
        let fs = self.fs.clone();
        let id = conversation_id.to_string();

        std::thread::Builder::new()
            .name(format!("rewind-conv-{conversation_id}"))
            .spawn(move || match ConversationWorker::open(&db_path, fs, &id, cwd) {
                Ok(worker) => {
                    if ready_tx.send(Ok(())).is_ok() {
                        worker.run(rx);
                    }
                }
                Err(err) => {
                    error!(
                        event = "conversation_worker_failed",
                        conversation_id = %id,
                        error = %err,
                    );
                    let _ = ready_tx.send(Err(err));
                }
            })?;

        ready_rx
            .await
            .map_err(|_| SessionError::WorkerGone(conversation_id.to_string()))??;
        info!(event = "conversation_worker_started", conversation_id = %conversation_id);
        Ok(ConversationHandle::new(conversation_id.to_string(), tx))
    }

    /// Closes a conversation's queue. Commands already queued still run.
    pub async fn release(&self, conversation_id: &str) -> bool {
        self.workers.lock().await.remove(conversation_id).is_some()
    }

    pub fn conversations(&self) -> Result<Vec<ConversationSummary>, SessionError> {
        Ok(self.open_store()?.conversations()?)
    }

    /// Turns that were in flight, or ended without finishing, across all conversations.
    pub fn recovery_states(&self) -> Result<Vec<RecoveryState>, SessionError> {
        Ok(self.open_store()?.recovery_states()?)
    }

    pub fn clear_recovery_state(&self, conversation_id: &str) -> Result<bool, SessionError> {
        Ok(self.open_store()?.clear_recovery_state(conversation_id)?)
    }

    fn open_store(&self) -> Result<RewindStore, SessionError> {
        Ok(RewindStore::open(&self.db_path)?)
    }
}

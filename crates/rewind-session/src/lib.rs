mod assembler;
mod checkpoints;
mod hub;
mod reconcile;
mod revert;
mod worker;

pub use assembler::{AssemblyContext, TurnAssembler};
pub use checkpoints::{CheckpointRecorder, CheckpointWriteError, ResolveReport, ResolveStatus};
pub use hub::{ConversationView, SessionHub, TurnView};
pub use reconcile::{ReconciliationError, TurnIdReconciler};
pub use revert::{
    ConversationState, FileOutcome, FileStatus, RevertEngine, RevertError, RevertOutcome,
    RevertReport, UnrevertError, UnrevertReport,
};
pub use worker::{ConversationHandle, TurnOutcome, TurnStart};

use rewind_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("conversation {0} already has a turn in flight")]
    TurnInFlight(String),
    #[error("conversation {0} has no turn in flight")]
    NoTurnInFlight(String),
    #[error("conversation worker for {0} is gone")]
    WorkerGone(String),
}

/// The worker thread behind a handle stopped before answering.
#[derive(Debug, Clone)]
pub(crate) struct WorkerGone(pub String);

impl From<WorkerGone> for SessionError {
    fn from(gone: WorkerGone) -> Self {
        SessionError::WorkerGone(gone.0)
    }
}

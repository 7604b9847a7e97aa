use crate::WorkerGone;
use chrono::Utc;
use rewind_core::{content_digest, AfterContent, Checkpoint, Conversation, FileSystem};
use rewind_storage::{RevertRecord, RewindStore, StorageError};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RevertError {
    #[error("conversation is already reverted to turn {turn_id}")]
    AlreadyReverted { turn_id: String },
    #[error("turn {0} is not part of this conversation")]
    UnknownTurn(String),
    #[error("conversation {0} has a turn in flight")]
    TurnInFlight(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("conversation worker for {0} is gone")]
    WorkerGone(String),
}

impl From<WorkerGone> for RevertError {
    fn from(gone: WorkerGone) -> Self {
        RevertError::WorkerGone(gone.0)
    }
}

#[derive(Debug, Error)]
pub enum UnrevertError {
    #[error("conversation {0} is not reverted")]
    NotReverted(String),
    #[error("conversation {0} has a turn in flight")]
    TurnInFlight(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("conversation worker for {0} is gone")]
    WorkerGone(String),
}

impl From<WorkerGone> for UnrevertError {
    fn from(gone: WorkerGone) -> Self {
        UnrevertError::WorkerGone(gone.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConversationState {
    Normal,
    Reverted { turn_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum FileStatus {
    Written,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    pub checkpoint_id: String,
    pub file_path: String,
    pub status: FileStatus,
    /// Whether the file differed from what the checkpoint expected to find there.
    /// `None` when the expectation is unknown.
    pub drifted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevertReport {
    pub conversation_id: String,
    pub turn_id: String,
    pub files: Vec<FileOutcome>,
    pub truncated_turns: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RevertOutcome {
    NoCheckpointsFound { turn_id: String },
    Reverted(RevertReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnrevertReport {
    pub conversation_id: String,
    pub turn_id: String,
    pub files: Vec<FileOutcome>,
    pub restored_turns: usize,
}

impl RevertReport {
    pub fn failures(&self) -> usize {
        count_failures(&self.files)
    }
}

impl UnrevertReport {
    pub fn failures(&self) -> usize {
        count_failures(&self.files)
    }
}

fn count_failures(files: &[FileOutcome]) -> usize {
    files
        .iter()
        .filter(|file| matches!(file.status, FileStatus::Failed(_)))
        .count()
}

/// Per-conversation `Normal <-> Reverted(turn)` state machine. The reverted state is
/// persisted so it survives restarts.
pub struct RevertEngine {
    fs: Arc<dyn FileSystem>,
    record: Option<RevertRecord>,
}

impl RevertEngine {
    pub fn load(
        fs: Arc<dyn FileSystem>,
        store: &RewindStore,
        conversation_id: &str,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            fs,
            record: store.revert_state(conversation_id)?,
        })
    }

    pub fn state(&self) -> ConversationState {
        match &self.record {
            Some(record) => ConversationState::Reverted {
                turn_id: record.turn_id.clone(),
            },
            None => ConversationState::Normal,
        }
    }

    pub fn is_reverted(&self) -> bool {
        self.record.is_some()
    }

    /// Restores before-content for every mutation made by `turn_id` or any later turn,
    /// newest first, then cuts the turn list after `turn_id`.
    ///
    /// File writes are not rolled back when one of them fails: the report lists each
    /// file, and the state still moves to `Reverted` so `unrevert` can re-apply.
    pub fn revert(
        &mut self,
        store: &RewindStore,
        conversation: &mut Conversation,
        turn_id: &str,
    ) -> Result<RevertOutcome, RevertError> {
        if let Some(record) = &self.record {
            return Err(RevertError::AlreadyReverted {
                turn_id: record.turn_id.clone(),
            });
        }
        if conversation.find_turn(turn_id).is_none() {
            return Err(RevertError::UnknownTurn(turn_id.to_string()));
        }

        let checkpoints = store.list_for_revert(&conversation.id, turn_id)?;
        if checkpoints.is_empty() {
            info!(
                event = "revert_no_checkpoints",
                conversation_id = %conversation.id,
                turn_id = %turn_id,
            );
            return Ok(RevertOutcome::NoCheckpointsFound {
                turn_id: turn_id.to_string(),
            });
        }

        let files = checkpoints
            .iter()
            .map(|checkpoint| self.restore_before(checkpoint))
            .collect::<Vec<_>>();

        let stashed = conversation.truncate_after(turn_id).unwrap_or_default();
        store.truncate_turns_after(&conversation.id, turn_id)?;
        let record = RevertRecord {
            conversation_id: conversation.id.clone(),
            turn_id: turn_id.to_string(),
            stashed_turns: stashed,
            checkpoint_ids: checkpoints
                .iter()
                .map(|checkpoint| checkpoint.checkpoint_id.clone())
                .collect(),
            reverted_at: Utc::now(),
        };
        store.save_revert_state(&record)?;
        let truncated_turns = record.stashed_turns.len();
        self.record = Some(record);

        let report = RevertReport {
            conversation_id: conversation.id.clone(),
            turn_id: turn_id.to_string(),
            files,
            truncated_turns,
        };
        if report.failures() > 0 {
            error!(
                event = "revert_partial_failure",
                conversation_id = %conversation.id,
                turn_id = %turn_id,
                failures = report.failures(),
                files = report.files.len(),
            );
        } else {
            info!(
                event = "revert_applied",
                conversation_id = %conversation.id,
                turn_id = %turn_id,
                files = report.files.len(),
                truncated_turns,
            );
        }
        Ok(RevertOutcome::Reverted(report))
    }

    /// Re-applies after-content oldest first and restores the truncated turns.
    /// Checkpoints whose after-content never resolved are skipped and reported.
    pub fn unrevert(
        &mut self,
        store: &RewindStore,
        conversation: &mut Conversation,
    ) -> Result<UnrevertReport, UnrevertError> {
        let Some(record) = self.record.clone() else {
            return Err(UnrevertError::NotReverted(conversation.id.clone()));
        };

        let mut files = Vec::with_capacity(record.checkpoint_ids.len());
        for checkpoint_id in record.checkpoint_ids.iter().rev() {
            match store.checkpoint(checkpoint_id)? {
                Some(checkpoint) => files.push(self.restore_after(&checkpoint)),
                None => files.push(FileOutcome {
                    checkpoint_id: checkpoint_id.clone(),
                    file_path: String::new(),
                    status: FileStatus::Skipped("checkpoint no longer stored".to_string()),
                    drifted: None,
                }),
            }
        }

        let restored_turns = record.stashed_turns.len();
        store.restore_turns(&conversation.id, &record.stashed_turns)?;
        conversation.restore_turns(record.stashed_turns);
        store.clear_revert_state(&conversation.id)?;
        self.record = None;

        let report = UnrevertReport {
            conversation_id: conversation.id.clone(),
            turn_id: record.turn_id,
            files,
            restored_turns,
        };
        info!(
            event = "unrevert_applied",
            conversation_id = %conversation.id,
            turn_id = %report.turn_id,
            files = report.files.len(),
            failures = report.failures(),
            restored_turns,
        );
        Ok(report)
    }

    /// New input while reverted discards the stashed turns and retires the reverted
    /// checkpoints instead of merging them back.
    pub fn start_fresh_branch(
        &mut self,
        store: &RewindStore,
        conversation_id: &str,
    ) -> Result<usize, StorageError> {
        let Some(record) = self.record.take() else {
            return Ok(0);
        };
        let abandoned = store.abandon_checkpoints(conversation_id, &record.checkpoint_ids)?;
        store.clear_revert_state(conversation_id)?;
        info!(
            event = "fresh_branch_started",
            conversation_id = %conversation_id,
            reverted_turn_id = %record.turn_id,
            abandoned_checkpoints = abandoned,
            discarded_turns = record.stashed_turns.len(),
        );
        Ok(abandoned)
    }

    fn restore_before(&self, checkpoint: &Checkpoint) -> FileOutcome {
        let expected = checkpoint.after_content.as_resolved();
        self.write_file(checkpoint, expected, &checkpoint.before_content)
    }

    fn restore_after(&self, checkpoint: &Checkpoint) -> FileOutcome {
        match &checkpoint.after_content {
            AfterContent::Pending => FileOutcome {
                checkpoint_id: checkpoint.checkpoint_id.clone(),
                file_path: checkpoint.file_path.clone(),
                status: FileStatus::Skipped("after-content pending".to_string()),
                drifted: None,
            },
            AfterContent::Resolved(content) => {
                self.write_file(checkpoint, Some(&checkpoint.before_content), content)
            }
        }
    }

    fn write_file(&self, checkpoint: &Checkpoint, expected: Option<&str>, content: &str) -> FileOutcome {
        let path = Path::new(&checkpoint.file_path);
        let drifted = expected.map(|expected| match self.fs.read(path) {
            Ok(current) => content_digest(&current) != content_digest(expected),
            Err(_) => !expected.is_empty(),
        });
        if drifted == Some(true) {
            warn!(
                event = "checkpoint_file_drifted",
                checkpoint_id = %checkpoint.checkpoint_id,
                file_path = %checkpoint.file_path,
            );
        }

        let status = match self.fs.write(path, content) {
            Ok(()) => FileStatus::Written,
            Err(err) => {
                warn!(
                    event = "checkpoint_file_write_failed",
                    checkpoint_id = %checkpoint.checkpoint_id,
                    file_path = %checkpoint.file_path,
                    error = %err,
                );
                FileStatus::Failed(err.to_string())
            }
        };
        FileOutcome {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            file_path: checkpoint.file_path.clone(),
            status,
            drifted,
        }
    }
}

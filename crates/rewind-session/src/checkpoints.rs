use chrono::Utc;
use rewind_core::{
    resolve_target_path, AfterContent, Checkpoint, FileSystem, FsError, NewCheckpoint, ToolInvocation,
    ToolKind,
};
use rewind_storage::{RewindStore, StorageError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CheckpointWriteError {
    #[error("{tool} invocation {tool_use_id} has no target path")]
    MissingPath { tool_use_id: String, tool: ToolKind },
    #[error("file error: {0}")]
    Fs(#[from] FsError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ResolveStatus {
    Resolved,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolveReport {
    pub checkpoint_id: String,
    pub file_path: String,
    pub status: ResolveStatus,
}

/// Captures file state around file-mutating tool invocations.
#[derive(Clone)]
pub struct CheckpointRecorder {
    fs: Arc<dyn FileSystem>,
}

impl CheckpointRecorder {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// Records the before-state of the file an invocation targets. Whole-file writes
    /// carry their after-content in the invocation itself; partial edits stay pending
    /// until their tool result arrives. Non-mutating tools record nothing.
    pub fn create_checkpoint(
        &self,
        store: &RewindStore,
        conversation_id: &str,
        cwd: &Path,
        turn_id: &str,
        invocation: &ToolInvocation,
    ) -> Result<Option<Checkpoint>, CheckpointWriteError> {
        let Some(kind) = ToolKind::from_tool_name(&invocation.name) else {
            return Ok(None);
        };
        let path = target_path(kind, cwd, invocation).ok_or_else(|| {
            CheckpointWriteError::MissingPath {
                tool_use_id: invocation.id.clone(),
                tool: kind,
            }
        })?;

        let before_content = match self.fs.read(&path) {
            Ok(content) => content,
            Err(err) if err.is_not_found() => String::new(),
            Err(err) => return Err(err.into()),
        };
        let after_content = match kind.written_content(&invocation.input) {
            Some(content) => AfterContent::Resolved(content),
            None => AfterContent::Pending,
        };

        let checkpoint = store.insert_checkpoint(&NewCheckpoint {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            turn_id: turn_id.to_string(),
            tool_use_id: invocation.id.clone(),
            file_path: path.to_string_lossy().into_owned(),
            created_at: Utc::now(),
            before_content,
            after_content,
            tool_kind: kind,
        })?;

        info!(
            event = "checkpoint_created",
            conversation_id = %conversation_id,
            turn_id = %turn_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            sequence = checkpoint.sequence,
            tool = %kind,
            pending = checkpoint.after_content.is_pending(),
        );
        Ok(Some(checkpoint))
    }

    /// Fills in after-content for the pending checkpoints of `turn_id` that target
    /// the invocation's file. Each checkpoint is reported on its own; nothing here
    /// raises.
    pub fn resolve_pending(
        &self,
        store: &RewindStore,
        conversation_id: &str,
        cwd: &Path,
        turn_id: &str,
        invocation: &ToolInvocation,
    ) -> Vec<ResolveReport> {
        let Some(kind) = ToolKind::from_tool_name(&invocation.name) else {
            return Vec::new();
        };
        let Some(path) = target_path(kind, cwd, invocation) else {
            return Vec::new();
        };
        let file_path = path.to_string_lossy().into_owned();

        let pending = match store.pending_checkpoints(conversation_id, turn_id) {
            Ok(pending) => pending,
            Err(err) => {
                warn!(
                    event = "checkpoint_resolve_lookup_failed",
                    conversation_id = %conversation_id,
                    turn_id = %turn_id,
                    error = %err,
                );
                return vec![ResolveReport {
                    checkpoint_id: String::new(),
                    file_path,
                    status: ResolveStatus::Failed(err.to_string()),
                }];
            }
        };

        let matching = pending
            .into_iter()
            .filter(|checkpoint| checkpoint.file_path == file_path)
            .filter(|checkpoint| checkpoint.tool_use_id == invocation.id)
            .collect::<Vec<_>>();
        if matching.is_empty() {
            debug!(
                event = "checkpoint_resolve_nothing_pending",
                conversation_id = %conversation_id,
                tool_use_id = %invocation.id,
            );
            return Vec::new();
        }

        let current = match self.fs.read(&path) {
            Ok(content) => Ok(content),
            Err(err) if err.is_not_found() => Ok(String::new()),
            Err(err) => Err(err.to_string()),
        };

        matching
            .into_iter()
            .map(|checkpoint| {
                let status = match &current {
                    Ok(content) => match store.resolve_checkpoint(&checkpoint.checkpoint_id, content)
                    {
                        Ok(_) => ResolveStatus::Resolved,
                        Err(err) => ResolveStatus::Failed(err.to_string()),
                    },
                    Err(message) => ResolveStatus::Failed(message.clone()),
                };
                match &status {
                    ResolveStatus::Resolved => debug!(
                        event = "checkpoint_resolved",
                        checkpoint_id = %checkpoint.checkpoint_id,
                    ),
                    ResolveStatus::Failed(reason) => warn!(
                        event = "checkpoint_resolve_failed",
                        checkpoint_id = %checkpoint.checkpoint_id,
                        reason = %reason,
                    ),
                }
                ResolveReport {
                    checkpoint_id: checkpoint.checkpoint_id,
                    file_path: checkpoint.file_path,
                    status,
                }
            })
            .collect()
    }
}

fn target_path(kind: ToolKind, cwd: &Path, invocation: &ToolInvocation) -> Option<PathBuf> {
    kind.target_path(&invocation.input)
        .map(|raw| resolve_target_path(cwd, &raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_core::LocalFileSystem;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn recorder() -> CheckpointRecorder {
        CheckpointRecorder::new(Arc::new(LocalFileSystem))
    }

    fn edit(id: &str, path: &str) -> ToolInvocation {
        ToolInvocation::new(
            id,
            "Edit",
            json!({"file_path": path, "old_string": "old", "new_string": "new"}),
        )
    }

    #[test]
    fn partial_edit_is_pending_until_resolved() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("f.txt"), "old").expect("seed file");
        let store = RewindStore::open_in_memory().expect("open db");
        let invocation = edit("tu1", "f.txt");

        let checkpoint = recorder()
            .create_checkpoint(&store, "conv", dir.path(), "t1", &invocation)
            .expect("create")
            .expect("mutating tool");
        assert_eq!(checkpoint.before_content, "old");
        assert!(checkpoint.after_content.is_pending());
        assert_eq!(
            checkpoint.file_path,
            dir.path().join("f.txt").to_string_lossy()
        );

        fs::write(dir.path().join("f.txt"), "new").expect("agent edit");
        let reports = recorder().resolve_pending(&store, "conv", dir.path(), "t1", &invocation);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, ResolveStatus::Resolved);
        let stored = store
            .checkpoint(&checkpoint.checkpoint_id)
            .expect("load")
            .expect("exists");
        assert_eq!(stored.after_content, AfterContent::Resolved("new".to_string()));
    }

    #[test]
    fn whole_file_write_resolves_immediately() {
        let dir = tempdir().expect("tempdir");
        let store = RewindStore::open_in_memory().expect("open db");
        let invocation = ToolInvocation::new(
            "tu1",
            "Write",
            json!({"file_path": "new.txt", "content": "fresh"}),
        );
        let checkpoint = recorder()
            .create_checkpoint(&store, "conv", dir.path(), "t1", &invocation)
            .expect("create")
            .expect("mutating tool");
        assert_eq!(checkpoint.before_content, "");
        assert_eq!(
            checkpoint.after_content,
            AfterContent::Resolved("fresh".to_string())
        );
        assert!(store
            .pending_checkpoints("conv", "t1")
            .expect("pending")
            .is_empty());
    }

    #[test]
    fn non_mutating_tools_record_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = RewindStore::open_in_memory().expect("open db");
        let read = ToolInvocation::new("tu1", "Read", json!({"file_path": "f.txt"}));
        assert!(recorder()
            .create_checkpoint(&store, "conv", dir.path(), "t1", &read)
            .expect("create")
            .is_none());
        assert!(store.checkpoints("conv").expect("list").is_empty());
    }

    #[test]
    fn missing_path_argument_is_a_write_error() {
        let dir = tempdir().expect("tempdir");
        let store = RewindStore::open_in_memory().expect("open db");
        let invocation = ToolInvocation::new("tu1", "Edit", json!({"old_string": "a"}));
        let err = recorder()
            .create_checkpoint(&store, "conv", dir.path(), "t1", &invocation)
            .expect_err("no path");
        assert!(matches!(err, CheckpointWriteError::MissingPath { .. }));
    }

    #[test]
    fn resolve_only_matches_the_reporting_invocation() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("f.txt"), "v0").expect("seed");
        let store = RewindStore::open_in_memory().expect("open db");
        let first = edit("tu1", "f.txt");
        let second = edit("tu2", "f.txt");
        recorder()
            .create_checkpoint(&store, "conv", dir.path(), "t1", &first)
            .expect("first");
        fs::write(dir.path().join("f.txt"), "v1").expect("first edit");
        recorder()
            .create_checkpoint(&store, "conv", dir.path(), "t1", &second)
            .expect("second");

        let reports = recorder().resolve_pending(&store, "conv", dir.path(), "t1", &first);
        assert_eq!(reports.len(), 1);
        let pending = store.pending_checkpoints("conv", "t1").expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tool_use_id, "tu2");
        assert_eq!(pending[0].before_content, "v1");
    }
}

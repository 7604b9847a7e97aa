use rewind_core::{Conversation, TurnIndex, TurnWarning};
use rewind_storage::{ReassignReport, RewindStore, StorageError};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("no turn at index {0}")]
    UnknownTurn(TurnIndex),
    #[error("turn already has final id {current}")]
    AlreadyFinal { current: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Swaps a turn's placeholder id for the id the agent assigned.
///
/// Storage rows move in one transaction that commits only once no checkpoint still
/// names the placeholder, and the in-memory turn is renamed after it commits. A failure is
/// logged and attached to the turn as a warning, since checkpoints left on a stale id
/// can no longer be found by id-based revert.
#[derive(Debug, Default, Clone, Copy)]
pub struct TurnIdReconciler;

impl TurnIdReconciler {
    pub fn reconcile(
        &self,
        store: &RewindStore,
        conversation: &mut Conversation,
        index: TurnIndex,
        final_id: &str,
    ) -> Result<ReassignReport, ReconciliationError> {
        let turn = conversation
            .turn(index)
            .ok_or(ReconciliationError::UnknownTurn(index))?;
        if turn.id == final_id {
            return Ok(ReassignReport::default());
        }
        if !turn.is_placeholder() {
            return Err(ReconciliationError::AlreadyFinal {
                current: turn.id.clone(),
            });
        }
        let placeholder = turn.id.clone();

        let result = store
            .reassign_turn_id(&conversation.id, &placeholder, final_id)
            .map_err(ReconciliationError::from);
        match result {
            Ok(report) => {
                conversation.set_turn_id(index, final_id);
                info!(
                    event = "turn_reconciled",
                    conversation_id = %conversation.id,
                    placeholder_id = %placeholder,
                    final_id = %final_id,
                    checkpoints = report.checkpoints,
                );
                Ok(report)
            }
            Err(err) => {
                error!(
                    event = "turn_reconcile_failed",
                    conversation_id = %conversation.id,
                    placeholder_id = %placeholder,
                    final_id = %final_id,
                    error = %err,
                );
                if let Some(turn) = conversation.turn_mut(index) {
                    turn.warnings.push(TurnWarning::Reconciliation {
                        placeholder_id: placeholder,
                        final_id: final_id.to_string(),
                        message: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }
}

use crate::assembler::{AssemblyContext, TurnAssembler};
use crate::checkpoints::CheckpointRecorder;
use crate::hub::{ConversationView, TurnView};
use crate::reconcile::TurnIdReconciler;
use crate::revert::{RevertEngine, RevertError, RevertOutcome, UnrevertError, UnrevertReport};
use crate::{SessionError, WorkerGone};
use chrono::Utc;
use rewind_core::{
    placeholder_turn_id, Checkpoint, ContentBlock, Conversation, ConversationStatus, FileSystem,
    StreamEvent, Turn, TurnCompletion, TurnIdState, TurnIndex, TurnRole,
};
use rewind_storage::{RecoveryReason, RecoveryState, RewindStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How the process behind a turn ended, as far as the turn is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    /// The agent exited interrupted-style; the partial turn is kept as the result.
    Interrupted,
    /// The agent never produced a turn, e.g. it could not be spawned.
    Failed,
    /// The turn did not finish. Its partial state is kept for recovery.
    Abandoned(RecoveryReason),
}

/// What the supervisor needs to launch the agent for a new turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnStart {
    pub conversation_id: String,
    pub user_turn: TurnIndex,
    pub assistant_turn: TurnIndex,
    pub placeholder_id: String,
    pub cwd: PathBuf,
    pub resume_token: Option<String>,
}

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    BeginTurn {
        prompt: String,
        reply: Reply<Result<TurnStart, SessionError>>,
    },
    ApplyEvents {
        events: Vec<StreamEvent>,
    },
    FinishTurn {
        outcome: TurnOutcome,
        reply: Reply<Result<Turn, SessionError>>,
    },
    Revert {
        turn_id: String,
        reply: Reply<Result<RevertOutcome, RevertError>>,
    },
    Unrevert {
        reply: Reply<Result<UnrevertReport, UnrevertError>>,
    },
    ListForRevert {
        turn_id: String,
        reply: Reply<Result<Vec<Checkpoint>, SessionError>>,
    },
    Checkpoints {
        reply: Reply<Result<Vec<Checkpoint>, SessionError>>,
    },
    View {
        reply: Reply<Result<ConversationView, SessionError>>,
    },
    SetStatus {
        status: ConversationStatus,
        reply: Reply<Result<(), SessionError>>,
    },
    Cleanup {
        reply: Reply<Result<usize, SessionError>>,
    },
}

/// Cloneable front of a conversation's single-writer queue. Every call is processed
/// in FIFO order by the one thread that owns the conversation's state.
#[derive(Debug, Clone)]
pub struct ConversationHandle {
    conversation_id: String,
    tx: mpsc::Sender<Command>,
}

impl ConversationHandle {
    pub(crate) fn new(conversation_id: String, tx: mpsc::Sender<Command>) -> Self {
        Self {
            conversation_id,
            tx,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, WorkerGone> {
        let (reply, rx) = oneshot::channel();
        let gone = || WorkerGone(self.conversation_id.clone());
        self.tx.send(build(reply)).await.map_err(|_| gone())?;
        rx.await.map_err(|_| gone())
    }

    pub async fn begin_turn(&self, prompt: impl Into<String>) -> Result<TurnStart, SessionError> {
        let prompt = prompt.into();
        self.call(|reply| Command::BeginTurn { prompt, reply }).await?
    }

    /// Queues stream events for the turn in flight. Ordering with every other call on
    /// this handle is preserved.
    pub async fn apply_events(&self, events: Vec<StreamEvent>) -> Result<(), SessionError> {
        if events.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Command::ApplyEvents { events })
            .await
            .map_err(|_| SessionError::WorkerGone(self.conversation_id.clone()))
    }

    pub async fn finish_turn(&self, outcome: TurnOutcome) -> Result<Turn, SessionError> {
        self.call(|reply| Command::FinishTurn { outcome, reply })
            .await?
    }

    pub async fn revert(&self, turn_id: impl Into<String>) -> Result<RevertOutcome, RevertError> {
        let turn_id = turn_id.into();
        self.call(|reply| Command::Revert { turn_id, reply }).await?
    }

    pub async fn unrevert(&self) -> Result<UnrevertReport, UnrevertError> {
        self.call(|reply| Command::Unrevert { reply }).await?
    }

    pub async fn list_for_revert(
        &self,
        turn_id: impl Into<String>,
    ) -> Result<Vec<Checkpoint>, SessionError> {
        let turn_id = turn_id.into();
        self.call(|reply| Command::ListForRevert { turn_id, reply })
            .await?
    }

    pub async fn checkpoints(&self) -> Result<Vec<Checkpoint>, SessionError> {
        self.call(|reply| Command::Checkpoints { reply }).await?
    }

    pub async fn view(&self) -> Result<ConversationView, SessionError> {
        self.call(|reply| Command::View { reply }).await?
    }

    pub async fn set_status(&self, status: ConversationStatus) -> Result<(), SessionError> {
        self.call(|reply| Command::SetStatus { status, reply })
            .await?
    }

    /// Deletes every checkpoint of the conversation and any revert state.
    pub async fn cleanup(&self) -> Result<usize, SessionError> {
        self.call(|reply| Command::Cleanup { reply }).await?
    }
}

pub(crate) struct ConversationWorker {
    conversation: Conversation,
    store: RewindStore,
    recorder: CheckpointRecorder,
    reconciler: TurnIdReconciler,
    engine: RevertEngine,
    active: Option<TurnAssembler>,
}

impl ConversationWorker {
    /// Opens the worker's own connection and loads the conversation, creating it when
    /// a working directory is supplied.
    pub(crate) fn open(
        db_path: &std::path::Path,
        fs: Arc<dyn FileSystem>,
        conversation_id: &str,
        cwd: Option<PathBuf>,
    ) -> Result<Self, SessionError> {
        let store = RewindStore::open(db_path)?;
        let mut conversation = match store.conversation(conversation_id)? {
            Some(conversation) => conversation,
            None => {
                let cwd =
                    cwd.ok_or_else(|| SessionError::ConversationNotFound(conversation_id.to_string()))?;
                let conversation = Conversation::new(conversation_id, cwd, Utc::now());
                store.insert_conversation(&conversation)?;
                info!(event = "conversation_created", conversation_id = %conversation_id);
                conversation
            }
        };

        // A turn still marked streaming was cut off with the previous process.
        let stale = conversation
            .turns()
            .iter()
            .filter(|turn| turn.completion == TurnCompletion::Streaming)
            .map(|turn| turn.index)
            .collect::<Vec<_>>();
        for index in stale {
            if let Some(turn) = conversation.turn_mut(index) {
                turn.completion = TurnCompletion::Interrupted;
                store.update_turn(conversation_id, turn)?;
                warn!(
                    event = "stale_streaming_turn",
                    conversation_id = %conversation_id,
                    turn_id = %turn.id,
                );
            }
        }

        let engine = RevertEngine::load(fs.clone(), &store, conversation_id)?;
        Ok(Self {
            conversation,
            store,
            recorder: CheckpointRecorder::new(fs),
            reconciler: TurnIdReconciler,
            engine,
            active: None,
        })
    }

    pub(crate) fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.blocking_recv() {
            self.handle(command);
        }
        debug!(
            event = "conversation_worker_stopped",
            conversation_id = %self.conversation.id,
        );
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::BeginTurn { prompt, reply } => {
                let _ = reply.send(self.begin_turn(prompt));
            }
            Command::ApplyEvents { events } => self.apply_events(events),
            Command::FinishTurn { outcome, reply } => {
                let _ = reply.send(self.finish_turn(outcome));
            }
            Command::Revert { turn_id, reply } => {
                let result = if self.active.is_some() {
                    Err(RevertError::TurnInFlight(self.conversation.id.clone()))
                } else {
                    self.engine
                        .revert(&self.store, &mut self.conversation, &turn_id)
                };
                let _ = reply.send(result);
            }
            Command::Unrevert { reply } => {
                let result = if self.active.is_some() {
                    Err(UnrevertError::TurnInFlight(self.conversation.id.clone()))
                } else {
                    self.engine.unrevert(&self.store, &mut self.conversation)
                };
                let _ = reply.send(result);
            }
            Command::ListForRevert { turn_id, reply } => {
                let result = self
                    .store
                    .list_for_revert(&self.conversation.id, &turn_id)
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            Command::Checkpoints { reply } => {
                let result = self
                    .store
                    .checkpoints(&self.conversation.id)
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            Command::View { reply } => {
                let _ = reply.send(self.view());
            }
            Command::SetStatus { status, reply } => {
                let result = self
                    .store
                    .set_conversation_status(&self.conversation.id, status)
                    .map(|_| self.conversation.status = status)
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            Command::Cleanup { reply } => {
                let _ = reply.send(self.cleanup());
            }
        }
    }

    fn begin_turn(&mut self, prompt: String) -> Result<TurnStart, SessionError> {
        if self.active.is_some() {
            return Err(SessionError::TurnInFlight(self.conversation.id.clone()));
        }
        if self.engine.is_reverted() {
            self.engine
                .start_fresh_branch(&self.store, &self.conversation.id)?;
        }

        let now = Utc::now();
        let user_turn = Turn {
            index: self.conversation.allocate_index(),
            id: format!("user-{}", uuid::Uuid::new_v4()),
            id_state: TurnIdState::Final,
            role: TurnRole::User,
            blocks: vec![ContentBlock::Text { text: prompt }],
            created_at: now,
            completion: TurnCompletion::Completed,
            warnings: Vec::new(),
            stats: None,
        };
        let placeholder_id = placeholder_turn_id();
        let assistant_turn = Turn {
            index: self.conversation.allocate_index(),
            id: placeholder_id.clone(),
            id_state: TurnIdState::Placeholder,
            role: TurnRole::Assistant,
            blocks: Vec::new(),
            created_at: now,
            completion: TurnCompletion::Streaming,
            warnings: Vec::new(),
            stats: None,
        };

        self.store.append_turn(&self.conversation.id, &user_turn)?;
        self.store
            .append_turn(&self.conversation.id, &assistant_turn)?;
        let start = TurnStart {
            conversation_id: self.conversation.id.clone(),
            user_turn: user_turn.index,
            assistant_turn: assistant_turn.index,
            placeholder_id,
            cwd: self.conversation.cwd.clone(),
            resume_token: self.conversation.external_session_id.clone(),
        };
        self.conversation.push_turn(user_turn);
        self.conversation.push_turn(assistant_turn);
        self.active = Some(TurnAssembler::new(start.assistant_turn));
        self.save_recovery(RecoveryReason::InFlight)?;

        info!(
            event = "turn_started",
            conversation_id = %self.conversation.id,
            placeholder_id = %start.placeholder_id,
            resume = start.resume_token.is_some(),
        );
        Ok(start)
    }

    fn apply_events(&mut self, events: Vec<StreamEvent>) {
        let Some(mut assembler) = self.active.take() else {
            debug!(
                event = "stream_events_without_turn",
                conversation_id = %self.conversation.id,
                count = events.len(),
            );
            return;
        };

        let ctx = AssemblyContext {
            store: &self.store,
            recorder: &self.recorder,
            reconciler: &self.reconciler,
        };
        for event in events {
            assembler.apply(&ctx, &mut self.conversation, event);
        }

        let index = assembler.index();
        self.active = Some(assembler);
        if let Some(turn) = self.conversation.turn(index) {
            if let Err(err) = self.store.update_turn(&self.conversation.id, turn) {
                warn!(
                    event = "turn_persist_failed",
                    conversation_id = %self.conversation.id,
                    error = %err,
                );
            }
        }
        if let Err(err) = self.save_recovery(RecoveryReason::InFlight) {
            warn!(
                event = "recovery_state_persist_failed",
                conversation_id = %self.conversation.id,
                error = %err,
            );
        }
    }

    fn finish_turn(&mut self, outcome: TurnOutcome) -> Result<Turn, SessionError> {
        let assembler = self
            .active
            .take()
            .ok_or_else(|| SessionError::NoTurnInFlight(self.conversation.id.clone()))?;
        let index = assembler.index();
        let completion = match outcome {
            TurnOutcome::Completed => TurnCompletion::Completed,
            TurnOutcome::Interrupted
            | TurnOutcome::Abandoned(RecoveryReason::Cancelled)
            | TurnOutcome::Abandoned(RecoveryReason::Shutdown) => TurnCompletion::Interrupted,
            TurnOutcome::Failed | TurnOutcome::Abandoned(_) => TurnCompletion::Failed,
        };

        let conversation_id = self.conversation.id.clone();
        let turn = {
            let turn = self
                .conversation
                .turn_mut(index)
                .ok_or(SessionError::NoTurnInFlight(conversation_id))?;
            turn.completion = completion;
            turn.clone()
        };
        self.store.update_turn(&self.conversation.id, &turn)?;

        let pending = self
            .store
            .pending_checkpoints(&self.conversation.id, &turn.id)?;
        if !pending.is_empty() {
            warn!(
                event = "turn_finished_with_pending_checkpoints",
                conversation_id = %self.conversation.id,
                turn_id = %turn.id,
                pending = pending.len(),
            );
        }

        match outcome {
            TurnOutcome::Abandoned(reason) => {
                self.write_recovery(&turn, reason)?;
                warn!(
                    event = "turn_abandoned",
                    conversation_id = %self.conversation.id,
                    turn_id = %turn.id,
                    reason = %reason,
                );
            }
            TurnOutcome::Completed | TurnOutcome::Interrupted | TurnOutcome::Failed => {
                self.store.clear_recovery_state(&self.conversation.id)?;
                info!(
                    event = "turn_finished",
                    conversation_id = %self.conversation.id,
                    turn_id = %turn.id,
                    completion = %completion,
                    terminal_result = assembler.saw_terminal_result(),
                );
            }
        }
        Ok(turn)
    }

    fn save_recovery(&self, reason: RecoveryReason) -> Result<(), SessionError> {
        let Some(index) = self.active.as_ref().map(TurnAssembler::index) else {
            return Ok(());
        };
        match self.conversation.turn(index) {
            Some(turn) => self.write_recovery(turn, reason),
            None => Ok(()),
        }
    }

    fn write_recovery(&self, turn: &Turn, reason: RecoveryReason) -> Result<(), SessionError> {
        self.store.upsert_recovery_state(&RecoveryState {
            conversation_id: self.conversation.id.clone(),
            turn_id: turn.id.clone(),
            turn_index: turn.index,
            resume_token: self.conversation.external_session_id.clone(),
            partial_turn: Some(turn.clone()),
            reason,
            updated_at: Utc::now(),
        })?;
        Ok(())
    }

    fn view(&self) -> Result<ConversationView, SessionError> {
        let with_checkpoints = self.store.turns_with_checkpoints(&self.conversation.id)?;
        Ok(ConversationView {
            conversation_id: self.conversation.id.clone(),
            status: self.conversation.status,
            state: self.engine.state(),
            external_session_id: self.conversation.external_session_id.clone(),
            turn_in_flight: self.active.is_some(),
            turns: self
                .conversation
                .turns()
                .iter()
                .map(|turn| TurnView {
                    index: turn.index,
                    id: turn.id.clone(),
                    role: turn.role,
                    completion: turn.completion,
                    text: turn.text(),
                    has_checkpoints: with_checkpoints.contains(&turn.id),
                    warnings: turn.warnings.clone(),
                })
                .collect(),
        })
    }

    fn cleanup(&mut self) -> Result<usize, SessionError> {
        if self.active.is_some() {
            return Err(SessionError::TurnInFlight(self.conversation.id.clone()));
        }
        let removed = self.store.delete_checkpoints(&self.conversation.id)?;
        if self.engine.is_reverted() {
            self.engine
                .start_fresh_branch(&self.store, &self.conversation.id)?;
        }
        info!(
            event = "checkpoints_cleaned",
            conversation_id = %self.conversation.id,
            removed,
        );
        Ok(removed)
    }
}

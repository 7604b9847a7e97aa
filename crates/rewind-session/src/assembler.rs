use crate::checkpoints::{CheckpointRecorder, ResolveStatus};
use crate::reconcile::TurnIdReconciler;
use rewind_core::stream::{AssistantBlock, AssistantDelta, InitEvent, TerminalResult, ToolResultEvent};
use rewind_core::{
    ContentBlock, Conversation, StreamEvent, ToolInvocation, ToolKind, ToolStatus, TurnIndex,
    TurnStats, TurnWarning,
};
use rewind_storage::RewindStore;
use tracing::{debug, warn};

/// Builds one assistant turn from stream events.
///
/// The turn lives in the conversation arena and is addressed by index only, so the
/// assembler keeps working when reconciliation renames it mid-stream.
#[derive(Debug)]
pub struct TurnAssembler {
    index: TurnIndex,
    reconcile_attempted: bool,
    terminal: bool,
}

pub struct AssemblyContext<'a> {
    pub store: &'a RewindStore,
    pub recorder: &'a CheckpointRecorder,
    pub reconciler: &'a TurnIdReconciler,
}

impl TurnAssembler {
    pub fn new(index: TurnIndex) -> Self {
        Self {
            index,
            reconcile_attempted: false,
            terminal: false,
        }
    }

    pub fn index(&self) -> TurnIndex {
        self.index
    }

    pub fn saw_terminal_result(&self) -> bool {
        self.terminal
    }

    pub fn apply(
        &mut self,
        ctx: &AssemblyContext<'_>,
        conversation: &mut Conversation,
        event: StreamEvent,
    ) {
        match event {
            StreamEvent::Init(init) => self.apply_init(ctx, conversation, init),
            StreamEvent::AssistantDelta(delta) => self.apply_delta(ctx, conversation, delta),
            StreamEvent::ToolResult(result) => self.apply_tool_result(ctx, conversation, result),
            StreamEvent::TerminalResult(result) => {
                self.apply_terminal(ctx, conversation, result)
            }
            StreamEvent::Unknown { kind } => {
                debug!(
                    event = "stream_event_ignored",
                    conversation_id = %conversation.id,
                    kind = %kind,
                );
            }
        }
    }

    fn apply_init(
        &mut self,
        ctx: &AssemblyContext<'_>,
        conversation: &mut Conversation,
        init: InitEvent,
    ) {
        assign_session(ctx, conversation, &init.session_id);
    }

    fn apply_delta(
        &mut self,
        ctx: &AssemblyContext<'_>,
        conversation: &mut Conversation,
        delta: AssistantDelta,
    ) {
        let conversation_id = conversation.id.clone();
        let cwd = conversation.cwd.clone();
        let Some(turn) = conversation.turn_mut(self.index) else {
            warn!(
                event = "turn_missing_for_delta",
                conversation_id = %conversation_id,
                turn_index = %self.index,
            );
            return;
        };

        for block in delta.blocks {
            match block {
                AssistantBlock::Text(text) => turn.blocks.push(ContentBlock::Text { text }),
                AssistantBlock::Thinking(text) => {
                    turn.blocks.push(ContentBlock::Thinking { text })
                }
                AssistantBlock::ToolUse { id, name, input } => {
                    let invocation = ToolInvocation::new(id, name, input);
                    if !turn.push_tool_invocation(invocation.clone()) {
                        continue;
                    }
                    let turn_id = turn.id.clone();
                    if let Err(err) = ctx.recorder.create_checkpoint(
                        ctx.store,
                        &conversation_id,
                        &cwd,
                        &turn_id,
                        &invocation,
                    ) {
                        warn!(
                            event = "checkpoint_write_failed",
                            conversation_id = %conversation_id,
                            turn_id = %turn_id,
                            tool_use_id = %invocation.id,
                            error = %err,
                        );
                        turn.warnings.push(TurnWarning::Checkpoint {
                            tool_use_id: invocation.id.clone(),
                            path: ToolKind::from_tool_name(&invocation.name)
                                .and_then(|kind| kind.target_path(&invocation.input)),
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(message_id) = delta.message_id {
            if !self.reconcile_attempted && turn.is_placeholder() {
                self.reconcile_attempted = true;
                // Failures are recorded on the turn by the reconciler.
                if let Err(err) =
                    ctx.reconciler
                        .reconcile(ctx.store, conversation, self.index, &message_id)
                {
                    debug!(
                        event = "turn_reconcile_skipped",
                        conversation_id = %conversation_id,
                        final_id = %message_id,
                        error = %err,
                    );
                }
            }
        }
    }

    fn apply_tool_result(
        &mut self,
        ctx: &AssemblyContext<'_>,
        conversation: &mut Conversation,
        result: ToolResultEvent,
    ) {
        let conversation_id = conversation.id.clone();
        let cwd = conversation.cwd.clone();
        let Some(turn) = conversation.turn_mut(self.index) else {
            return;
        };
        let turn_id = turn.id.clone();
        let Some(invocation) = turn.tool_invocation_mut(&result.tool_use_id) else {
            debug!(
                event = "tool_result_unmatched",
                conversation_id = %conversation_id,
                tool_use_id = %result.tool_use_id,
            );
            return;
        };
        invocation.status = if result.is_error {
            ToolStatus::Failed
        } else {
            ToolStatus::Succeeded
        };
        invocation.output = Some(result.output);
        let invocation = invocation.clone();

        if ToolKind::from_tool_name(&invocation.name).is_none() {
            return;
        }
        let reports =
            ctx.recorder
                .resolve_pending(ctx.store, &conversation_id, &cwd, &turn_id, &invocation);
        for report in reports {
            if let ResolveStatus::Failed(reason) = report.status {
                turn.warnings.push(TurnWarning::Checkpoint {
                    tool_use_id: invocation.id.clone(),
                    path: Some(report.file_path),
                    message: format!("after-content unresolved: {reason}"),
                });
            }
        }
    }

    fn apply_terminal(
        &mut self,
        ctx: &AssemblyContext<'_>,
        conversation: &mut Conversation,
        result: TerminalResult,
    ) {
        self.terminal = true;
        if let Some(session_id) = result.session_id.as_deref() {
            assign_session(ctx, conversation, session_id);
        }
        if let Some(turn) = conversation.turn_mut(self.index) {
            turn.stats = Some(TurnStats {
                subtype: result.subtype,
                is_error: result.is_error,
                num_turns: result.num_turns,
                duration_ms: result.duration_ms,
                total_cost_usd: result.total_cost_usd,
            });
        }
    }
}

fn assign_session(ctx: &AssemblyContext<'_>, conversation: &mut Conversation, session_id: &str) {
    if !conversation.assign_external_session_id(session_id) {
        return;
    }
    if let Err(err) = ctx.store.set_external_session_id(&conversation.id, session_id) {
        warn!(
            event = "session_id_persist_failed",
            conversation_id = %conversation.id,
            error = %err,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rewind_core::{
        AfterContent, LocalFileSystem, Turn, TurnCompletion, TurnIdState, TurnRole,
    };
    use serde_json::json;
    use std::fs;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        store: RewindStore,
        recorder: CheckpointRecorder,
        conversation: Conversation,
        assembler: TurnAssembler,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().expect("tempdir");
            let store = RewindStore::open_in_memory().expect("open db");
            let mut conversation = Conversation::new("conv-1", dir.path(), Utc::now());
            store.insert_conversation(&conversation).expect("insert");
            let turn = Turn {
                index: conversation.allocate_index(),
                id: "local-1".to_string(),
                id_state: TurnIdState::Placeholder,
                role: TurnRole::Assistant,
                blocks: Vec::new(),
                created_at: Utc::now(),
                completion: TurnCompletion::Streaming,
                warnings: Vec::new(),
                stats: None,
            };
            let assembler = TurnAssembler::new(turn.index);
            store.append_turn("conv-1", &turn).expect("append");
            conversation.push_turn(turn);
            Self {
                dir,
                store,
                recorder: CheckpointRecorder::new(Arc::new(LocalFileSystem)),
                conversation,
                assembler,
            }
        }

        fn apply(&mut self, event: StreamEvent) {
            let reconciler = TurnIdReconciler;
            let ctx = AssemblyContext {
                store: &self.store,
                recorder: &self.recorder,
                reconciler: &reconciler,
            };
            self.assembler.apply(&ctx, &mut self.conversation, event);
        }

        fn turn(&self) -> &Turn {
            self.conversation
                .turn(self.assembler.index())
                .expect("turn in arena")
        }
    }

    fn delta(message_id: Option<&str>, blocks: Vec<AssistantBlock>) -> StreamEvent {
        StreamEvent::AssistantDelta(AssistantDelta {
            message_id: message_id.map(str::to_string),
            blocks,
        })
    }

    fn edit_block(id: &str) -> AssistantBlock {
        AssistantBlock::ToolUse {
            id: id.to_string(),
            name: "Edit".to_string(),
            input: json!({"file_path": "f.txt", "old_string": "old", "new_string": "new"}),
        }
    }

    #[test]
    fn tool_use_before_final_id_is_reconciled() {
        let mut fixture = Fixture::new();
        fs::write(fixture.dir.path().join("f.txt"), "old").expect("seed");

        fixture.apply(delta(None, vec![edit_block("tu1")]));
        assert_eq!(
            fixture
                .store
                .count_checkpoints_for_turn("conv-1", "local-1")
                .expect("count"),
            1
        );

        fixture.apply(delta(
            Some("srv-42"),
            vec![AssistantBlock::Text("done".to_string())],
        ));
        assert_eq!(fixture.turn().id, "srv-42");
        assert_eq!(
            fixture
                .store
                .list_for_revert("conv-1", "srv-42")
                .expect("list")
                .len(),
            1
        );

        fs::write(fixture.dir.path().join("f.txt"), "new").expect("agent edit");
        fixture.apply(StreamEvent::ToolResult(ToolResultEvent {
            tool_use_id: "tu1".to_string(),
            output: "ok".to_string(),
            is_error: false,
        }));
        let checkpoints = fixture.store.checkpoints("conv-1").expect("list");
        assert_eq!(
            checkpoints[0].after_content,
            AfterContent::Resolved("new".to_string())
        );
        assert_eq!(checkpoints[0].turn_id, "srv-42");
        assert!(fixture.turn().warnings.is_empty());
    }

    #[test]
    fn conflicting_message_id_keeps_placeholder_and_continues() {
        let mut fixture = Fixture::new();
        let mut taken = fixture.turn().clone();
        taken.index = fixture.conversation.allocate_index();
        taken.id = "srv-42".to_string();
        taken.id_state = TurnIdState::Final;
        fixture.store.append_turn("conv-1", &taken).expect("append taken");

        fixture.apply(delta(
            Some("srv-42"),
            vec![AssistantBlock::Text("still streaming".to_string())],
        ));
        assert_eq!(fixture.turn().id, "local-1");
        assert_eq!(fixture.turn().text(), "still streaming");
        assert!(matches!(
            fixture.turn().warnings.as_slice(),
            [TurnWarning::Reconciliation { final_id, .. }] if final_id == "srv-42"
        ));

        fixture.apply(delta(Some("srv-43"), Vec::new()));
        assert_eq!(fixture.turn().id, "local-1");
        assert_eq!(fixture.turn().warnings.len(), 1);
    }

    #[test]
    fn later_message_ids_do_not_rename_again() {
        let mut fixture = Fixture::new();
        fixture.apply(delta(Some("msg_a"), Vec::new()));
        fixture.apply(delta(Some("msg_b"), Vec::new()));
        assert_eq!(fixture.turn().id, "msg_a");
    }

    #[test]
    fn repeated_tool_use_blocks_create_one_checkpoint() {
        let mut fixture = Fixture::new();
        fixture.apply(delta(None, vec![edit_block("tu1")]));
        fixture.apply(delta(None, vec![edit_block("tu1")]));
        assert_eq!(fixture.store.checkpoints("conv-1").expect("list").len(), 1);
        assert_eq!(fixture.turn().tool_invocations().count(), 1);
    }

    #[test]
    fn checkpoint_failure_becomes_turn_warning() {
        let mut fixture = Fixture::new();
        fixture.apply(delta(
            None,
            vec![AssistantBlock::ToolUse {
                id: "tu1".to_string(),
                name: "Write".to_string(),
                input: json!({"content": "no path"}),
            }],
        ));
        assert!(matches!(
            fixture.turn().warnings.as_slice(),
            [TurnWarning::Checkpoint { tool_use_id, .. }] if tool_use_id == "tu1"
        ));
        assert_eq!(fixture.turn().tool_invocations().count(), 1);
    }

    #[test]
    fn init_and_result_fill_session_and_stats() {
        let mut fixture = Fixture::new();
        fixture.apply(StreamEvent::Init(InitEvent {
            session_id: "sess-1".to_string(),
            model: None,
            cwd: None,
            tools: Vec::new(),
            permission_mode: None,
        }));
        fixture.apply(StreamEvent::TerminalResult(TerminalResult {
            subtype: Some("success".to_string()),
            is_error: false,
            num_turns: Some(2),
            duration_ms: Some(900),
            total_cost_usd: None,
            result: Some("done".to_string()),
            session_id: Some("sess-other".to_string()),
        }));

        assert!(fixture.assembler.saw_terminal_result());
        assert_eq!(
            fixture.conversation.external_session_id.as_deref(),
            Some("sess-1")
        );
        let stored = fixture
            .store
            .conversation("conv-1")
            .expect("load")
            .expect("exists");
        assert_eq!(stored.external_session_id.as_deref(), Some("sess-1"));
        assert_eq!(
            fixture.turn().stats.as_ref().and_then(|stats| stats.num_turns),
            Some(2)
        );
    }

    #[test]
    fn failed_tool_result_still_resolves_checkpoint() {
        let mut fixture = Fixture::new();
        fs::write(fixture.dir.path().join("f.txt"), "old").expect("seed");
        fixture.apply(delta(None, vec![edit_block("tu1")]));
        fixture.apply(StreamEvent::ToolResult(ToolResultEvent {
            tool_use_id: "tu1".to_string(),
            output: "old_string not found".to_string(),
            is_error: true,
        }));
        let checkpoints = fixture.store.checkpoints("conv-1").expect("list");
        assert_eq!(
            checkpoints[0].after_content,
            AfterContent::Resolved("old".to_string())
        );
        let invocation = fixture
            .turn()
            .tool_invocations()
            .next()
            .expect("invocation");
        assert_eq!(invocation.status, ToolStatus::Failed);
    }
}

pub mod checkpoint;
pub mod conversation;
pub mod fs;
pub mod ingest;
pub mod stream;

pub use checkpoint::{resolve_target_path, AfterContent, Checkpoint, NewCheckpoint, ToolKind};
pub use conversation::{
    ContentBlock, Conversation, ConversationStatus, ToolInvocation, ToolStatus, Turn,
    TurnCompletion, TurnIdState, TurnIndex, TurnRole, TurnStats, TurnWarning,
};
pub use fs::{FileSystem, FsError, LocalFileSystem};
pub use ingest::{IngestReport, IngestorConfig, StreamIngestor, StreamParseError};
pub use stream::{
    AssistantBlock, AssistantDelta, InitEvent, StreamEvent, TerminalResult, ToolResultEvent,
};

use sha2::{Digest, Sha256};

pub const PLACEHOLDER_TURN_PREFIX: &str = "local-";

pub fn placeholder_turn_id() -> String {
    format!("{PLACEHOLDER_TURN_PREFIX}{}", uuid::Uuid::new_v4())
}

pub fn is_placeholder_turn_id(id: &str) -> bool {
    id.starts_with(PLACEHOLDER_TURN_PREFIX)
}

pub fn content_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

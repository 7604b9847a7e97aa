use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Stable arena key for a turn. Never reused within a conversation, so it stays valid
/// while the turn's visible id moves from placeholder to final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct TurnIndex(pub u64);

impl fmt::Display for TurnIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Historical,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Historical => "historical",
            ConversationStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "active" => Ok(ConversationStatus::Active),
            "historical" => Ok(ConversationStatus::Historical),
            "archived" => Ok(ConversationStatus::Archived),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnRole {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "user" => Ok(TurnRole::User),
            "assistant" => Ok(TurnRole::Assistant),
            other => Err(format!("unknown turn role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnIdState {
    Placeholder,
    Final,
}

impl TurnIdState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnIdState::Placeholder => "placeholder",
            TurnIdState::Final => "final",
        }
    }
}

impl FromStr for TurnIdState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "placeholder" => Ok(TurnIdState::Placeholder),
            "final" => Ok(TurnIdState::Final),
            other => Err(format!("unknown turn id state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnCompletion {
    Streaming,
    Completed,
    Interrupted,
    Failed,
}

impl TurnCompletion {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnCompletion::Streaming => "streaming",
            TurnCompletion::Completed => "completed",
            TurnCompletion::Interrupted => "interrupted",
            TurnCompletion::Failed => "failed",
        }
    }
}

impl fmt::Display for TurnCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnCompletion {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "streaming" => Ok(TurnCompletion::Streaming),
            "completed" => Ok(TurnCompletion::Completed),
            "interrupted" => Ok(TurnCompletion::Interrupted),
            "failed" => Ok(TurnCompletion::Failed),
            other => Err(format!("unknown turn completion: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub status: ToolStatus,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            output: None,
            status: ToolStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { text: String },
    ToolInvocation(ToolInvocation),
}

/// Degraded-state markers attached to a turn when an absorbed failure left something
/// the user should know about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnWarning {
    Checkpoint {
        tool_use_id: String,
        path: Option<String>,
        message: String,
    },
    Reconciliation {
        placeholder_id: String,
        final_id: String,
        message: String,
    },
    Stream {
        message: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TurnStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub index: TurnIndex,
    pub id: String,
    pub id_state: TurnIdState,
    pub role: TurnRole,
    #[serde(default)]
    pub blocks: Vec<ContentBlock>,
    pub created_at: DateTime<Utc>,
    pub completion: TurnCompletion,
    #[serde(default)]
    pub warnings: Vec<TurnWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<TurnStats>,
}

impl Turn {
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.blocks.iter().filter_map(|block| match block {
            ContentBlock::ToolInvocation(invocation) => Some(invocation),
            _ => None,
        })
    }

    pub fn tool_invocation_mut(&mut self, tool_use_id: &str) -> Option<&mut ToolInvocation> {
        self.blocks.iter_mut().find_map(|block| match block {
            ContentBlock::ToolInvocation(invocation) if invocation.id == tool_use_id => {
                Some(invocation)
            }
            _ => None,
        })
    }

    /// Returns false when an invocation with the same id is already recorded. Agents
    /// may repeat a tool_use block across partial assistant lines.
    pub fn push_tool_invocation(&mut self, invocation: ToolInvocation) -> bool {
        if self.tool_invocations().any(|existing| existing.id == invocation.id) {
            return false;
        }
        self.blocks.push(ContentBlock::ToolInvocation(invocation));
        true
    }

    pub fn is_placeholder(&self) -> bool {
        self.id_state == TurnIdState::Placeholder
    }
}

/// A conversation owns its turns as an arena: each turn is addressed by a
/// [`TurnIndex`] that survives id reconciliation, truncation and restore.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub external_session_id: Option<String>,
    pub cwd: PathBuf,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    turns: Vec<Turn>,
    next_index: u64,
}

impl Conversation {
    pub fn new(id: impl Into<String>, cwd: impl Into<PathBuf>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            external_session_id: None,
            cwd: cwd.into(),
            status: ConversationStatus::Active,
            created_at,
            turns: Vec::new(),
            next_index: 0,
        }
    }

    pub fn with_turns(mut self, mut turns: Vec<Turn>) -> Self {
        turns.sort_by_key(|turn| turn.index);
        self.next_index = turns.last().map(|turn| turn.index.0 + 1).unwrap_or(0);
        self.turns = turns;
        self
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn turn(&self, index: TurnIndex) -> Option<&Turn> {
        self.turns.iter().find(|turn| turn.index == index)
    }

    pub fn turn_mut(&mut self, index: TurnIndex) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|turn| turn.index == index)
    }

    pub fn find_turn(&self, turn_id: &str) -> Option<&Turn> {
        self.turns.iter().find(|turn| turn.id == turn_id)
    }

    /// Reserves the next arena index. Indexes of abandoned turns are never handed out
    /// again, even after truncation.
    pub fn allocate_index(&mut self) -> TurnIndex {
        let index = TurnIndex(self.next_index);
        self.next_index += 1;
        index
    }

    pub fn push_turn(&mut self, turn: Turn) {
        if turn.index.0 >= self.next_index {
            self.next_index = turn.index.0 + 1;
        }
        self.turns.push(turn);
    }

    /// Renames the turn at `index`. This is the only place a turn id changes.
    pub fn set_turn_id(&mut self, index: TurnIndex, turn_id: &str) -> bool {
        match self.turn_mut(index) {
            Some(turn) => {
                turn.id = turn_id.to_string();
                turn.id_state = TurnIdState::Final;
                true
            }
            None => false,
        }
    }

    /// Removes every turn after the one named `turn_id` and returns them in order.
    /// `None` when no such turn exists.
    pub fn truncate_after(&mut self, turn_id: &str) -> Option<Vec<Turn>> {
        let position = self.turns.iter().position(|turn| turn.id == turn_id)?;
        Some(self.turns.split_off(position + 1))
    }

    pub fn restore_turns(&mut self, turns: Vec<Turn>) {
        for turn in turns {
            self.push_turn(turn);
        }
        self.turns.sort_by_key(|turn| turn.index);
    }

    /// The agent's session id is assigned once; later values are ignored.
    pub fn assign_external_session_id(&mut self, session_id: &str) -> bool {
        if self.external_session_id.is_some() || session_id.trim().is_empty() {
            return false;
        }
        self.external_session_id = Some(session_id.to_string());
        true
    }
}

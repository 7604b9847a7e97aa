use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File-mutating tools. Anything else the agent invokes produces no checkpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Write,
    Edit,
    MultiEdit,
    NotebookEdit,
}

impl ToolKind {
    pub fn from_tool_name(name: &str) -> Option<Self> {
        match name {
            "Write" => Some(ToolKind::Write),
            "Edit" => Some(ToolKind::Edit),
            "MultiEdit" => Some(ToolKind::MultiEdit),
            "NotebookEdit" => Some(ToolKind::NotebookEdit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Write => "Write",
            ToolKind::Edit => "Edit",
            ToolKind::MultiEdit => "MultiEdit",
            ToolKind::NotebookEdit => "NotebookEdit",
        }
    }

    /// Whole-file writes know their after-content up front.
    pub fn is_whole_file(&self) -> bool {
        matches!(self, ToolKind::Write)
    }

    pub fn path_argument(&self) -> &'static str {
        match self {
            ToolKind::NotebookEdit => "notebook_path",
            _ => "file_path",
        }
    }

    pub fn target_path(&self, input: &Value) -> Option<String> {
        input
            .get(self.path_argument())
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    /// The literal `content` argument of a whole-file write.
    pub fn written_content(&self, input: &Value) -> Option<String> {
        if !self.is_whole_file() {
            return None;
        }
        input
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        ToolKind::from_tool_name(input.trim()).ok_or_else(|| format!("unknown tool kind: {input}"))
    }
}

pub fn resolve_target_path(cwd: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "content", rename_all = "snake_case")]
pub enum AfterContent {
    Pending,
    Resolved(String),
}

impl AfterContent {
    pub fn is_pending(&self) -> bool {
        matches!(self, AfterContent::Pending)
    }

    pub fn as_resolved(&self) -> Option<&str> {
        match self {
            AfterContent::Resolved(content) => Some(content.as_str()),
            AfterContent::Pending => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub tool_use_id: String,
    pub file_path: String,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub before_content: String,
    pub after_content: AfterContent,
    pub tool_kind: ToolKind,
    #[serde(default)]
    pub abandoned: bool,
}

/// Insert form of a checkpoint. The store assigns the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCheckpoint {
    pub checkpoint_id: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub tool_use_id: String,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
    pub before_content: String,
    pub after_content: AfterContent,
    pub tool_kind: ToolKind,
}

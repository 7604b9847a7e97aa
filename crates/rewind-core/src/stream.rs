use serde::Deserialize;
use serde_json::Value;

/// Events recognized on the agent's `stream-json` output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Init(InitEvent),
    AssistantDelta(AssistantDelta),
    ToolResult(ToolResultEvent),
    TerminalResult(TerminalResult),
    Unknown { kind: String },
}

impl StreamEvent {
    pub fn kind(&self) -> &str {
        match self {
            StreamEvent::Init(_) => "init",
            StreamEvent::AssistantDelta(_) => "assistant_delta",
            StreamEvent::ToolResult(_) => "tool_result",
            StreamEvent::TerminalResult(_) => "terminal_result",
            StreamEvent::Unknown { kind } => kind.as_str(),
        }
    }

    /// Maps one decoded line to events. A `user` line may carry several tool results,
    /// so one line can yield more than one event.
    pub fn from_value(value: Value) -> Result<Vec<StreamEvent>, String> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing type tag".to_string())?
            .to_string();

        match kind.as_str() {
            "system" => {
                let subtype = value
                    .get("subtype")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if subtype != "init" {
                    return Ok(vec![StreamEvent::Unknown {
                        kind: format!("system:{subtype}"),
                    }]);
                }
                let wire: WireInit = decode(value)?;
                Ok(vec![StreamEvent::Init(InitEvent {
                    session_id: wire.session_id,
                    model: wire.model,
                    cwd: wire.cwd,
                    tools: wire.tools,
                    permission_mode: wire.permission_mode,
                })])
            }
            "assistant" => {
                let wire: WireAssistant = decode(value)?;
                let blocks = wire
                    .message
                    .content
                    .into_iter()
                    .filter_map(WireContentBlock::into_assistant_block)
                    .collect();
                Ok(vec![StreamEvent::AssistantDelta(AssistantDelta {
                    message_id: wire.message.id.filter(|id| !id.trim().is_empty()),
                    blocks,
                })])
            }
            "user" => {
                let wire: WireUser = decode(value)?;
                let events = wire
                    .message
                    .content
                    .into_iter()
                    .filter_map(|block| match block {
                        WireContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => Some(StreamEvent::ToolResult(ToolResultEvent {
                            tool_use_id,
                            output: flatten_tool_output(&content),
                            is_error,
                        })),
                        _ => None,
                    })
                    .collect();
                Ok(events)
            }
            "result" => {
                let wire: WireResult = decode(value)?;
                Ok(vec![StreamEvent::TerminalResult(TerminalResult {
                    subtype: wire.subtype,
                    is_error: wire.is_error,
                    num_turns: wire.num_turns,
                    duration_ms: wire.duration_ms,
                    total_cost_usd: wire.total_cost_usd,
                    result: wire.result,
                    session_id: wire.session_id,
                })])
            }
            _ => Ok(vec![StreamEvent::Unknown { kind }]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitEvent {
    pub session_id: String,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub tools: Vec<String>,
    pub permission_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssistantDelta {
    /// Authoritative turn id once the agent has assigned one.
    pub message_id: Option<String>,
    pub blocks: Vec<AssistantBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssistantBlock {
    Text(String),
    Thinking(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultEvent {
    pub tool_use_id: String,
    pub output: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminalResult {
    pub subtype: Option<String>,
    pub is_error: bool,
    pub num_turns: Option<u64>,
    pub duration_ms: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub result: Option<String>,
    pub session_id: Option<String>,
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, String> {
    serde_json::from_value(value).map_err(|err| err.to_string())
}

fn flatten_tool_output(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text.clone()),
                other => other
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct WireInit {
    session_id: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default, rename = "permissionMode")]
    permission_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAssistant {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, deserialize_with = "content_blocks")]
    content: Vec<WireContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

impl WireContentBlock {
    fn into_assistant_block(self) -> Option<AssistantBlock> {
        match self {
            WireContentBlock::Text { text } => Some(AssistantBlock::Text(text)),
            WireContentBlock::Thinking { thinking } => Some(AssistantBlock::Thinking(thinking)),
            WireContentBlock::ToolUse { id, name, input } => {
                Some(AssistantBlock::ToolUse { id, name, input })
            }
            WireContentBlock::ToolResult { .. } | WireContentBlock::Other => None,
        }
    }
}

/// User prompts echoed back may carry `content` as a bare string.
fn content_blocks<'de, D>(deserializer: D) -> Result<Vec<WireContentBlock>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(serde::de::Error::custom))
            .collect(),
        Value::String(text) => Ok(vec![WireContentBlock::Text { text }]),
        _ => Ok(Vec::new()),
    }
}

#[derive(Debug, Deserialize)]
struct WireResult {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    num_turns: Option<u64>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_line_carries_session_id() {
        let events = StreamEvent::from_value(json!({
            "type": "system",
            "subtype": "init",
            "session_id": "sess-1",
            "model": "agent-model",
            "tools": ["Edit", "Write"],
            "permissionMode": "acceptEdits"
        }))
        .expect("init decodes");
        match &events[..] {
            [StreamEvent::Init(init)] => {
                assert_eq!(init.session_id, "sess-1");
                assert_eq!(init.tools, vec!["Edit", "Write"]);
                assert_eq!(init.permission_mode.as_deref(), Some("acceptEdits"));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn assistant_line_keeps_tool_use_and_message_id() {
        let events = StreamEvent::from_value(json!({
            "type": "assistant",
            "message": {
                "id": "msg_01",
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "look first"},
                    {"type": "text", "text": "Editing now."},
                    {"type": "tool_use", "id": "toolu_1", "name": "Edit",
                     "input": {"file_path": "a.txt", "old_string": "old", "new_string": "new"}},
                    {"type": "redacted_thinking", "data": "xx"}
                ]
            }
        }))
        .expect("assistant decodes");
        let [StreamEvent::AssistantDelta(delta)] = &events[..] else {
            panic!("unexpected events: {events:?}");
        };
        assert_eq!(delta.message_id.as_deref(), Some("msg_01"));
        assert_eq!(delta.blocks.len(), 3);
        assert!(matches!(
            &delta.blocks[2],
            AssistantBlock::ToolUse { name, .. } if name == "Edit"
        ));
    }

    #[test]
    fn user_line_fans_out_tool_results() {
        let events = StreamEvent::from_value(json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "ok"},
                    {"type": "tool_result", "tool_use_id": "toolu_2", "is_error": true,
                     "content": [{"type": "text", "text": "denied"}]}
                ]
            }
        }))
        .expect("user decodes");
        assert_eq!(
            events,
            vec![
                StreamEvent::ToolResult(ToolResultEvent {
                    tool_use_id: "toolu_1".to_string(),
                    output: "ok".to_string(),
                    is_error: false,
                }),
                StreamEvent::ToolResult(ToolResultEvent {
                    tool_use_id: "toolu_2".to_string(),
                    output: "denied".to_string(),
                    is_error: true,
                }),
            ]
        );
    }

    #[test]
    fn result_line_maps_metadata() {
        let events = StreamEvent::from_value(json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "num_turns": 3,
            "duration_ms": 1200,
            "total_cost_usd": 0.02,
            "result": "done",
            "session_id": "sess-1"
        }))
        .expect("result decodes");
        let [StreamEvent::TerminalResult(result)] = &events[..] else {
            panic!("unexpected events: {events:?}");
        };
        assert_eq!(result.num_turns, Some(3));
        assert_eq!(result.result.as_deref(), Some("done"));
    }

    #[test]
    fn unknown_kinds_are_not_errors() {
        let events = StreamEvent::from_value(json!({"type": "stream_event", "event": {}}))
            .expect("unknown decodes");
        assert_eq!(
            events,
            vec![StreamEvent::Unknown {
                kind: "stream_event".to_string()
            }]
        );
        let events = StreamEvent::from_value(json!({"type": "system", "subtype": "compact"}))
            .expect("system decodes");
        assert_eq!(events[0].kind(), "system:compact");
    }

    #[test]
    fn known_kind_with_bad_shape_is_an_error() {
        assert!(StreamEvent::from_value(json!({"type": "system", "subtype": "init"})).is_err());
        assert!(StreamEvent::from_value(json!({"no_type": true})).is_err());
    }
}

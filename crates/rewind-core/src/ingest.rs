use crate::stream::StreamEvent;
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamParseError {
    #[error("invalid json line ({message}): {preview}")]
    Json { message: String, preview: String },
    #[error("unexpected line shape ({message}): {preview}")]
    Shape { message: String, preview: String },
    #[error("line exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
}

#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub max_frame_bytes: usize,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestReport {
    pub events: Vec<StreamEvent>,
    pub errors: Vec<StreamParseError>,
    pub rebuffered_lines: usize,
}

impl IngestReport {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.errors.is_empty()
    }

    pub fn extend(&mut self, other: IngestReport) {
        self.events.extend(other.events);
        self.errors.extend(other.errors);
        self.rebuffered_lines += other.rebuffered_lines;
    }
}

/// Incremental decoder for the agent's newline-delimited event stream.
///
/// Bytes are accepted in arbitrary chunks. Only complete lines are parsed, so the
/// emitted events do not depend on where chunk boundaries fall. A line that fails to
/// parse but still has an unclosed `{` is carried over and retried with the next
/// line; anything else that fails is reported and dropped.
#[derive(Debug)]
pub struct StreamIngestor {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    carry: Vec<u8>,
    discarding: bool,
}

impl Default for StreamIngestor {
    fn default() -> Self {
        Self::new(IngestorConfig::default())
    }
}

impl StreamIngestor {
    pub fn new(config: IngestorConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            pending: Vec::new(),
            carry: Vec::new(),
            discarding: false,
        }
    }

    pub fn buffered_bytes(&self) -> usize {
        self.pending.len() + self.carry.len()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> IngestReport {
        let mut report = IngestReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            if is_blank(&line) {
                continue;
            }
            self.consume_line(line, &mut report);
        }

        if !self.discarding && self.pending.len() > self.max_frame_bytes {
            report.errors.push(StreamParseError::Oversized {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
            self.discarding = true;
        } else if self.discarding {
            self.pending.clear();
        }

        report
    }

    /// Final attempt on whatever is left once the stream has closed.
    pub fn finish(&mut self) -> IngestReport {
        let mut report = IngestReport::default();
        let mut remainder = std::mem::take(&mut self.pending);
        if self.discarding {
            self.discarding = false;
            remainder.clear();
        }
        if remainder.ends_with(b"\r") {
            remainder.pop();
        }
        if !is_blank(&remainder) {
            self.consume_line(remainder, &mut report);
        }
        if !self.carry.is_empty() {
            let fragment = std::mem::take(&mut self.carry);
            report.errors.push(StreamParseError::Json {
                message: "stream ended inside an incomplete line".to_string(),
                preview: preview(&fragment),
            });
        }
        report
    }

    fn consume_line(&mut self, line: Vec<u8>, report: &mut IngestReport) {
        if self.carry.is_empty() {
            match self.parse(&line) {
                Ok(events) => report.events.extend(events),
                Err(err) => self.rebuffer_or_drop(line, err, report),
            }
            return;
        }

        let mut candidate = std::mem::take(&mut self.carry);
        candidate.extend_from_slice(&line);
        match self.parse(&candidate) {
            Ok(events) => report.events.extend(events),
            Err(err) => {
                if let Ok(events) = self.parse(&line) {
                    report.errors.push(StreamParseError::Json {
                        message: "incomplete line discarded".to_string(),
                        preview: preview(&candidate[..candidate.len() - line.len()]),
                    });
                    report.events.extend(events);
                } else {
                    self.rebuffer_or_drop(candidate, err, report);
                }
            }
        }
    }

    fn rebuffer_or_drop(
        &mut self,
        mut fragment: Vec<u8>,
        err: StreamParseError,
        report: &mut IngestReport,
    ) {
        let retryable = matches!(err, StreamParseError::Json { .. });
        if retryable && looks_truncated(&fragment) {
            if fragment.len() > self.max_frame_bytes {
                report.errors.push(StreamParseError::Oversized {
                    size: fragment.len(),
                    max: self.max_frame_bytes,
                });
                return;
            }
            fragment.push(b'\n');
            self.carry = fragment;
            report.rebuffered_lines += 1;
            return;
        }
        report.errors.push(err);
    }

    fn parse(&self, frame: &[u8]) -> Result<Vec<StreamEvent>, StreamParseError> {
        if frame.len() > self.max_frame_bytes {
            return Err(StreamParseError::Oversized {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
        }
        let value: Value = serde_json::from_slice(frame).map_err(|err| StreamParseError::Json {
            message: err.to_string(),
            preview: preview(frame),
        })?;
        StreamEvent::from_value(value).map_err(|message| StreamParseError::Shape {
            message,
            preview: preview(frame),
        })
    }
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(|byte| byte.is_ascii_whitespace())
}

fn preview(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .take(PREVIEW_CHARS)
        .collect()
}

/// An object that was opened but never closed, ignoring braces inside strings.
fn looks_truncated(bytes: &[u8]) -> bool {
    let starts_with_brace = bytes
        .iter()
        .find(|byte| !byte.is_ascii_whitespace())
        .is_some_and(|byte| *byte == b'{');
    if !starts_with_brace {
        return false;
    }

    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for byte in bytes {
        if in_string {
            if escaped {
                escaped = false;
            } else if *byte == b'\\' {
                escaped = true;
            } else if *byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth -= 1,
            _ => {}
        }
    }
    depth > 0 || in_string
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{AssistantBlock, StreamEvent};

    fn sample_stream() -> Vec<u8> {
        let lines = [
            r#"{"type":"system","subtype":"init","session_id":"sess-1","tools":["Edit"]}"#,
            r#"{"type":"assistant","message":{"id":"msg_1","content":[{"type":"text","text":"braces { in } text"}]}}"#,
            r#"{"type":"assistant","message":{"id":"msg_1","content":[{"type":"tool_use","id":"toolu_1","name":"Edit","input":{"file_path":"a.txt","old_string":"old","new_string":"new"}}]}}"#,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"ok"}]}}"#,
            r#"{"type":"result","subtype":"success","is_error":false,"num_turns":1,"result":"done"}"#,
        ];
        let mut bytes = Vec::new();
        for line in lines {
            bytes.extend_from_slice(line.as_bytes());
            bytes.push(b'\n');
        }
        bytes
    }

    fn ingest_in_chunks(bytes: &[u8], chunk_size: usize) -> IngestReport {
        let mut ingestor = StreamIngestor::default();
        let mut report = IngestReport::default();
        for chunk in bytes.chunks(chunk_size) {
            report.extend(ingestor.push_chunk(chunk));
        }
        report.extend(ingestor.finish());
        report
    }

    #[test]
    fn event_sequence_is_independent_of_chunking() {
        let bytes = sample_stream();
        let whole = ingest_in_chunks(&bytes, bytes.len());
        assert_eq!(whole.events.len(), 5);
        assert!(whole.errors.is_empty());

        for chunk_size in 1..=17 {
            let chunked = ingest_in_chunks(&bytes, chunk_size);
            assert_eq!(chunked.events, whole.events, "chunk size {chunk_size}");
            assert!(chunked.errors.is_empty(), "chunk size {chunk_size}");
        }
    }

    #[test]
    fn every_two_way_split_yields_same_events() {
        let bytes = sample_stream();
        let expected = ingest_in_chunks(&bytes, bytes.len()).events;
        for split in 0..bytes.len() {
            let mut ingestor = StreamIngestor::default();
            let mut report = ingestor.push_chunk(&bytes[..split]);
            report.extend(ingestor.push_chunk(&bytes[split..]));
            report.extend(ingestor.finish());
            assert_eq!(report.events, expected, "split at {split}");
        }
    }

    #[test]
    fn malformed_line_is_dropped_and_stream_continues() {
        let mut bytes = b"not json at all\n".to_vec();
        bytes.extend_from_slice(&sample_stream());
        let report = ingest_in_chunks(&bytes, 5);
        assert_eq!(report.events.len(), 5);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], StreamParseError::Json { .. }));
    }

    #[test]
    fn object_broken_across_lines_is_rebuffered() {
        let stream = b"{\n\"type\": \"result\",\n\"is_error\": false,\n\"result\": \"a } b\"\n}\n";
        let mut ingestor = StreamIngestor::default();
        let report = ingestor.push_chunk(stream);
        assert!(report.errors.is_empty(), "errors: {:?}", report.errors);
        assert_eq!(report.rebuffered_lines, 4);
        match &report.events[..] {
            [StreamEvent::TerminalResult(result)] => {
                assert_eq!(result.result.as_deref(), Some("a } b"));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn unfinished_fragment_is_dropped_when_next_line_stands_alone() {
        let stream = concat!(
            r#"{"type":"assistant","message":{"id":"msg_1""#,
            "\n",
            r#"{"type":"result","is_error":false}"#,
            "\n"
        );
        let mut ingestor = StreamIngestor::default();
        let report = ingestor.push_chunk(stream.as_bytes());
        assert_eq!(report.events.len(), 1);
        assert!(matches!(report.events[0], StreamEvent::TerminalResult(_)));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(ingestor.buffered_bytes(), 0);
    }

    #[test]
    fn finish_parses_unterminated_final_line() {
        let mut ingestor = StreamIngestor::default();
        let report = ingestor.push_chunk(br#"{"type":"result","is_error":true}"#);
        assert!(report.is_empty());
        let report = ingestor.finish();
        assert_eq!(report.events.len(), 1);
    }

    #[test]
    fn finish_reports_incomplete_remainder() {
        let mut ingestor = StreamIngestor::default();
        ingestor.push_chunk(b"{\"type\":\"assistant\",\n");
        let report = ingestor.finish();
        assert!(report.events.is_empty());
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let mut ingestor = StreamIngestor::default();
        let report =
            ingestor.push_chunk(b"{\"type\":\"ping\"}\r\n\r\n{\"type\":\"result\"}\r\n");
        assert!(report.errors.is_empty());
        assert_eq!(report.events.len(), 2);
        assert_eq!(report.events[0].kind(), "ping");
    }

    #[test]
    fn oversized_line_is_skipped_regardless_of_chunking() {
        let mut bytes = format!("{{\"blob\":\"{}\"}}\n", "x".repeat(300)).into_bytes();
        bytes.extend_from_slice(br#"{"type":"result","is_error":false}"#);
        bytes.push(b'\n');

        for chunk_size in [bytes.len(), 64, 7] {
            let mut ingestor = StreamIngestor::new(IngestorConfig {
                max_frame_bytes: 128,
            });
            let mut report = IngestReport::default();
            for chunk in bytes.chunks(chunk_size) {
                report.extend(ingestor.push_chunk(chunk));
            }
            report.extend(ingestor.finish());
            assert_eq!(report.events.len(), 1, "chunk size {chunk_size}");
            assert_eq!(report.errors.len(), 1, "chunk size {chunk_size}");
            assert!(matches!(
                report.errors[0],
                StreamParseError::Oversized { .. }
            ));
        }
    }

    #[test]
    fn shape_errors_are_not_retried() {
        let mut ingestor = StreamIngestor::default();
        let report = ingestor.push_chunk(b"{\"type\":\"assistant\",\"message\":7}\n");
        assert!(report.events.is_empty());
        assert!(matches!(report.errors[0], StreamParseError::Shape { .. }));
        assert_eq!(ingestor.buffered_bytes(), 0);
    }

    #[test]
    fn tool_use_survives_byte_at_a_time_delivery() {
        let report = ingest_in_chunks(&sample_stream(), 1);
        let tool_uses = report
            .events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::AssistantDelta(delta) => Some(delta),
                _ => None,
            })
            .flat_map(|delta| delta.blocks.iter())
            .filter(|block| matches!(block, AssistantBlock::ToolUse { .. }))
            .count();
        assert_eq!(tool_uses, 1);
    }
}

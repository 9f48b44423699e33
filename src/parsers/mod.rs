//! Per-vendor response parsers.
//!
//! Three upstream dialects (OpenAI chat, Anthropic messages, Google Gemini
//! generateContent), each with an incremental entry point fed one decoded
//! stream line at a time and a final entry point for complete bodies. Both
//! update a [`StreamAccumulator`]; a malformed chunk is dropped and the
//! stream continues.

pub mod anthropic;
pub mod google;
pub mod openai;

use crate::domains::AuthType;
use serde_json::Value;

/// A tool call being assembled from Anthropic `input_json_delta` events.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallDraft {
    pub id: String,
    pub name: String,
    pub input_json: String,
}

/// Assembly state for the current Anthropic tool-use block.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PendingToolCall {
    #[default]
    Idle,
    Assembling(ToolCallDraft),
}

/// Transient per-request state collected while an upstream response streams.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    pub response_id: Option<String>,
    pub visible: String,
    pub reasoning: String,
    pub pending: PendingToolCall,
    /// Completed tool calls in event-arrival order, already in
    /// `{id, type, function:{name, arguments}}` shape.
    pub tool_calls: Vec<Value>,
    pub stop_reason: Option<String>,
    /// Set when a terminal condition (e.g. a Google non-STOP finish reason)
    /// replaced the visible text; further parsing is skipped.
    pub finished: bool,
}

/// Output of [`StreamAccumulator::finalize`], ready for normalization.
#[derive(Debug)]
pub struct FinalizedResponse {
    pub response_id: Option<String>,
    pub text: String,
    /// Tool calls handed to the normalizer structurally; populated only for
    /// a function-call-only turn (no visible text to carry a marker).
    pub tool_calls: Vec<Value>,
}

impl FinalizedResponse {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.tool_calls.is_empty()
    }
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture_id(&mut self, id: &str) {
        if self.response_id.is_none() && !id.is_empty() {
            self.response_id = Some(id.to_string());
        }
    }

    /// Close the accumulator: splice the reasoning trace into the visible
    /// text and resolve how assembled tool calls reach the normalizer.
    pub fn finalize(mut self) -> FinalizedResponse {
        // Flush a tool call whose content_block_stop never arrived
        if let PendingToolCall::Assembling(draft) = std::mem::take(&mut self.pending) {
            self.tool_calls.push(anthropic::complete_tool_call(&draft));
        }

        let visible = if self.reasoning.trim().is_empty() {
            self.visible
        } else {
            format!(
                "<think>\n{}\n</think>\n\n{}",
                self.reasoning.trim(),
                self.visible
            )
        };

        if self.tool_calls.is_empty() {
            return FinalizedResponse {
                response_id: self.response_id,
                text: visible,
                tool_calls: Vec::new(),
            };
        }

        if visible.trim().is_empty() {
            // Function-call-only turn: no text, tool calls pass structurally
            return FinalizedResponse {
                response_id: self.response_id,
                text: String::new(),
                tool_calls: self.tool_calls,
            };
        }

        let marker = serde_json::to_string(&self.tool_calls).unwrap_or_else(|_| "[]".to_string());
        FinalizedResponse {
            response_id: self.response_id,
            text: format!("{}\n[ANTHROPIC_TOOL_CALLS: {}]", visible, marker),
            tool_calls: Vec::new(),
        }
    }
}

impl AuthType {
    /// Feed one decoded line from the upstream stream.
    pub fn parse_incremental(self, line: &str, acc: &mut StreamAccumulator) {
        match self {
            AuthType::OpenAi => openai::parse_incremental(line, acc),
            AuthType::Anthropic => anthropic::parse_incremental(line, acc),
            AuthType::Google => google::parse_incremental(line, acc),
        }
    }

    /// Parse a complete (non-streamed) response body.
    pub fn parse_final(self, body: &str, acc: &mut StreamAccumulator) {
        match self {
            AuthType::OpenAi => openai::parse_final(body, acc),
            AuthType::Anthropic => anthropic::parse_final(body, acc),
            AuthType::Google => google::parse_final(body, acc),
        }
    }

    /// Rewrite an OpenAI-style request body for this vendor, when the fixed
    /// entry points retarget to it. Identity for vendors that accept the
    /// OpenAI shape.
    pub fn rewrite_request(self, body: &Value) -> Value {
        match self {
            AuthType::Google => google::rewrite_request(body),
            AuthType::OpenAi | AuthType::Anthropic => body.clone(),
        }
    }
}

/// Strip SSE `data:` framing; `None` means the line carries no payload
/// (comments, `event:` lines, blank keep-alives).
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    let line = line.trim();
    if let Some(stripped) = line.strip_prefix("data: ") {
        Some(stripped.trim())
    } else if let Some(stripped) = line.strip_prefix("data:") {
        Some(stripped.trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reasoning_splice_on_finalize() {
        let acc = StreamAccumulator {
            visible: "answer".to_string(),
            reasoning: "why".to_string(),
            ..Default::default()
        };
        let fin = acc.finalize();
        assert_eq!(fin.text, "<think>\nwhy\n</think>\n\nanswer");
    }

    #[test]
    fn test_finalize_without_reasoning_is_verbatim() {
        let acc = StreamAccumulator {
            visible: "plain".to_string(),
            ..Default::default()
        };
        assert_eq!(acc.finalize().text, "plain");
    }

    #[test]
    fn test_tool_calls_with_text_become_marker() {
        let acc = StreamAccumulator {
            visible: "Let me check.".to_string(),
            tool_calls: vec![json!({"id": "t1"})],
            ..Default::default()
        };
        let fin = acc.finalize();
        assert!(fin.text.starts_with("Let me check.\n[ANTHROPIC_TOOL_CALLS: "));
        assert!(fin.tool_calls.is_empty());
    }

    #[test]
    fn test_tool_calls_without_text_pass_structurally() {
        let acc = StreamAccumulator {
            tool_calls: vec![json!({"id": "t1"})],
            ..Default::default()
        };
        let fin = acc.finalize();
        assert!(fin.text.is_empty());
        assert_eq!(fin.tool_calls.len(), 1);
    }

    #[test]
    fn test_sse_data_framing() {
        assert_eq!(sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(sse_data("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(sse_data("event: message_start"), None);
        assert_eq!(sse_data(": keep-alive"), None);
    }
}

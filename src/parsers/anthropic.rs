//! Anthropic Messages API parsing: named SSE events with a small state
//! machine assembling `tool_use` blocks from `input_json_delta` fragments.

use super::{sse_data, PendingToolCall, StreamAccumulator, ToolCallDraft};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStart },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { content_block: ContentBlock },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: BlockDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop {},
    #[serde(rename = "message_delta")]
    MessageDelta { delta: MessageDeltaBody },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum BlockDelta {
    #[serde(rename = "text_delta")]
    TextDelta {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta {
        #[serde(default)]
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

/// SSE line: `data: {event}` where the JSON carries a `type` tag.
pub fn parse_incremental(line: &str, acc: &mut StreamAccumulator) {
    let Some(data) = sse_data(line) else {
        return;
    };
    if data.is_empty() || data == "[DONE]" {
        return;
    }

    let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
        return;
    };

    match event {
        StreamEvent::MessageStart { message } => {
            if let Some(ref id) = message.id {
                acc.capture_id(id);
            }
        }
        StreamEvent::ContentBlockStart { content_block } => {
            if let ContentBlock::ToolUse { id, name } = content_block {
                acc.pending = PendingToolCall::Assembling(ToolCallDraft {
                    id,
                    name,
                    input_json: String::new(),
                });
            }
        }
        StreamEvent::ContentBlockDelta { delta } => match delta {
            BlockDelta::TextDelta { text } => acc.visible.push_str(&text),
            BlockDelta::InputJsonDelta { partial_json } => {
                if let PendingToolCall::Assembling(ref mut draft) = acc.pending {
                    draft.input_json.push_str(&partial_json);
                }
            }
            BlockDelta::Other => {}
        },
        StreamEvent::ContentBlockStop {} => {
            if let PendingToolCall::Assembling(draft) = std::mem::take(&mut acc.pending) {
                acc.tool_calls.push(complete_tool_call(&draft));
            }
        }
        StreamEvent::MessageDelta { delta } => {
            if delta.stop_reason.is_some() {
                acc.stop_reason = delta.stop_reason;
            }
        }
        StreamEvent::MessageStop | StreamEvent::Ping | StreamEvent::Other => {}
    }
}

/// Non-stream body: concatenate all `content[].text` where `type == "text"`.
pub fn parse_final(body: &str, acc: &mut StreamAccumulator) {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return;
    };

    if let Some(id) = parsed.get("id").and_then(Value::as_str) {
        acc.capture_id(id);
    }
    if let Some(reason) = parsed.get("stop_reason").and_then(Value::as_str) {
        acc.stop_reason = Some(reason.to_string());
    }

    if let Some(content) = parsed.get("content").and_then(Value::as_array) {
        for block in content {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    acc.visible.push_str(text);
                }
            }
        }
    }
}

/// Close an assembled draft: the accumulated `input_json` is validated as
/// JSON and compacted, falling back to the raw string.
pub fn complete_tool_call(draft: &ToolCallDraft) -> Value {
    let arguments = match serde_json::from_str::<Value>(&draft.input_json) {
        Ok(parsed) => serde_json::to_string(&parsed).unwrap_or_else(|_| draft.input_json.clone()),
        Err(_) if draft.input_json.is_empty() => "{}".to_string(),
        Err(_) => draft.input_json.clone(),
    };

    json!({
        "id": draft.id,
        "type": "function",
        "function": {
            "name": draft.name,
            "arguments": arguments,
        },
    })
}

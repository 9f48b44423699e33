//! OpenAI Chat Completions parsing (streaming deltas and final bodies).

use super::{sse_data, StreamAccumulator};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    /// String, object with one of `{text|content|message|parts}`, or an
    /// array of such; reasoning models disagree on the shape.
    #[serde(default)]
    reasoning_content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FinalBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<FinalChoice>,
}

#[derive(Debug, Deserialize)]
struct FinalChoice {
    #[serde(default)]
    message: Option<FinalMessage>,
}

#[derive(Debug, Deserialize)]
struct FinalMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<Value>,
}

/// SSE line: `data: {chunk}`, terminated by `data: [DONE]`.
pub fn parse_incremental(line: &str, acc: &mut StreamAccumulator) {
    let Some(data) = sse_data(line) else {
        return;
    };
    if data.is_empty() || data == "[DONE]" {
        return;
    }

    let Ok(chunk) = serde_json::from_str::<Chunk>(data) else {
        return;
    };

    if let Some(ref id) = chunk.id {
        acc.capture_id(id);
    }

    let Some(delta) = chunk.choices.into_iter().next().and_then(|c| c.delta) else {
        return;
    };

    if let Some(reasoning) = delta.reasoning_content {
        acc.reasoning.push_str(&flatten_reasoning(&reasoning));
    }
    if let Some(content) = delta.content {
        acc.visible.push_str(&content);
    }
}

pub fn parse_final(body: &str, acc: &mut StreamAccumulator) {
    let Ok(parsed) = serde_json::from_str::<FinalBody>(body) else {
        return;
    };

    if let Some(ref id) = parsed.id {
        acc.capture_id(id);
    }

    let Some(message) = parsed.choices.into_iter().next().and_then(|c| c.message) else {
        return;
    };

    if let Some(reasoning) = message.reasoning_content {
        acc.reasoning.push_str(&flatten_reasoning(&reasoning));
    }
    if let Some(content) = message.content {
        acc.visible.push_str(&content);
    }
}

/// Flatten the text out of whatever shape `reasoning_content` arrived in.
pub fn flatten_reasoning(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => ["text", "content", "message", "parts"]
            .iter()
            .find_map(|key| map.get(*key))
            .map(flatten_reasoning)
            .unwrap_or_default(),
        Value::Array(items) => items.iter().map(flatten_reasoning).collect(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_deltas_accumulate() {
        let mut acc = StreamAccumulator::new();
        parse_incremental(
            r#"data: {"id":"r2","choices":[{"delta":{"content":"a"}}]}"#,
            &mut acc,
        );
        parse_incremental(r#"data: {"choices":[{"delta":{"content":"b"}}]}"#, &mut acc);
        parse_incremental("data: [DONE]", &mut acc);

        assert_eq!(acc.response_id.as_deref(), Some("r2"));
        assert_eq!(acc.visible, "ab");
    }

    #[test]
    fn test_malformed_chunk_is_dropped() {
        let mut acc = StreamAccumulator::new();
        parse_incremental("data: {not json", &mut acc);
        parse_incremental(r#"data: {"choices":[{"delta":{"content":"ok"}}]}"#, &mut acc);
        assert_eq!(acc.visible, "ok");
    }

    #[test]
    fn test_final_with_reasoning_splices_think_block() {
        let mut acc = StreamAccumulator::new();
        parse_final(
            r#"{"id":"r1","choices":[{"message":{"content":"hi","reasoning_content":"think"}}]}"#,
            &mut acc,
        );

        assert_eq!(acc.response_id.as_deref(), Some("r1"));
        let fin = acc.finalize();
        assert_eq!(fin.text, "<think>\nthink\n</think>\n\nhi");
    }

    #[test]
    fn test_reasoning_shapes_flatten() {
        assert_eq!(flatten_reasoning(&json!("plain")), "plain");
        assert_eq!(flatten_reasoning(&json!({"text": "a"})), "a");
        assert_eq!(flatten_reasoning(&json!({"message": "b"})), "b");
        assert_eq!(
            flatten_reasoning(&json!([{"content": "a"}, {"text": "b"}])),
            "ab"
        );
        assert_eq!(
            flatten_reasoning(&json!({"parts": [{"text": "x"}, {"text": "y"}]})),
            "xy"
        );
        assert_eq!(flatten_reasoning(&json!(42)), "");
    }

    #[test]
    fn test_streamed_reasoning_deltas() {
        let mut acc = StreamAccumulator::new();
        parse_incremental(
            r#"data: {"id":"r5","choices":[{"delta":{"reasoning_content":"step one "}}]}"#,
            &mut acc,
        );
        parse_incremental(
            r#"data: {"choices":[{"delta":{"reasoning_content":"step two"}}]}"#,
            &mut acc,
        );
        parse_incremental(
            r#"data: {"choices":[{"delta":{"content":"done"}}]}"#,
            &mut acc,
        );

        assert_eq!(acc.reasoning, "step one step two");
        assert_eq!(acc.finalize().text, "<think>\nstep one step two\n</think>\n\ndone");
    }
}

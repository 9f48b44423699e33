//! Google Gemini generateContent parsing and the OpenAI→Gemini request
//! rewrite used by the fixed entry points.
//!
//! Streaming Gemini arrives either as line-framed JSON objects or as
//! `data:`-prefixed SSE; OpenAI-style delta envelopes are also accepted for
//! compatibility. Shards that are not complete JSON fall back to regex
//! capture.

use super::StreamAccumulator;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

fn text_shard_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""text"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid regex"))
}

fn response_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""responseId"\s*:\s*"([^"]+)""#).expect("valid regex"))
}

pub fn parse_incremental(line: &str, acc: &mut StreamAccumulator) {
    if acc.finished {
        return;
    }

    let data = match super::sse_data(line) {
        Some(d) => d,
        None => line.trim(),
    };
    if data.is_empty() || data == "[DONE]" {
        return;
    }
    // Array framing wraps whole-response chunks in brackets and commas
    let data = data.trim_start_matches(['[', ',']).trim_end_matches(']').trim();
    if data.is_empty() {
        return;
    }

    match serde_json::from_str::<Value>(data) {
        Ok(chunk) => apply_chunk(&chunk, acc),
        Err(_) => apply_shard_fallback(data, acc),
    }
}

pub fn parse_final(body: &str, acc: &mut StreamAccumulator) {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return;
    };

    if let Some(id) = parsed.get("responseId").and_then(Value::as_str) {
        acc.response_id = Some(id.to_string());
    }

    let candidate = parsed
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first());
    let Some(candidate) = candidate else {
        return;
    };

    if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
        acc.stop_reason = Some(reason.to_string());
        if reason != "STOP" {
            acc.visible = finish_reason_text(reason);
            acc.reasoning.clear();
            acc.finished = true;
            return;
        }
    }

    classify_parts(candidate, acc);
}

fn apply_chunk(chunk: &Value, acc: &mut StreamAccumulator) {
    if let Some(id) = chunk.get("responseId").and_then(Value::as_str) {
        acc.response_id = Some(id.to_string());
    }
    // OpenAI-style envelope, seen when an OpenAI-compat layer fronts Gemini
    if let Some(choices) = chunk.get("choices").and_then(Value::as_array) {
        if let Some(content) = choices
            .first()
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
        {
            acc.visible.push_str(content);
        }
        if let Some(id) = chunk.get("id").and_then(Value::as_str) {
            acc.capture_id(id);
        }
        return;
    }

    if let Some(candidate) = chunk
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    {
        classify_parts(candidate, acc);
    }
}

/// Sort each part into the reasoning or visible stream. A part carrying
/// `thinking.thought` (string form) or the legacy `thought: true` flag is
/// reasoning; anything else contributes its `text`.
fn classify_parts(candidate: &Value, acc: &mut StreamAccumulator) {
    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array);
    let Some(parts) = parts else {
        return;
    };

    for part in parts {
        if let Some(thought) = part
            .get("thinking")
            .and_then(|t| t.get("thought"))
            .and_then(Value::as_str)
        {
            acc.reasoning.push_str(thought);
            continue;
        }
        if part.get("thought").and_then(Value::as_bool) == Some(true) {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                acc.reasoning.push_str(text);
            }
            continue;
        }
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            acc.visible.push_str(text);
        }
    }
}

/// A shard that is not a complete JSON object: capture `"text":"…"` and
/// `"responseId":"…"` by regex. Text capture is skipped when the shard also
/// carries a thinking marker, so reasoning never leaks into visible text.
fn apply_shard_fallback(shard: &str, acc: &mut StreamAccumulator) {
    if !shard.contains("\"thought\"") && !shard.contains("\"thinking\"") {
        for capture in text_shard_re().captures_iter(shard) {
            let escaped = format!("\"{}\"", &capture[1]);
            if let Ok(text) = serde_json::from_str::<String>(&escaped) {
                acc.visible.push_str(&text);
            }
        }
    }
    if let Some(capture) = response_id_re().captures(shard) {
        acc.response_id = Some(capture[1].to_string());
    }
}

fn finish_reason_text(reason: &str) -> String {
    match reason {
        "MAX_TOKENS" => "[Response truncated: maximum output token limit reached]".to_string(),
        "SAFETY" => "[Response blocked by safety filters]".to_string(),
        "RECITATION" => "[Response blocked: recitation of protected content]".to_string(),
        other => format!("[Response stopped: {other}]"),
    }
}

/// Rewrite an OpenAI chat request into Gemini `contents[].parts[].text`
/// form. Role mapping: `user→user`, `assistant→model`; system messages fold
/// into the first user part prefixed with `"System: "`. `generationConfig`
/// is filled from `temperature` / `max_tokens` / `top_p`.
pub fn rewrite_request(body: &Value) -> Value {
    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for msg in messages {
            let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
            let text = content_text(msg.get("content"));
            match role {
                "system" => system_texts.push(text),
                "assistant" => contents.push(json!({
                    "role": "model",
                    "parts": [{"text": text}],
                })),
                _ => contents.push(json!({
                    "role": "user",
                    "parts": [{"text": text}],
                })),
            }
        }
    }

    if !system_texts.is_empty() {
        let prefix = format!("System: {}", system_texts.join("\n"));
        let first_user = contents
            .iter()
            .position(|c| c.get("role").and_then(Value::as_str) == Some("user"));
        match first_user {
            Some(i) => {
                if let Some(slot) = contents[i].pointer_mut("/parts/0/text") {
                    if let Some(text) = slot.as_str().map(String::from) {
                        *slot = Value::String(format!("{prefix}\n\n{text}"));
                    }
                }
            }
            None => contents.insert(0, json!({"role": "user", "parts": [{"text": prefix}]})),
        }
    }

    let mut generation_config = Map::new();
    if let Some(t) = body.get("temperature").filter(|v| !v.is_null()) {
        generation_config.insert("temperature".to_string(), t.clone());
    }
    if let Some(m) = body.get("max_tokens").filter(|v| !v.is_null()) {
        generation_config.insert("maxOutputTokens".to_string(), m.clone());
    }
    if let Some(p) = body.get("top_p").filter(|v| !v.is_null()) {
        generation_config.insert("topP".to_string(), p.clone());
    }

    let mut out = json!({"contents": contents});
    if !generation_config.is_empty() {
        out["generationConfig"] = Value::Object(generation_config);
    }
    out
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thinking_and_text_parts_split() {
        let mut acc = StreamAccumulator::new();
        parse_incremental(
            r#"{"responseId":"g1","candidates":[{"content":{"parts":[
                {"thinking":{"thought":"why"}},
                {"text":"answer"}
            ]}}]}"#,
            &mut acc,
        );

        assert_eq!(acc.response_id.as_deref(), Some("g1"));
        assert_eq!(acc.reasoning, "why");
        assert_eq!(acc.visible, "answer");
        assert_eq!(acc.finalize().text, "<think>\nwhy\n</think>\n\nanswer");
    }

    #[test]
    fn test_legacy_thought_flag() {
        let mut acc = StreamAccumulator::new();
        parse_incremental(
            r#"{"candidates":[{"content":{"parts":[
                {"thought":true,"text":"hidden"},
                {"text":"visible"}
            ]}}]}"#,
            &mut acc,
        );

        assert_eq!(acc.reasoning, "hidden");
        assert_eq!(acc.visible, "visible");
    }

    #[test]
    fn test_sse_framed_chunk() {
        let mut acc = StreamAccumulator::new();
        parse_incremental(
            r#"data: {"candidates":[{"content":{"parts":[{"text":"streamed"}]}}]}"#,
            &mut acc,
        );
        assert_eq!(acc.visible, "streamed");
    }

    #[test]
    fn test_openai_envelope_compatibility() {
        let mut acc = StreamAccumulator::new();
        parse_incremental(
            r#"data: {"id":"c1","choices":[{"delta":{"content":"compat"}}]}"#,
            &mut acc,
        );
        assert_eq!(acc.visible, "compat");
        assert_eq!(acc.response_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_shard_fallback_captures_text_and_id() {
        let mut acc = StreamAccumulator::new();
        parse_incremental(
            r#""text": "partial \"quoted\"", "responseId": "g7", "other": {"#,
            &mut acc,
        );
        assert_eq!(acc.visible, "partial \"quoted\"");
        assert_eq!(acc.response_id.as_deref(), Some("g7"));
    }

    #[test]
    fn test_shard_fallback_skips_thinking_shards() {
        let mut acc = StreamAccumulator::new();
        parse_incremental(r#""thought": true, "text": "hidden reasoning", {"#, &mut acc);
        assert_eq!(acc.visible, "");
    }

    #[test]
    fn test_final_non_stop_reason_replaces_text() {
        let mut acc = StreamAccumulator::new();
        parse_final(
            r#"{"responseId":"g2","candidates":[{"finishReason":"MAX_TOKENS","content":{"parts":[{"text":"cut"}]}}]}"#,
            &mut acc,
        );

        assert!(acc.finished);
        assert_eq!(
            acc.visible,
            "[Response truncated: maximum output token limit reached]"
        );
    }

    #[test]
    fn test_final_stop_reason_keeps_parts() {
        let mut acc = StreamAccumulator::new();
        parse_final(
            r#"{"responseId":"g3","candidates":[{"finishReason":"STOP","content":{"parts":[{"text":"fine"}]}}]}"#,
            &mut acc,
        );
        assert_eq!(acc.visible, "fine");
        assert_eq!(acc.stop_reason.as_deref(), Some("STOP"));
    }

    #[test]
    fn test_rewrite_request_roles_and_config() {
        let body = serde_json::json!({
            "model": "gemini-2.0-flash",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi"}
            ],
            "temperature": 0.5,
            "max_tokens": 64,
            "top_p": 0.9
        });
        let rewritten = rewrite_request(&body);

        let contents = rewritten["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(
            contents[0]["parts"][0]["text"],
            "System: Be brief.\n\nhello"
        );
        assert_eq!(contents[1]["role"], "model");

        let config = &rewritten["generationConfig"];
        assert_eq!(config["temperature"], 0.5);
        assert_eq!(config["maxOutputTokens"], 64);
        assert_eq!(config["topP"], 0.9);
    }

    #[test]
    fn test_rewrite_request_system_only() {
        let body = serde_json::json!({
            "messages": [{"role": "system", "content": "Only instructions."}]
        });
        let rewritten = rewrite_request(&body);
        let contents = rewritten["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "System: Only instructions.");
        assert!(rewritten.get("generationConfig").is_none());
    }
}

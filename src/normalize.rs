//! Normalization of heterogeneous vendor messages into the extended
//! ShareGPT conversation record.
//!
//! The record extends classic ShareGPT with `function_call` and
//! `observation` roles so tool invocations and their results survive the
//! round-trip into training data. All functions here are pure (no I/O).

use crate::domains::AuthType;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Speaker of a single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    Human,
    Gpt,
    FunctionCall,
    Observation,
    System,
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub from: TurnRole,
    pub value: String,
    /// Audit marker: set when the role was rewritten by the consecutive-human
    /// heuristic.
    #[serde(
        rename = "_normalized_role",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub normalized_role: Option<bool>,
}

impl Turn {
    pub fn new(from: TurnRole, value: impl Into<String>) -> Self {
        Self {
            from,
            value: value.into(),
            normalized_role: None,
        }
    }
}

/// The persisted conversation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversations: Vec<Turn>,
    pub system: String,
    /// JSON-encoded array of tool definitions, `"[]"` when absent.
    pub tools: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub flags: Option<Vec<String>>,
    /// Raw request body, retained whenever a role was rewritten.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub raw_request: Option<String>,
}

impl Conversation {
    /// A conversation is function-call-only when its last turn is a
    /// `function_call` (earlier `gpt` turns do not matter).
    pub fn is_function_call_only(&self) -> bool {
        matches!(
            self.conversations.last(),
            Some(Turn {
                from: TurnRole::FunctionCall,
                ..
            })
        )
    }
}

/// Build a [`Conversation`] from the original request, the assembled
/// response text, and any tool calls collected by the stream accumulator.
pub fn normalize(
    auth_type: AuthType,
    request_body: &Value,
    response_text: &str,
    response_tool_calls: &[Value],
) -> Result<Conversation> {
    let messages = extract_archive_messages(auth_type, request_body);

    let mut system = String::new();
    let mut turns: Vec<Turn> = Vec::new();

    for msg in &messages {
        let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
        match role {
            "system" => {
                append_system(&mut system, &coerce_text(msg.get("content")));
            }
            "tool" | "function" | "tool_response" | "observation" => {
                let text = coerce_text(msg.get("content"));
                if !text.trim().is_empty() {
                    turns.push(Turn::new(TurnRole::Observation, text.trim()));
                }
            }
            "function_call" => {
                let value = match msg.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => serde_json::to_string(other)?,
                    None => String::new(),
                };
                turns.push(Turn::new(TurnRole::FunctionCall, value));
            }
            _ => {
                let from = match role {
                    "assistant" | "gpt" | "model" => TurnRole::Gpt,
                    _ => TurnRole::Human,
                };

                let flattened = flatten_content(msg.get("content"));
                if !flattened.text.trim().is_empty() {
                    turns.push(Turn::new(from, flattened.text.trim()));
                }

                // OpenAI-style tool calls carried on the message itself
                if let Some(calls) = msg.get("tool_calls").and_then(Value::as_array) {
                    for call in calls {
                        turns.push(Turn::new(
                            TurnRole::FunctionCall,
                            serde_json::to_string(call)?,
                        ));
                    }
                }
                turns.extend(flattened.tool_calls);
                turns.extend(flattened.observations);
            }
        }
    }

    let any_normalized = normalize_roles(&mut turns);

    splice_response(&mut turns, response_text, response_tool_calls)?;

    let tools = match request_body.get("tools") {
        Some(Value::Array(a)) => serde_json::to_string(a)?,
        Some(Value::String(s)) => s.clone(),
        _ => "[]".to_string(),
    };

    let (flags, raw_request) = if any_normalized {
        (
            Some(vec!["normalized_roles".to_string()]),
            Some(serde_json::to_string(request_body)?),
        )
    } else {
        (None, None)
    };

    Ok(Conversation {
        conversations: turns,
        system,
        tools,
        flags,
        raw_request,
    })
}

/// Build the user-visible prompt list from the original request body.
///
/// Google requests carry `systemInstruction` and `contents[]`; everything
/// else carries `messages[]` (plus an optional Anthropic top-level `system`).
pub fn extract_archive_messages(auth_type: AuthType, body: &Value) -> Vec<Value> {
    let mut msgs = Vec::new();

    match auth_type {
        AuthType::Google => {
            if let Some(instruction) = body.get("systemInstruction") {
                let text = parts_text(instruction.get("parts"));
                if !text.is_empty() {
                    msgs.push(json!({"role": "system", "content": text}));
                }
            }
            if let Some(contents) = body.get("contents").and_then(Value::as_array) {
                for content in contents {
                    let role = match content.get("role").and_then(Value::as_str) {
                        Some("model") => "assistant",
                        Some("system") => "system",
                        _ => "user",
                    };
                    msgs.push(json!({
                        "role": role,
                        "content": parts_text(content.get("parts")),
                    }));
                }
            }
        }
        _ => {
            if let Some(sys) = body.get("system") {
                let text = coerce_text(Some(sys));
                if !text.is_empty() {
                    msgs.push(json!({"role": "system", "content": text}));
                }
            }
            if let Some(arr) = body.get("messages").and_then(Value::as_array) {
                msgs.extend(arr.iter().cloned());
            }
        }
    }

    msgs
}

struct FlattenedContent {
    text: String,
    tool_calls: Vec<Turn>,
    observations: Vec<Turn>,
}

/// Flatten a message `content` field: text parts concatenate with newlines,
/// `tool_use` parts become synthesized `function_call` turns, `tool_result`
/// parts become `observation` turns.
fn flatten_content(content: Option<&Value>) -> FlattenedContent {
    let mut out = FlattenedContent {
        text: String::new(),
        tool_calls: Vec::new(),
        observations: Vec::new(),
    };

    let Some(content) = content else {
        return out;
    };

    match content {
        Value::String(s) => out.text = s.clone(),
        Value::Array(items) => {
            let mut parts: Vec<String> = Vec::new();
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            parts.push(text.to_string());
                        }
                    }
                    Some("tool_use") => {
                        let call = json!({
                            "id": item.get("id").cloned().unwrap_or(Value::Null),
                            "type": "function",
                            "function": {
                                "name": item.get("name").cloned().unwrap_or(Value::Null),
                                "arguments": serde_json::to_string(
                                    item.get("input").unwrap_or(&json!({}))
                                )
                                .unwrap_or_else(|_| "{}".to_string()),
                            },
                        });
                        out.tool_calls.push(Turn::new(
                            TurnRole::FunctionCall,
                            call.to_string(),
                        ));
                    }
                    Some("tool_result") => {
                        let text = coerce_text(item.get("content"));
                        if !text.trim().is_empty() {
                            out.observations
                                .push(Turn::new(TurnRole::Observation, text.trim()));
                        }
                    }
                    _ => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            parts.push(text.to_string());
                        } else if let Some(s) = item.as_str() {
                            parts.push(s.to_string());
                        } else {
                            parts.push(item.to_string());
                        }
                    }
                }
            }
            out.text = parts.join("\n");
        }
        Value::Null => {}
        other => out.text = other.to_string(),
    }

    out
}

/// Coerce arbitrary content to plain text: strings pass through, arrays of
/// text-bearing parts join with newlines, anything else serializes.
fn coerce_text(content: Option<&Value>) -> String {
    let Some(content) = content else {
        return String::new();
    };
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    text.to_string()
                } else if let Some(s) = item.as_str() {
                    s.to_string()
                } else {
                    item.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parts_text(parts: Option<&Value>) -> String {
    parts
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn append_system(system: &mut String, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    if !system.is_empty() {
        system.push('\n');
    }
    system.push_str(text.trim());
}

/// Rewrite the second of two consecutive `human` turns to `gpt` when it
/// reads like assistant output. Returns whether any rewrite happened.
fn normalize_roles(turns: &mut [Turn]) -> bool {
    let mut any = false;
    for i in 1..turns.len() {
        if turns[i - 1].from == TurnRole::Human
            && turns[i].from == TurnRole::Human
            && looks_like_assistant(&turns[i].value)
        {
            turns[i].from = TurnRole::Gpt;
            turns[i].normalized_role = Some(true);
            any = true;
        }
    }
    any
}

/// Heuristic for "this human turn is actually an assistant reply":
/// long, or markdown-heavy, or with almost no question marks.
fn looks_like_assistant(text: &str) -> bool {
    let len = text.chars().count();
    if len == 0 {
        return false;
    }
    if len >= 400 {
        return true;
    }
    if text.contains("###") || text.contains("**") || text.contains("<think>") {
        return true;
    }
    let questions = text.chars().filter(|c| *c == '?' || *c == '？').count();
    (questions as f64 / len as f64) < 0.002
}

/// Append the assistant's reply: extract any `[ANTHROPIC_TOOL_CALLS: …]`
/// marker, emit a trailing `gpt` turn only when visible text remains, then
/// one `function_call` turn per tool call in arrival order.
fn splice_response(
    turns: &mut Vec<Turn>,
    response_text: &str,
    response_tool_calls: &[Value],
) -> Result<()> {
    let mut visible = response_text.trim().to_string();
    let mut marker_calls: Vec<Value> = Vec::new();

    if let Some((calls, remainder)) = extract_tool_call_marker(&visible) {
        marker_calls = calls;
        visible = remainder.trim().to_string();
    }

    if !visible.is_empty() {
        turns.push(Turn::new(TurnRole::Gpt, visible));
    }

    for call in marker_calls.iter().chain(response_tool_calls.iter()) {
        turns.push(Turn::new(
            TurnRole::FunctionCall,
            serde_json::to_string(call)?,
        ));
    }

    Ok(())
}

/// Locate the tool-call marker and extract its JSON array with a
/// bracket-balanced scan from the opening `[`. Returns the parsed calls and
/// the text with the marker removed.
fn extract_tool_call_marker(text: &str) -> Option<(Vec<Value>, String)> {
    const MARKER: &str = "[ANTHROPIC_TOOL_CALLS:";

    let start = text.find(MARKER)?;
    let json_start = start + MARKER.len();

    let mut depth = 0u32;
    let mut end = None;
    for (i, ch) in text[json_start..].char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => {
                if depth == 0 {
                    end = Some(json_start + i);
                    break;
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    let end = end?;

    let calls: Vec<Value> = serde_json::from_str(text[json_start..end].trim()).ok()?;

    let mut rest = String::with_capacity(text.len());
    rest.push_str(&text[..start]);
    rest.push_str(&text[end + 1..]);

    Some((calls, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_body(messages: Value) -> Value {
        json!({"model": "test", "messages": messages})
    }

    #[test]
    fn test_simple_exchange() {
        let body = chat_body(json!([{"role": "user", "content": "Q?"}]));
        let conv = normalize(AuthType::OpenAi, &body, "A.", &[]).unwrap();

        assert_eq!(conv.conversations.len(), 2);
        assert_eq!(conv.conversations[0].from, TurnRole::Human);
        assert_eq!(conv.conversations[0].value, "Q?");
        assert_eq!(conv.conversations[1].from, TurnRole::Gpt);
        assert_eq!(conv.conversations[1].value, "A.");
        assert_eq!(conv.system, "");
        assert_eq!(conv.tools, "[]");
        assert!(conv.flags.is_none());
    }

    #[test]
    fn test_system_message_folds_into_field() {
        let body = chat_body(json!([
            {"role": "system", "content": "Be brief."},
            {"role": "user", "content": "hi"}
        ]));
        let conv = normalize(AuthType::OpenAi, &body, "hello", &[]).unwrap();

        assert_eq!(conv.system, "Be brief.");
        assert_eq!(conv.conversations[0].from, TurnRole::Human);
    }

    #[test]
    fn test_anthropic_block_content() {
        let body = chat_body(json!([
            {"role": "user", "content": [
                {"type": "text", "text": "look this up"},
            ]},
            {"role": "assistant", "content": [
                {"type": "text", "text": "checking"},
                {"type": "tool_use", "id": "t9", "name": "search", "input": {"q": "x"}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t9", "content": "found it"}
            ]}
        ]));
        let conv = normalize(AuthType::Anthropic, &body, "done", &[]).unwrap();

        let roles: Vec<TurnRole> = conv.conversations.iter().map(|t| t.from).collect();
        assert_eq!(
            roles,
            vec![
                TurnRole::Human,
                TurnRole::Gpt,
                TurnRole::FunctionCall,
                TurnRole::Observation,
                TurnRole::Gpt,
            ]
        );

        let call: Value = serde_json::from_str(&conv.conversations[2].value).unwrap();
        assert_eq!(call["function"]["name"], "search");
        assert_eq!(call["function"]["arguments"], "{\"q\":\"x\"}");
    }

    #[test]
    fn test_role_normalization_flags_pasted_reply() {
        let long_reply = format!("### Heading\n\n**Bold**\n{}", "x".repeat(600));
        let body = chat_body(json!([
            {"role": "user", "content": "Q?"},
            {"role": "user", "content": long_reply}
        ]));
        let conv = normalize(AuthType::OpenAi, &body, "", &[]).unwrap();

        assert_eq!(conv.conversations[1].from, TurnRole::Gpt);
        assert_eq!(conv.conversations[1].normalized_role, Some(true));
        assert_eq!(conv.flags.as_deref(), Some(&["normalized_roles".to_string()][..]));
        assert!(conv.raw_request.is_some());
    }

    #[test]
    fn test_marker_extraction_with_trailing_text() {
        let text = "Let me look.\n[ANTHROPIC_TOOL_CALLS: [{\"id\":\"t1\",\"type\":\"function\",\"function\":{\"name\":\"lookup\",\"arguments\":\"{\\\"q\\\":\\\"x\\\"}\"}}]]";
        let (calls, rest) = extract_tool_call_marker(text).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["function"]["name"], "lookup");
        assert_eq!(rest.trim(), "Let me look.");
    }

    #[test]
    fn test_function_call_only_response() {
        let body = chat_body(json!([{"role": "user", "content": "run the tool"}]));
        let call = json!({
            "id": "t1",
            "type": "function",
            "function": {"name": "lookup", "arguments": "{\"q\":\"x\"}"}
        });
        let conv = normalize(AuthType::Anthropic, &body, "", std::slice::from_ref(&call)).unwrap();

        assert!(conv.is_function_call_only());
        let last = conv.conversations.last().unwrap();
        assert_eq!(last.from, TurnRole::FunctionCall);
        let parsed: Value = serde_json::from_str(&last.value).unwrap();
        assert_eq!(parsed, call);
    }

    #[test]
    fn test_trailing_gpt_turn_not_function_call_only() {
        let body = chat_body(json!([{"role": "user", "content": "hi"}]));
        let conv = normalize(AuthType::OpenAi, &body, "hello", &[]).unwrap();
        assert!(!conv.is_function_call_only());
    }

    #[test]
    fn test_google_archive_extraction() {
        let body = json!({
            "systemInstruction": {"parts": [{"text": "Be terse."}]},
            "contents": [
                {"role": "user", "parts": [{"text": "first"}, {"text": "second"}]},
                {"role": "model", "parts": [{"text": "reply"}]},
                {"role": "system", "parts": [{"text": "extra instruction"}]}
            ]
        });
        let conv = normalize(AuthType::Google, &body, "answer", &[]).unwrap();

        // systemInstruction and role=system contents both fold in, newline-joined
        assert_eq!(conv.system, "Be terse.\nextra instruction");
        assert_eq!(conv.conversations[0].from, TurnRole::Human);
        assert_eq!(conv.conversations[0].value, "first\nsecond");
        assert_eq!(conv.conversations[1].from, TurnRole::Gpt);
    }

    #[test]
    fn test_tools_field_variants() {
        let with_array = json!({
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"name": "f"}}]
        });
        let conv = normalize(AuthType::OpenAi, &with_array, "ok", &[]).unwrap();
        let parsed: Value = serde_json::from_str(&conv.tools).unwrap();
        assert_eq!(parsed[0]["function"]["name"], "f");

        let with_string = json!({
            "messages": [{"role": "user", "content": "hi"}],
            "tools": "[{\"type\":\"function\"}]"
        });
        let conv = normalize(AuthType::OpenAi, &with_string, "ok", &[]).unwrap();
        assert_eq!(conv.tools, "[{\"type\":\"function\"}]");

        let without = chat_body(json!([{"role": "user", "content": "hi"}]));
        let conv = normalize(AuthType::OpenAi, &without, "ok", &[]).unwrap();
        assert_eq!(conv.tools, "[]");
    }

    #[test]
    fn test_normalizer_idempotent_on_sharegpt_shaped_input() {
        let body = chat_body(json!([
            {"role": "user", "content": "What is two plus two?"},
            {"role": "user", "content": "Why though?"}
        ]));
        let first = normalize(AuthType::OpenAi, &body, "Four.", &[]).unwrap();

        // Feed the conversation back as the archive-message list
        let replay: Vec<Value> = first
            .conversations
            .iter()
            .map(|t| {
                json!({
                    "role": match t.from {
                        TurnRole::Human => "human",
                        TurnRole::Gpt => "gpt",
                        TurnRole::FunctionCall => "function_call",
                        TurnRole::Observation => "observation",
                        TurnRole::System => "system",
                    },
                    "content": t.value,
                })
            })
            .collect();
        let replay_body = json!({"messages": replay, "system": first.system});
        let second = normalize(AuthType::OpenAi, &replay_body, "", &[]).unwrap();

        let strip = |c: &Conversation| {
            c.conversations
                .iter()
                .map(|t| (t.from, t.value.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(&first), strip(&second));
        assert_eq!(first.system, second.system);
    }

    #[test]
    fn test_openai_tool_calls_on_message() {
        let body = chat_body(json!([
            {"role": "user", "content": "weather?"},
            {"role": "assistant", "content": null, "tool_calls": [
                {"id": "c1", "type": "function",
                 "function": {"name": "get_weather", "arguments": "{\"city\":\"London\"}"}}
            ]},
            {"role": "tool", "content": "12C, rain"}
        ]));
        let conv = normalize(AuthType::OpenAi, &body, "It rains.", &[]).unwrap();

        let roles: Vec<TurnRole> = conv.conversations.iter().map(|t| t.from).collect();
        assert_eq!(
            roles,
            vec![
                TurnRole::Human,
                TurnRole::FunctionCall,
                TurnRole::Observation,
                TurnRole::Gpt,
            ]
        );
    }
}

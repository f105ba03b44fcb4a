//! Structural validation of Harmony documents
//!
//! Inbound payloads (task requests, model replies) arrive as JSON and are
//! checked here before they become typed values. Typed values built inside
//! the engine only need the range and name checks.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;

use sdk::harmony::{Content, GenerationSettings, Message, Role, ToolSpec};

use super::{HarmonyError, Result};

static TOOL_NAME: OnceLock<Option<Regex>> = OnceLock::new();

/// Whether `name` is a legal tool name (`[A-Za-z0-9_.-]`, 1 to 64 chars)
pub fn is_valid_tool_name(name: &str) -> bool {
    TOOL_NAME
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,64}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

fn invalid(msg: impl Into<String>) -> HarmonyError {
    HarmonyError::Validation(msg.into())
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| invalid(format!("{} must be a JSON object", what)))
}

fn reject_unknown(obj: &Map<String, Value>, allowed: &[&str], what: &str) -> Result<()> {
    match obj.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(invalid(format!("unknown field '{}' in {}", key, what))),
        None => Ok(()),
    }
}

fn require_str<'a>(obj: &'a Map<String, Value>, field: &str, what: &str) -> Result<&'a str> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(invalid(format!("{}.{} must be a string", what, field))),
        None => Err(invalid(format!("{} is missing '{}'", what, field))),
    }
}

fn optional_str<'a>(obj: &'a Map<String, Value>, field: &str, what: &str) -> Result<Option<&'a str>> {
    match obj.get(field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(invalid(format!("{}.{} must be a string", what, field))),
    }
}

/// Validate one content block and convert it.
pub fn validate_content(value: &Value) -> Result<Content> {
    let obj = as_object(value, "content block")?;
    let kind = require_str(obj, "type", "content block")?;

    match kind {
        "text" => {
            reject_unknown(obj, &["type", "text"], "text block")?;
            require_str(obj, "text", "text block")?;
        }
        "image_reference" => {
            reject_unknown(obj, &["type", "url", "mime_type"], "image_reference block")?;
            let url = require_str(obj, "url", "image_reference block")?;
            if url.is_empty() {
                return Err(invalid("image_reference.url must not be empty"));
            }
            optional_str(obj, "mime_type", "image_reference block")?;
        }
        "tool_call" => {
            reject_unknown(obj, &["type", "id", "name", "arguments"], "tool_call block")?;
            let id = require_str(obj, "id", "tool_call block")?;
            if id.is_empty() {
                return Err(invalid("tool_call.id must not be empty"));
            }
            let name = require_str(obj, "name", "tool_call block")?;
            if !is_valid_tool_name(name) {
                return Err(invalid(format!("invalid tool name '{}'", name)));
            }
            match obj.get("arguments") {
                None | Some(Value::Object(_)) => {}
                Some(_) => return Err(invalid("tool_call.arguments must be an object")),
            }
        }
        "tool_result" => {
            reject_unknown(
                obj,
                &["type", "tool_call_id", "result", "error"],
                "tool_result block",
            )?;
            require_str(obj, "tool_call_id", "tool_result block")?;
            let has_result = obj.contains_key("result");
            let has_error = obj.get("error").is_some_and(|e| !e.is_null());
            if has_result == has_error {
                return Err(invalid(
                    "tool_result must carry exactly one of 'result' or 'error'",
                ));
            }
            if let Some(error) = obj.get("error").filter(|e| !e.is_null()) {
                let err = as_object(error, "tool_result.error")?;
                reject_unknown(err, &["kind", "message"], "tool_result.error")?;
                require_str(err, "kind", "tool_result.error")?;
                require_str(err, "message", "tool_result.error")?;
            }
        }
        "error" => {
            reject_unknown(obj, &["type", "message", "kind"], "error block")?;
            require_str(obj, "message", "error block")?;
            optional_str(obj, "kind", "error block")?;
        }
        other => return Err(invalid(format!("unknown content type '{}'", other))),
    }

    let block: Content = serde_json::from_value(value.clone())
        .map_err(|e| invalid(format!("malformed {} block: {}", kind, e)))?;

    // An explicit `"result": null` is a result, not a missing one
    Ok(match block {
        Content::ToolResult(mut result) if result.result.is_none() && result.error.is_none() => {
            result.result = Some(Value::Null);
            Content::ToolResult(result)
        }
        other => other,
    })
}

/// Validate a message and convert it.
///
/// `id` and `timestamp` are optional on input and assigned when missing.
/// `tool_call` blocks are only legal in assistant messages and
/// `tool_result` blocks only in tool messages.
pub fn validate_message(value: &Value) -> Result<Message> {
    let obj = as_object(value, "message")?;
    reject_unknown(obj, &["id", "role", "content", "timestamp"], "message")?;

    let role: Role = match obj.get("role") {
        Some(role) => serde_json::from_value(role.clone())
            .map_err(|_| invalid(format!("invalid role {}", role)))?,
        None => return Err(invalid("message is missing 'role'")),
    };

    let blocks = match obj.get("content") {
        Some(Value::Array(blocks)) => blocks,
        Some(_) => return Err(invalid("message.content must be an array")),
        None => return Err(invalid("message is missing 'content'")),
    };

    let mut content = Vec::with_capacity(blocks.len());
    for block in blocks {
        let block = validate_content(block)?;
        match (&block, role) {
            (Content::ToolCall(_), Role::User | Role::Tool) => {
                return Err(invalid(format!("tool_call block in a {} message", role)));
            }
            (Content::ToolResult(_), Role::User | Role::Assistant) => {
                return Err(invalid(format!("tool_result block in a {} message", role)));
            }
            _ => {}
        }
        content.push(block);
    }

    let mut message = Message::new(role, content);

    if let Some(id) = optional_str(obj, "id", "message")? {
        if id.is_empty() {
            return Err(invalid("message.id must not be empty"));
        }
        message.id = id.to_string();
    }

    if let Some(ts) = optional_str(obj, "timestamp", "message")? {
        message.timestamp = DateTime::parse_from_rfc3339(ts)
            .map_err(|e| invalid(format!("invalid timestamp '{}': {}", ts, e)))?
            .with_timezone(&Utc);
    }

    Ok(message)
}

/// Validate an ordered conversation.
///
/// Every `tool_result` must answer a `tool_call` that appears earlier.
pub fn validate_conversation(value: &Value) -> Result<Vec<Message>> {
    let items = value
        .as_array()
        .ok_or_else(|| invalid("conversation must be an array of messages"))?;
    if items.is_empty() {
        return Err(invalid("conversation must not be empty"));
    }

    let messages = items
        .iter()
        .map(validate_message)
        .collect::<Result<Vec<_>>>()?;

    check_tool_correlation(&messages)?;
    Ok(messages)
}

/// Tool call ids are unique within one message
pub fn check_unique_tool_call_ids(message: &Message) -> Result<()> {
    let mut ids: HashSet<&str> = HashSet::new();
    for block in &message.content {
        if let Content::ToolCall(call) = block {
            if !ids.insert(call.id.as_str()) {
                return Err(invalid(format!(
                    "duplicate tool_call id '{}' in one turn",
                    call.id
                )));
            }
        }
    }
    Ok(())
}

/// Every tool result refers to an earlier tool call, and no turn repeats
/// a tool call id
pub fn check_tool_correlation(messages: &[Message]) -> Result<()> {
    let mut seen_calls: HashSet<&str> = HashSet::new();
    for message in messages {
        check_unique_tool_call_ids(message)?;
        for block in &message.content {
            match block {
                Content::ToolCall(call) => {
                    seen_calls.insert(call.id.as_str());
                }
                Content::ToolResult(result) => {
                    if !seen_calls.contains(result.tool_call_id.as_str()) {
                        return Err(invalid(format!(
                            "tool_result '{}' does not answer any earlier tool_call",
                            result.tool_call_id
                        )));
                    }
                }
                Content::Text { .. } | Content::ImageReference { .. } | Content::Error { .. } => {}
            }
        }
    }
    Ok(())
}

const SETTINGS_FIELDS: &[&str] = &[
    "model",
    "temperature",
    "top_p",
    "top_k",
    "max_tokens",
    "presence_penalty",
    "frequency_penalty",
    "seed",
];

/// Parse generation settings from JSON, rejecting unknown fields.
///
/// An absent `model` is allowed here so the value can act as an override
/// layered on an endpoint's defaults.
pub fn parse_settings(value: &Value) -> Result<GenerationSettings> {
    let obj = as_object(value, "settings")?;
    reject_unknown(obj, SETTINGS_FIELDS, "settings")?;

    let mut obj = obj.clone();
    obj.entry("model").or_insert_with(|| Value::String(String::new()));
    let settings: GenerationSettings = serde_json::from_value(Value::Object(obj))
        .map_err(|e| invalid(format!("malformed settings: {}", e)))?;

    validate_setting_ranges(&settings)?;
    Ok(settings)
}

/// Validate settings for a generation call: model is required and every
/// numeric field must be in range.
pub fn validate_settings(settings: &GenerationSettings) -> Result<()> {
    if settings.model.trim().is_empty() {
        return Err(invalid("settings.model is required"));
    }
    validate_setting_ranges(settings)
}

/// Range checks only; `model` may be empty (settings overrides).
pub fn validate_setting_ranges(s: &GenerationSettings) -> Result<()> {
    if let Some(t) = s.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(invalid(format!("temperature {} outside [0, 2]", t)));
        }
    }
    if let Some(p) = s.top_p {
        if !(p > 0.0 && p <= 1.0) {
            return Err(invalid(format!("top_p {} outside (0, 1]", p)));
        }
    }
    if s.top_k == Some(0) {
        return Err(invalid("top_k must be at least 1"));
    }
    if s.max_tokens == Some(0) {
        return Err(invalid("max_tokens must be at least 1"));
    }
    for (name, value) in [
        ("presence_penalty", s.presence_penalty),
        ("frequency_penalty", s.frequency_penalty),
    ] {
        if let Some(v) = value {
            if !(-2.0..=2.0).contains(&v) {
                return Err(invalid(format!("{} {} outside [-2, 2]", name, v)));
            }
        }
    }
    Ok(())
}

/// Validate the tool list sent with a generation call.
pub fn validate_tools(tools: &[ToolSpec]) -> Result<()> {
    let mut names = HashSet::new();
    for tool in tools {
        if !is_valid_tool_name(&tool.name) {
            return Err(invalid(format!("invalid tool name '{}'", tool.name)));
        }
        if !names.insert(tool.name.as_str()) {
            return Err(invalid(format!("duplicate tool '{}'", tool.name)));
        }
        if !tool.parameters.is_object() {
            return Err(invalid(format!(
                "tool '{}' parameters must be a JSON schema object",
                tool.name
            )));
        }
    }
    Ok(())
}

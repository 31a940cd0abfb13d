//! Structured trailer the model appends to mission-tick replies.
//!
//! The contract asks for a final line `MISSION_META: {...}`. Replies are
//! free-form text from an external model, so every field is validated
//! structurally and a reply that carries no usable block is a miss, never an
//! error.

use ap_core::mission::MissionStatus;
use serde_json::{Map, Value};

use crate::commands::object_line;

pub const MISSION_META_MARKER: &str = "MISSION_META:";
pub const NO_ACTION_SENTINEL: &str = "NO_ACTION_NEEDED";

/// Keys that identify a line as a meta block during fallback scanning.
const EXPECTED_KEYS: &[&str] = &[
    "status",
    "summary",
    "next_action",
    "follow_up",
    "delay_sec",
    "goal",
    "consume_event_ids",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissionMeta {
    pub status: Option<MissionStatus>,
    pub summary: Option<String>,
    pub next_action: Option<String>,
    pub follow_up: bool,
    /// Raw request, unclamped.
    pub delay_sec: Option<i64>,
    pub goal: Option<String>,
    pub consume_event_ids: Vec<String>,
}

/// Whether the whole reply is the "no action needed" sentinel.
pub fn is_no_action_sentinel(reply: &str) -> bool {
    let normalized = reply
        .trim()
        .trim_matches(|c: char| c == '`' || c == '"' || c == '.' || c == '!')
        .trim()
        .to_ascii_uppercase()
        .replace(' ', "_");
    normalized == NO_ACTION_SENTINEL
}

/// Parse the meta block from a reply.
///
/// When the marker is present only the marker line is considered. Without
/// it, single-line JSON objects carrying at least one expected key are tried
/// from the bottom up.
pub fn parse_mission_meta(reply: &str) -> Option<MissionMeta> {
    if let Some(line) = reply.lines().rev().find(|l| l.contains(MISSION_META_MARKER)) {
        let payload = line
            .split_once(MISSION_META_MARKER)
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        return object_line(payload).and_then(parse_object);
    }

    reply
        .lines()
        .rev()
        .filter_map(object_line)
        .filter(|candidate| {
            EXPECTED_KEYS
                .iter()
                .any(|key| candidate.contains(&format!("\"{key}\"")))
        })
        .find_map(parse_object)
}

/// The reply with any marker line removed, for display.
pub fn strip_meta_line(reply: &str) -> String {
    reply
        .lines()
        .filter(|l| !l.contains(MISSION_META_MARKER))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn parse_object(candidate: &str) -> Option<MissionMeta> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let obj = value.as_object()?;
    if !EXPECTED_KEYS.iter().any(|k| obj.contains_key(*k)) {
        return None;
    }
    Some(MissionMeta {
        status: string_field(obj, "status").and_then(|s| MissionStatus::parse(&s)),
        summary: string_field(obj, "summary"),
        next_action: string_field(obj, "next_action"),
        follow_up: obj.get("follow_up").map(truthy).unwrap_or(false),
        delay_sec: obj.get("delay_sec").and_then(integer),
        goal: string_field(obj, "goal"),
        consume_event_ids: obj
            .get("consume_event_ids")
            .map(string_list)
            .unwrap_or_default(),
    })
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Mission-loop state carried by persistent sessions.
//!
//! All mutation goes through [`MissionLoopState::apply`], which normalizes
//! the stored value (TTL pruning, bounding, counter clamping), applies a
//! [`MissionLoopPatch`] and normalizes again.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MissionConfig;

pub const GOAL_MAX_CHARS: usize = 500;
pub const SUMMARY_MAX_CHARS: usize = 600;
pub const NEXT_ACTION_MAX_CHARS: usize = 300;
pub const EVENT_TEXT_MAX_CHARS: usize = 240;
/// Upper bound for both loop counters.
pub const COUNTER_CAP: u32 = 100;
/// Identical adjacent events inside this window collapse into one.
pub const EVENT_DEDUPE_WINDOW_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    #[default]
    Idle,
    Progress,
    Blocked,
    Ok,
}

impl MissionStatus {
    /// Lenient parse used for model-provided values.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "progress" | "in_progress" | "in-progress" | "working" => Some(Self::Progress),
            "blocked" => Some(Self::Blocked),
            "ok" | "done" | "complete" | "completed" => Some(Self::Ok),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Progress => "progress",
            Self::Blocked => "blocked",
            Self::Ok => "ok",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    #[default]
    Assist,
    Autonomous,
}

impl AutonomyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assist => "assist",
            Self::Autonomous => "autonomous",
        }
    }
}

// ---------------------------------------------------------------------------
// MissionEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Event to append; id and timestamp are assigned on apply.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub kind: String,
    pub text: String,
}

impl NewEvent {
    pub fn new(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            text: text.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct MissionLimits {
    pub pending_event_limit: usize,
    pub event_ttl: Duration,
}

impl Default for MissionLimits {
    fn default() -> Self {
        Self {
            pending_event_limit: 40,
            event_ttl: Duration::days(7),
        }
    }
}

impl From<&MissionConfig> for MissionLimits {
    fn from(cfg: &MissionConfig) -> Self {
        Self {
            pending_event_limit: cfg.pending_event_limit,
            event_ttl: Duration::days(cfg.event_ttl_days),
        }
    }
}

// ---------------------------------------------------------------------------
// MissionLoopPatch
// ---------------------------------------------------------------------------

/// Change to one of the loop counters, resolved against the stored value
/// when the patch is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUpdate {
    Reset,
    Set(u32),
    Increment,
}

impl CounterUpdate {
    pub fn resolve(self, current: u32) -> u32 {
        match self {
            Self::Reset => 0,
            Self::Set(value) => value,
            Self::Increment => current.saturating_add(1),
        }
    }
}

/// Partial update. `None` leaves a field untouched; for nullable fields
/// `Some(None)` clears the value.
#[derive(Debug, Clone, Default)]
pub struct MissionLoopPatch {
    pub goal: Option<Option<String>>,
    pub status: Option<MissionStatus>,
    /// Move `Idle` to `Progress`; any other stored status is kept.
    pub promote_idle: bool,
    pub summary: Option<Option<String>>,
    pub next_action: Option<Option<String>>,
    pub paused: Option<bool>,
    pub autonomy_mode: Option<AutonomyMode>,
    /// Applied before `consume_event_ids` and `push_events`.
    pub clear_events: bool,
    pub consume_event_ids: Vec<String>,
    pub push_events: Vec<NewEvent>,
    pub followup_chain: Option<CounterUpdate>,
    pub meta_miss: Option<CounterUpdate>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl MissionLoopPatch {
    pub fn event(mut self, kind: impl Into<String>, text: impl Into<String>) -> Self {
        self.push_events.push(NewEvent::new(kind, text));
        self
    }
}

// ---------------------------------------------------------------------------
// MissionLoopState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionLoopState {
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub status: MissionStatus,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub next_action: Option<String>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub autonomy_mode: AutonomyMode,
    #[serde(default)]
    pub pending_events: Vec<MissionEvent>,
    #[serde(default)]
    pub followup_chain_count: u32,
    #[serde(default)]
    pub meta_miss_count: u32,
    #[serde(default)]
    pub last_tick_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl MissionLoopState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            goal: None,
            status: MissionStatus::Idle,
            summary: None,
            next_action: None,
            paused: false,
            autonomy_mode: AutonomyMode::Assist,
            pending_events: Vec::new(),
            followup_chain_count: 0,
            meta_miss_count: 0,
            last_tick_at: None,
            updated_at: now,
        }
    }

    /// Drop expired events, bound the list (oldest first), cap text fields
    /// and clamp counters. Idempotent.
    pub fn normalize(&mut self, limits: &MissionLimits, now: DateTime<Utc>) {
        let cutoff = now - limits.event_ttl;
        self.pending_events.retain(|e| e.created_at >= cutoff);
        if self.pending_events.len() > limits.pending_event_limit {
            let excess = self.pending_events.len() - limits.pending_event_limit;
            self.pending_events.drain(..excess);
        }
        for event in &mut self.pending_events {
            event.text = clip_single_line(&event.text, EVENT_TEXT_MAX_CHARS);
        }
        self.goal = non_empty(self.goal.take().map(|g| truncate_chars(g.trim(), GOAL_MAX_CHARS)));
        self.summary = non_empty(
            self.summary
                .take()
                .map(|s| clip_single_line(&s, SUMMARY_MAX_CHARS)),
        );
        self.next_action = non_empty(
            self.next_action
                .take()
                .map(|s| clip_single_line(&s, NEXT_ACTION_MAX_CHARS)),
        );
        self.followup_chain_count = self.followup_chain_count.min(COUNTER_CAP);
        self.meta_miss_count = self.meta_miss_count.min(COUNTER_CAP);
    }

    /// The single mutation path: normalize, patch, normalize.
    pub fn apply(&mut self, patch: MissionLoopPatch, limits: &MissionLimits, now: DateTime<Utc>) {
        self.normalize(limits, now);

        if let Some(goal) = patch.goal {
            self.goal = goal;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if patch.promote_idle && self.status == MissionStatus::Idle {
            self.status = MissionStatus::Progress;
        }
        if let Some(summary) = patch.summary {
            self.summary = summary;
        }
        if let Some(next_action) = patch.next_action {
            self.next_action = next_action;
        }
        if let Some(paused) = patch.paused {
            self.paused = paused;
        }
        if let Some(mode) = patch.autonomy_mode {
            self.autonomy_mode = mode;
        }
        if patch.clear_events {
            self.pending_events.clear();
        }
        if !patch.consume_event_ids.is_empty() {
            self.pending_events
                .retain(|e| !patch.consume_event_ids.contains(&e.id));
        }
        for event in patch.push_events {
            self.push_event(event, now);
        }
        if let Some(update) = patch.followup_chain {
            self.followup_chain_count = update.resolve(self.followup_chain_count);
        }
        if let Some(update) = patch.meta_miss {
            self.meta_miss_count = update.resolve(self.meta_miss_count);
        }
        if let Some(at) = patch.last_tick_at {
            self.last_tick_at = Some(at);
        }

        self.updated_at = now;
        self.normalize(limits, now);
    }

    /// Append unless it repeats the newest event within the dedupe window.
    fn push_event(&mut self, event: NewEvent, now: DateTime<Utc>) {
        let text = clip_single_line(&event.text, EVENT_TEXT_MAX_CHARS);
        let kind = event.kind.trim().to_string();
        if let Some(last) = self.pending_events.last() {
            let recent = now - last.created_at < Duration::seconds(EVENT_DEDUPE_WINDOW_SECS);
            if recent && last.kind == kind && last.text == text {
                return;
            }
        }
        self.pending_events.push(MissionEvent {
            id: Uuid::new_v4().to_string(),
            kind,
            text,
            created_at: now,
        });
    }
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// Truncate to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(1);
    let mut out: String = text.chars().take(keep).collect();
    out.push('…');
    out
}

/// Collapse all whitespace runs (newlines included) to single spaces, then truncate.
pub fn clip_single_line(text: &str, max: usize) -> String {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&joined, max)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Per-session mission loop.
//!
//! Keeps a persistent session moving toward its goal. User messages set the
//! goal; internal ticks ask the model for the next step, fold the reply's
//! meta block into the session's [`MissionLoopState`] and may request one
//! follow-up tick. Every mutation goes through
//! [`SessionStore::update_mission_loop`].

use std::sync::Arc;

use ap_core::config::MissionConfig;
use ap_core::mission::{
    truncate_chars, AutonomyMode, CounterUpdate, MissionLoopPatch, MissionLoopState,
    MissionStatus, GOAL_MAX_CHARS,
};
use ap_core::session_store::SessionStore;
use ap_core::storage::{load_record, StorageError};
use ap_core::types::{collections, AgentProfile, TranscriptRole};
use ap_intelligence::{LlmConfig, LlmMessage, LlmProvider};
use ap_telemetry::tracing_setup::create_operation_span;
use chrono::Utc;
use tracing::{debug, error, info, warn, Instrument};

use crate::followup::{FollowupRequest, MISSION_TICK_MARKER};
use crate::mission_meta::{is_no_action_sentinel, parse_mission_meta, strip_meta_line};
use crate::prompts::{build_mission_system_prompt, build_mission_tick_prompt, TickPromptLimits};

/// Probe text sent by heartbeat schedules.
pub const HEARTBEAT_PROBE: &str = "[heartbeat]";

/// Delay used when a meta block asks for a follow-up without `delay_sec`.
pub const DEFAULT_FOLLOWUP_DELAY_SECS: i64 = 60;

const ACKNOWLEDGEMENTS: &[&str] = &[
    "ok", "okay", "k", "thanks", "thank you", "thx", "ty", "got it", "cool", "nice",
];

// ---------------------------------------------------------------------------
// Message classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Empty,
    InternalTick,
    HeartbeatProbe,
    Acknowledgement,
    /// Anything else: a real instruction that becomes the goal.
    Instruction,
}

pub fn classify_message(text: &str) -> MessageKind {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return MessageKind::Empty;
    }
    if trimmed.starts_with(MISSION_TICK_MARKER) {
        return MessageKind::InternalTick;
    }
    if trimmed.starts_with(HEARTBEAT_PROBE) {
        return MessageKind::HeartbeatProbe;
    }
    let bare = trimmed
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_lowercase();
    if ACKNOWLEDGEMENTS.contains(&bare.as_str()) {
        return MessageKind::Acknowledgement;
    }
    MessageKind::Instruction
}

// ---------------------------------------------------------------------------
// Controls
// ---------------------------------------------------------------------------

/// Operator controls, each a patch through the normal mutation path.
#[derive(Debug, Clone, PartialEq)]
pub enum MissionControl {
    Pause,
    Resume,
    SetGoal(Option<String>),
    SetMode(AutonomyMode),
    ClearEvents,
    Nudge(Option<String>),
}

impl MissionControl {
    pub fn to_patch(&self) -> MissionLoopPatch {
        match self {
            MissionControl::Pause => MissionLoopPatch {
                paused: Some(true),
                ..Default::default()
            },
            MissionControl::Resume => MissionLoopPatch {
                paused: Some(false),
                followup_chain: Some(CounterUpdate::Reset),
                ..Default::default()
            },
            MissionControl::SetGoal(goal) => {
                let goal = goal
                    .as_deref()
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(|g| truncate_chars(g, GOAL_MAX_CHARS));
                let mut patch = MissionLoopPatch {
                    status: goal.as_ref().map(|_| MissionStatus::Progress),
                    followup_chain: Some(CounterUpdate::Reset),
                    ..Default::default()
                };
                if let Some(text) = &goal {
                    patch = patch.event("goal_set", text);
                }
                patch.goal = Some(goal);
                patch
            }
            MissionControl::SetMode(mode) => MissionLoopPatch {
                autonomy_mode: Some(*mode),
                ..Default::default()
            },
            MissionControl::ClearEvents => MissionLoopPatch {
                clear_events: true,
                ..Default::default()
            },
            MissionControl::Nudge(text) => {
                let text = text
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .unwrap_or("manual nudge");
                MissionLoopPatch {
                    promote_idle: true,
                    ..Default::default()
                }
                .event("nudge", text)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tick outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    /// Session paused; nothing changed.
    Paused,
    ProviderError,
    NoAction,
    Meta,
    MetaMissing,
    EmptyReply,
}

#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub kind: TickKind,
    pub state: MissionLoopState,
    pub followup: Option<FollowupRequest>,
    /// The reply with the meta line removed.
    pub reply: Option<String>,
}

/// A tick's changes, resolved against the stored state at commit.
struct TickUpdate {
    patch: MissionLoopPatch,
    /// Clamped delay, when the reply asked for a follow-up.
    followup_delay: Option<u64>,
    /// Goal the tick prompt was built from.
    prompt_goal: Option<String>,
}

impl TickUpdate {
    fn new(patch: MissionLoopPatch, prompted: &MissionLoopState) -> Self {
        Self {
            patch,
            followup_delay: None,
            prompt_goal: prompted.goal.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// MissionLoopEngine
// ---------------------------------------------------------------------------

pub struct MissionLoopEngine {
    sessions: Arc<SessionStore>,
    provider: Arc<dyn LlmProvider>,
    llm: LlmConfig,
    config: MissionConfig,
}

impl MissionLoopEngine {
    pub fn new(
        sessions: Arc<SessionStore>,
        provider: Arc<dyn LlmProvider>,
        llm: LlmConfig,
        config: MissionConfig,
    ) -> Self {
        Self {
            sessions,
            provider,
            llm,
            config,
        }
    }

    pub fn config(&self) -> &MissionConfig {
        &self.config
    }

    /// Fold a user message into the mission. Sentinels, acknowledgements and
    /// empty text leave the state alone and return `None`. Goals are updated
    /// even while paused; the pause itself is kept.
    pub async fn record_user_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<Option<MissionLoopState>, StorageError> {
        let kind = classify_message(text);
        if kind != MessageKind::Instruction {
            debug!(session_id, ?kind, "message does not change the mission");
            return Ok(None);
        }
        let goal = truncate_chars(text.trim(), GOAL_MAX_CHARS);
        let patch = MissionLoopPatch {
            goal: Some(Some(goal.clone())),
            status: Some(MissionStatus::Progress),
            followup_chain: Some(CounterUpdate::Reset),
            ..Default::default()
        }
        .event("user_instruction", goal);
        let state = self
            .sessions
            .update_mission_loop(session_id, patch, Utc::now())
            .await?;
        if state.is_some() {
            info!(session_id, "mission goal updated from user message");
        }
        Ok(state)
    }

    /// Apply an operator control.
    pub async fn control(
        &self,
        session_id: &str,
        control: MissionControl,
    ) -> Result<Option<MissionLoopState>, StorageError> {
        let state = self
            .sessions
            .update_mission_loop(session_id, control.to_patch(), Utc::now())
            .await?;
        if state.is_some() {
            info!(session_id, control = ?control, "mission control applied");
        }
        Ok(state)
    }

    /// Run one internal tick. Returns `None` only when the session does not
    /// exist or storage failed; every other failure is folded into state.
    pub async fn tick(&self, session_id: &str) -> Option<TickOutcome> {
        let (span, _) = create_operation_span("mission_loop", "tick");
        self.tick_inner(session_id).instrument(span).await
    }

    async fn tick_inner(&self, session_id: &str) -> Option<TickOutcome> {
        let state = match self.sessions.mission_loop(session_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                warn!(session_id, "mission tick for unknown session");
                return None;
            }
            Err(e) => {
                error!(session_id, error = %e, "failed to load mission state");
                return None;
            }
        };

        if state.paused {
            debug!(session_id, "mission paused, tick skipped");
            return Some(TickOutcome {
                kind: TickKind::Paused,
                state,
                followup: None,
                reply: None,
            });
        }

        let now = Utc::now();
        let prompt = build_mission_tick_prompt(
            &state,
            TickPromptLimits {
                events_shown: self.config.events_in_prompt,
                min_delay_secs: self.config.min_delay_secs,
                max_delay_secs: self.config.max_delay_secs,
            },
        );
        let llm = match self.persona(session_id).await {
            Some(system) => self.llm.clone().with_system_prompt(system),
            None => self.llm.clone(),
        };

        let reply = match self.provider.complete(&[LlmMessage::user(prompt)], &llm).await {
            Ok(response) => response.content,
            Err(e) => {
                warn!(session_id, error = %e, "mission tick model call failed");
                let patch = MissionLoopPatch {
                    status: Some(MissionStatus::Blocked),
                    last_tick_at: Some(now),
                    ..Default::default()
                }
                .event("run_error", e.to_string());
                let update = TickUpdate::new(patch, &state);
                return self
                    .commit(session_id, update, TickKind::ProviderError, None)
                    .await;
            }
        };

        let trimmed = reply.trim();
        let mut patch = MissionLoopPatch {
            last_tick_at: Some(now),
            ..Default::default()
        };
        let mut followup_delay = None;

        let kind = if is_no_action_sentinel(trimmed) {
            patch.meta_miss = Some(CounterUpdate::Reset);
            patch.followup_chain = Some(CounterUpdate::Reset);
            TickKind::NoAction
        } else if let Some(meta) = parse_mission_meta(trimmed) {
            patch.meta_miss = Some(CounterUpdate::Reset);
            if let Some(goal) = meta.goal {
                patch.goal = Some(Some(goal));
            }
            patch.status = meta.status;
            patch.summary = meta.summary.map(Some);
            patch.next_action = meta.next_action.map(Some);
            patch.consume_event_ids = meta.consume_event_ids;

            if meta.follow_up {
                followup_delay = Some(
                    self.config
                        .clamp_delay_secs(meta.delay_sec.unwrap_or(DEFAULT_FOLLOWUP_DELAY_SECS)),
                );
            } else {
                patch.followup_chain = Some(CounterUpdate::Reset);
            }
            TickKind::Meta
        } else if trimmed.is_empty() {
            TickKind::EmptyReply
        } else {
            patch.meta_miss = Some(CounterUpdate::Increment);
            patch.summary = Some(Some(trimmed.to_string()));
            patch.promote_idle = true;
            patch = patch.event("meta_missing", "reply carried no MISSION_META block");
            TickKind::MetaMissing
        };

        let visible = match kind {
            TickKind::Meta | TickKind::MetaMissing => Some(strip_meta_line(trimmed)),
            _ => None,
        }
        .filter(|text| !text.is_empty());
        if let Some(text) = &visible {
            if let Err(e) = self
                .sessions
                .append_transcript(session_id, TranscriptRole::Assistant, text)
                .await
            {
                warn!(session_id, error = %e, "failed to persist tick reply");
            }
        }

        let mut update = TickUpdate::new(patch, &state);
        update.followup_delay = followup_delay;
        self.commit(session_id, update, kind, visible).await
    }

    /// Persist the tick against the stored state as it is now, not as it was
    /// when the prompt was built. Counter changes are relative, and the
    /// follow-up is granted only if the stored chain still has room and the
    /// session is not paused.
    async fn commit(
        &self,
        session_id: &str,
        update: TickUpdate,
        kind: TickKind,
        reply: Option<String>,
    ) -> Option<TickOutcome> {
        let max_chain = self.config.max_followup_chain;
        let mut granted = false;
        let result = self
            .sessions
            .update_mission_loop_with(session_id, Utc::now(), |current| {
                let mut patch = update.patch;
                // A goal set while the model was thinking wins over the reply's goal.
                if current.goal != update.prompt_goal {
                    patch.goal = None;
                }
                if update.followup_delay.is_some() {
                    if current.paused {
                        debug!(session_id, "paused during tick, follow-up dropped");
                    } else if current.followup_chain_count < max_chain {
                        patch.followup_chain = Some(CounterUpdate::Increment);
                        granted = true;
                    } else {
                        info!(
                            session_id,
                            chain = current.followup_chain_count,
                            "follow-up chain limit reached"
                        );
                    }
                }
                patch
            })
            .await;

        match result {
            Ok(Some(state)) => {
                if kind == TickKind::MetaMissing
                    && state.meta_miss_count == self.config.meta_miss_warn_threshold
                {
                    warn!(
                        session_id,
                        misses = state.meta_miss_count,
                        "mission replies keep missing the meta block"
                    );
                }
                let followup = update
                    .followup_delay
                    .filter(|_| granted)
                    .map(|delay| FollowupRequest::mission_tick(session_id, delay));
                debug!(
                    session_id,
                    ?kind,
                    status = state.status.as_str(),
                    followup = followup.is_some(),
                    "mission tick committed"
                );
                Some(TickOutcome {
                    kind,
                    state,
                    followup,
                    reply,
                })
            }
            Ok(None) => {
                warn!(session_id, "session vanished during mission tick");
                None
            }
            Err(e) => {
                error!(session_id, error = %e, "failed to persist mission tick");
                None
            }
        }
    }

    /// Persona of the session's agent, if it can be loaded.
    async fn persona(&self, session_id: &str) -> Option<String> {
        let session = self.sessions.get(session_id).await.ok().flatten()?;
        let agent: AgentProfile = load_record(
            self.sessions.storage().as_ref(),
            collections::AGENTS,
            &session.agent_id,
        )
        .await
        .ok()
        .flatten()?;
        Some(build_mission_system_prompt(None, &agent, &[]))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ap_core::mission::MissionLimits;

    #[test]
    fn classify_sentinels_and_acks() {
        assert_eq!(classify_message("   "), MessageKind::Empty);
        assert_eq!(classify_message("[mission-tick]"), MessageKind::InternalTick);
        assert_eq!(classify_message("[heartbeat] ping"), MessageKind::HeartbeatProbe);
        assert_eq!(classify_message("Thanks!"), MessageKind::Acknowledgement);
        assert_eq!(classify_message("got it."), MessageKind::Acknowledgement);
        assert_eq!(classify_message("OK"), MessageKind::Acknowledgement);
        assert_eq!(
            classify_message("Build me a report on X"),
            MessageKind::Instruction
        );
        assert_eq!(classify_message("ok, now do Y"), MessageKind::Instruction);
    }

    #[test]
    fn nudge_promotes_only_idle() {
        let now = Utc::now();
        let limits = MissionLimits::default();
        let mut idle = MissionLoopState::new(now);
        let patch = MissionControl::Nudge(None).to_patch();
        assert_eq!(patch.push_events[0].kind, "nudge");
        assert_eq!(patch.push_events[0].text, "manual nudge");
        idle.apply(patch, &limits, now);
        assert_eq!(idle.status, MissionStatus::Progress);

        let mut blocked = MissionLoopState::new(now);
        blocked.status = MissionStatus::Blocked;
        let patch = MissionControl::Nudge(Some("look again".into())).to_patch();
        assert!(patch.status.is_none());
        assert_eq!(patch.push_events[0].text, "look again");
        blocked.apply(patch, &limits, now);
        assert_eq!(blocked.status, MissionStatus::Blocked);
    }

    #[test]
    fn set_goal_none_clears_without_status_change() {
        let patch = MissionControl::SetGoal(None).to_patch();
        assert_eq!(patch.goal, Some(None));
        assert!(patch.status.is_none());
        assert!(patch.push_events.is_empty());
    }

    #[test]
    fn resume_resets_chain() {
        let patch = MissionControl::Resume.to_patch();
        assert_eq!(patch.paused, Some(false));
        assert_eq!(patch.followup_chain, Some(CounterUpdate::Reset));
    }
}

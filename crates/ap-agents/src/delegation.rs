//! Turn-bounded delegation loop.
//!
//! One agent converses with the model, optionally handing sub-tasks to peer
//! agents and reading or writing long-term memory through single-line JSON
//! commands. Every exit path returns text; nothing here fails the caller.

use std::sync::Arc;
use std::time::Instant;

use ap_core::config::DelegationConfig;
use ap_core::mission::{truncate_chars, MissionLoopPatch};
use ap_core::session_store::SessionStore;
use ap_core::storage::{load_record, load_records};
use ap_core::types::{
    collections, AgentProfile, RunMode, Skill, TranscriptRole, UserPreferences, PREFERENCES_KEY,
};
use ap_intelligence::{LlmConfig, LlmMessage, LlmProvider, Memory, MemoryEntry};
use ap_telemetry::tracing_setup::{create_child_span, create_operation_span};
use chrono::Utc;
use tracing::{debug, error, info, warn, Instrument};

use crate::commands::{parse_commands, Command};
use crate::prompts::{
    build_delegation_system_prompt, build_peer_system_prompt, DelegationPromptContext,
};

/// Entries returned to the model for one `memory_read` command.
pub const MEMORY_READ_LIMIT: usize = 5;

pub fn max_turns_message(max_turns: u32) -> String {
    format!("stopped after reaching max turns ({max_turns})")
}

pub fn timeout_message(cap_secs: u64) -> String {
    format!("stopped after exceeding the runtime cap of {cap_secs} seconds")
}

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub agent_id: String,
    pub task: String,
    pub mode: RunMode,
    pub max_turns: Option<u32>,
    /// Session whose transcript receives replies, if any.
    pub session_id: Option<String>,
}

impl DelegationRequest {
    pub fn new(agent_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            task: task.into(),
            mode: RunMode::Task,
            max_turns: None,
            session_id: None,
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationExit {
    /// A `done` command ended the run.
    Done,
    /// A turn carried no commands; its reply is the result.
    NoCommands,
    MaxTurns,
    Timeout,
    ProviderError,
    AgentNotFound,
}

#[derive(Debug, Clone)]
pub struct DelegationOutcome {
    pub result: String,
    pub exit: DelegationExit,
    pub turns: u32,
}

// ---------------------------------------------------------------------------
// Conversation state
// ---------------------------------------------------------------------------

/// Lives for one `run` only.
struct DelegationConversation {
    history: Vec<LlmMessage>,
    turn: u32,
    started_at: Instant,
}

impl DelegationConversation {
    fn new(task: &str) -> Self {
        Self {
            history: vec![LlmMessage::user(task)],
            turn: 0,
            started_at: Instant::now(),
        }
    }

    fn finish(&self, result: impl Into<String>, exit: DelegationExit) -> DelegationOutcome {
        DelegationOutcome {
            result: result.into(),
            exit,
            turns: self.turn,
        }
    }
}

struct Observation {
    text: String,
    tool_error: bool,
}

impl Observation {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_error: false,
        }
    }

    fn tool_error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_error: true,
        }
    }

    fn as_message(&self) -> LlmMessage {
        let tag = if self.tool_error { "tool_error" } else { "observation" };
        LlmMessage::system(format!("[{tag}] {}", self.text))
    }
}

/// Per-run context shared by command handlers.
struct RunContext<'a> {
    trace_id: &'a str,
    agent: &'a AgentProfile,
    roster: &'a [AgentProfile],
    skills: &'a [Skill],
    preferences: Option<&'a str>,
    session_id: Option<&'a str>,
    persistent: bool,
}

// ---------------------------------------------------------------------------
// DelegationLoop
// ---------------------------------------------------------------------------

pub struct DelegationLoop {
    sessions: Arc<SessionStore>,
    provider: Arc<dyn LlmProvider>,
    memory: Arc<dyn Memory>,
    llm: LlmConfig,
    config: DelegationConfig,
}

impl DelegationLoop {
    pub fn new(
        sessions: Arc<SessionStore>,
        provider: Arc<dyn LlmProvider>,
        memory: Arc<dyn Memory>,
        llm: LlmConfig,
        config: DelegationConfig,
    ) -> Self {
        Self {
            sessions,
            provider,
            memory,
            llm,
            config,
        }
    }

    pub fn config(&self) -> &DelegationConfig {
        &self.config
    }

    pub async fn run(&self, request: DelegationRequest) -> DelegationOutcome {
        let (span, trace_id) = create_operation_span("delegation", &request.agent_id);
        self.run_inner(request, &trace_id).instrument(span).await
    }

    async fn run_inner(&self, request: DelegationRequest, trace_id: &str) -> DelegationOutcome {
        let session_id = request.session_id.as_deref();
        let mut convo = DelegationConversation::new(&request.task);

        let agents = self.load_agents().await;
        let Some(agent) = find_agent(&agents, &request.agent_id).cloned() else {
            let message = format!("agent {} not found", request.agent_id);
            warn!(agent_id = %request.agent_id, "delegation target missing");
            self.record(session_id, TranscriptRole::System, &message).await;
            return convo.finish(message, DelegationExit::AgentNotFound);
        };

        let preferences = self.load_preferences().await;
        let all_skills = self.load_skills().await;
        let skills = skills_for(&agent, &all_skills);
        let roster = roster_for(&agent, &agents);
        let memories = self.recall(&agent, &request.task).await;

        let system_prompt = build_delegation_system_prompt(&DelegationPromptContext {
            preferences: preferences.as_deref(),
            agent: &agent,
            skills: &skills,
            roster: &roster,
            memories: &memories,
            excerpt_chars: self.config.memory_excerpt_chars,
        });
        let llm = self.llm.clone().with_system_prompt(system_prompt);
        let max_turns = self.config.resolve_max_turns(request.max_turns);
        let runtime_cap = self.config.ongoing_runtime_cap();

        let persistent = match session_id {
            Some(id) => self
                .sessions
                .get(id)
                .await
                .ok()
                .flatten()
                .is_some_and(|s| s.persistent),
            None => false,
        };
        let ctx = RunContext {
            trace_id,
            agent: &agent,
            roster: &roster,
            skills: &all_skills,
            preferences: preferences.as_deref(),
            session_id,
            persistent,
        };

        info!(agent_id = %agent.id, max_turns, mode = ?request.mode, "delegation started");

        while convo.turn < max_turns {
            if request.mode == RunMode::Ongoing
                && convo.turn > 0
                && convo.started_at.elapsed() >= runtime_cap
            {
                let message = timeout_message(runtime_cap.as_secs());
                warn!(agent_id = %agent.id, turns = convo.turn, "runtime cap exceeded");
                self.record(session_id, TranscriptRole::System, &message).await;
                return convo.finish(message, DelegationExit::Timeout);
            }

            convo.turn += 1;
            let reply = match self.provider.complete(&convo.history, &llm).await {
                Ok(response) => response.content,
                Err(e) => {
                    let message = format!("model call failed: {e}");
                    error!(
                        agent_id = %agent.id,
                        turn = convo.turn,
                        error = %e,
                        "delegation model call failed"
                    );
                    self.record(session_id, TranscriptRole::System, &message).await;
                    return convo.finish(message, DelegationExit::ProviderError);
                }
            };
            convo.history.push(LlmMessage::assistant(reply.clone()));
            self.record(session_id, TranscriptRole::Assistant, &reply).await;

            let commands = parse_commands(&reply);
            debug!(turn = convo.turn, commands = commands.len(), "turn parsed");
            if commands.is_empty() {
                return convo.finish(reply, DelegationExit::NoCommands);
            }

            for command in commands {
                let observation = match command {
                    Command::Done { summary } => {
                        info!(agent_id = %agent.id, turns = convo.turn, "delegation done");
                        let result = summary.unwrap_or_else(|| reply.clone());
                        return convo.finish(result, DelegationExit::Done);
                    }
                    Command::Delegate { agent: target, task } => {
                        self.delegate(&ctx, &target, &task).await
                    }
                    Command::MemoryStore {
                        category,
                        title,
                        content,
                    } => self.memory_store(&ctx, category, title, content).await,
                    Command::MemoryRead { query } => self.memory_read(&ctx, &query).await,
                };
                self.observe(&ctx, &mut convo, observation).await;
            }
        }

        let message = max_turns_message(max_turns);
        info!(agent_id = %agent.id, max_turns, "delegation hit turn cap");
        self.record(session_id, TranscriptRole::System, &message).await;
        convo.finish(message, DelegationExit::MaxTurns)
    }

    // -- commands ------------------------------------------------------------

    async fn delegate(&self, ctx: &RunContext<'_>, target: &str, task: &str) -> Observation {
        let Some(peer) = find_agent(ctx.roster, target) else {
            let available: Vec<&str> = ctx.roster.iter().map(|a| a.name.as_str()).collect();
            let available = if available.is_empty() {
                "none".to_string()
            } else {
                available.join(", ")
            };
            debug!(agent = %target, "delegation to unknown agent");
            return Observation::ok(format!(
                "agent not found: {target}. available agents are: {available}"
            ));
        };

        let peer_skills = skills_for(peer, ctx.skills);
        let system = build_peer_system_prompt(ctx.preferences, peer, &peer_skills);
        let llm = self.llm.clone().with_system_prompt(system);
        let span = create_child_span(ctx.trace_id, "delegate");
        let result = self
            .provider
            .complete(&[LlmMessage::user(task)], &llm)
            .instrument(span)
            .await;

        match result {
            Ok(response) => {
                info!(from = %ctx.agent.id, to = %peer.id, "sub-task delegated");
                Observation::ok(format!(
                    "result from {}: {}",
                    peer.name,
                    response.content.trim()
                ))
            }
            Err(e) => {
                warn!(to = %peer.id, error = %e, "delegated sub-task failed");
                Observation::tool_error(format!("delegation to {} failed: {e}", peer.name))
            }
        }
    }

    async fn memory_store(
        &self,
        ctx: &RunContext<'_>,
        category: String,
        title: String,
        content: String,
    ) -> Observation {
        let entry = MemoryEntry::new(ctx.agent.id.clone(), category, title.clone(), content);
        match self.memory.add(entry).await {
            Ok(id) => {
                debug!(%id, "memory stored");
                Observation::ok(format!("memory stored: {title}"))
            }
            Err(e) => Observation::tool_error(format!("memory_store failed: {e}")),
        }
    }

    async fn memory_read(&self, ctx: &RunContext<'_>, query: &str) -> Observation {
        match self.memory.search(query, &ctx.agent.id).await {
            Ok(entries) if entries.is_empty() => {
                Observation::ok(format!("no memories matched \"{query}\""))
            }
            Ok(entries) => {
                let mut text = format!("memory results for \"{query}\":");
                for entry in entries.iter().take(MEMORY_READ_LIMIT) {
                    text.push_str(&format!(
                        "\n- [{}] {}: {}",
                        entry.category,
                        entry.title,
                        truncate_chars(&entry.content, self.config.memory_excerpt_chars)
                    ));
                }
                Observation::ok(text)
            }
            Err(e) => Observation::tool_error(format!("memory_read failed: {e}")),
        }
    }

    async fn observe(
        &self,
        ctx: &RunContext<'_>,
        convo: &mut DelegationConversation,
        observation: Observation,
    ) {
        if observation.tool_error {
            if let (Some(id), true) = (ctx.session_id, ctx.persistent) {
                let patch = MissionLoopPatch::default().event("tool_error", &observation.text);
                if let Err(e) = self.sessions.update_mission_loop(id, patch, Utc::now()).await {
                    warn!(session_id = %id, error = %e, "failed to record tool_error event");
                }
            }
        }
        convo.history.push(observation.as_message());
    }

    // -- loading -------------------------------------------------------------

    async fn record(&self, session_id: Option<&str>, role: TranscriptRole, text: &str) {
        let Some(id) = session_id else { return };
        if let Err(e) = self.sessions.append_transcript(id, role, text).await {
            warn!(session_id = %id, error = %e, "failed to persist transcript entry");
        }
    }

    async fn load_agents(&self) -> Vec<AgentProfile> {
        let storage = self.sessions.storage().as_ref();
        match load_records::<AgentProfile>(storage, collections::AGENTS).await {
            Ok(records) => records.into_iter().map(|(_, a)| a).collect(),
            Err(e) => {
                warn!(error = %e, "failed to load agents");
                Vec::new()
            }
        }
    }

    async fn load_skills(&self) -> Vec<Skill> {
        match load_records::<Skill>(self.sessions.storage().as_ref(), collections::SKILLS).await {
            Ok(records) => records.into_iter().map(|(_, s)| s).collect(),
            Err(e) => {
                warn!(error = %e, "failed to load skills");
                Vec::new()
            }
        }
    }

    async fn load_preferences(&self) -> Option<String> {
        let storage = self.sessions.storage().as_ref();
        let prefs = load_record::<UserPreferences>(storage, collections::SETTINGS, PREFERENCES_KEY);
        match prefs.await {
            Ok(prefs) => prefs.map(|p| p.text).filter(|t| !t.trim().is_empty()),
            Err(e) => {
                warn!(error = %e, "failed to load user preferences");
                None
            }
        }
    }

    async fn recall(&self, agent: &AgentProfile, task: &str) -> Vec<MemoryEntry> {
        if self.config.memory_excerpts == 0 {
            return Vec::new();
        }
        match self.memory.search(task, &agent.id).await {
            Ok(mut entries) => {
                entries.truncate(self.config.memory_excerpts);
                entries
            }
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "memory recall failed");
                Vec::new()
            }
        }
    }
}

/// Match by id, then by name ignoring case.
fn find_agent<'a>(agents: &'a [AgentProfile], key: &str) -> Option<&'a AgentProfile> {
    let key = key.trim();
    agents
        .iter()
        .find(|a| a.id == key)
        .or_else(|| agents.iter().find(|a| a.name.eq_ignore_ascii_case(key)))
}

fn skills_for(agent: &AgentProfile, skills: &[Skill]) -> Vec<Skill> {
    skills
        .iter()
        .filter(|s| agent.skills.iter().any(|k| *k == s.id || *k == s.name))
        .cloned()
        .collect()
}

/// Peers this agent may delegate to: its allow-list, or everyone else.
fn roster_for(agent: &AgentProfile, agents: &[AgentProfile]) -> Vec<AgentProfile> {
    agents
        .iter()
        .filter(|a| a.id != agent.id)
        .filter(|a| {
            agent.delegates.is_empty()
                || agent
                    .delegates
                    .iter()
                    .any(|d| *d == a.id || d.eq_ignore_ascii_case(&a.name))
        })
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn agents() -> Vec<AgentProfile> {
        let mut lead = AgentProfile::new("Lead");
        lead.delegates = vec!["writer".into()];
        vec![lead, AgentProfile::new("Writer"), AgentProfile::new("Researcher")]
    }

    #[test]
    fn find_agent_by_id_or_name() {
        let agents = agents();
        assert_eq!(find_agent(&agents, "writer").unwrap().name, "Writer");
        assert_eq!(find_agent(&agents, "RESEARCHER").unwrap().id, "researcher");
        assert!(find_agent(&agents, "ghost").is_none());
    }

    #[test]
    fn roster_honours_allow_list_and_excludes_self() {
        let agents = agents();
        let roster = roster_for(&agents[0], &agents);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].id, "writer");

        let open = roster_for(&agents[1], &agents);
        let ids: Vec<_> = open.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["lead", "researcher"]);
    }

    #[test]
    fn fixed_messages() {
        assert_eq!(max_turns_message(3), "stopped after reaching max turns (3)");
        assert_eq!(
            timeout_message(1800),
            "stopped after exceeding the runtime cap of 1800 seconds"
        );
    }
}

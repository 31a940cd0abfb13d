use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mission::MissionLoopState;

/// Collection names used with the storage collaborator.
pub mod collections {
    pub const SESSIONS: &str = "sessions";
    pub const AGENTS: &str = "agents";
    pub const SKILLS: &str = "skills";
    pub const TASKS: &str = "tasks";
    pub const SETTINGS: &str = "settings";
    /// Process-level records owned by the daemon (e.g. the stale-session set).
    pub const DAEMON: &str = "daemon";
}

/// Key of the global preferences record inside [`collections::SETTINGS`].
pub const PREFERENCES_KEY: &str = "preferences";

// ---------------------------------------------------------------------------
// RunMode
// ---------------------------------------------------------------------------

/// How a delegation run is bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Turn cap only.
    #[default]
    Task,
    /// Turn cap plus a wall-clock runtime cap checked between turns.
    Ongoing,
}

// ---------------------------------------------------------------------------
// HeartbeatSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interval_secs: u64,
}

impl HeartbeatSettings {
    pub fn monitored(&self) -> bool {
        self.enabled && self.interval_secs > 0
    }
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A conversation between a user and one agent. Persistent sessions carry a
/// mission loop and may be heartbeat-monitored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub mission_loop: Option<MissionLoopState>,
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            title: String::new(),
            persistent: false,
            heartbeat: HeartbeatSettings::default(),
            last_active_at: now,
            mission_loop: None,
            transcript: Vec::new(),
            created_at: now,
        }
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_heartbeat(mut self, interval_secs: u64) -> Self {
        self.heartbeat = HeartbeatSettings {
            enabled: true,
            interval_secs,
        };
        self
    }
}

// ---------------------------------------------------------------------------
// AgentProfile / Skill
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Persona text placed ahead of the system prompt.
    #[serde(default)]
    pub soul: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Skill ids resolved against [`collections::SKILLS`].
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    /// Peer agent ids this agent may delegate to. Empty means every other agent.
    #[serde(default)]
    pub delegates: Vec<String>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.to_lowercase().replace(' ', "-"),
            name,
            description: String::new(),
            soul: String::new(),
            system_prompt: String::new(),
            skills: Vec::new(),
            tools: Vec::new(),
            delegates: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub content: String,
}

// ---------------------------------------------------------------------------
// TaskRecord
// ---------------------------------------------------------------------------

/// A queued unit of work executed by the delegation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub agent_id: String,
    pub prompt: String,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub last_result: Option<String>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(agent_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            mode: RunMode::Task,
            max_turns: None,
            session_id: None,
            last_result: None,
            last_run_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// UserPreferences
// ---------------------------------------------------------------------------

/// Global preferences injected at the top of every delegation system prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPreferences {
    #[serde(default)]
    pub text: String,
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling for any delegation turn budget.
pub const MAX_TURNS_CEILING: u32 = 300;

/// Top-level configuration loaded from `~/.autopilot/config.toml`.
///
/// **Security**: This struct never stores API keys. The model key is read
/// from the environment variable named by [`LlmConfigSection::api_key_env`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub mission: MissionConfig,
    #[serde(default)]
    pub delegation: DelegationConfig,
    #[serde(default)]
    pub llm: LlmConfigSection,
}

impl Config {
    /// Load config from `~/.autopilot/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.daemon.validate()?;
        self.mission.validate()?;
        self.delegation.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".autopilot")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            data_dir: default_data_dir(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "human" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be 'human' or 'json', got '{other}'"
            ))),
        }
    }

    /// `data_dir` with a leading `~/` expanded to the home directory.
    pub fn expanded_data_dir(&self) -> PathBuf {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(rest),
            None => PathBuf::from(&self.data_dir),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}
fn default_data_dir() -> String {
    "~/.autopilot/data".into()
}

/// Intervals and thresholds for the background subsystems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_queue_interval")]
    pub queue_interval_secs: u64,
    #[serde(default = "default_sweeper_interval")]
    pub sweeper_interval_secs: u64,
    /// Resources idle longer than this are force-released.
    #[serde(default = "default_sweeper_max_idle")]
    pub sweeper_max_idle_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_stale_multiplier")]
    pub stale_multiplier: u32,
    #[serde(default = "default_min_stale")]
    pub min_stale_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            queue_interval_secs: default_queue_interval(),
            sweeper_interval_secs: default_sweeper_interval(),
            sweeper_max_idle_secs: default_sweeper_max_idle(),
            health_interval_secs: default_health_interval(),
            stale_multiplier: default_stale_multiplier(),
            min_stale_secs: default_min_stale(),
        }
    }
}

impl DaemonConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("queue_interval_secs", self.queue_interval_secs),
            ("sweeper_interval_secs", self.sweeper_interval_secs),
            ("health_interval_secs", self.health_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "daemon.{name} must be greater than zero"
                )));
            }
        }
        if self.stale_multiplier == 0 {
            return Err(ConfigError::Validation(
                "daemon.stale_multiplier must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_secs(self.queue_interval_secs)
    }

    pub fn sweeper_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper_interval_secs)
    }

    pub fn sweeper_max_idle(&self) -> Duration {
        Duration::from_secs(self.sweeper_max_idle_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

fn default_queue_interval() -> u64 {
    30
}
fn default_sweeper_interval() -> u64 {
    60
}
fn default_sweeper_max_idle() -> u64 {
    600
}
fn default_health_interval() -> u64 {
    120
}
fn default_stale_multiplier() -> u32 {
    4
}
fn default_min_stale() -> u64 {
    240
}

/// Where stale-session alerts are delivered. Both unset means log only.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlertsConfig {
    #[serde(default)]
    pub connector: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

impl AlertsConfig {
    pub fn is_configured(&self) -> bool {
        self.connector.is_some() && self.channel.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionConfig {
    #[serde(default = "default_max_followup_chain")]
    pub max_followup_chain: u32,
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    #[serde(default = "default_pending_event_limit")]
    pub pending_event_limit: usize,
    #[serde(default = "default_event_ttl_days")]
    pub event_ttl_days: i64,
    /// How many of the newest pending events are rendered into a tick prompt.
    #[serde(default = "default_events_in_prompt")]
    pub events_in_prompt: usize,
    #[serde(default = "default_meta_miss_warn")]
    pub meta_miss_warn_threshold: u32,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            max_followup_chain: default_max_followup_chain(),
            min_delay_secs: default_min_delay(),
            max_delay_secs: default_max_delay(),
            pending_event_limit: default_pending_event_limit(),
            event_ttl_days: default_event_ttl_days(),
            events_in_prompt: default_events_in_prompt(),
            meta_miss_warn_threshold: default_meta_miss_warn(),
        }
    }
}

impl MissionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_delay_secs == 0 || self.min_delay_secs > self.max_delay_secs {
            return Err(ConfigError::Validation(format!(
                "mission.min_delay_secs ({}) must be positive and <= max_delay_secs ({})",
                self.min_delay_secs, self.max_delay_secs
            )));
        }
        if self.pending_event_limit == 0 {
            return Err(ConfigError::Validation(
                "mission.pending_event_limit must be greater than zero".into(),
            ));
        }
        if self.event_ttl_days <= 0 {
            return Err(ConfigError::Validation(
                "mission.event_ttl_days must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Clamp a model-requested delay into the configured bounds.
    pub fn clamp_delay_secs(&self, requested: i64) -> u64 {
        let min = self.min_delay_secs as i64;
        let max = self.max_delay_secs as i64;
        requested.clamp(min, max) as u64
    }
}

fn default_max_followup_chain() -> u32 {
    6
}
fn default_min_delay() -> u64 {
    5
}
fn default_max_delay() -> u64 {
    900
}
fn default_pending_event_limit() -> usize {
    40
}
fn default_event_ttl_days() -> i64 {
    7
}
fn default_events_in_prompt() -> usize {
    10
}
fn default_meta_miss_warn() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    #[serde(default = "default_max_turns")]
    pub default_max_turns: u32,
    #[serde(default = "default_max_turns_limit")]
    pub max_turns_limit: u32,
    /// Wall-clock cap for `ongoing` runs, checked between turns.
    #[serde(default = "default_runtime_cap")]
    pub ongoing_runtime_cap_secs: u64,
    #[serde(default = "default_memory_excerpts")]
    pub memory_excerpts: usize,
    #[serde(default = "default_memory_excerpt_chars")]
    pub memory_excerpt_chars: usize,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            default_max_turns: default_max_turns(),
            max_turns_limit: default_max_turns_limit(),
            ongoing_runtime_cap_secs: default_runtime_cap(),
            memory_excerpts: default_memory_excerpts(),
            memory_excerpt_chars: default_memory_excerpt_chars(),
        }
    }
}

impl DelegationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_TURNS_CEILING).contains(&self.max_turns_limit) {
            return Err(ConfigError::Validation(format!(
                "delegation.max_turns_limit must be within 1..={MAX_TURNS_CEILING}, got {}",
                self.max_turns_limit
            )));
        }
        if self.default_max_turns == 0 || self.default_max_turns > self.max_turns_limit {
            return Err(ConfigError::Validation(format!(
                "delegation.default_max_turns must be within 1..={}, got {}",
                self.max_turns_limit, self.default_max_turns
            )));
        }
        if self.ongoing_runtime_cap_secs == 0 {
            return Err(ConfigError::Validation(
                "delegation.ongoing_runtime_cap_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Resolve a caller-requested turn budget against the configured limit.
    pub fn resolve_max_turns(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_max_turns)
            .clamp(1, self.max_turns_limit.min(MAX_TURNS_CEILING))
    }

    pub fn ongoing_runtime_cap(&self) -> Duration {
        Duration::from_secs(self.ongoing_runtime_cap_secs)
    }
}

fn default_max_turns() -> u32 {
    12
}
fn default_max_turns_limit() -> u32 {
    MAX_TURNS_CEILING
}
fn default_runtime_cap() -> u64 {
    1800
}
fn default_memory_excerpts() -> usize {
    5
}
fn default_memory_excerpt_chars() -> usize {
    400
}

/// Settings for the OpenAI-compatible completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfigSection {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfigSection {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_llm_key_env(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
        }
    }
}

fn default_llm_base_url() -> String {
    "http://127.0.0.1:11434".into()
}
fn default_llm_model() -> String {
    "qwen2.5:14b".into()
}
fn default_llm_key_env() -> String {
    "AUTOPILOT_LLM_API_KEY".into()
}
fn default_llm_max_tokens() -> u32 {
    4096
}
fn default_llm_temperature() -> f32 {
    0.4
}

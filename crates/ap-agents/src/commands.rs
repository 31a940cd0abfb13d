//! Command grammar for delegation replies.
//!
//! A reply may carry zero or more commands, each a single-line JSON object
//! (optionally wrapped in backticks) with an `action` field. Lines that are
//! not such objects, or whose shape is incomplete, are ignored.

use serde::Deserialize;

/// Category used when a `memory_store` command omits one.
pub const DEFAULT_MEMORY_CATEGORY: &str = "note";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Delegate {
        agent: String,
        task: String,
    },
    MemoryStore {
        category: String,
        title: String,
        content: String,
    },
    MemoryRead {
        query: String,
    },
    Done {
        summary: Option<String>,
    },
}

impl Command {
    pub fn action(&self) -> &'static str {
        match self {
            Command::Delegate { .. } => "delegate",
            Command::MemoryStore { .. } => "memory_store",
            Command::MemoryRead { .. } => "memory_read",
            Command::Done { .. } => "done",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCommand {
    action: String,
    agent: Option<String>,
    task: Option<String>,
    category: Option<String>,
    title: Option<String>,
    content: Option<String>,
    query: Option<String>,
    summary: Option<String>,
}

fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl RawCommand {
    fn into_command(self) -> Option<Command> {
        let action = self.action.trim().to_ascii_lowercase().replace('-', "_");
        match action.as_str() {
            "delegate" => Some(Command::Delegate {
                agent: present(self.agent)?,
                task: present(self.task)?,
            }),
            "memory_store" => {
                let content = present(self.content)?;
                let title = present(self.title)
                    .unwrap_or_else(|| content.chars().take(60).collect());
                Some(Command::MemoryStore {
                    category: present(self.category)
                        .unwrap_or_else(|| DEFAULT_MEMORY_CATEGORY.to_string()),
                    title,
                    content,
                })
            }
            "memory_read" => Some(Command::MemoryRead {
                query: present(self.query)?,
            }),
            "done" => Some(Command::Done {
                summary: present(self.summary),
            }),
            _ => None,
        }
    }
}

/// Strip surrounding inline-code backticks and a leading `json` tag.
pub(crate) fn unwrap_code(line: &str) -> &str {
    let trimmed = line.trim().trim_matches('`').trim();
    trimmed
        .strip_prefix("json")
        .map(str::trim_start)
        .filter(|rest| rest.starts_with('{'))
        .unwrap_or(trimmed)
}

/// Candidate single-line JSON object, or `None`.
pub(crate) fn object_line(line: &str) -> Option<&str> {
    let candidate = unwrap_code(line);
    (candidate.starts_with('{') && candidate.ends_with('}')).then_some(candidate)
}

/// Extract every well-formed command from a reply, in order of appearance.
pub fn parse_commands(reply: &str) -> Vec<Command> {
    reply
        .lines()
        .filter_map(object_line)
        .filter_map(|candidate| serde_json::from_str::<RawCommand>(candidate).ok())
        .filter_map(RawCommand::into_command)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Prompt assembly for delegation runs and mission ticks.

use ap_core::mission::{truncate_chars, MissionLoopState};
use ap_core::types::{AgentProfile, Skill};
use ap_intelligence::MemoryEntry;

use crate::mission_meta::{MISSION_META_MARKER, NO_ACTION_SENTINEL};

/// Instructions appended to every delegation system prompt.
pub const COMMAND_PROTOCOL: &str = r#"## Commands
You may issue commands by writing a single-line JSON object on its own line.
Put each command on its own line. Any other text is treated as conversation.
- Delegate a sub-task to a peer agent:
  {"action":"delegate","agent":"<agent name>","task":"<what they should do>"}
- Store a long-term memory:
  {"action":"memory_store","category":"<category>","title":"<short title>","content":"<what to remember>"}
- Read long-term memory:
  {"action":"memory_read","query":"<search terms>"}
- Finish and report:
  {"action":"done","summary":"<final answer for the user>"}
Results of delegate and memory commands come back as observations on the next turn.
When the work is finished, always end with a done command."#;

/// Everything the delegation system prompt is built from.
pub struct DelegationPromptContext<'a> {
    pub preferences: Option<&'a str>,
    pub agent: &'a AgentProfile,
    pub skills: &'a [Skill],
    pub roster: &'a [AgentProfile],
    pub memories: &'a [MemoryEntry],
    pub excerpt_chars: usize,
}

/// Sections in fixed order: preferences, soul, system prompt, skills,
/// roster, memory excerpts, command protocol. Empty sections are skipped.
pub fn build_delegation_system_prompt(ctx: &DelegationPromptContext<'_>) -> String {
    let mut sections = persona_sections(ctx.preferences, ctx.agent, ctx.skills);

    if !ctx.roster.is_empty() {
        let mut roster = String::from("## Agents you can delegate to\n");
        for peer in ctx.roster {
            roster.push_str(&roster_line(peer));
            roster.push('\n');
        }
        sections.push(roster.trim_end().to_string());
    }

    if !ctx.memories.is_empty() {
        let mut memory = String::from("## Relevant memories\n");
        for entry in ctx.memories {
            memory.push_str(&format!(
                "- [{}] {}: {}\n",
                entry.category,
                entry.title,
                truncate_chars(&entry.content, ctx.excerpt_chars)
            ));
        }
        sections.push(memory.trim_end().to_string());
    }

    sections.push(COMMAND_PROTOCOL.to_string());
    sections.join("\n\n")
}

/// System prompt for an isolated single-exchange sub-conversation with a
/// peer: persona only, no roster and no command protocol.
pub fn build_peer_system_prompt(
    preferences: Option<&str>,
    agent: &AgentProfile,
    skills: &[Skill],
) -> String {
    let mut sections = persona_sections(preferences, agent, skills);
    sections.push(format!(
        "You are {}. Complete the task you are given and reply with the result only.",
        agent.name
    ));
    sections.join("\n\n")
}

/// System prompt for internal mission ticks: persona plus a pointer to the
/// tick's own reply contract. Nothing here may contradict that contract.
pub fn build_mission_system_prompt(
    preferences: Option<&str>,
    agent: &AgentProfile,
    skills: &[Skill],
) -> String {
    let mut sections = persona_sections(preferences, agent, skills);
    sections.push(format!(
        "You are {}, working on a standing mission for this session. \
         Each mission tick states your goal and pending events. \
         Follow the reply format the tick asks for, including its final \
         {MISSION_META_MARKER} line.",
        agent.name
    ));
    sections.join("\n\n")
}

fn persona_sections(
    preferences: Option<&str>,
    agent: &AgentProfile,
    skills: &[Skill],
) -> Vec<String> {
    let mut sections = Vec::new();
    if let Some(prefs) = preferences.map(str::trim).filter(|p| !p.is_empty()) {
        sections.push(format!("## User preferences\n{prefs}"));
    }
    if !agent.soul.trim().is_empty() {
        sections.push(agent.soul.trim().to_string());
    }
    if !agent.system_prompt.trim().is_empty() {
        sections.push(agent.system_prompt.trim().to_string());
    }
    for skill in skills {
        if !skill.content.trim().is_empty() {
            sections.push(format!("## Skill: {}\n{}", skill.name, skill.content.trim()));
        }
    }
    sections
}

fn roster_line(peer: &AgentProfile) -> String {
    let mut line = format!("- {}", peer.name);
    if !peer.description.trim().is_empty() {
        line.push_str(&format!(": {}", peer.description.trim()));
    }
    let mut extras = Vec::new();
    if !peer.tools.is_empty() {
        extras.push(format!("tools: {}", peer.tools.join(", ")));
    }
    if !peer.skills.is_empty() {
        extras.push(format!("skills: {}", peer.skills.join(", ")));
    }
    if !extras.is_empty() {
        line.push_str(&format!(" ({})", extras.join("; ")));
    }
    line
}

// ---------------------------------------------------------------------------
// Mission tick
// ---------------------------------------------------------------------------

/// Bounds quoted in the tick contract.
#[derive(Debug, Clone, Copy)]
pub struct TickPromptLimits {
    pub events_shown: usize,
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
}

/// The single prompt sent on an internal mission tick.
pub fn build_mission_tick_prompt(state: &MissionLoopState, limits: TickPromptLimits) -> String {
    let or_none = |v: &Option<String>| v.clone().unwrap_or_else(|| "(none)".into());

    let mut prompt =
        String::from("[mission-tick] Review your mission and decide the next step.\n\n");
    prompt.push_str(&format!("Goal: {}\n", or_none(&state.goal)));
    prompt.push_str(&format!("Status: {}\n", state.status.as_str()));
    prompt.push_str(&format!("Last summary: {}\n", or_none(&state.summary)));
    prompt.push_str(&format!("Last next action: {}\n", or_none(&state.next_action)));
    prompt.push_str(&format!("Autonomy mode: {}\n", state.autonomy_mode.as_str()));

    let skip = state.pending_events.len().saturating_sub(limits.events_shown);
    let shown = &state.pending_events[skip..];
    if shown.is_empty() {
        prompt.push_str("\nPending events: (none)\n");
    } else {
        prompt.push_str("\nPending events (oldest first):\n");
        for event in shown {
            prompt.push_str(&format!(
                "- id={} type={} at={}: {}\n",
                event.id,
                event.kind,
                event.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
                event.text
            ));
        }
    }

    prompt.push_str(&format!(
        "\nIf nothing needs doing, reply with exactly {NO_ACTION_SENTINEL} and nothing else.\n\
         Otherwise do the work, then end your reply with one line:\n\
         {MISSION_META_MARKER} {{\"status\":\"progress|blocked|ok\",\"summary\":\"...\",\"next_action\":\"...\",\"follow_up\":true,\"delay_sec\":60,\"goal\":\"(optional)\",\"consume_event_ids\":[\"...\"]}}\n\
         The block must be valid JSON on a single line. delay_sec must be between {} and {}. \
         List in consume_event_ids the ids of events you have handled.",
        limits.min_delay_secs, limits.max_delay_secs
    ));
    prompt
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ap_core::mission::{MissionLimits, MissionLoopPatch, MissionStatus};
    use chrono::Utc;

    fn agent() -> AgentProfile {
        let mut a = AgentProfile::new("Planner").with_system_prompt("You plan work.");
        a.soul = "Calm and precise.".into();
        a
    }

    #[test]
    fn delegation_prompt_sections_are_ordered() {
        let mut peer = AgentProfile::new("Researcher").with_description("Finds sources");
        peer.tools = vec!["web_search".into()];
        let skills = vec![Skill {
            id: "s1".into(),
            name: "Summaries".into(),
            content: "Write tight summaries.".into(),
        }];
        let memories = vec![MemoryEntry::new("planner", "fact", "Deadline", "x".repeat(50))];
        let agent = agent();
        let prompt = build_delegation_system_prompt(&DelegationPromptContext {
            preferences: Some("Reply in English."),
            agent: &agent,
            skills: &skills,
            roster: std::slice::from_ref(&peer),
            memories: &memories,
            excerpt_chars: 10,
        });

        let order = [
            "Reply in English.",
            "Calm and precise.",
            "You plan work.",
            "Write tight summaries.",
            "- Researcher: Finds sources (tools: web_search)",
            "## Relevant memories",
            "## Commands",
        ];
        let positions: Vec<usize> = order.iter().map(|s| prompt.find(s).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{prompt}");
        // Excerpt truncated to 10 chars.
        assert!(prompt.contains(&format!("{}…", "x".repeat(9))));
    }

    #[test]
    fn empty_sections_are_skipped() {
        let agent = AgentProfile::new("Bare");
        let prompt = build_delegation_system_prompt(&DelegationPromptContext {
            preferences: None,
            agent: &agent,
            skills: &[],
            roster: &[],
            memories: &[],
            excerpt_chars: 100,
        });
        assert!(prompt.starts_with("## Commands"));
    }

    #[test]
    fn peer_prompt_has_no_protocol() {
        let prompt = build_peer_system_prompt(None, &agent(), &[]);
        assert!(prompt.contains("You plan work."));
        assert!(!prompt.contains("## Commands"));
    }

    #[test]
    fn mission_prompt_points_at_the_meta_line() {
        let prompt = build_mission_system_prompt(Some("Use metric units."), &agent(), &[]);
        assert!(prompt.starts_with("## User preferences\nUse metric units."));
        assert!(prompt.contains("Calm and precise."));
        assert!(prompt.contains("You plan work."));
        assert!(prompt.contains(MISSION_META_MARKER));
        assert!(!prompt.contains("result only"));
        assert!(!prompt.contains("## Commands"));
    }

    #[test]
    fn tick_prompt_shows_last_events_oldest_first() {
        let now = Utc::now();
        let limits = MissionLimits::default();
        let mut state = MissionLoopState::new(now);
        let mut patch = MissionLoopPatch {
            goal: Some(Some("Ship the report".into())),
            status: Some(MissionStatus::Progress),
            ..Default::default()
        };
        for i in 0..12 {
            patch = patch.event("note", format!("event-{i:02}"));
        }
        state.apply(patch, &limits, now);

        let prompt = build_mission_tick_prompt(
            &state,
            TickPromptLimits {
                events_shown: 10,
                min_delay_secs: 5,
                max_delay_secs: 900,
            },
        );
        assert!(prompt.contains("Goal: Ship the report"));
        assert!(prompt.contains("Status: progress"));
        assert!(prompt.contains("Autonomy mode: assist"));
        assert!(!prompt.contains("event-01"));
        let first = prompt.find("event-02").unwrap();
        let last = prompt.find("event-11").unwrap();
        assert!(first < last);
        assert!(prompt.contains(NO_ACTION_SENTINEL));
        assert!(prompt.contains(MISSION_META_MARKER));
        assert!(prompt.contains("between 5 and 900"));
    }
}

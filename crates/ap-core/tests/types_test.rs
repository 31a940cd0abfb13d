use ap_core::mission::{AutonomyMode, MissionLoopState, MissionStatus};
use ap_core::types::*;

#[test]
fn session_defaults() {
    let session = Session::new("researcher");
    assert_eq!(session.agent_id, "researcher");
    assert!(!session.persistent);
    assert!(!session.heartbeat.monitored());
    assert!(session.mission_loop.is_none());
    assert!(session.transcript.is_empty());
}

#[test]
fn heartbeat_requires_enabled_and_positive_interval() {
    let session = Session::new("a").with_heartbeat(60);
    assert!(session.heartbeat.monitored());

    let disabled = HeartbeatSettings {
        enabled: false,
        interval_secs: 60,
    };
    assert!(!disabled.monitored());

    let zero = HeartbeatSettings {
        enabled: true,
        interval_secs: 0,
    };
    assert!(!zero.monitored());
}

#[test]
fn agent_profile_id_is_slugged_name() {
    let agent = AgentProfile::new("Research Lead").with_description("digs into things");
    assert_eq!(agent.id, "research-lead");
    assert_eq!(agent.description, "digs into things");
}

#[test]
fn run_mode_serializes_snake_case() {
    assert_eq!(serde_json::to_string(&RunMode::Ongoing).unwrap(), "\"ongoing\"");
    let mode: RunMode = serde_json::from_str("\"task\"").unwrap();
    assert_eq!(mode, RunMode::Task);
}

#[test]
fn session_decodes_with_missing_optional_fields() {
    let json = r#"{
        "id": "s1",
        "agent_id": "a1",
        "last_active_at": "2026-01-01T00:00:00Z",
        "created_at": "2026-01-01T00:00:00Z"
    }"#;
    let session: Session = serde_json::from_str(json).expect("decode");
    assert_eq!(session.id, "s1");
    assert!(session.mission_loop.is_none());
    assert_eq!(session.heartbeat, HeartbeatSettings::default());
}

#[test]
fn mission_state_event_type_field_name() {
    let now = chrono::Utc::now();
    let mut state = MissionLoopState::new(now);
    state.apply(
        ap_core::mission::MissionLoopPatch::default().event("user_instruction", "do it"),
        &ap_core::mission::MissionLimits::default(),
        now,
    );
    let json = serde_json::to_value(&state).unwrap();
    assert_eq!(json["pending_events"][0]["type"], "user_instruction");
    assert_eq!(json["status"], "idle");
    assert_eq!(state.autonomy_mode, AutonomyMode::Assist);
    assert_eq!(state.status, MissionStatus::Idle);
}

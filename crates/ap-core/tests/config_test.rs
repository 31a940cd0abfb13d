use ap_core::config::{Config, MAX_TURNS_CEILING};

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.general.log_format, "human");
    assert_eq!(cfg.daemon.queue_interval_secs, 30);
    assert_eq!(cfg.daemon.sweeper_interval_secs, 60);
    assert_eq!(cfg.daemon.sweeper_max_idle_secs, 600);
    assert_eq!(cfg.daemon.health_interval_secs, 120);
    assert_eq!(cfg.daemon.stale_multiplier, 4);
    assert_eq!(cfg.daemon.min_stale_secs, 240);
    assert_eq!(cfg.mission.max_followup_chain, 6);
    assert_eq!(cfg.mission.pending_event_limit, 40);
    assert_eq!(cfg.mission.event_ttl_days, 7);
    assert_eq!(cfg.delegation.max_turns_limit, MAX_TURNS_CEILING);
    assert!(!cfg.alerts.is_configured());
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("queue_interval_secs"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.daemon.queue_interval_secs, cfg.daemon.queue_interval_secs);
    assert_eq!(parsed.delegation.default_max_turns, cfg.delegation.default_max_turns);
    assert_eq!(parsed.llm.model, cfg.llm.model);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r##"
[daemon]
queue_interval_secs = 5

[alerts]
connector = "slack"
channel = "#ops"
"##;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.daemon.queue_interval_secs, 5);
    assert!(cfg.alerts.is_configured());
    // defaults should fill in the rest
    assert_eq!(cfg.daemon.health_interval_secs, 120);
    assert_eq!(cfg.mission.max_delay_secs, 900);
    cfg.validate().expect("config validates");
}

#[test]
fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[delegation]\ndefault_max_turns = 3\n").unwrap();
    let cfg = Config::load_from(&path).expect("load");
    assert_eq!(cfg.delegation.default_max_turns, 3);
}

#[test]
fn turn_limit_above_ceiling_fails_validation() {
    let mut cfg = Config::default();
    cfg.delegation.max_turns_limit = 301;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("max_turns_limit"));
}

#[test]
fn default_turns_above_limit_fails_validation() {
    let mut cfg = Config::default();
    cfg.delegation.max_turns_limit = 10;
    cfg.delegation.default_max_turns = 20;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("default_max_turns"));
}

#[test]
fn zero_interval_fails_validation() {
    let mut cfg = Config::default();
    cfg.daemon.health_interval_secs = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("health_interval_secs"));
}

#[test]
fn unknown_log_format_fails_validation() {
    let mut cfg = Config::default();
    cfg.general.log_format = "xml".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn resolve_max_turns_clamps_to_limit() {
    let cfg = Config::default();
    assert_eq!(cfg.delegation.resolve_max_turns(None), 12);
    assert_eq!(cfg.delegation.resolve_max_turns(Some(0)), 1);
    assert_eq!(cfg.delegation.resolve_max_turns(Some(3)), 3);
    assert_eq!(cfg.delegation.resolve_max_turns(Some(5000)), 300);
}

#[test]
fn delay_is_clamped_into_bounds() {
    let cfg = Config::default();
    assert_eq!(cfg.mission.clamp_delay_secs(1), 5);
    assert_eq!(cfg.mission.clamp_delay_secs(45), 45);
    assert_eq!(cfg.mission.clamp_delay_secs(-10), 5);
    assert_eq!(cfg.mission.clamp_delay_secs(10_000), 900);
}

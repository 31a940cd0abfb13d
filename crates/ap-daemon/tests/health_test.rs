use std::sync::{Arc, Mutex};

use ap_core::mission::MissionLimits;
use ap_core::session_store::SessionStore;
use ap_core::storage::MemoryStorage;
use ap_core::types::Session;
use ap_daemon::alerts::{AlertConnector, AlertRoute, ConnectorError};
use ap_daemon::heartbeat::{HealthMonitor, StalenessPolicy};
use async_trait::async_trait;
use chrono::{Duration, Utc};

#[derive(Clone, Default)]
struct Recorder {
    lines: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

#[async_trait]
impl AlertConnector for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn send(&self, channel: &str, text: &str) -> Result<(), ConnectorError> {
        self.lines.lock().unwrap().push(format!("{channel} {text}"));
        if self.fail {
            return Err(ConnectorError::Unavailable("recorder".into()));
        }
        Ok(())
    }
}

fn monitor(recorder: &Recorder) -> (HealthMonitor, Arc<SessionStore>) {
    let sessions = Arc::new(SessionStore::new(
        Arc::new(MemoryStorage::new()),
        MissionLimits::default(),
    ));
    let route = AlertRoute::new(Box::new(recorder.clone()), "#ops");
    let monitor = HealthMonitor::new(sessions.clone(), route, StalenessPolicy::default());
    (monitor, sessions)
}

#[tokio::test]
async fn stale_session_alerts_once_per_episode() {
    let recorder = Recorder::default();
    let (monitor, sessions) = monitor(&recorder);
    let t0 = Utc::now();

    let mut session = Session::new("ops").with_heartbeat(60);
    session.last_active_at = t0 - Duration::minutes(10);
    sessions.upsert(&session).await.unwrap();

    let first = monitor.check_at(t0).await.unwrap();
    assert_eq!(first.alerted, vec![session.id.clone()]);
    assert_eq!(recorder.lines.lock().unwrap().len(), 1);

    // Still stale on the next tick: no repeat.
    let second = monitor.check_at(t0 + Duration::minutes(2)).await.unwrap();
    assert_eq!(second.stale, vec![session.id.clone()]);
    assert!(second.alerted.is_empty());
    assert_eq!(recorder.lines.lock().unwrap().len(), 1);

    // Activity resumes.
    let t1 = t0 + Duration::minutes(3);
    sessions.touch(&session.id, t1).await.unwrap();
    let third = monitor.check_at(t1 + Duration::minutes(1)).await.unwrap();
    assert_eq!(third.recovered, vec![session.id.clone()]);
    assert!(monitor.stale_set().await.unwrap().session_ids.is_empty());

    // A later stale episode alerts again.
    let fourth = monitor.check_at(t1 + Duration::minutes(30)).await.unwrap();
    assert_eq!(fourth.alerted, vec![session.id.clone()]);
    assert_eq!(recorder.lines.lock().unwrap().len(), 2);

    let counters = monitor.counters().await;
    assert_eq!(counters.checks, 4);
    assert_eq!(counters.alerts_sent, 2);
    assert_eq!(counters.currently_stale, 1);
}

#[tokio::test]
async fn threshold_is_max_of_scaled_interval_and_floor() {
    let recorder = Recorder::default();
    let (monitor, sessions) = monitor(&recorder);
    let now = Utc::now();

    // 30s heartbeat: 4 × 30s = 2 min, floor wins at 4 min.
    let mut quick = Session::new("ops").with_heartbeat(30);
    quick.last_active_at = now - Duration::minutes(3);
    sessions.upsert(&quick).await.unwrap();

    // 10 min heartbeat: 40 min window.
    let mut slow = Session::new("ops").with_heartbeat(600);
    slow.last_active_at = now - Duration::minutes(30);
    sessions.upsert(&slow).await.unwrap();

    let report = monitor.check_at(now).await.unwrap();
    assert!(report.stale.is_empty());

    let report = monitor.check_at(now + Duration::minutes(2)).await.unwrap();
    assert_eq!(report.stale, vec![quick.id.clone()]);
}

#[tokio::test]
async fn unmonitored_sessions_are_ignored() {
    let recorder = Recorder::default();
    let (monitor, sessions) = monitor(&recorder);
    let now = Utc::now();

    let mut disabled = Session::new("ops");
    disabled.last_active_at = now - Duration::days(2);
    sessions.upsert(&disabled).await.unwrap();

    let mut zero_interval = Session::new("ops").with_heartbeat(0);
    zero_interval.last_active_at = now - Duration::days(2);
    sessions.upsert(&zero_interval).await.unwrap();

    let report = monitor.check_at(now).await.unwrap();
    assert!(report.stale.is_empty());
    assert!(recorder.lines.lock().unwrap().is_empty());
}

#[tokio::test]
async fn delivery_failure_is_counted_and_not_retried_within_episode() {
    let recorder = Recorder {
        fail: true,
        ..Recorder::default()
    };
    let (monitor, sessions) = monitor(&recorder);
    let now = Utc::now();

    let mut session = Session::new("ops").with_heartbeat(60);
    session.last_active_at = now - Duration::hours(1);
    sessions.upsert(&session).await.unwrap();

    monitor.check_at(now).await.unwrap();
    monitor.check_at(now + Duration::minutes(2)).await.unwrap();

    assert_eq!(recorder.lines.lock().unwrap().len(), 1);
    let counters = monitor.counters().await;
    assert_eq!(counters.alerts_sent, 0);
    assert_eq!(counters.alert_failures, 1);
}

#[tokio::test]
async fn stale_set_survives_a_new_monitor() {
    let recorder = Recorder::default();
    let sessions = Arc::new(SessionStore::new(
        Arc::new(MemoryStorage::new()),
        MissionLimits::default(),
    ));
    let now = Utc::now();
    let mut session = Session::new("ops").with_heartbeat(60);
    session.last_active_at = now - Duration::hours(1);
    sessions.upsert(&session).await.unwrap();

    let first = HealthMonitor::new(
        sessions.clone(),
        AlertRoute::new(Box::new(recorder.clone()), "#ops"),
        StalenessPolicy::default(),
    );
    first.check_at(now).await.unwrap();

    // A restarted monitor reads the persisted set and stays quiet.
    let second = HealthMonitor::new(
        sessions,
        AlertRoute::new(Box::new(recorder.clone()), "#ops"),
        StalenessPolicy::default(),
    );
    let report = second.check_at(now + Duration::minutes(2)).await.unwrap();
    assert!(report.alerted.is_empty());
    assert_eq!(recorder.lines.lock().unwrap().len(), 1);
}

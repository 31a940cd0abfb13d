use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use ap_core::config::DaemonConfig;
use ap_core::session_store::SessionStore;
use ap_core::storage::{load_record, save_record, StorageError};
use ap_core::types::{collections, Session};
use ap_harness::timer::TickHandler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn, Instrument};

use crate::alerts::AlertRoute;

/// Record id of the persisted stale set inside [`collections::DAEMON`].
pub const STALE_SET_KEY: &str = "stale_sessions";

/// Sessions that have already been alerted for their current stale episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaleSet {
    #[serde(default)]
    pub session_ids: BTreeSet<String>,
}

/// How long a monitored session may stay quiet before it is stale.
#[derive(Debug, Clone, Copy)]
pub struct StalenessPolicy {
    pub multiplier: u32,
    pub min_stale: Duration,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            multiplier: 4,
            min_stale: Duration::from_secs(240),
        }
    }
}

impl From<&DaemonConfig> for StalenessPolicy {
    fn from(cfg: &DaemonConfig) -> Self {
        Self {
            multiplier: cfg.stale_multiplier,
            min_stale: Duration::from_secs(cfg.min_stale_secs),
        }
    }
}

impl StalenessPolicy {
    /// `max(interval × multiplier, min_stale)`.
    pub fn stale_after(&self, interval_secs: u64) -> Duration {
        let scaled = Duration::from_secs(interval_secs.saturating_mul(self.multiplier as u64));
        scaled.max(self.min_stale)
    }
}

/// Counters exposed through the supervisor status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCounters {
    pub checks: u64,
    pub alerts_sent: u64,
    pub alert_failures: u64,
    pub currently_stale: usize,
    pub last_check_at: Option<DateTime<Utc>>,
}

/// Result of one health check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    /// Sessions stale at this check.
    pub stale: Vec<String>,
    /// Sessions that entered a new stale episode and were alerted.
    pub alerted: Vec<String>,
    /// Sessions whose stale episode ended.
    pub recovered: Vec<String>,
}

/// Watches heartbeat-enabled sessions and alerts once per stale episode.
pub struct HealthMonitor {
    sessions: Arc<SessionStore>,
    alerts: AlertRoute,
    policy: StalenessPolicy,
    counters: Mutex<HealthCounters>,
}

impl HealthMonitor {
    pub fn new(sessions: Arc<SessionStore>, alerts: AlertRoute, policy: StalenessPolicy) -> Self {
        Self {
            sessions,
            alerts,
            policy,
            counters: Mutex::new(HealthCounters::default()),
        }
    }

    pub fn policy(&self) -> StalenessPolicy {
        self.policy
    }

    pub async fn counters(&self) -> HealthCounters {
        self.counters.lock().await.clone()
    }

    pub async fn stale_set(&self) -> Result<StaleSet, StorageError> {
        let stored: Option<StaleSet> = load_record(
            self.sessions.storage().as_ref(),
            collections::DAEMON,
            STALE_SET_KEY,
        )
        .await?;
        Ok(stored.unwrap_or_default())
    }

    pub async fn check(&self) -> Result<HealthReport, StorageError> {
        self.check_at(Utc::now()).await
    }

    /// Run one check as of `now`.
    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<HealthReport, StorageError> {
        let sessions = self.sessions.list().await?;
        let mut persisted = self.stale_set().await?;

        let mut currently_stale = BTreeSet::new();
        let mut report = HealthReport::default();
        let mut sent = 0u64;
        let mut failed = 0u64;

        for session in sessions.iter().filter(|s| s.heartbeat.monitored()) {
            let stale_after = self.policy.stale_after(session.heartbeat.interval_secs);
            let idle = now
                .signed_duration_since(session.last_active_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if idle <= stale_after {
                continue;
            }

            currently_stale.insert(session.id.clone());
            report.stale.push(session.id.clone());
            if persisted.session_ids.contains(&session.id) {
                debug!(session_id = %session.id, "session still stale, already alerted");
                continue;
            }

            let line = alert_line(session, idle, stale_after);
            if self.alerts.deliver(&line).await {
                sent += 1;
            } else {
                failed += 1;
            }
            report.alerted.push(session.id.clone());
        }

        let before = persisted.session_ids.clone();
        report.recovered = before.difference(&currently_stale).cloned().collect();
        for id in &report.recovered {
            info!(session_id = %id, "session recovered from stale state");
        }
        persisted.session_ids = currently_stale;
        if persisted.session_ids != before {
            save_record(
                self.sessions.storage().as_ref(),
                collections::DAEMON,
                STALE_SET_KEY,
                &persisted,
            )
            .await?;
        }

        let mut counters = self.counters.lock().await;
        counters.checks += 1;
        counters.alerts_sent += sent;
        counters.alert_failures += failed;
        counters.currently_stale = report.stale.len();
        counters.last_check_at = Some(now);

        if !report.stale.is_empty() {
            warn!(
                count = report.stale.len(),
                newly_alerted = report.alerted.len(),
                "stale sessions detected"
            );
        }
        Ok(report)
    }
}

fn alert_line(session: &Session, idle: Duration, stale_after: Duration) -> String {
    let name = if session.title.is_empty() {
        session.id.as_str()
    } else {
        session.title.as_str()
    };
    format!(
        "[autopilot] session {name} ({}) has been inactive for {}m (stale after {}m, heartbeat every {}s)",
        session.id,
        idle.as_secs() / 60,
        stale_after.as_secs() / 60,
        session.heartbeat.interval_secs,
    )
}

#[async_trait]
impl TickHandler for HealthMonitor {
    async fn tick(&self) {
        let (span, _) = ap_telemetry::tracing_setup::create_operation_span("health", "check");
        if let Err(e) = self.check().instrument(span).await {
            error!(error = %e, "health check failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_after_uses_floor() {
        let policy = StalenessPolicy::default();
        assert_eq!(policy.stale_after(30), Duration::from_secs(240));
        assert_eq!(policy.stale_after(60), Duration::from_secs(240));
        assert_eq!(policy.stale_after(300), Duration::from_secs(1200));
    }

    #[test]
    fn policy_from_config() {
        let cfg = DaemonConfig {
            stale_multiplier: 2,
            min_stale_secs: 10,
            ..DaemonConfig::default()
        };
        let policy = StalenessPolicy::from(&cfg);
        assert_eq!(policy.stale_after(30), Duration::from_secs(60));
    }

    #[test]
    fn alert_line_prefers_title() {
        let mut session = Session::new("ops").with_heartbeat(60);
        session.title = "nightly".into();
        let line = alert_line(&session, Duration::from_secs(600), Duration::from_secs(240));
        assert!(line.contains("session nightly"));
        assert!(line.contains("inactive for 10m"));
        assert!(line.contains("heartbeat every 60s"));
    }
}

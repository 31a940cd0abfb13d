use std::sync::Arc;
use std::time::Duration;

use ap_agents::{FollowupDispatcher, FollowupRequest, TimerFollowupDispatcher};
use ap_core::mission::MissionLimits;
use ap_core::queue::{ExecutionError, QueueItem, RunExecutor, RunQueue};
use ap_core::session_store::SessionStore;
use ap_core::storage::MemoryStorage;
use ap_daemon::alerts::AlertRoute;
use ap_daemon::daemon::{DaemonIntervals, DaemonSupervisor, ScheduleTrigger};
use ap_daemon::heartbeat::{HealthMonitor, StalenessPolicy};
use ap_daemon::queue::QueueProcessor;
use ap_daemon::sweeper::{InMemoryResourcePool, ResourceSweeper};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

struct Echo;

#[async_trait]
impl RunExecutor for Echo {
    async fn execute(&self, item: QueueItem) -> Result<String, ExecutionError> {
        Ok(item.label())
    }
}

struct Fixed(DateTime<Utc>);

impl ScheduleTrigger for Fixed {
    fn next_run_at(&self) -> Option<DateTime<Utc>> {
        Some(self.0)
    }
}

struct Parts {
    supervisor: DaemonSupervisor,
    queue: Arc<RunQueue>,
    pool: Arc<InMemoryResourcePool>,
}

fn build(intervals: DaemonIntervals) -> Parts {
    let queue = Arc::new(RunQueue::new());
    let pool = Arc::new(InMemoryResourcePool::new());
    let sessions = Arc::new(SessionStore::new(
        Arc::new(MemoryStorage::new()),
        MissionLimits::default(),
    ));
    let supervisor = DaemonSupervisor::new(
        intervals,
        Arc::new(QueueProcessor::new(queue.clone(), Arc::new(Echo))),
        Arc::new(ResourceSweeper::new(pool.clone(), Duration::from_secs(600))),
        Arc::new(HealthMonitor::new(
            sessions,
            AlertRoute::log_only(),
            StalenessPolicy::default(),
        )),
    );
    Parts {
        supervisor,
        queue,
        pool,
    }
}

fn fast() -> DaemonIntervals {
    DaemonIntervals {
        queue: Duration::from_millis(10),
        sweeper: Duration::from_secs(60),
        health: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn start_twice_arms_each_timer_once() {
    let parts = build(DaemonIntervals::default());
    assert_eq!(parts.supervisor.start().await, 3);
    assert_eq!(parts.supervisor.start().await, 0);
    assert!(parts.supervisor.is_running());

    let status = parts.supervisor.status().await;
    assert_eq!(status.timers.len(), 3);
    assert!(status.timers.iter().all(|t| t.armed));
    parts.supervisor.stop().await;
}

#[tokio::test]
async fn stop_disarms_and_force_sweeps() {
    let parts = build(DaemonIntervals::default());
    parts.pool.acquire("wd-1", "workdir");
    parts.supervisor.start().await;

    parts.supervisor.stop().await;
    let status = parts.supervisor.status().await;
    assert!(!status.running);
    assert!(status.timers.iter().all(|t| !t.armed));
    assert!(parts.pool.is_empty());

    // Restart after stop re-arms everything.
    assert_eq!(parts.supervisor.start().await, 3);
    parts.supervisor.stop().await;
}

#[tokio::test]
async fn stop_cancels_pending_follow_ups() {
    let parts = build(DaemonIntervals::default());
    let followups = Arc::new(TimerFollowupDispatcher::new(parts.queue.clone()));
    let supervisor = parts.supervisor.with_followups(followups.clone());
    supervisor.start().await;

    let mut request = FollowupRequest::mission_tick("s1", 0);
    request.delay_ms = 40;
    assert!(followups.schedule(request).await);

    supervisor.stop().await;
    assert_eq!(followups.pending_count(), 0);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(parts.queue.len().await, 0);
}

#[tokio::test]
async fn queue_timer_drains_one_item_per_tick() {
    let parts = build(fast());
    parts.queue.enqueue_task("a").await;
    parts.queue.enqueue_task("b").await;

    parts.supervisor.start().await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    parts.supervisor.stop().await;

    let status = parts.supervisor.status().await;
    assert_eq!(status.queue_length, 0);
    assert!(status.last_processed_at.is_some());
    let queue_timer = status.timers.iter().find(|t| t.name == "queue").unwrap();
    assert!(queue_timer.ticks >= 2);
    assert_eq!(queue_timer.period_ms, 10);
}

#[tokio::test]
async fn status_reports_schedule_and_health() {
    let at = Utc.with_ymd_and_hms(2030, 1, 1, 9, 0, 0).unwrap();
    let parts = build(DaemonIntervals::default());
    let supervisor = parts.supervisor.with_schedule(Arc::new(Fixed(at)));

    let status = supervisor.status().await;
    assert!(!status.running);
    assert_eq!(status.next_trigger_at, Some(at));
    assert_eq!(status.health.checks, 0);
    assert_eq!(status.queue_length, 0);
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ap_agents::FollowupDispatcher;
use ap_core::config::DaemonConfig;
use ap_harness::timer::{PeriodicTimer, TickHandler};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::heartbeat::{HealthCounters, HealthMonitor};
use crate::queue::QueueProcessor;
use crate::sweeper::ResourceSweeper;

/// Source of the next externally scheduled trigger, reported in status.
pub trait ScheduleTrigger: Send + Sync {
    fn next_run_at(&self) -> Option<DateTime<Utc>>;
}

/// No external schedule.
#[derive(Debug, Default)]
pub struct NoSchedule;

impl ScheduleTrigger for NoSchedule {
    fn next_run_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Tick periods for each subsystem.
#[derive(Debug, Clone, Copy)]
pub struct DaemonIntervals {
    pub queue: Duration,
    pub sweeper: Duration,
    pub health: Duration,
}

impl Default for DaemonIntervals {
    fn default() -> Self {
        Self::from(&DaemonConfig::default())
    }
}

impl From<&DaemonConfig> for DaemonIntervals {
    fn from(cfg: &DaemonConfig) -> Self {
        Self {
            queue: cfg.queue_interval(),
            sweeper: cfg.sweeper_interval(),
            health: cfg.health_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimerStatus {
    pub name: String,
    pub period_ms: u64,
    pub armed: bool,
    pub ticks: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub queue_length: usize,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub next_trigger_at: Option<DateTime<Utc>>,
    pub health: HealthCounters,
    pub timers: Vec<TimerStatus>,
}

struct Subsystem {
    timer: PeriodicTimer,
    handler: Arc<dyn TickHandler>,
}

/// Owns the background subsystems and their timers.
///
/// Built once at process start and shared by reference. `start` re-arms
/// any subsystem whose timer is not live, so calling it again after a
/// subsystem died (or on an already running daemon) never duplicates a loop.
pub struct DaemonSupervisor {
    queue: Arc<QueueProcessor>,
    sweeper: Arc<ResourceSweeper>,
    health: Arc<HealthMonitor>,
    schedule: Arc<dyn ScheduleTrigger>,
    followups: Option<Arc<dyn FollowupDispatcher>>,
    subsystems: Vec<Subsystem>,
    running: AtomicBool,
}

impl DaemonSupervisor {
    pub fn new(
        intervals: DaemonIntervals,
        queue: Arc<QueueProcessor>,
        sweeper: Arc<ResourceSweeper>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        let subsystems = vec![
            Subsystem {
                timer: PeriodicTimer::new("queue", intervals.queue),
                handler: queue.clone(),
            },
            Subsystem {
                timer: PeriodicTimer::new("sweeper", intervals.sweeper),
                handler: sweeper.clone(),
            },
            Subsystem {
                timer: PeriodicTimer::new("health", intervals.health),
                handler: health.clone(),
            },
        ];
        Self {
            queue,
            sweeper,
            health,
            schedule: Arc::new(NoSchedule),
            followups: None,
            subsystems,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_schedule(mut self, schedule: Arc<dyn ScheduleTrigger>) -> Self {
        self.schedule = schedule;
        self
    }

    /// Follow-up timers to cancel on [`stop`](Self::stop).
    pub fn with_followups(mut self, followups: Arc<dyn FollowupDispatcher>) -> Self {
        self.followups = Some(followups);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Arm every subsystem that is not already armed. Returns how many
    /// timers this call armed.
    pub async fn start(&self) -> usize {
        let mut armed = 0;
        for sub in &self.subsystems {
            if sub.timer.start(sub.handler.clone()).await {
                armed += 1;
            }
        }
        let was_running = self.running.swap(true, Ordering::SeqCst);
        info!(armed, was_running, "daemon supervisor started");
        armed
    }

    /// Cancel every timer and pending follow-up, then release all tracked
    /// resources.
    pub async fn stop(&self) {
        let mut stopped = 0;
        for sub in &self.subsystems {
            if sub.timer.stop().await {
                stopped += 1;
            }
        }
        let cancelled = match &self.followups {
            Some(followups) => followups.cancel_pending().await,
            None => 0,
        };
        let released = self.sweeper.sweep(Duration::ZERO).await;
        self.running.store(false, Ordering::SeqCst);
        info!(stopped, cancelled, released, "daemon supervisor stopped");
    }

    pub async fn status(&self) -> DaemonStatus {
        let mut timers = Vec::with_capacity(self.subsystems.len());
        for sub in &self.subsystems {
            timers.push(TimerStatus {
                name: sub.timer.name().to_string(),
                period_ms: sub.timer.period().as_millis() as u64,
                armed: sub.timer.is_armed().await,
                ticks: sub.timer.tick_count(),
            });
        }
        DaemonStatus {
            running: self.is_running(),
            queue_length: self.queue.queue().len().await,
            last_processed_at: self.queue.last_processed_at().await,
            next_trigger_at: self.schedule.next_run_at(),
            health: self.health.counters().await,
            timers,
        }
    }
}

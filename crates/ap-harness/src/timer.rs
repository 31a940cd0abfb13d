//! Named, idempotent recurring callbacks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

use crate::shutdown::ShutdownSignal;

/// How long `stop()` waits for an in-flight tick before aborting it.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Work performed on every timer tick.
///
/// A tick is awaited to completion before the next one is scheduled, so a
/// handler never overlaps itself; slow ticks just lower the effective rate.
#[async_trait]
pub trait TickHandler: Send + Sync + 'static {
    async fn tick(&self);
}

struct ActiveRun {
    handle: JoinHandle<()>,
    signal: ShutdownSignal,
}

/// A named periodic timer with start/stop semantics.
///
/// `start` is a no-op while a run is live, so calling it repeatedly never
/// produces a second loop for the same timer. The first tick fires one
/// full period after `start`.
pub struct PeriodicTimer {
    name: String,
    period: Duration,
    run: Mutex<Option<ActiveRun>>,
    ticks: Arc<AtomicU64>,
}

impl PeriodicTimer {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period,
            run: Mutex::new(None),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Completed ticks across every run of this timer.
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Whether a loop is currently armed.
    pub async fn is_armed(&self) -> bool {
        let run = self.run.lock().await;
        run.as_ref().is_some_and(|r| !r.handle.is_finished())
    }

    /// Arm the timer. Returns `false` when it was already armed.
    pub async fn start(&self, handler: Arc<dyn TickHandler>) -> bool {
        let mut run = self.run.lock().await;
        if run.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!(timer = %self.name, "timer already armed");
            return false;
        }

        let signal = ShutdownSignal::new(&self.name);
        let stop = signal.clone();
        let name = self.name.clone();
        let period = self.period;
        let ticks = self.ticks.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Consume the immediate first tick.
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = stop.wait() => break,
                    _ = interval.tick() => {
                        let span = tracing::debug_span!("timer_tick", timer = %name);
                        handler.tick().instrument(span).await;
                        ticks.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            debug!(timer = %name, "timer loop exited");
        });

        *run = Some(ActiveRun { handle, signal });
        info!(timer = %self.name, period_ms = self.period.as_millis() as u64, "timer armed");
        true
    }

    /// Disarm the timer, letting an in-flight tick finish within [`STOP_GRACE`].
    /// Returns `false` when it was not armed.
    pub async fn stop(&self) -> bool {
        let taken = self.run.lock().await.take();
        let Some(ActiveRun { mut handle, signal }) = taken else {
            return false;
        };
        signal.trigger();
        if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
            warn!(timer = %self.name, "tick did not finish within grace period, aborting");
            handle.abort();
        }
        info!(timer = %self.name, "timer stopped");
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal: cooperative stop for one background run
// ---------------------------------------------------------------------------

/// One-shot, cloneable stop flag.
///
/// Backed by a `watch` channel so a receiver created after `trigger()` still
/// observes the stop. Loops `select!` on [`ShutdownSignal::wait`] next to
/// their timer and finish the current iteration before exiting.
///
/// ```ignore
/// let signal = ShutdownSignal::new("queue");
/// let waiter = signal.clone();
///
/// tokio::select! {
///     _ = waiter.wait() => { /* leave the loop */ }
///     _ = interval.tick() => { /* do one tick */ }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    label: Arc<str>,
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new(label: &str) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            label: Arc::from(label),
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Non-blocking check.
    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }

    /// Request the stop. Repeated calls are no-ops.
    pub fn trigger(&self) {
        let changed = self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if changed {
            debug!(label = %self.label, "shutdown signal triggered");
        } else {
            warn!(label = %self.label, "shutdown already triggered");
        }
    }

    /// Resolve once the signal has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so `wait_for` only errors if it is dropped.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

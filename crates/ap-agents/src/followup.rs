use std::sync::Arc;
use std::time::Duration;

use ap_core::queue::{RunQueue, SessionRunRequest};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Internal message carried by self-scheduled mission ticks.
pub const MISSION_TICK_MARKER: &str = "[mission-tick]";

/// Queue `source` tag for follow-up runs.
pub const FOLLOWUP_SOURCE: &str = "mission_followup";

pub fn mission_dedupe_key(session_id: &str) -> String {
    format!("mission-loop:{session_id}")
}

/// A request for a future internal tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowupRequest {
    pub session_id: String,
    pub message: String,
    pub delay_ms: u64,
    pub dedupe_key: String,
}

impl FollowupRequest {
    pub fn mission_tick(session_id: &str, delay_secs: u64) -> Self {
        Self {
            session_id: session_id.to_string(),
            message: MISSION_TICK_MARKER.to_string(),
            delay_ms: delay_secs * 1000,
            dedupe_key: mission_dedupe_key(session_id),
        }
    }
}

/// Executes follow-ups later.
///
/// Implementations must honour the dedupe key: scheduling while a request
/// with the same key is still pending is a no-op returning `false`.
#[async_trait]
pub trait FollowupDispatcher: Send + Sync {
    async fn schedule(&self, request: FollowupRequest) -> bool;

    /// Drop every follow-up that has not fired yet. Returns how many were
    /// cancelled.
    async fn cancel_pending(&self) -> usize {
        0
    }
}

/// Sleeps on a tokio task, then enqueues an internal session run.
///
/// A timer only enqueues if it can still remove its own key from the
/// pending map, so a cancelled timer never fires even if it was already
/// past its sleep when cancelled.
pub struct TimerFollowupDispatcher {
    queue: Arc<RunQueue>,
    pending: Arc<DashMap<String, JoinHandle<()>>>,
}

impl TimerFollowupDispatcher {
    pub fn new(queue: Arc<RunQueue>) -> Self {
        Self {
            queue,
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn is_pending(&self, dedupe_key: &str) -> bool {
        self.pending.contains_key(dedupe_key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl FollowupDispatcher for TimerFollowupDispatcher {
    async fn schedule(&self, request: FollowupRequest) -> bool {
        let slot = match self.pending.entry(request.dedupe_key.clone()) {
            Entry::Occupied(_) => {
                debug!(key = %request.dedupe_key, "follow-up already pending");
                return false;
            }
            Entry::Vacant(slot) => slot,
        };

        info!(
            session_id = %request.session_id,
            delay_ms = request.delay_ms,
            "follow-up scheduled"
        );
        let queue = self.queue.clone();
        let pending = self.pending.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(request.delay_ms)).await;
            // Release the key first so the tick it triggers may schedule the next one.
            if pending.remove(&request.dedupe_key).is_none() {
                debug!(key = %request.dedupe_key, "follow-up cancelled before firing");
                return;
            }
            let run_id = queue
                .enqueue_session_run(SessionRunRequest::internal(
                    request.session_id.clone(),
                    request.message,
                    FOLLOWUP_SOURCE,
                ))
                .await;
            debug!(session_id = %request.session_id, %run_id, "follow-up enqueued");
        });
        slot.insert(handle);
        true
    }

    async fn cancel_pending(&self) -> usize {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut cancelled = 0;
        for key in keys {
            if let Some((_, handle)) = self.pending.remove(&key) {
                handle.abort();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(cancelled, "pending follow-ups cancelled");
        }
        cancelled
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ap_core::queue::QueueItem;

    #[test]
    fn mission_tick_request_shape() {
        let req = FollowupRequest::mission_tick("s1", 45);
        assert_eq!(req.delay_ms, 45_000);
        assert_eq!(req.dedupe_key, "mission-loop:s1");
        assert_eq!(req.message, MISSION_TICK_MARKER);
    }

    #[tokio::test]
    async fn second_schedule_with_live_key_is_noop() {
        let queue = Arc::new(RunQueue::new());
        let dispatcher = TimerFollowupDispatcher::new(queue.clone());

        let mut req = FollowupRequest::mission_tick("s1", 0);
        req.delay_ms = 30;
        assert!(dispatcher.schedule(req.clone()).await);
        assert!(!dispatcher.schedule(req.clone()).await);
        assert!(dispatcher.is_pending("mission-loop:s1"));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(dispatcher.pending_count(), 0);

        match queue.pop().await.unwrap() {
            QueueItem::SessionRun { request, .. } => {
                assert!(request.internal);
                assert_eq!(request.session_id, "s1");
                assert_eq!(request.source, FOLLOWUP_SOURCE);
            }
            other => panic!("unexpected item {other:?}"),
        }

        // Key released: a new follow-up may be scheduled.
        assert!(dispatcher.schedule(req).await);
    }

    #[tokio::test]
    async fn cancelled_follow_ups_never_enqueue() {
        let queue = Arc::new(RunQueue::new());
        let dispatcher = TimerFollowupDispatcher::new(queue.clone());
        let mut req = FollowupRequest::mission_tick("s1", 0);
        req.delay_ms = 30;
        assert!(dispatcher.schedule(req.clone()).await);
        assert!(dispatcher.schedule(FollowupRequest::mission_tick("s2", 60)).await);

        assert_eq!(dispatcher.cancel_pending().await, 2);
        assert_eq!(dispatcher.pending_count(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.len().await, 0);

        // Scheduling works again afterwards.
        assert!(dispatcher.schedule(req).await);
        assert_eq!(dispatcher.cancel_pending().await, 1);
    }

    #[tokio::test]
    async fn distinct_sessions_do_not_collide() {
        let dispatcher = TimerFollowupDispatcher::new(Arc::new(RunQueue::new()));
        assert!(dispatcher.schedule(FollowupRequest::mission_tick("a", 60)).await);
        assert!(dispatcher.schedule(FollowupRequest::mission_tick("b", 60)).await);
        assert_eq!(dispatcher.pending_count(), 2);
    }
}

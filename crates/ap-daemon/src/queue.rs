use std::sync::Arc;

use ap_core::queue::{RunExecutor, RunQueue};
use ap_harness::timer::TickHandler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, Instrument};

/// Hands at most one queued item to the executor per tick.
pub struct QueueProcessor {
    queue: Arc<RunQueue>,
    executor: Arc<dyn RunExecutor>,
    last_processed_at: RwLock<Option<DateTime<Utc>>>,
}

impl QueueProcessor {
    pub fn new(queue: Arc<RunQueue>, executor: Arc<dyn RunExecutor>) -> Self {
        Self {
            queue,
            executor,
            last_processed_at: RwLock::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<RunQueue> {
        &self.queue
    }

    pub async fn last_processed_at(&self) -> Option<DateTime<Utc>> {
        *self.last_processed_at.read().await
    }

    /// Process the head of the queue, if any. Returns whether an item ran.
    pub async fn process_next(&self) -> bool {
        let Some(item) = self.queue.pop().await else {
            return false;
        };
        let run_id = item.run_id().to_string();
        let label = item.label();
        let (span, _trace_id) = ap_telemetry::tracing_setup::create_operation_span("queue", &label);

        let result = self.executor.execute(item).instrument(span).await;
        *self.last_processed_at.write().await = Some(Utc::now());
        match result {
            Ok(text) => info!(
                run_id = %run_id,
                item = %label,
                result_chars = text.chars().count(),
                "run completed"
            ),
            Err(e) => error!(run_id = %run_id, item = %label, error = %e, "run failed"),
        }
        true
    }
}

#[async_trait]
impl TickHandler for QueueProcessor {
    async fn tick(&self) {
        self.process_next().await;
    }
}

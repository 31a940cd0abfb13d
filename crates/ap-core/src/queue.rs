use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::storage::StorageError;
use crate::types::RunMode;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A request to run a session turn, from a webhook, the scheduler, or the
/// mission loop's own follow-ups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRunRequest {
    pub session_id: String,
    pub message: String,
    /// Free-form origin tag (`webhook`, `schedule`, `mission_followup`, ...).
    pub source: String,
    /// Internal runs are mission-loop ticks rather than user messages.
    pub internal: bool,
    pub mode: RunMode,
}

impl SessionRunRequest {
    pub fn user(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            source: "user".into(),
            internal: false,
            mode: RunMode::Task,
        }
    }

    pub fn internal(
        session_id: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            source: source.into(),
            internal: true,
            mode: RunMode::Task,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueItem {
    Task {
        run_id: String,
        task_id: String,
        enqueued_at: DateTime<Utc>,
    },
    SessionRun {
        run_id: String,
        request: SessionRunRequest,
        enqueued_at: DateTime<Utc>,
    },
}

impl QueueItem {
    pub fn run_id(&self) -> &str {
        match self {
            QueueItem::Task { run_id, .. } | QueueItem::SessionRun { run_id, .. } => run_id,
        }
    }

    pub fn label(&self) -> String {
        match self {
            QueueItem::Task { task_id, .. } => format!("task:{task_id}"),
            QueueItem::SessionRun { request, .. } => format!("session:{}", request.session_id),
        }
    }
}

// ---------------------------------------------------------------------------
// RunQueue
// ---------------------------------------------------------------------------

/// FIFO of pending work, drained one item per Queue Processor tick.
#[derive(Debug, Default)]
pub struct RunQueue {
    items: Mutex<VecDeque<QueueItem>>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stored task for execution. Returns the run id.
    pub async fn enqueue_task(&self, task_id: impl Into<String>) -> String {
        let run_id = Uuid::new_v4().to_string();
        let item = QueueItem::Task {
            run_id: run_id.clone(),
            task_id: task_id.into(),
            enqueued_at: Utc::now(),
        };
        self.push(item).await;
        run_id
    }

    /// Queue a session run. Returns the run id.
    pub async fn enqueue_session_run(&self, request: SessionRunRequest) -> String {
        let run_id = Uuid::new_v4().to_string();
        let item = QueueItem::SessionRun {
            run_id: run_id.clone(),
            request,
            enqueued_at: Utc::now(),
        };
        self.push(item).await;
        run_id
    }

    async fn push(&self, item: QueueItem) {
        let mut items = self.items.lock().await;
        debug!(run_id = %item.run_id(), item = %item.label(), depth = items.len() + 1, "enqueued");
        items.push_back(item);
    }

    pub async fn pop(&self) -> Option<QueueItem> {
        self.items.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

// ---------------------------------------------------------------------------
// RunExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("execution failed: {0}")]
    Failed(String),
}

/// The execution path queued items are handed to.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Execute one item to completion and return its result text.
    async fn execute(&self, item: QueueItem) -> Result<String, ExecutionError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

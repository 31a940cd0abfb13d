use std::sync::Arc;
use std::time::Duration;

use ap_harness::timer::TickHandler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("resource {0} is not tracked")]
    NotTracked(String),
}

/// A tracked per-session resource (working directory, browser handle, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLease {
    pub id: String,
    pub kind: String,
    pub last_used_at: DateTime<Utc>,
}

/// The set of resources the sweeper may reclaim.
#[async_trait]
pub trait ResourcePool: Send + Sync {
    async fn leases(&self) -> Vec<ResourceLease>;

    async fn release(&self, id: &str) -> Result<(), ResourceError>;
}

/// Process-local pool keyed by resource id.
#[derive(Debug, Default)]
pub struct InMemoryResourcePool {
    leases: DashMap<String, ResourceLease>,
}

impl InMemoryResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a resource, or refresh it if already tracked.
    pub fn acquire(&self, id: impl Into<String>, kind: impl Into<String>) {
        let id = id.into();
        self.leases.insert(
            id.clone(),
            ResourceLease {
                id,
                kind: kind.into(),
                last_used_at: Utc::now(),
            },
        );
    }

    pub fn touch(&self, id: &str, at: DateTime<Utc>) -> bool {
        match self.leases.get_mut(id) {
            Some(mut lease) => {
                lease.last_used_at = at;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[async_trait]
impl ResourcePool for InMemoryResourcePool {
    async fn leases(&self) -> Vec<ResourceLease> {
        self.leases.iter().map(|e| e.value().clone()).collect()
    }

    async fn release(&self, id: &str) -> Result<(), ResourceError> {
        self.leases
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ResourceError::NotTracked(id.to_string()))
    }
}

/// Force-releases resources that have been idle too long.
pub struct ResourceSweeper {
    pool: Arc<dyn ResourcePool>,
    max_idle: Duration,
}

impl ResourceSweeper {
    pub fn new(pool: Arc<dyn ResourcePool>, max_idle: Duration) -> Self {
        Self { pool, max_idle }
    }

    pub fn max_idle(&self) -> Duration {
        self.max_idle
    }

    /// Release every resource idle for longer than `max_age`. A zero age
    /// releases everything. Returns the number released.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        self.sweep_at(Utc::now(), max_age).await
    }

    /// [`sweep`](Self::sweep) as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let mut released = 0;
        for lease in self.pool.leases().await {
            let idle = now
                .signed_duration_since(lease.last_used_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if !max_age.is_zero() && idle <= max_age {
                continue;
            }
            match self.pool.release(&lease.id).await {
                Ok(()) => {
                    released += 1;
                    debug!(
                        resource = %lease.id,
                        kind = %lease.kind,
                        idle_secs = idle.as_secs(),
                        "released idle resource"
                    );
                }
                Err(e) => warn!(resource = %lease.id, error = %e, "failed to release resource"),
            }
        }
        if released > 0 {
            info!(
                count = released,
                max_age_secs = max_age.as_secs(),
                "sweep released resources"
            );
        }
        released
    }
}

#[async_trait]
impl TickHandler for ResourceSweeper {
    async fn tick(&self) {
        let (span, _) = ap_telemetry::tracing_setup::create_operation_span("sweeper", "sweep");
        self.sweep(self.max_idle).instrument(span).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

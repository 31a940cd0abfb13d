use std::sync::Arc;

use ap_core::queue::{ExecutionError, QueueItem, RunExecutor, SessionRunRequest};
use ap_core::session_store::SessionStore;
use ap_core::storage::{load_record, save_record};
use ap_core::types::{collections, TaskRecord, TranscriptRole};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::delegation::{DelegationLoop, DelegationRequest};
use crate::followup::FollowupDispatcher;
use crate::mission_loop::MissionLoopEngine;

/// Executes queued runs: stored tasks and session runs.
pub struct AgentRuntime {
    sessions: Arc<SessionStore>,
    delegation: Arc<DelegationLoop>,
    mission: Arc<MissionLoopEngine>,
    followups: Arc<dyn FollowupDispatcher>,
}

impl AgentRuntime {
    pub fn new(
        sessions: Arc<SessionStore>,
        delegation: Arc<DelegationLoop>,
        mission: Arc<MissionLoopEngine>,
        followups: Arc<dyn FollowupDispatcher>,
    ) -> Self {
        Self {
            sessions,
            delegation,
            mission,
            followups,
        }
    }

    pub fn mission(&self) -> &Arc<MissionLoopEngine> {
        &self.mission
    }

    async fn run_task(&self, task_id: &str) -> Result<String, ExecutionError> {
        let storage = self.sessions.storage().as_ref();
        let mut task: TaskRecord = load_record(storage, collections::TASKS, task_id)
            .await?
            .ok_or_else(|| ExecutionError::NotFound {
                entity: "task",
                id: task_id.to_string(),
            })?;

        let mut request = DelegationRequest::new(task.agent_id.clone(), task.prompt.clone())
            .with_mode(task.mode);
        request.max_turns = task.max_turns;
        request.session_id = task.session_id.clone();

        let outcome = self.delegation.run(request).await;
        info!(task_id, exit = ?outcome.exit, turns = outcome.turns, "task run finished");

        task.last_result = Some(outcome.result.clone());
        task.last_run_at = Some(Utc::now());
        save_record(storage, collections::TASKS, task_id, &task).await?;
        Ok(outcome.result)
    }

    async fn run_internal(&self, request: &SessionRunRequest) -> Result<String, ExecutionError> {
        let session = self
            .sessions
            .get(&request.session_id)
            .await?
            .ok_or_else(|| ExecutionError::NotFound {
                entity: "session",
                id: request.session_id.clone(),
            })?;
        if !session.persistent {
            warn!(session_id = %session.id, "internal run on a non-persistent session ignored");
            return Err(ExecutionError::Failed(format!(
                "session {} is not persistent and has no mission loop",
                session.id
            )));
        }

        let outcome = self
            .mission
            .tick(&request.session_id)
            .await
            .ok_or_else(|| ExecutionError::NotFound {
                entity: "session",
                id: request.session_id.clone(),
            })?;

        if let Some(followup) = outcome.followup {
            let scheduled = self.followups.schedule(followup).await;
            if !scheduled {
                info!(
                    session_id = %request.session_id,
                    "follow-up already pending, not rescheduled"
                );
            }
        }
        self.sessions.touch(&request.session_id, Utc::now()).await?;
        Ok(outcome
            .reply
            .unwrap_or_else(|| format!("mission tick: {:?}", outcome.kind)))
    }

    async fn run_external(&self, request: &SessionRunRequest) -> Result<String, ExecutionError> {
        let session = self
            .sessions
            .get(&request.session_id)
            .await?
            .ok_or_else(|| ExecutionError::NotFound {
                entity: "session",
                id: request.session_id.clone(),
            })?;

        self.sessions
            .append_transcript(&session.id, TranscriptRole::User, &request.message)
            .await?;
        if session.persistent {
            if let Err(e) = self
                .mission
                .record_user_message(&session.id, &request.message)
                .await
            {
                warn!(session_id = %session.id, error = %e, "failed to update mission goal");
            }
        }
        self.sessions.touch(&session.id, Utc::now()).await?;

        let outcome = self
            .delegation
            .run(
                DelegationRequest::new(session.agent_id.clone(), request.message.clone())
                    .with_mode(request.mode)
                    .in_session(session.id.clone()),
            )
            .await;
        self.sessions.touch(&session.id, Utc::now()).await?;
        info!(
            session_id = %session.id,
            source = %request.source,
            exit = ?outcome.exit,
            "session run finished"
        );
        Ok(outcome.result)
    }
}

#[async_trait]
impl RunExecutor for AgentRuntime {
    async fn execute(&self, item: QueueItem) -> Result<String, ExecutionError> {
        match item {
            QueueItem::Task { task_id, .. } => self.run_task(&task_id).await,
            QueueItem::SessionRun { request, .. } if request.internal => {
                self.run_internal(&request).await
            }
            QueueItem::SessionRun { request, .. } => self.run_external(&request).await,
        }
    }
}

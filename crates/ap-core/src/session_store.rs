use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::mission::{MissionLimits, MissionLoopPatch, MissionLoopState};
use crate::storage::{load_record, load_records, Collection, Storage, StorageError};
use crate::types::{collections, Session, TranscriptEntry, TranscriptRole};

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// Typed access to the `sessions` collection.
///
/// The storage collaborator only loads and saves whole collections, so every
/// mutator here is a load-patch-save of the full collection. Mutators are
/// serialized through one async lock so two in-process writers (a background
/// tick and a user message, say) cannot overwrite each other. Writers in other
/// processes are not coordinated.
pub struct SessionStore {
    storage: Arc<dyn Storage>,
    limits: MissionLimits,
    write_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn Storage>, limits: MissionLimits) -> Self {
        Self {
            storage,
            limits,
            write_lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn limits(&self) -> &MissionLimits {
        &self.limits
    }

    /// Load a session by id. Returns `None` if not found.
    pub async fn get(&self, id: &str) -> Result<Option<Session>, StorageError> {
        load_record(self.storage.as_ref(), collections::SESSIONS, id).await
    }

    /// All decodable sessions, ordered by id.
    pub async fn list(&self) -> Result<Vec<Session>, StorageError> {
        let records = load_records::<Session>(self.storage.as_ref(), collections::SESSIONS).await?;
        Ok(records.into_iter().map(|(_, s)| s).collect())
    }

    /// Insert or replace a session.
    pub async fn upsert(&self, session: &Session) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut raw = self.storage.load(collections::SESSIONS).await?;
        raw.insert(session.id.clone(), serde_json::to_value(session)?);
        self.storage.save(collections::SESSIONS, &raw).await
    }

    /// Record activity on a session. Returns `false` when the session is unknown.
    pub async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StorageError> {
        self.modify(id, |session| session.last_active_at = at)
            .await
            .map(|found| found.is_some())
    }

    /// Append one transcript entry. Returns `false` when the session is unknown.
    pub async fn append_transcript(
        &self,
        id: &str,
        role: TranscriptRole,
        text: &str,
    ) -> Result<bool, StorageError> {
        let entry = TranscriptEntry {
            role,
            text: text.to_string(),
            at: Utc::now(),
        };
        self.modify(id, move |session| session.transcript.push(entry))
            .await
            .map(|found| found.is_some())
    }

    /// Current mission-loop state, normalized, without persisting anything.
    pub async fn mission_loop(&self, id: &str) -> Result<Option<MissionLoopState>, StorageError> {
        let now = Utc::now();
        Ok(self.get(id).await?.map(|session| {
            let mut state = session
                .mission_loop
                .unwrap_or_else(|| MissionLoopState::new(now));
            state.normalize(&self.limits, now);
            state
        }))
    }

    /// The normalize-then-patch mutation path for mission-loop state.
    ///
    /// The state is created lazily on the first mutation. Returns the new
    /// state, or `None` when the session does not exist.
    pub async fn update_mission_loop(
        &self,
        id: &str,
        patch: MissionLoopPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<MissionLoopState>, StorageError> {
        self.update_mission_loop_with(id, now, move |_| patch).await
    }

    /// Like [`update_mission_loop`](Self::update_mission_loop), but the patch
    /// is built from the normalized stored state while the write lock is held.
    pub async fn update_mission_loop_with<F>(
        &self,
        id: &str,
        now: DateTime<Utc>,
        build: F,
    ) -> Result<Option<MissionLoopState>, StorageError>
    where
        F: FnOnce(&MissionLoopState) -> MissionLoopPatch,
    {
        let limits = self.limits;
        let updated = self
            .modify(id, move |session| {
                let state = session
                    .mission_loop
                    .get_or_insert_with(|| MissionLoopState::new(now));
                state.normalize(&limits, now);
                let patch = build(state);
                state.apply(patch, &limits, now);
            })
            .await?;
        Ok(updated.and_then(|session| session.mission_loop))
    }

    async fn modify<F>(&self, id: &str, f: F) -> Result<Option<Session>, StorageError>
    where
        F: FnOnce(&mut Session),
    {
        let _guard = self.write_lock.lock().await;
        let mut raw: Collection = self.storage.load(collections::SESSIONS).await?;
        let Some(value) = raw.remove(id) else {
            debug!(session_id = %id, "session not found");
            return Ok(None);
        };
        let mut session: Session = serde_json::from_value(value)?;
        f(&mut session);
        raw.insert(id.to_string(), serde_json::to_value(&session)?);
        self.storage.save(collections::SESSIONS, &raw).await?;
        Ok(Some(session))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::{CounterUpdate, MissionStatus};
    use crate::storage::MemoryStorage;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryStorage::new()), MissionLimits::default())
    }

    #[tokio::test]
    async fn upsert_and_get() {
        let store = store();
        let session = Session::new("planner").persistent();
        store.upsert(&session).await.unwrap();

        let loaded = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.agent_id, "planner");
        assert!(loaded.persistent);
        assert!(loaded.mission_loop.is_none());
    }

    #[tokio::test]
    async fn mission_loop_is_created_lazily() {
        let store = store();
        let session = Session::new("planner").persistent();
        store.upsert(&session).await.unwrap();

        let patch = MissionLoopPatch {
            status: Some(MissionStatus::Progress),
            ..Default::default()
        };
        let state = store
            .update_mission_loop(&session.id, patch, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, MissionStatus::Progress);

        let persisted = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(persisted.mission_loop.unwrap().status, MissionStatus::Progress);
    }

    #[tokio::test]
    async fn update_unknown_session_returns_none() {
        let store = store();
        let result = store
            .update_mission_loop("missing", MissionLoopPatch::default(), Utc::now())
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(!store.touch("missing", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn patch_builder_sees_stored_state() {
        let store = store();
        let session = Session::new("planner").persistent();
        store.upsert(&session).await.unwrap();
        let patch = MissionLoopPatch {
            followup_chain: Some(CounterUpdate::Set(2)),
            ..Default::default()
        };
        store.update_mission_loop(&session.id, patch, Utc::now()).await.unwrap();

        let mut seen = None;
        let state = store
            .update_mission_loop_with(&session.id, Utc::now(), |current| {
                seen = Some(current.followup_chain_count);
                MissionLoopPatch {
                    followup_chain: Some(CounterUpdate::Increment),
                    ..Default::default()
                }
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, Some(2));
        assert_eq!(state.followup_chain_count, 3);
    }

    #[tokio::test]
    async fn transcript_appends_in_order() {
        let store = store();
        let session = Session::new("planner");
        store.upsert(&session).await.unwrap();

        store
            .append_transcript(&session.id, TranscriptRole::User, "hi")
            .await
            .unwrap();
        store
            .append_transcript(&session.id, TranscriptRole::Assistant, "hello")
            .await
            .unwrap();

        let loaded = store.get(&session.id).await.unwrap().unwrap();
        let texts: Vec<_> = loaded.transcript.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["hi", "hello"]);
    }

    #[tokio::test]
    async fn concurrent_mutators_do_not_lose_updates() {
        let store = Arc::new(store());
        let session = Session::new("planner");
        store.upsert(&session).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let id = session.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_transcript(&id, TranscriptRole::User, &format!("m{i}"))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let loaded = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.transcript.len(), 20);
    }
}

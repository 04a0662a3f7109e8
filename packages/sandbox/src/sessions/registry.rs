// ABOUTME: Session registry owning session records and their lifecycle
// ABOUTME: Writes through to a durable store when present, always keeping an in-process copy

use super::store::SessionStore;
use crate::error::{Result, SandboxError};
use crate::types::{Session, SessionPatch, SessionStatus, SessionType};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const KEY_PREFIX: &str = "session:";

/// Fields fixed when a session is created
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_type: SessionType,
    pub language: String,
    pub memory_mb: u64,
    pub client_id: String,
}

pub struct SessionRegistry {
    store: Option<Arc<dyn SessionStore>>,
    sessions: RwLock<HashMap<String, Session>>,
    /// Destroyed ids whose store record could not be deleted yet
    undeleted: RwLock<HashSet<String>>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(store: Option<Arc<dyn SessionStore>>, ttl: Duration) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
            undeleted: RwLock::new(HashSet::new()),
            ttl,
        }
    }

    /// Registry without a durable store
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(None, ttl)
    }

    fn key(id: &str) -> String {
        format!("{}{}", KEY_PREFIX, id)
    }

    pub async fn create(&self, new: NewSession) -> Session {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            session_type: new.session_type,
            language: new.language,
            status: SessionStatus::Creating,
            memory_mb: new.memory_mb,
            endpoints: BTreeMap::new(),
            client_id: new.client_id,
            created_at: now,
            last_accessed_at: now,
            container_id: None,
        };

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id.clone(), session.clone());
        self.persist(&session).await;

        info!(
            session_id = %session.id,
            session_type = %session.session_type,
            client_id = %session.client_id,
            "Created session"
        );
        session
    }

    pub async fn get(&self, id: &str) -> Result<Session> {
        if let Some(stored) = self.load_from_store(id).await {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let session = sessions.entry(id.to_string()).or_insert_with(|| stored.clone());
            // Last writer wins between processes
            if stored.last_accessed_at > session.last_accessed_at {
                *session = stored;
            }
            return Ok(session.clone());
        }

        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))
    }

    /// Apply `patch` and refresh `last_accessed_at`.
    ///
    /// A status change is validated against the state machine and applied in
    /// one step under the registry lock, so two callers cannot both move a
    /// session out of the same state.
    pub async fn update(&self, id: &str, patch: SessionPatch) -> Result<Session> {
        let missing_locally = !self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id);
        if missing_locally {
            if let Some(session) = self.load_from_store(id).await {
                self.sessions
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(id.to_string())
                    .or_insert(session);
            }
        }

        let updated = {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;

            if let Some(next) = patch.status {
                if !session.status.can_transition_to(next) {
                    return Err(SandboxError::InvalidTransition {
                        from: session.status,
                        to: next,
                    });
                }
                session.status = next;
            }
            if let Some(container_id) = patch.container_id {
                session.container_id = container_id;
            }
            if let Some(endpoints) = patch.endpoints {
                session.endpoints = endpoints;
            }
            session.last_accessed_at = Utc::now();
            session.clone()
        };

        self.persist(&updated).await;
        Ok(updated)
    }

    /// Remove a session, returning the record if this call removed it.
    ///
    /// A second call for the same id returns `None`.
    pub async fn destroy(&self, id: &str) -> Option<Session> {
        let local = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        let removed = match local {
            Some(session) => Some(session),
            None => self.load_from_store(id).await,
        };

        self.delete_from_store(id).await;

        removed.map(|mut session| {
            session.status = SessionStatus::Destroyed;
            debug!(session_id = %id, "Destroyed session record");
            session
        })
    }

    /// All sessions, optionally only those owned by `owner`, oldest first
    pub async fn list(&self, owner: Option<&str>) -> Vec<Session> {
        let mut merged: HashMap<String, Session> = HashMap::new();

        if let Some(store) = &self.store {
            match store.scan_prefix(KEY_PREFIX).await {
                Ok(entries) => {
                    for (key, value) in entries {
                        match serde_json::from_str::<Session>(&value) {
                            Ok(session) if self.is_undeleted(&session.id) => {}
                            Ok(session) => {
                                merged.insert(session.id.clone(), session);
                            }
                            Err(e) => warn!("Skipping unreadable session record {}: {}", key, e),
                        }
                    }
                }
                Err(e) => warn!("Failed to scan session store, using local records: {}", e),
            }
        }

        {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            for (id, session) in sessions.iter() {
                let newer = merged
                    .get(id)
                    .map_or(true, |s| session.last_accessed_at >= s.last_accessed_at);
                if newer {
                    merged.insert(id.clone(), session.clone());
                }
            }
        }

        let mut sessions: Vec<Session> = merged
            .into_values()
            .filter(|s| owner.map_or(true, |o| s.client_id == o))
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Destroy every session idle for longer than `max_age`, returning the removed records
    pub async fn sweep_expired(&self, max_age: Duration) -> Vec<Session> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        self.retry_deletes().await;

        let mut expired = Vec::new();
        for session in self.list(None).await {
            if now.signed_duration_since(session.last_accessed_at) > max_age {
                if let Some(removed) = self.destroy(&session.id).await {
                    expired.push(removed);
                }
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.purge_expired().await {
                warn!("Failed to purge expired session records: {}", e);
            }
        }

        if !expired.is_empty() {
            info!("Expired {} idle sessions", expired.len());
        }
        expired
    }

    fn is_undeleted(&self, id: &str) -> bool {
        self.undeleted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Delete the store record, remembering the id when the store refuses so
    /// the stale record is neither served nor listed
    async fn delete_from_store(&self, id: &str) -> bool {
        let Some(store) = &self.store else {
            return true;
        };

        let deleted = match store.delete(&Self::key(id)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %id, "Failed to delete session from store: {}", e);
                false
            }
        };

        let mut undeleted = self
            .undeleted
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if deleted {
            undeleted.remove(id);
        } else {
            undeleted.insert(id.to_string());
        }
        deleted
    }

    async fn retry_deletes(&self) {
        let ids: Vec<String> = self
            .undeleted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        for id in ids {
            if self.delete_from_store(&id).await {
                debug!(session_id = %id, "Deleted stale session record");
            }
        }
    }

    async fn load_from_store(&self, id: &str) -> Option<Session> {
        if self.is_undeleted(id) {
            return None;
        }
        let store = self.store.as_ref()?;
        match store.get(&Self::key(id)).await {
            Ok(Some(value)) => match serde_json::from_str(&value) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(session_id = %id, "Unreadable session record in store: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(session_id = %id, "Session store read failed: {}", e);
                None
            }
        }
    }

    /// Best-effort write-through; the in-process copy stays authoritative on failure
    async fn persist(&self, session: &Session) {
        let Some(store) = &self.store else {
            return;
        };

        let value = match serde_json::to_string(session) {
            Ok(value) => value,
            Err(e) => {
                warn!(session_id = %session.id, "Failed to serialize session: {}", e);
                return;
            }
        };

        if let Err(e) = store
            .set_with_ttl(&Self::key(&session.id), &value, self.ttl)
            .await
        {
            warn!(session_id = %session.id, "Failed to persist session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sessions::store::{SqliteSessionStore, StoreError, StoreResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FailingStore;

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
            Err(StoreError::Unavailable("offline".into()))
        }

        async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<()> {
            Err(StoreError::Unavailable("offline".into()))
        }

        async fn delete(&self, _key: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("offline".into()))
        }

        async fn scan_prefix(&self, _prefix: &str) -> StoreResult<Vec<(String, String)>> {
            Err(StoreError::Unavailable("offline".into()))
        }
    }

    /// Durable store whose deletes fail while `refuse_deletes` is set
    struct StubbornStore {
        inner: SqliteSessionStore,
        refuse_deletes: AtomicBool,
    }

    #[async_trait]
    impl SessionStore for StubbornStore {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
            self.inner.set_with_ttl(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            if self.refuse_deletes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("read-only replica".into()));
            }
            self.inner.delete(key).await
        }

        async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
            self.inner.scan_prefix(prefix).await
        }
    }

    fn new_session(client: &str) -> NewSession {
        NewSession {
            session_type: SessionType::Execution,
            language: "python".to_string(),
            memory_mb: 512,
            client_id: client.to_string(),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_in_memory() {
        let registry = SessionRegistry::in_memory(Duration::from_secs(60));

        let session = registry.create(new_session("agent-1")).await;
        assert_eq!(session.status, SessionStatus::Creating);

        let ready = registry
            .update(&session.id, SessionPatch::status(SessionStatus::Ready))
            .await
            .unwrap();
        assert_eq!(ready.status, SessionStatus::Ready);
        assert!(ready.last_accessed_at >= session.last_accessed_at);

        let removed = registry.destroy(&session.id).await.unwrap();
        assert_eq!(removed.status, SessionStatus::Destroyed);
        assert!(registry.destroy(&session.id).await.is_none());

        let err = registry.get(&session.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let registry = SessionRegistry::in_memory(Duration::from_secs(60));
        let session = registry.create(new_session("agent-1")).await;

        let err = registry
            .update(&session.id, SessionPatch::status(SessionStatus::Busy))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::InvalidTransition {
                from: SessionStatus::Creating,
                to: SessionStatus::Busy
            }
        ));
    }

    #[tokio::test]
    async fn test_only_one_caller_claims_ready_session() {
        let registry = Arc::new(SessionRegistry::in_memory(Duration::from_secs(60)));
        let session = registry.create(new_session("agent-1")).await;
        registry
            .update(&session.id, SessionPatch::status(SessionStatus::Ready))
            .await
            .unwrap();

        let first = registry
            .update(&session.id, SessionPatch::status(SessionStatus::Busy))
            .await;
        let second = registry
            .update(&session.id, SessionPatch::status(SessionStatus::Busy))
            .await;

        assert!(first.is_ok());
        assert!(matches!(
            second,
            Err(SandboxError::InvalidTransition {
                from: SessionStatus::Busy,
                to: SessionStatus::Busy
            })
        ));
    }

    #[tokio::test]
    async fn test_durable_store_round_trip() {
        let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::in_memory().await.unwrap());
        let writer = SessionRegistry::new(Some(store.clone()), Duration::from_secs(60));
        let reader = SessionRegistry::new(Some(store), Duration::from_secs(60));

        let session = writer.create(new_session("agent-1")).await;

        // A second registry over the same store sees the record
        let loaded = reader.get(&session.id).await.unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(reader.list(Some("agent-1")).await.len(), 1);
        assert!(reader.list(Some("agent-2")).await.is_empty());

        assert!(reader.destroy(&session.id).await.is_some());
        assert!(writer.destroy(&session.id).await.is_some());
        assert!(writer.destroy(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn test_store_failures_fall_back_to_local() {
        let registry = SessionRegistry::new(Some(Arc::new(FailingStore)), Duration::from_secs(60));

        let session = registry.create(new_session("agent-1")).await;
        assert_eq!(registry.get(&session.id).await.unwrap().id, session.id);
        registry
            .update(&session.id, SessionPatch::status(SessionStatus::Ready))
            .await
            .unwrap();
        assert_eq!(registry.list(None).await.len(), 1);
        assert!(registry.destroy(&session.id).await.is_some());
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let registry = SessionRegistry::in_memory(Duration::from_secs(60));
        let stale = registry.create(new_session("agent-1")).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let fresh = registry.create(new_session("agent-2")).await;

        let expired = registry.sweep_expired(Duration::from_millis(200)).await;

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);
        assert!(registry.get(&fresh.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_store_delete_does_not_resurrect_session() {
        let store = Arc::new(StubbornStore {
            inner: SqliteSessionStore::in_memory().await.unwrap(),
            refuse_deletes: AtomicBool::new(true),
        });
        let registry = SessionRegistry::new(Some(store.clone()), Duration::from_secs(60));
        let session = registry.create(new_session("agent-1")).await;

        assert!(registry.destroy(&session.id).await.is_some());

        // The record is still in the store but no longer served
        let key = SessionRegistry::key(&session.id);
        assert!(store.inner.get(&key).await.unwrap().is_some());
        let err = registry.get(&session.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(registry.list(None).await.is_empty());
        assert!(registry.destroy(&session.id).await.is_none());

        // The next sweep finishes the delete once the store accepts it
        store.refuse_deletes.store(false, Ordering::SeqCst);
        registry.sweep_expired(Duration::from_secs(3600)).await;
        assert!(store.inner.get(&key).await.unwrap().is_none());
        assert!(registry.undeleted.read().unwrap().is_empty());
    }
}

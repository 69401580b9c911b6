//! Session store
//!
//! Keyed in-memory store of per-conversation state: the rolling context string
//! and the latest artifact set. Each session sits behind its own async mutex;
//! a turn holds the owned guard for its whole duration, so two turns on the
//! same session never interleave while turns on different sessions run freely.
//! The guard is released on every exit path when it is dropped.

use chrono::{DateTime, Utc};
use sdk::{ArtifactKind, ArtifactRef, ArtifactReferences};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::db::Table;

/// Shared handle to one session
pub type SessionHandle = Arc<Mutex<Session>>;

/// Exclusive scope over one session for the duration of a turn
pub type SessionGuard = OwnedMutexGuard<Session>;

/// Last executed query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryArtifact {
    pub text: String,
    pub reference: Option<ArtifactRef>,
}

/// Last retrieved tabular result
#[derive(Debug, Clone, PartialEq)]
pub struct DataArtifact {
    pub table: Arc<Table>,
    pub reference: Option<ArtifactRef>,
}

/// Latest outputs of a session
///
/// Every field is independently optional; `None` means "not produced yet in
/// this session". A branch overwrites only the fields it produces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactSet {
    pub query: Option<QueryArtifact>,
    pub data: Option<DataArtifact>,
    pub image: Option<ArtifactRef>,
    pub code: Option<ArtifactRef>,
    pub answer: Option<String>,
}

impl ArtifactSet {
    /// Cached non-empty table, if any
    pub fn cached_table(&self) -> Option<Arc<Table>> {
        self.data
            .as_ref()
            .filter(|data| !data.table.is_empty())
            .map(|data| Arc::clone(&data.table))
    }

    /// Kinds currently cached, in a stable order
    pub fn available_kinds(&self) -> Vec<ArtifactKind> {
        let mut kinds = Vec::new();
        if self.query.is_some() {
            kinds.push(ArtifactKind::Query);
        }
        if self.cached_table().is_some() {
            kinds.push(ArtifactKind::Table);
        }
        if self.image.is_some() {
            kinds.push(ArtifactKind::Image);
        }
        if self.code.is_some() {
            kinds.push(ArtifactKind::Code);
        }
        if self.answer.is_some() {
            kinds.push(ArtifactKind::Answer);
        }
        kinds
    }

    /// References handed back to callers
    pub fn references(&self) -> ArtifactReferences {
        ArtifactReferences {
            query: self.query.as_ref().and_then(|q| q.reference.clone()),
            data: self.data.as_ref().and_then(|d| d.reference.clone()),
            image: self.image.clone(),
            code: self.code.clone(),
        }
    }
}

/// Per-conversation state
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,

    /// Rolling memory, replaced after every turn
    pub context: String,

    pub artifacts: ArtifactSet,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,

    /// Completed turns
    pub turns: u64,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            context: String::new(),
            artifacts: ArtifactSet::default(),
            created_at: now,
            last_active: now,
            turns: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}

/// In-memory session store
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `id`, creating the session if needed
    ///
    /// Returns `true` as second element when the session was created.
    pub async fn get_or_create(&self, id: &str) -> (SessionHandle, bool) {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(id) {
            return (Arc::clone(handle), false);
        }

        let handle = Arc::new(Mutex::new(Session::new(id)));
        sessions.insert(id.to_string(), Arc::clone(&handle));
        info!(session_id = id, total = sessions.len(), "Session created");
        (handle, true)
    }

    /// Acquire the exclusive scope of `id`, creating the session if needed
    pub async fn lock(&self, id: &str) -> SessionGuard {
        let (handle, _) = self.get_or_create(id).await;
        handle.lock_owned().await
    }

    /// Run `mutator` inside the exclusive scope of `id`
    pub async fn update<F, R>(&self, id: &str, mutator: F) -> R
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut guard = self.lock(id).await;
        let result = mutator(&mut guard);
        guard.touch();
        result
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.lock().await.get(id).map(Arc::clone)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Session ids, sorted
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Copy of a session's state (waits for an active turn to finish)
    pub async fn snapshot(&self, id: &str) -> Option<Session> {
        let handle = self.get(id).await?;
        let session = handle.lock().await;
        Some(session.clone())
    }

    /// Remove a session; returns whether it existed
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id).is_some();
        if removed {
            info!(session_id = id, "Session removed");
        }
        removed
    }

    /// Evict idle sessions, oldest activity first, until at most `keep` remain
    ///
    /// Sessions with an active turn (locked) are never evicted, so the store
    /// may stay above `keep` while many turns are in flight.
    pub async fn evict_idle(&self, keep: usize) -> Vec<String> {
        let mut sessions = self.sessions.lock().await;
        if sessions.len() <= keep {
            return Vec::new();
        }

        let mut idle: Vec<(String, DateTime<Utc>)> = sessions
            .iter()
            .filter_map(|(id, handle)| {
                handle
                    .try_lock()
                    .ok()
                    .map(|session| (id.clone(), session.last_active))
            })
            .collect();
        idle.sort_by_key(|(_, last_active)| *last_active);

        let excess = sessions.len() - keep;
        let evicted: Vec<String> = idle.into_iter().take(excess).map(|(id, _)| id).collect();
        for id in &evicted {
            sessions.remove(id);
        }

        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), remaining = sessions.len(), "Evicted idle sessions");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = SessionStore::new();
        let (_, created) = store.get_or_create("a").await;
        let (_, created_again) = store.get_or_create("a").await;
        assert!(created);
        assert!(!created_again);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_mutates_in_place() {
        let store = SessionStore::new();
        store
            .update("a", |session| session.context = "pumps due".to_string())
            .await;
        let snapshot = store.snapshot("a").await.unwrap();
        assert_eq!(snapshot.context, "pumps due");
    }

    #[tokio::test]
    async fn test_same_session_turns_are_serialized() {
        let store = Arc::new(SessionStore::new());
        let guard = store.lock("a").await;

        let store2 = Arc::clone(&store);
        let waiter = tokio::spawn(async move {
            store2.update("a", |session| session.turns += 1).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(store.snapshot("a").await.unwrap().turns, 1);
    }

    #[tokio::test]
    async fn test_other_sessions_are_not_blocked() {
        let store = SessionStore::new();
        let _guard = store.lock("a").await;
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            store.update("b", |session| session.turns),
        )
        .await;
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_evict_skips_active_sessions() {
        let store = SessionStore::new();
        for id in ["old", "mid", "new"] {
            store.update(id, |_| ()).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _active = store.lock("old").await;

        let evicted = store.evict_idle(1).await;
        assert_eq!(evicted, vec!["mid".to_string(), "new".to_string()]);
        assert_eq!(store.list().await, vec!["old".to_string()]);
    }

    #[test]
    fn test_cached_table_ignores_empty_data() {
        let mut artifacts = ArtifactSet::default();
        assert!(artifacts.cached_table().is_none());

        artifacts.data = Some(DataArtifact {
            table: Arc::new(Table::default()),
            reference: None,
        });
        assert!(artifacts.cached_table().is_none());

        artifacts.data = Some(DataArtifact {
            table: Arc::new(Table::new(vec!["n".to_string()], vec![vec![json!(1)]])),
            reference: None,
        });
        assert_eq!(artifacts.cached_table().unwrap().len(), 1);
    }
}

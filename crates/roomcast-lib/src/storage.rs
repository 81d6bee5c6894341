//! Storage abstraction with an in-memory implementation.
//!
//! The store holds the persistent half of a room (its row and sessions)
//! keyed by room id. Entries expire on a TTL; a background sweeper drops
//! them. The sweeper never calls back into the hub — the hub treats a
//! store miss as expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// How often the in-memory sweeper runs. Expiry precision is no finer
/// than this.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("room not found")]
    RoomNotFound,

    #[error("room already exists")]
    RoomExists,

    #[error("storage failure: {0}")]
    Internal(String),
}

/// The persistent row of a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRow {
    pub id: String,
    pub name: String,
    /// bcrypt hash of the room password.
    pub password: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    pub id: String,
    pub handle: String,
}

/// Trait for room/session storage backends.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a room with `expires_at = now + ttl`. Fails with
    /// [`StoreError::RoomExists`] on id collision.
    async fn add_room(&self, room: RoomRow, ttl: Duration) -> Result<(), StoreError>;

    async fn room_exists(&self, id: &str) -> Result<bool, StoreError>;

    async fn get_room(&self, id: &str) -> Result<RoomRow, StoreError>;

    /// Extend a room's expiry by `ttl`.
    async fn extend_room_ttl(&self, id: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Remove a room and all its sessions.
    async fn remove_room(&self, id: &str) -> Result<(), StoreError>;

    async fn add_session(
        &self,
        sess_id: &str,
        handle: &str,
        room_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// `Ok(None)` when the room exists but the session does not;
    /// `Err(RoomNotFound)` when the room itself is absent.
    async fn get_session(
        &self,
        sess_id: &str,
        room_id: &str,
    ) -> Result<Option<SessionRow>, StoreError>;

    async fn remove_session(&self, sess_id: &str, room_id: &str) -> Result<(), StoreError>;

    async fn clear_sessions(&self, room_id: &str) -> Result<(), StoreError>;
}

struct MemRoom {
    row: RoomRow,
    sessions: HashMap<String, String>,
    expires_at: Instant,
}

/// In-memory implementation of the [`Store`] trait.
pub struct MemoryStore {
    rooms: Mutex<HashMap<String, MemRoom>>,
}

impl MemoryStore {
    /// Create the store and start its sweeper task.
    pub fn new() -> Arc<Self> {
        let store = Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
        });
        tokio::spawn(Self::watch(Arc::downgrade(&store)));
        store
    }

    async fn watch(store: Weak<Self>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            let Some(store) = store.upgrade() else { break };
            store.sweep();
        }
    }

    /// Drop expired entries.
    fn sweep(&self) {
        let now = Instant::now();
        let mut rooms = self.lock();
        let before = rooms.len();
        rooms.retain(|_, room| room.expires_at > now);
        let dropped = before - rooms.len();
        if dropped > 0 {
            debug!(dropped, "swept expired rooms");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemRoom>> {
        // A poisoned lock means a panic mid-mutation; propagating it here
        // would take every room down with it.
        self.rooms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_room(&self, room: RoomRow, ttl: Duration) -> Result<(), StoreError> {
        let mut rooms = self.lock();
        if rooms.contains_key(&room.id) {
            return Err(StoreError::RoomExists);
        }
        rooms.insert(
            room.id.clone(),
            MemRoom {
                row: room,
                sessions: HashMap::new(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn room_exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock().contains_key(id))
    }

    async fn get_room(&self, id: &str) -> Result<RoomRow, StoreError> {
        self.lock()
            .get(id)
            .map(|room| room.row.clone())
            .ok_or(StoreError::RoomNotFound)
    }

    async fn extend_room_ttl(&self, id: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut rooms = self.lock();
        let room = rooms.get_mut(id).ok_or(StoreError::RoomNotFound)?;
        room.expires_at += ttl;
        Ok(())
    }

    async fn remove_room(&self, id: &str) -> Result<(), StoreError> {
        self.lock().remove(id);
        Ok(())
    }

    async fn add_session(
        &self,
        sess_id: &str,
        handle: &str,
        room_id: &str,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        // Session lifetime is bound to the room entry; the TTL argument
        // exists for backends with per-key expiry.
        let mut rooms = self.lock();
        let room = rooms.get_mut(room_id).ok_or(StoreError::RoomNotFound)?;
        room.sessions.insert(sess_id.to_string(), handle.to_string());
        Ok(())
    }

    async fn get_session(
        &self,
        sess_id: &str,
        room_id: &str,
    ) -> Result<Option<SessionRow>, StoreError> {
        let rooms = self.lock();
        let room = rooms.get(room_id).ok_or(StoreError::RoomNotFound)?;
        Ok(room.sessions.get(sess_id).map(|handle| SessionRow {
            id: sess_id.to_string(),
            handle: handle.clone(),
        }))
    }

    async fn remove_session(&self, sess_id: &str, room_id: &str) -> Result<(), StoreError> {
        let mut rooms = self.lock();
        let room = rooms.get_mut(room_id).ok_or(StoreError::RoomNotFound)?;
        room.sessions.remove(sess_id);
        Ok(())
    }

    async fn clear_sessions(&self, room_id: &str) -> Result<(), StoreError> {
        let mut rooms = self.lock();
        let room = rooms.get_mut(room_id).ok_or(StoreError::RoomNotFound)?;
        room.sessions.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str) -> RoomRow {
        RoomRow {
            id: id.to_string(),
            name: "test".to_string(),
            password: "$2b$08$hash".to_string(),
            created_at: Utc::now(),
        }
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn add_get_remove_roundtrip() {
        let store = MemoryStore::new();
        store.add_room(row("abc"), TTL).await.unwrap();

        assert!(store.room_exists("abc").await.unwrap());
        let got = store.get_room("abc").await.unwrap();
        assert_eq!(got.id, "abc");

        store.remove_room("abc").await.unwrap();
        assert!(matches!(
            store.get_room("abc").await,
            Err(StoreError::RoomNotFound)
        ));
    }

    #[tokio::test]
    async fn add_room_rejects_collision() {
        let store = MemoryStore::new();
        store.add_room(row("abc"), TTL).await.unwrap();
        assert!(matches!(
            store.add_room(row("abc"), TTL).await,
            Err(StoreError::RoomExists)
        ));
    }

    #[tokio::test]
    async fn sessions_cascade_with_room() {
        let store = MemoryStore::new();
        store.add_room(row("abc"), TTL).await.unwrap();
        store.add_session("s1", "alice", "abc", TTL).await.unwrap();

        let sess = store.get_session("s1", "abc").await.unwrap().unwrap();
        assert_eq!(sess.handle, "alice");

        store.remove_room("abc").await.unwrap();
        assert!(matches!(
            store.get_session("s1", "abc").await,
            Err(StoreError::RoomNotFound)
        ));
    }

    #[tokio::test]
    async fn missing_session_is_empty_not_error() {
        let store = MemoryStore::new();
        store.add_room(row("abc"), TTL).await.unwrap();

        assert_eq!(store.get_session("nope", "abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn session_ops_require_room() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.add_session("s1", "alice", "ghost", TTL).await,
            Err(StoreError::RoomNotFound)
        ));
        assert!(matches!(
            store.extend_room_ttl("ghost", TTL).await,
            Err(StoreError::RoomNotFound)
        ));
    }

    #[tokio::test]
    async fn remove_and_clear_sessions() {
        let store = MemoryStore::new();
        store.add_room(row("abc"), TTL).await.unwrap();
        store.add_session("s1", "alice", "abc", TTL).await.unwrap();
        store.add_session("s2", "bob", "abc", TTL).await.unwrap();

        store.remove_session("s1", "abc").await.unwrap();
        assert_eq!(store.get_session("s1", "abc").await.unwrap(), None);
        assert!(store.get_session("s2", "abc").await.unwrap().is_some());

        store.clear_sessions("abc").await.unwrap();
        assert_eq!(store.get_session("s2", "abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sweep_drops_expired_rooms_only() {
        let store = MemoryStore::new();
        store.add_room(row("dead"), Duration::ZERO).await.unwrap();
        store.add_room(row("live"), TTL).await.unwrap();

        store.sweep();

        assert!(!store.room_exists("dead").await.unwrap());
        assert!(store.room_exists("live").await.unwrap());
    }

    #[tokio::test]
    async fn extend_ttl_outlives_sweep() {
        let store = MemoryStore::new();
        store.add_room(row("abc"), Duration::ZERO).await.unwrap();
        store.extend_room_ttl("abc", TTL).await.unwrap();

        store.sweep();
        assert!(store.room_exists("abc").await.unwrap());
    }
}

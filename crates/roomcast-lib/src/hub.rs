//! The hub: registry and factory for all live rooms.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::{PredefinedRoomConfig, PredefinedUserConfig, Settings};
use crate::error::AppError;
use crate::metrics as keys;
use crate::notify::Notifier;
use crate::room::Room;
use crate::storage::{RoomRow, Store, StoreError};

/// bcrypt work factor for room passwords.
const BCRYPT_COST: u32 = 8;

/// Attempts at finding an unused random room id.
const ROOM_ID_TRIES: usize = 5;

/// Controller and container for all chat rooms.
pub struct Hub {
    cfg: Arc<Settings>,
    store: Arc<dyn Store>,
    notifier: Option<Arc<dyn Notifier>>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// Self-reference handed to rooms so they can call back without
    /// keeping the hub alive.
    weak: Weak<Hub>,
}

impl Hub {
    pub fn new(
        cfg: Arc<Settings>,
        store: Arc<dyn Store>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            cfg,
            store,
            notifier,
            rooms: RwLock::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn notifier(&self) -> Option<&Arc<dyn Notifier>> {
        self.notifier.as_ref()
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.cfg
    }

    /// Create a room, persist it and start its loop.
    pub async fn add_room(&self, name: &str, password: &str) -> Result<Arc<Room>, AppError> {
        if self.rooms.read().await.len() >= self.cfg.room.max_rooms {
            return Err(AppError::Validation("maximum number of rooms reached".into()));
        }

        let hash = bcrypt::hash(password, BCRYPT_COST)
            .map_err(|err| AppError::Internal(format!("error hashing password: {err}")))?;
        let id = self.generate_room_id(self.cfg.room.room_id_length).await?;

        self.store
            .add_room(
                RoomRow {
                    id: id.clone(),
                    name: name.to_string(),
                    password: hash.clone(),
                    created_at: Utc::now(),
                },
                Duration::from_secs(self.cfg.room.room_age),
            )
            .await
            .map_err(|err| {
                error!(%err, "error creating room in the store");
                AppError::from(err)
            })?;

        counter!(keys::ROOMS_CREATED).increment(1);
        Ok(self
            .init_room(id, name.to_string(), hash, false, Vec::new())
            .await)
    }

    /// Create a room with a fixed id from configuration. An existing row
    /// with that id is silently accepted.
    pub async fn add_predefined_room(
        &self,
        rc: &PredefinedRoomConfig,
    ) -> Result<Arc<Room>, AppError> {
        let hash = bcrypt::hash(&rc.password, BCRYPT_COST)
            .map_err(|err| AppError::Internal(format!("error hashing password: {err}")))?;

        if !self.store.room_exists(&rc.id).await.map_err(AppError::from)? {
            self.store
                .add_room(
                    RoomRow {
                        id: rc.id.clone(),
                        name: rc.name.clone(),
                        password: hash.clone(),
                        created_at: Utc::now(),
                    },
                    Duration::from_secs(self.cfg.room.room_age),
                )
                .await
                .map_err(AppError::from)?;
        }

        let room = self
            .init_room(rc.id.clone(), rc.name.clone(), hash, true, rc.users.clone())
            .await;
        if !rc.motd.is_empty() {
            room.set_motd(rc.motd.clone()).await;
        }
        info!(room = %rc.id, "predefined room ready");
        Ok(room)
    }

    /// Load a room from the store into the hub if it is not already live.
    pub async fn activate_room(&self, id: &str) -> Result<Arc<Room>, AppError> {
        if let Some(room) = self.rooms.read().await.get(id) {
            return Ok(room.clone());
        }

        let row = self
            .store
            .get_room(id)
            .await
            .map_err(|_| AppError::RoomNotFound)?;
        Ok(self
            .init_room(row.id, row.name, row.password, false, Vec::new())
            .await)
    }

    /// A live room, if any.
    pub async fn get_room(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(id).cloned()
    }

    /// Unregister a room and delete it from the store. Called by the room
    /// itself on teardown.
    pub async fn remove_room(&self, id: &str) {
        self.rooms.write().await.remove(id);
        match self.store.remove_room(id).await {
            Ok(()) | Err(StoreError::RoomNotFound) => {}
            Err(err) => warn!(room = %id, %err, "error removing room from store"),
        }
    }

    async fn init_room(
        &self,
        id: String,
        name: String,
        password: String,
        predefined: bool,
        users: Vec<PredefinedUserConfig>,
    ) -> Arc<Room> {
        let mut rooms = self.rooms.write().await;
        if let Some(existing) = rooms.get(&id) {
            return existing.clone();
        }

        let (room, channels) = Room::new(
            id.clone(),
            name,
            password,
            predefined,
            users,
            self.cfg.clone(),
            self.weak.clone(),
        );
        let room = Arc::new(room);
        rooms.insert(id, room.clone());
        tokio::spawn(room.clone().run(channels));
        room
    }

    async fn generate_room_id(&self, length: usize) -> Result<String, AppError> {
        for _ in 0..ROOM_ID_TRIES {
            let id = generate_guid(length);
            let exists = self.store.room_exists(&id).await.map_err(AppError::from)?;
            if !exists {
                return Ok(id);
            }
        }
        Err(AppError::Storage("unable to generate a unique room id".into()))
    }
}

/// Generate a cryptographically random alphanumeric string of length `n`.
pub fn generate_guid(n: usize) -> String {
    const DICTIONARY: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| DICTIONARY[*b as usize % DICTIONARY.len()] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn build_hub(mut mutate: impl FnMut(&mut Settings)) -> (Arc<Hub>, Arc<MemoryStore>) {
        let mut cfg = Settings::default();
        mutate(&mut cfg);
        let store = MemoryStore::new();
        let hub = Hub::new(Arc::new(cfg), store.clone(), None);
        (hub, store)
    }

    #[test]
    fn guid_length_and_alphabet() {
        for n in [5, 8, 32] {
            let id = generate_guid(n);
            assert_eq!(id.len(), n);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        }
        assert_ne!(generate_guid(32), generate_guid(32));
    }

    #[tokio::test]
    async fn add_room_persists_and_registers() {
        let (hub, store) = build_hub(|_| {});
        let room = hub.add_room("dev", "secret1").await.unwrap();

        assert_eq!(room.id.len(), 5);
        assert!(store.room_exists(&room.id).await.unwrap());
        assert!(hub.get_room(&room.id).await.is_some());

        // The persisted row carries the hash, never the plain password.
        let row = store.get_room(&room.id).await.unwrap();
        assert_ne!(row.password, "secret1");
        assert!(bcrypt::verify("secret1", &row.password).unwrap());
    }

    #[tokio::test]
    async fn max_rooms_is_enforced() {
        let (hub, _store) = build_hub(|cfg| cfg.room.max_rooms = 1);
        hub.add_room("", "secret1").await.unwrap();

        assert!(matches!(
            hub.add_room("", "secret2").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn activate_room_loads_from_store() {
        let (hub, store) = build_hub(|_| {});
        store
            .add_room(
                RoomRow {
                    id: "abcde".to_string(),
                    name: "stored".to_string(),
                    password: bcrypt::hash("secret1", 4).unwrap(),
                    created_at: Utc::now(),
                },
                Duration::from_secs(600),
            )
            .await
            .unwrap();

        assert!(hub.get_room("abcde").await.is_none());
        let room = hub.activate_room("abcde").await.unwrap();
        assert_eq!(room.name, "stored");
        assert!(hub.get_room("abcde").await.is_some());

        // Second activation returns the same live instance.
        let again = hub.activate_room("abcde").await.unwrap();
        assert!(Arc::ptr_eq(&room, &again));
    }

    #[tokio::test]
    async fn activate_missing_room_fails() {
        let (hub, _store) = build_hub(|_| {});
        assert!(matches!(
            hub.activate_room("ghost").await,
            Err(AppError::RoomNotFound)
        ));
    }

    #[tokio::test]
    async fn predefined_room_is_idempotent() {
        let (hub, store) = build_hub(|_| {});
        let rc = PredefinedRoomConfig {
            id: "lobby".to_string(),
            name: "Lobby".to_string(),
            password: "secret1".to_string(),
            motd: String::new(),
            users: Vec::new(),
        };

        let first = hub.add_predefined_room(&rc).await.unwrap();
        let second = hub.add_predefined_room(&rc).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.predefined);
        assert!(store.room_exists("lobby").await.unwrap());
    }

    #[tokio::test]
    async fn remove_room_unregisters_and_deletes() {
        let (hub, store) = build_hub(|_| {});
        let room = hub.add_room("", "secret1").await.unwrap();

        hub.remove_room(&room.id).await;

        assert!(hub.get_room(&room.id).await.is_none());
        assert!(!store.room_exists(&room.id).await.unwrap());
    }
}

//! The per-room actor.
//!
//! A single task owns the live state of a room — the peer set, the
//! backlog cache, the motd and the TTL-extension tick. External callers
//! only enqueue requests; reads of live state go through the op channel.
//! Within one room all events are totally ordered by the loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use metrics::{counter, gauge};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{PredefinedUserConfig, Settings};
use crate::error::AppError;
use crate::hub::{generate_guid, Hub};
use crate::messages::{
    self, PeerPayload, TYPE_MOTD, TYPE_PEER_INFO, TYPE_PEER_JOIN, TYPE_PEER_LEAVE, TYPE_PEER_LIST,
    TYPE_ROOM_DISPOSE, TYPE_ROOM_FULL,
};
use crate::metrics as keys;
use crate::notify;
use crate::peer::Peer;
use crate::token::TokenStore;

/// Capacity of the room-level request queues. Producers block (apply
/// back-pressure) when full.
const ROOM_QUEUE: usize = 100;

/// The room's TTL is extended at most once per this interval.
const TTL_EXTEND_INTERVAL: Duration = Duration::from_secs(30);

const SESSION_ID_LEN: usize = 32;

type OpFn = Box<dyn FnOnce(&mut RoomState) + Send>;

pub(crate) struct Broadcast {
    data: Utf8Bytes,
    record: bool,
}

pub(crate) enum PeerReq {
    Join(Peer),
    Leave(u64),
    List(u64),
}

pub(crate) struct ForwardReq {
    typ: &'static str,
    to: String,
    from_id: String,
    from_handle: String,
    data: Value,
}

/// Live state owned exclusively by the actor task.
pub(crate) struct RoomState {
    peers: HashMap<u64, Peer>,
    backlog: VecDeque<Utf8Bytes>,
    motd: String,
    last_extend: tokio::time::Instant,
}

impl RoomState {
    fn new(backlog_capacity: usize) -> Self {
        Self {
            peers: HashMap::new(),
            backlog: VecDeque::with_capacity(backlog_capacity),
            motd: String::new(),
            last_extend: tokio::time::Instant::now(),
        }
    }

    /// Append a broadcast payload, evicting the oldest at capacity.
    fn record(&mut self, data: Utf8Bytes, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self.backlog.len() >= capacity {
            self.backlog.pop_front();
        }
        self.backlog.push_back(data);
    }
}

/// Receiver halves of a room's queues, consumed by [`Room::run`].
pub(crate) struct RoomChannels {
    op_rx: mpsc::Receiver<OpFn>,
    peer_rx: mpsc::Receiver<PeerReq>,
    forward_rx: mpsc::Receiver<ForwardReq>,
    broadcast_rx: mpsc::Receiver<Broadcast>,
    dispose_rx: mpsc::Receiver<()>,
}

/// A chat room. This is the shared handle; the live state lives in the
/// actor task.
pub struct Room {
    pub id: String,
    pub name: String,
    /// bcrypt hash of the room password.
    password: String,
    pub predefined: bool,
    predefined_users: Vec<PredefinedUserConfig>,

    cfg: Arc<Settings>,
    hub: Weak<Hub>,

    op_tx: mpsc::Sender<OpFn>,
    peer_tx: mpsc::Sender<PeerReq>,
    forward_tx: mpsc::Sender<ForwardReq>,
    broadcast_tx: mpsc::Sender<Broadcast>,
    dispose_tx: mpsc::Sender<()>,

    closed: AtomicBool,
    growl_tokens: TokenStore,
}

impl Room {
    pub(crate) fn new(
        id: String,
        name: String,
        password: String,
        predefined: bool,
        predefined_users: Vec<PredefinedUserConfig>,
        cfg: Arc<Settings>,
        hub: Weak<Hub>,
    ) -> (Self, RoomChannels) {
        let (op_tx, op_rx) = mpsc::channel(1);
        let (peer_tx, peer_rx) = mpsc::channel(ROOM_QUEUE);
        let (forward_tx, forward_rx) = mpsc::channel(ROOM_QUEUE);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(ROOM_QUEUE);
        let (dispose_tx, dispose_rx) = mpsc::channel(1);

        let room = Self {
            id,
            name,
            password,
            predefined,
            predefined_users,
            cfg,
            hub,
            op_tx,
            peer_tx,
            forward_tx,
            broadcast_tx,
            dispose_tx,
            closed: AtomicBool::new(false),
            growl_tokens: TokenStore::new(),
        };
        let channels = RoomChannels {
            op_rx,
            peer_rx,
            forward_rx,
            broadcast_rx,
            dispose_rx,
        };
        (room, channels)
    }

    pub(crate) fn settings(&self) -> &Arc<Settings> {
        &self.cfg
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Authenticate a peer into the room and mint a session.
    ///
    /// The duplicate-handle check runs inside the actor loop; this is the
    /// only reader of the live peer set.
    pub async fn login(
        &self,
        room_pwd: &str,
        handle: &str,
        user_pwd: &str,
    ) -> Result<String, AppError> {
        if !bcrypt::verify(room_pwd, &self.password).unwrap_or(false) {
            return Err(AppError::InvalidRoomPassword);
        }
        for user in &self.predefined_users {
            if user.name == handle && user.password != user_pwd {
                return Err(AppError::InvalidUserPassword);
            }
        }
        if self.is_handle_connected(handle).await {
            return Err(AppError::AlreadyConnected);
        }
        self.create_session(handle).await
    }

    /// Exchange a one-time growl token for a session.
    pub async fn login_with_token(&self, token: &str) -> Result<String, AppError> {
        let handle = self
            .growl_tokens
            .consume(token)
            .ok_or(AppError::InvalidToken)?;
        if self.is_handle_connected(&handle).await {
            return Err(AppError::AlreadyConnected);
        }
        self.create_session(&handle).await
    }

    async fn create_session(&self, handle: &str) -> Result<String, AppError> {
        let sess_id = generate_guid(SESSION_ID_LEN);
        let hub = self.hub.upgrade().ok_or(AppError::RoomNotFound)?;
        let ttl = Duration::from_secs(self.cfg.room.room_age);
        hub.store()
            .add_session(&sess_id, handle, &self.id, ttl)
            .await?;
        Ok(sess_id)
    }

    /// Hand a connected peer to the room.
    pub async fn add_peer(&self, peer: Peer) {
        if self.closed() {
            return;
        }
        let _ = self.peer_tx.send(PeerReq::Join(peer)).await;
    }

    /// Broadcast a serialized frame to every connected peer. Recorded
    /// frames are replayed to future joiners.
    pub async fn broadcast(&self, data: Utf8Bytes, record: bool) {
        if self.closed() {
            return;
        }
        let _ = self.broadcast_tx.send(Broadcast { data, record }).await;
    }

    /// Signal the room to tear itself down. Predefined rooms only clear
    /// their sessions and keep running.
    pub async fn dispose(&self) {
        if self.closed() {
            return;
        }
        let _ = self.dispose_tx.send(()).await;
    }

    /// Directed best-effort delivery to a handle; unknown recipients are
    /// dropped silently.
    pub(crate) async fn forward(
        &self,
        typ: &'static str,
        to: &str,
        from_id: &str,
        from_handle: &str,
        data: Value,
    ) {
        if self.closed() {
            return;
        }
        let _ = self
            .forward_tx
            .send(ForwardReq {
                typ,
                to: to.to_string(),
                from_id: from_id.to_string(),
                from_handle: from_handle.to_string(),
                data,
            })
            .await;
    }

    pub(crate) async fn queue_peer_leave(&self, key: u64) {
        if self.closed() {
            return;
        }
        let _ = self.peer_tx.send(PeerReq::Leave(key)).await;
    }

    pub(crate) async fn request_peer_list(&self, key: u64) {
        if self.closed() {
            return;
        }
        let _ = self.peer_tx.send(PeerReq::List(key)).await;
    }

    /// Whether a live peer currently holds `handle`.
    pub async fn is_handle_connected(&self, handle: &str) -> bool {
        let handle = handle.to_string();
        self.with_state(move |state| state.peers.values().any(|p| p.handle == handle))
            .await
            .unwrap_or(false)
    }

    /// Set the message of the day sent to joining peers.
    pub async fn set_motd(&self, motd: String) {
        let _ = self.with_state(move |state| state.motd = motd).await;
    }

    /// Notify an offline predefined user that they were mentioned. Mints
    /// a one-time login token and hands it to the hub's notifier.
    pub async fn handle_growl(&self, from: &str, to: &str, msg: &str) {
        let Some(hub) = self.hub.upgrade() else { return };
        let Some(notifier) = hub.notifier().cloned() else {
            return;
        };
        if !self
            .predefined_users
            .iter()
            .any(|user| user.growl && user.name == to)
        {
            return;
        }
        if self.is_handle_connected(to).await {
            return;
        }
        let token = self.growl_tokens.get_or_create(to);
        let url = notify::login_url(&self.cfg.server.root_url, &self.id, &token);
        notifier.notify(&self.id, to, from, msg, &url);
    }

    /// Run a closure against the live state inside the actor loop.
    async fn with_state<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut RoomState) -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.closed() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        let op: OpFn = Box::new(move |state| {
            let _ = tx.send(f(state));
        });
        self.op_tx.send(op).await.ok()?;
        rx.await.ok()
    }

    /// The room's event loop. Spawned by the hub; exits on dispose or
    /// after `room_age` of silence (predefined rooms run forever).
    pub(crate) async fn run(self: Arc<Self>, mut ch: RoomChannels) {
        let mut state = RoomState::new(self.cfg.room.max_cached_messages);
        let room_age = Duration::from_secs(self.cfg.room.room_age);

        loop {
            tokio::select! {
                biased;

                Some(op) = ch.op_rx.recv() => op(&mut state),

                Some(()) = ch.dispose_rx.recv() => {
                    if let Some(hub) = self.hub.upgrade() {
                        if let Err(err) = hub.store().clear_sessions(&self.id).await {
                            warn!(room = %self.id, %err, "error clearing sessions");
                        }
                    }
                    if self.predefined {
                        continue;
                    }
                    break;
                }

                Some(fw) = ch.forward_rx.recv() => Self::handle_forward(&state, fw),

                Some(req) = ch.peer_rx.recv() => match req {
                    PeerReq::Join(peer) => Self::handle_join(&self, &mut state, peer).await,
                    PeerReq::Leave(key) => Self::handle_leave(&self, &mut state, key).await,
                    PeerReq::List(key) => {
                        if let Some(peer) = state.peers.get(&key) {
                            peer.send_data(Self::peer_list_frame(&state));
                        }
                    }
                },

                Some(b) = ch.broadcast_rx.recv() => {
                    Self::fanout(&self, &mut state, b.data, b.record).await;
                }

                () = tokio::time::sleep(room_age) => {
                    if self.predefined {
                        continue;
                    }
                    debug!(room = %self.id, "idle timeout");
                    break;
                }
            }
        }

        Self::teardown(&self, &mut state).await;
        info!(room = %self.id, "stopped room");
    }

    async fn handle_join(room: &Arc<Room>, state: &mut RoomState, peer: Peer) {
        let cfg = &room.cfg.room;
        if state.peers.len() >= cfg.max_peers_per_room {
            if let Some(hub) = room.hub.upgrade() {
                if let Err(err) = hub.store().remove_session(&peer.id, &room.id).await {
                    warn!(room = %room.id, %err, "error removing session of rejected peer");
                }
            }
            peer.reject(TYPE_ROOM_FULL, Duration::from_secs(cfg.websocket_timeout))
                .await;
            return;
        }

        peer.send_data(messages::make_peer_frame(
            TYPE_PEER_INFO,
            &peer.id,
            &peer.handle,
        ));
        for cached in &state.backlog {
            peer.send_data(cached.clone());
        }
        if !state.motd.is_empty() {
            peer.send_data(messages::make_chat_frame(
                TYPE_MOTD,
                &peer.id,
                &peer.handle,
                &state.motd,
            ));
        }

        let join_frame = messages::make_peer_frame(TYPE_PEER_JOIN, &peer.id, &peer.handle);
        info!(room = %room.id, handle = %peer.handle, id = %peer.id, "peer joined");
        peer.start_pumps(room);
        state.peers.insert(peer.key(), peer);
        counter!(keys::PEERS_JOINED).increment(1);
        gauge!(keys::PEERS_ACTIVE).increment(1.0);

        Self::fanout(room, state, join_frame, true).await;
    }

    /// Idempotent: leaving twice is a no-op.
    async fn handle_leave(room: &Arc<Room>, state: &mut RoomState, key: u64) {
        let Some(peer) = state.peers.remove(&key) else {
            return;
        };
        let leave_frame = messages::make_peer_frame(TYPE_PEER_LEAVE, &peer.id, &peer.handle);
        info!(room = %room.id, handle = %peer.handle, "peer left");
        drop(peer);
        counter!(keys::PEERS_LEFT).increment(1);
        gauge!(keys::PEERS_ACTIVE).decrement(1.0);

        Self::fanout(room, state, leave_frame, true).await;
    }

    fn handle_forward(state: &RoomState, fw: ForwardReq) {
        let Some(peer) = state.peers.values().find(|p| p.handle == fw.to) else {
            return;
        };
        peer.send_data(messages::make_upload_frame(
            fw.typ,
            &fw.from_id,
            &fw.from_handle,
            fw.data,
        ));
    }

    /// Deliver a frame to every peer, once each, and extend the room's
    /// TTL (throttled, non-predefined only).
    ///
    /// Loop-originated events call this directly instead of re-entering
    /// the bounded broadcast queue the loop itself drains.
    async fn fanout(room: &Arc<Room>, state: &mut RoomState, data: Utf8Bytes, record: bool) {
        for peer in state.peers.values() {
            peer.send_data(data.clone());
        }
        counter!(keys::MESSAGES_BROADCAST).increment(1);

        if record {
            state.record(data, room.cfg.room.max_cached_messages);
        }

        if !room.predefined && state.last_extend.elapsed() > TTL_EXTEND_INTERVAL {
            state.last_extend = tokio::time::Instant::now();
            if let Some(hub) = room.hub.upgrade() {
                let ttl = Duration::from_secs(room.cfg.room.room_age);
                if let Err(err) = hub.store().extend_room_ttl(&room.id, ttl).await {
                    warn!(room = %room.id, %err, "error extending room ttl");
                }
            }
        }
    }

    fn peer_list_frame(state: &RoomState) -> Utf8Bytes {
        let peers: Vec<PeerPayload> = state
            .peers
            .values()
            .map(|p| PeerPayload {
                id: p.id.clone(),
                handle: p.handle.clone(),
            })
            .collect();
        messages::make_frame(TYPE_PEER_LIST, peers)
    }

    async fn teardown(room: &Arc<Room>, state: &mut RoomState) {
        room.closed.store(true, Ordering::Release);

        for (_, peer) in state.peers.drain() {
            peer.send_close(TYPE_ROOM_DISPOSE);
            gauge!(keys::PEERS_ACTIVE).decrement(1.0);
        }
        counter!(keys::ROOMS_DISPOSED).increment(1);

        if let Some(hub) = room.hub.upgrade() {
            hub.remove_room(&room.id).await;
        }
    }
}

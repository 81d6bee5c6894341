//! One connected chat participant.
//!
//! A peer owns a bounded outbound queue and, when bound to a websocket,
//! two pumps: the read pump parses inbound frames and routes them to the
//! room, the write pump drains the queue onto the socket. Both exit by
//! enqueueing a leave request; the room loop owns membership.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use metrics::counter;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::debug;

use crate::config::RoomSettings;
use crate::messages::{
    self, GrowlRequest, Inbound, TypingPayload, TYPE_GROWL, TYPE_MESSAGE, TYPE_PEER_LIST,
    TYPE_PEER_RATE_LIMITED, TYPE_ROOM_DISPOSE, TYPE_TYPING, TYPE_UPLOAD, TYPE_UPLOADING,
};
use crate::metrics as keys;
use crate::room::Room;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Peer lifecycle. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PeerState {
    Connecting = 0,
    Running = 1,
    Leaving = 2,
    Gone = 3,
}

impl PeerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => PeerState::Connecting,
            1 => PeerState::Running,
            2 => PeerState::Leaving,
            _ => PeerState::Gone,
        }
    }
}

/// An item on a peer's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    Frame(Utf8Bytes),
    Close(&'static str),
}

struct PeerConn {
    sink: SplitSink<WebSocket, Message>,
    stream: SplitStream<WebSocket>,
    rx: mpsc::Receiver<Outbound>,
}

/// One connected client of a room.
pub struct Peer {
    key: u64,
    /// Session id of the peer.
    pub id: String,
    /// Display name, unique within a live room.
    pub handle: String,
    tx: mpsc::Sender<Outbound>,
    state: AtomicU8,
    conn: Mutex<Option<PeerConn>>,
}

impl Peer {
    /// A peer bound to a websocket. `queue` is the outbound queue
    /// capacity.
    pub fn new(id: String, handle: String, socket: WebSocket, queue: usize) -> Self {
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::channel(queue.max(1));
        Self {
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            id,
            handle,
            tx,
            state: AtomicU8::new(PeerState::Connecting as u8),
            conn: Mutex::new(Some(PeerConn { sink, stream, rx })),
        }
    }

    /// A peer without a socket; outbound frames surface on the returned
    /// receiver. The room treats it exactly like a connected peer.
    pub fn piped(id: String, handle: String, queue: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let peer = Self {
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            id,
            handle,
            tx,
            state: AtomicU8::new(PeerState::Connecting as u8),
            conn: Mutex::new(None),
        };
        (peer, rx)
    }

    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// One-way transition; moving backwards is a no-op.
    fn advance(&self, to: PeerState) {
        self.state.fetch_max(to as u8, Ordering::AcqRel);
    }

    /// Enqueue a serialized frame without blocking. Dropped when the
    /// queue is full or the peer is leaving.
    pub fn send_data(&self, frame: Utf8Bytes) {
        if self.state() >= PeerState::Leaving {
            return;
        }
        let _ = self.tx.try_send(Outbound::Frame(frame));
    }

    /// Enqueue a close frame and stop accepting writes.
    pub(crate) fn send_close(&self, reason: &'static str) {
        if self.state() == PeerState::Gone {
            return;
        }
        let _ = self.tx.try_send(Outbound::Close(reason));
        self.advance(PeerState::Leaving);
    }

    /// Close a never-admitted peer's socket with a reason, bypassing the
    /// pumps (they were never started).
    pub(crate) async fn reject(&self, reason: &'static str, deadline: Duration) {
        match self.take_conn() {
            Some(mut conn) => {
                let _ = timeout(deadline, conn.sink.send(close_message(reason))).await;
            }
            None => {
                let _ = self.tx.try_send(Outbound::Close(reason));
            }
        }
        self.advance(PeerState::Gone);
    }

    /// Start the read and write pumps. A no-op for piped peers.
    pub(crate) fn start_pumps(&self, room: &Arc<Room>) {
        self.advance(PeerState::Running);
        let Some(conn) = self.take_conn() else { return };
        let ws_timeout = Duration::from_secs(room.settings().room.websocket_timeout);
        tokio::spawn(write_pump(
            conn.sink,
            conn.rx,
            room.clone(),
            self.key,
            ws_timeout,
        ));
        tokio::spawn(read_pump(
            conn.stream,
            room.clone(),
            self.key,
            self.id.clone(),
            self.handle.clone(),
            self.tx.clone(),
        ));
    }

    fn take_conn(&self) -> Option<PeerConn> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

fn close_message(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static(reason),
    }))
}

/// Token bucket for inbound peer frames: `rate_limit_messages` per
/// `rate_limit_interval`, with the full budget as burst.
pub(crate) fn message_quota(cfg: &RoomSettings) -> Quota {
    let budget = cfg.rate_limit_messages.max(1);
    let burst = NonZeroU32::new(budget).expect("budget is non-zero");
    let per = Duration::from_secs(cfg.rate_limit_interval.max(1)) / budget;
    Quota::with_period(per.max(Duration::from_millis(1)))
        .expect("period is non-zero")
        .allow_burst(burst)
}

/// Reads frames from the socket and routes them to the room. An idle
/// deadline of `websocket_timeout`, reset by any inbound traffic, detects
/// dead connections.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    room: Arc<Room>,
    key: u64,
    id: String,
    handle: String,
    tx: mpsc::Sender<Outbound>,
) {
    let cfg = room.settings().room.clone();
    let ws_timeout = Duration::from_secs(cfg.websocket_timeout);
    let limiter = RateLimiter::direct(message_quota(&cfg));

    let deadline = tokio::time::sleep(ws_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => {
                debug!(%handle, "read deadline expired, dropping peer");
                break;
            }
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                deadline.as_mut().reset(tokio::time::Instant::now() + ws_timeout);
                match msg {
                    Message::Text(text) => {
                        let flow =
                            dispatch_frame(&room, &limiter, &cfg, key, &id, &handle, &tx, text)
                                .await;
                        if flow.is_break() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    // Pings are answered by the websocket layer.
                    _ => {}
                }
            }
        }
    }

    room.queue_peer_leave(key).await;
}

/// Handle one inbound text frame. Breaks the pump on unparseable input.
#[allow(clippy::too_many_arguments)]
async fn dispatch_frame(
    room: &Arc<Room>,
    limiter: &DefaultDirectRateLimiter,
    cfg: &RoomSettings,
    key: u64,
    id: &str,
    handle: &str,
    tx: &mpsc::Sender<Outbound>,
    text: Utf8Bytes,
) -> ControlFlow<()> {
    if text.len() > cfg.max_message_length || limiter.check().is_err() {
        counter!(keys::MESSAGES_RATELIMITED).increment(1);
        let frame = messages::make_frame(TYPE_PEER_RATE_LIMITED, serde_json::json!({}));
        let _ = tx.try_send(Outbound::Frame(frame));
        return ControlFlow::Continue(());
    }

    let Ok(inbound) = serde_json::from_str::<Inbound>(text.as_str()) else {
        return ControlFlow::Break(());
    };

    match inbound.typ.as_str() {
        TYPE_MESSAGE => {
            if let Some(msg) = inbound.data.as_str() {
                let frame = messages::make_chat_frame(TYPE_MESSAGE, id, handle, msg);
                room.broadcast(frame, true).await;
            }
        }
        TYPE_TYPING => {
            let frame = messages::make_frame(
                TYPE_TYPING,
                TypingPayload {
                    peer_id: id.to_string(),
                    peer_handle: handle.to_string(),
                },
            );
            room.broadcast(frame, false).await;
        }
        TYPE_UPLOADING => {
            let frame = messages::make_upload_frame(TYPE_UPLOADING, id, handle, inbound.data);
            room.broadcast(frame, false).await;
        }
        TYPE_UPLOAD => {
            let to = inbound
                .data
                .get("to")
                .and_then(Value::as_str)
                .map(str::to_owned);
            match to {
                Some(to) => room.forward(TYPE_UPLOAD, &to, id, handle, inbound.data).await,
                None => {
                    let frame = messages::make_upload_frame(TYPE_UPLOAD, id, handle, inbound.data);
                    room.broadcast(frame, false).await;
                }
            }
        }
        TYPE_PEER_LIST => room.request_peer_list(key).await,
        TYPE_GROWL => {
            if let Ok(req) = serde_json::from_value::<GrowlRequest>(inbound.data) {
                room.handle_growl(handle, &req.to, &req.msg).await;
            }
        }
        TYPE_ROOM_DISPOSE => room.dispose().await,
        _ => {}
    }

    ControlFlow::Continue(())
}

/// Drains the outbound queue onto the socket, pinging at half the
/// websocket timeout. Every write carries a deadline.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    room: Arc<Room>,
    key: u64,
    ws_timeout: Duration,
) {
    let mut ping = tokio::time::interval(ws_timeout / 2);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(Outbound::Frame(frame)) => {
                    match timeout(ws_timeout, sink.send(Message::Text(frame))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                Some(Outbound::Close(reason)) => {
                    let _ = timeout(ws_timeout, sink.send(close_message(reason))).await;
                    return;
                }
                None => {
                    let _ = timeout(ws_timeout, sink.send(Message::Close(None))).await;
                    return;
                }
            },
            _ = ping.tick() => {
                let sent = timeout(ws_timeout, sink.send(Message::Ping(Bytes::new()))).await;
                if !matches!(sent, Ok(Ok(()))) {
                    break;
                }
            }
        }
    }

    room.queue_peer_leave(key).await;
}

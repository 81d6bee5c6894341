//! Wire frames exchanged with peers.
//!
//! Every outbound frame is JSON of the shape
//! `{"type": ..., "timestamp": <RFC 3339>, "data": ...}`; inbound frames
//! carry `{"type": ..., "data": ...}`.

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Types of messages sent to and received from peers.
pub const TYPE_TYPING: &str = "typing";
pub const TYPE_MESSAGE: &str = "message";
pub const TYPE_UPLOADING: &str = "uploading";
pub const TYPE_UPLOAD: &str = "upload";
pub const TYPE_PEER_LIST: &str = "peer.list";
pub const TYPE_PEER_INFO: &str = "peer.info";
pub const TYPE_PEER_JOIN: &str = "peer.join";
pub const TYPE_PEER_LEAVE: &str = "peer.leave";
pub const TYPE_PEER_RATE_LIMITED: &str = "peer.ratelimited";
pub const TYPE_ROOM_DISPOSE: &str = "room.dispose";
pub const TYPE_ROOM_FULL: &str = "room.full";
pub const TYPE_NOTICE: &str = "notice";
pub const TYPE_MOTD: &str = "motd";
pub const TYPE_GROWL: &str = "growl";

#[derive(Debug, Serialize)]
struct FrameOut<'a, T: Serialize> {
    #[serde(rename = "type")]
    typ: &'a str,
    timestamp: DateTime<Utc>,
    data: T,
}

/// A peer identity as seen on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerPayload {
    pub id: String,
    pub handle: String,
}

/// A chat message, notice or motd.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub peer_id: String,
    pub peer_handle: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingPayload {
    pub peer_id: String,
    pub peer_handle: String,
}

/// Upload progress or delivery, tagged with the originating peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPayload {
    pub peer_id: String,
    pub peer_handle: String,
    pub data: Value,
}

/// An inbound `{type, data}` frame.
#[derive(Debug, Deserialize)]
pub struct Inbound {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub data: Value,
}

/// Growl request payload sent by a peer.
#[derive(Debug, Deserialize)]
pub struct GrowlRequest {
    pub to: String,
    #[serde(default)]
    pub msg: String,
}

/// Serialize an outbound frame, stamping it with the current time.
pub fn make_frame<T: Serialize>(typ: &str, data: T) -> Utf8Bytes {
    let frame = FrameOut {
        typ,
        timestamp: Utc::now(),
        data,
    };
    serde_json::to_string(&frame).unwrap_or_default().into()
}

pub fn make_peer_frame(typ: &str, id: &str, handle: &str) -> Utf8Bytes {
    make_frame(
        typ,
        PeerPayload {
            id: id.to_string(),
            handle: handle.to_string(),
        },
    )
}

pub fn make_chat_frame(typ: &str, id: &str, handle: &str, message: &str) -> Utf8Bytes {
    make_frame(
        typ,
        ChatPayload {
            peer_id: id.to_string(),
            peer_handle: handle.to_string(),
            message: message.to_string(),
        },
    )
}

pub fn make_upload_frame(typ: &str, id: &str, handle: &str, data: Value) -> Utf8Bytes {
    make_frame(
        typ,
        UploadPayload {
            peer_id: id.to_string(),
            peer_handle: handle.to_string(),
            data,
        },
    )
}

//! Central place for metric keys.
pub const ROOMS_CREATED: &str = "rooms.created";
pub const ROOMS_DISPOSED: &str = "rooms.disposed";
pub const PEERS_JOINED: &str = "peers.joined";
pub const PEERS_LEFT: &str = "peers.left";
pub const PEERS_ACTIVE: &str = "peers.active";
pub const MESSAGES_BROADCAST: &str = "messages.broadcast";
pub const MESSAGES_RATELIMITED: &str = "messages.ratelimited";
pub const WS_CONNECTION: &str = "ws.connection";
pub const UPLOADS_ACCEPTED: &str = "uploads.accepted";
pub const UPLOADS_RATELIMITED: &str = "uploads.ratelimited";

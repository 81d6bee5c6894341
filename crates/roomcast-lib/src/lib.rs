//! Core engine of the roomcast chat server: the hub/room actor model,
//! peer pumps, stores and the HTTP/WS front controller.

pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod messages;
pub mod metrics;
pub mod notify;
pub mod peer;
pub mod room;
pub mod storage;
pub mod token;
pub mod upload;
pub mod validation;

pub use config::Settings;
pub use error::AppError;
pub use handlers::AppState;
pub use hub::Hub;
pub use notify::{LogNotifier, Notifier};
pub use peer::{Outbound, Peer};
pub use room::Room;
pub use storage::{MemoryStore, Store};
pub use upload::{RoomRateLimiters, UploadStore};

//! Desktop-notification collaborator seam.
//!
//! The actual transport lives outside the engine; the room only needs a
//! callback to invoke when an offline predefined user is mentioned. The
//! token embedded in the login URL is one-time and expires on its own.

use tracing::info;

/// Receiver of offline growl notifications.
pub trait Notifier: Send + Sync {
    /// Deliver a notification for `to` in `room_id`, with a one-time
    /// auto-login URL.
    fn notify(&self, room_id: &str, to: &str, from: &str, msg: &str, login_url: &str);
}

/// A notifier that only logs; the default wiring.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, room_id: &str, to: &str, from: &str, msg: &str, login_url: &str) {
        info!(room_id, to, from, msg, login_url, "growl notification");
    }
}

/// Build the auto-login URL a notification carries.
pub fn login_url(root_url: &str, room_id: &str, token: &str) -> String {
    format!("{}/r/{}?token={}", root_url.trim_end_matches('/'), room_id, token)
}

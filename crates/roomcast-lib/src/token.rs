//! One-time login tokens for offline-notification auto-login links.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::hub::generate_guid;

/// Tokens live ten minutes, sliding on read.
const TOKEN_TTL: Duration = Duration::from_secs(10 * 60);
const TOKEN_LEN: usize = 32;

#[derive(Debug, Clone)]
struct LoginToken {
    token: String,
    expires_at: Instant,
}

/// Thread-safe handle → token map.
#[derive(Debug, Default)]
pub struct TokenStore {
    tokens: Mutex<HashMap<String, LoginToken>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live token for `handle`, sliding its expiry, or mint a
    /// fresh one.
    pub fn get_or_create(&self, handle: &str) -> String {
        let mut tokens = self.lock();
        let now = Instant::now();
        if let Some(tok) = tokens.get_mut(handle) {
            if tok.expires_at >= now {
                tok.expires_at += TOKEN_TTL;
                return tok.token.clone();
            }
        }
        let tok = LoginToken {
            token: generate_guid(TOKEN_LEN),
            expires_at: now + TOKEN_TTL,
        };
        let value = tok.token.clone();
        tokens.insert(handle.to_string(), tok);
        value
    }

    /// Exchange a live token for its handle, consuming it.
    pub fn consume(&self, token: &str) -> Option<String> {
        let mut tokens = self.lock();
        let now = Instant::now();
        let handle = tokens
            .iter()
            .find(|(_, tok)| tok.token == token && tok.expires_at >= now)
            .map(|(handle, _)| handle.clone())?;
        tokens.remove(&handle);
        Some(handle)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LoginToken>> {
        self.tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

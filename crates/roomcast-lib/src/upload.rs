//! Volatile store for uploaded images and the per-room upload budget.
//!
//! Uploads live in RAM only and expire after `max_age`; the store's
//! total resident size is capped by `max_memory`. Each room gets a token
//! bucket; idle buckets are evicted.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::debug;

use crate::config::UploadSettings;
use crate::error::AppError;
use crate::hub::generate_guid;

const UPLOAD_ID_LEN: usize = 12;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Buckets idle longer than this are dropped.
const LIMITER_IDLE: Duration = Duration::from_secs(10 * 60);

/// Detect the three accepted image types by their magic bytes.
pub fn sniff_image_mime(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
        return Some("image/png");
    }
    if data.starts_with(&[0xff, 0xd8, 0xff]) {
        return Some("image/jpeg");
    }
    None
}

#[derive(Clone)]
pub struct Upload {
    pub id: String,
    pub name: String,
    pub mime: &'static str,
    pub data: Bytes,
    created_at: Instant,
}

/// In-memory upload store with TTL eviction.
pub struct UploadStore {
    cfg: UploadSettings,
    files: DashMap<String, Upload>,
    total_bytes: AtomicU64,
}

impl UploadStore {
    pub fn new(cfg: UploadSettings) -> Arc<Self> {
        let store = Arc::new(Self {
            cfg,
            files: DashMap::new(),
            total_bytes: AtomicU64::new(0),
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

    pub fn add(&self, name: &str, mime: &'static str, data: Bytes) -> Result<Upload, AppError> {
        let size = data.len() as u64;
        if self.total_bytes.load(Ordering::Acquire) + size > self.cfg.max_memory {
            return Err(AppError::Storage("upload store is out of memory".into()));
        }

        let upload = Upload {
            id: generate_guid(UPLOAD_ID_LEN),
            name: name.to_string(),
            mime,
            data,
            created_at: Instant::now(),
        };
        self.total_bytes.fetch_add(size, Ordering::AcqRel);
        self.files.insert(upload.id.clone(), upload.clone());
        Ok(upload)
    }

    pub fn get(&self, id: &str) -> Option<Upload> {
        self.files.get(id).map(|entry| entry.clone())
    }

    fn sweep(&self) {
        let max_age = Duration::from_secs(self.cfg.max_age);
        let mut dropped = 0usize;
        self.files.retain(|_, upload| {
            if upload.created_at.elapsed() > max_age {
                self.total_bytes
                    .fetch_sub(upload.data.len() as u64, Ordering::AcqRel);
                dropped += 1;
                false
            } else {
                true
            }
        });
        if dropped > 0 {
            debug!(dropped, "swept expired uploads");
        }
    }
}

struct RoomLimiter {
    limiter: DefaultDirectRateLimiter,
    last_used: Instant,
}

/// Per-room upload token buckets: `rate_limit_count` per
/// `rate_limit_period`, burst `rate_limit_burst`.
pub struct RoomRateLimiters {
    quota: Quota,
    limiters: DashMap<String, RoomLimiter>,
}

impl RoomRateLimiters {
    pub fn new(cfg: &UploadSettings) -> Arc<Self> {
        let per = Duration::from_secs(cfg.rate_limit_period.max(1)) / cfg.rate_limit_count.max(1);
        let quota = Quota::with_period(per.max(Duration::from_millis(1)))
            .expect("period is non-zero")
            .allow_burst(NonZeroU32::new(cfg.rate_limit_burst.max(1)).expect("burst is non-zero"));

        let limiters = Arc::new(Self {
            quota,
            limiters: DashMap::new(),
        });
        let every = Duration::from_secs(cfg.rate_limit_period) + SWEEP_INTERVAL;
        tokio::spawn(Self::watch(Arc::downgrade(&limiters), every));
        limiters
    }

    /// Whether `room_id` may upload now; consumes one token.
    pub fn allow(&self, room_id: &str) -> bool {
        let mut entry = self
            .limiters
            .entry(room_id.to_string())
            .or_insert_with(|| RoomLimiter {
                limiter: RateLimiter::direct(self.quota),
                last_used: Instant::now(),
            });
        entry.last_used = Instant::now();
        entry.limiter.check().is_ok()
    }

    async fn watch(limiters: Weak<Self>, every: Duration) {
        let mut tick = tokio::time::interval(every.max(Duration::from_secs(1)));
        loop {
            tick.tick().await;
            let Some(limiters) = limiters.upgrade() else { break };
            limiters.evict_idle();
        }
    }

    fn evict_idle(&self) {
        self.limiters
            .retain(|_, limiter| limiter.last_used.elapsed() < LIMITER_IDLE);
    }
}

//! In-process rate limiting.
//!
//! Fixed one-minute windows, one bucket per key, compare-and-swap
//! increments. Buckets are ephemeral and rebuilt empty on restart.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

/// Window length in seconds.
const WINDOW_SECONDS: u64 = 60;

struct Bucket {
    window: AtomicU64,
    count: AtomicU32,
}

/// Windowed counter limiter.
pub struct RateLimiter {
    limit: u32,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    /// Creates a limiter allowing `limit` hits per key per window.
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            buckets: DashMap::new(),
        }
    }

    /// Records a hit. Returns `false` once the key is over its budget for
    /// the current window.
    pub fn check(&self, key: &str) -> bool {
        let now_window = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() / WINDOW_SECONDS)
            .unwrap_or(0);

        let bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            window: AtomicU64::new(now_window),
            count: AtomicU32::new(0),
        });

        let seen_window = bucket.window.load(Ordering::Acquire);
        if seen_window != now_window
            && bucket
                .window
                .compare_exchange(seen_window, now_window, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // First hit of a fresh window resets the counter.
            bucket.count.store(0, Ordering::Release);
        }

        bucket.count.fetch_add(1, Ordering::AcqRel) < self.limit
    }
}

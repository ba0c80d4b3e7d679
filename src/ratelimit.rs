//! Fixed-window rate limiter for `POST /v1/agents/register` (spec §4.4,
//! §9 P3). One window per client IP; the window resets wholesale every
//! `window` instead of sliding, which is what the spec calls for and
//! keeps the accounting trivial compared to a token bucket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::HeaderMap;

struct Window {
    started_at: Instant,
    count: u32,
}

pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
        }
    }

    /// Returns `true` if `key` is still within its budget for the current
    /// window, and records the hit. Never denies on internal error: a
    /// poisoned entry is simply replaced with a fresh window.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window {
                started_at: now,
                count: 0,
            });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        entry.count += 1;
        entry.count <= self.limit
    }

    /// Periodic cleanup so the map doesn't grow unbounded under churn;
    /// safe to call from the purge loop's tick.
    pub fn evict_stale(&self) {
        let now = Instant::now();
        let window = self.window;
        self.windows
            .retain(|_, w| now.duration_since(w.started_at) < window * 2);
    }
}

/// Best-effort client address for rate-limiting and audit logging. Trusts
/// `X-Forwarded-For` (first hop) then `X-Real-IP` ahead of the socket
/// peer address, since the service is expected to run behind a reverse
/// proxy or platform load balancer; fails open to `"unknown"` rather than
/// reject the request if nothing is present.
pub fn extract_client_ip(headers: &HeaderMap, peer: Option<std::net::SocketAddr>) -> String {
    if let Some(v) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = v.split(',').next() {
            let candidate = first.trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
    }
    if let Some(v) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !v.trim().is_empty() {
            return v.trim().to_string();
        }
    }
    peer.map(|a| a.ip().to_string()).unwrap_or_else(|| "unknown".to_string())
}

pub type SharedRateLimiter = Arc<RateLimiter>;

use crate::config::RateLimitSettings;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;

/// Fixed-window request counter keyed by client identifier.
///
/// Each key owns a counter that resets `window` after its first request.
/// The check is atomic per key; a background sweep evicts expired windows so
/// memory stays bounded by the active-client count.
pub struct RateLimiter {
    enabled: bool,
    window: Duration,
    max_requests: u32,
    entries: Mutex<HashMap<String, WindowEntry>>,
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    window_start: SystemTime,
}

/// Outcome of one admission check, carrying everything the HTTP edge needs
/// for the `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds since epoch at which the client's window resets.
    pub reset_epoch_secs: u64,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            enabled: settings.enabled,
            window: settings.window,
            max_requests: settings.max_requests,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Check and account one request for `key`.
    pub async fn is_allowed(&self, key: &str) -> RateDecision {
        let now = SystemTime::now();

        if !self.enabled {
            return RateDecision {
                allowed: true,
                limit: self.max_requests,
                remaining: self.max_requests,
                reset_epoch_secs: epoch_secs(now + self.window),
            };
        }

        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.to_string()).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        let expired = now
            .duration_since(entry.window_start)
            .map(|elapsed| elapsed >= self.window)
            .unwrap_or(true);
        if expired {
            entry.count = 0;
            entry.window_start = now;
        }

        let reset_epoch_secs = epoch_secs(entry.window_start + self.window);

        if entry.count >= self.max_requests {
            debug!(client = key, "rate limit exceeded");
            return RateDecision {
                allowed: false,
                limit: self.max_requests,
                remaining: 0,
                reset_epoch_secs,
            };
        }

        entry.count += 1;
        RateDecision {
            allowed: true,
            limit: self.max_requests,
            remaining: self.max_requests - entry.count,
            reset_epoch_secs,
        }
    }

    /// Number of clients currently holding a window.
    pub async fn active_clients(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Drop every entry whose window has fully elapsed.
    pub async fn evict_expired(&self) {
        let now = SystemTime::now();
        let window = self.window;
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            now.duration_since(entry.window_start)
                .map(|elapsed| elapsed < window)
                .unwrap_or(false)
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "rate limiter sweep");
        }
    }

    /// Start the periodic eviction sweep. One tick per window length.
    pub fn start_eviction_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        let period = self.window;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.evict_expired().await;
            }
        })
    }
}

fn epoch_secs(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Client key for admission: the first `X-Forwarded-For` value when present,
/// otherwise the socket peer address.
pub fn client_key(forwarded_for: Option<&str>, peer: &std::net::SocketAddr) -> String {
    forwarded_for
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(window: Duration, max_requests: u32) -> RateLimitSettings {
        RateLimitSettings {
            enabled: true,
            window,
            max_requests,
        }
    }

    #[tokio::test]
    async fn allows_up_to_max_then_denies() {
        let limiter = RateLimiter::new(&settings(Duration::from_secs(60), 3));

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.is_allowed("1.2.3.4").await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denied = limiter.is_allowed("1.2.3.4").await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        let now = epoch_secs(SystemTime::now());
        assert!(denied.reset_epoch_secs >= now);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(&settings(Duration::from_secs(60), 1));

        assert!(limiter.is_allowed("a").await.allowed);
        assert!(!limiter.is_allowed("a").await.allowed);
        assert!(limiter.is_allowed("b").await.allowed);
    }

    #[tokio::test]
    async fn window_expiry_resets_the_counter() {
        let limiter = RateLimiter::new(&settings(Duration::from_millis(40), 1));

        assert!(limiter.is_allowed("a").await.allowed);
        assert!(!limiter.is_allowed("a").await.allowed);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.is_allowed("a").await.allowed);
    }

    #[tokio::test]
    async fn sweep_evicts_expired_entries() {
        let limiter = RateLimiter::new(&settings(Duration::from_millis(30), 5));

        limiter.is_allowed("a").await;
        limiter.is_allowed("b").await;
        assert_eq!(limiter.active_clients().await, 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.evict_expired().await;
        assert_eq!(limiter.active_clients().await, 0);
    }

    #[tokio::test]
    async fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(&RateLimitSettings {
            enabled: false,
            window: Duration::from_secs(60),
            max_requests: 1,
        });

        for _ in 0..10 {
            assert!(limiter.is_allowed("a").await.allowed);
        }
    }

    #[test]
    fn client_key_prefers_forwarded_for() {
        let peer: std::net::SocketAddr = "10.0.0.9:12345".parse().unwrap();
        assert_eq!(
            client_key(Some("203.0.113.7, 10.0.0.1"), &peer),
            "203.0.113.7"
        );
        assert_eq!(client_key(Some("  "), &peer), "10.0.0.9");
        assert_eq!(client_key(None, &peer), "10.0.0.9");
    }
}

/* src/ratelimit.rs */

//! Rate limiting: a local token bucket per client key, or a fixed window
//! counted in the shared store.

use crate::clock::Clock;
use crate::counter::{SharedCounter, incr_with_ttl};
use anyhow::Result;
use axum::http::HeaderMap;
use fancy_log::{LogLevel, log};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Derives the limiter / quota key: the configured header when present and
/// non-empty, otherwise the client IP.
pub fn client_key(headers: &HeaderMap, key_header: Option<&str>, client_ip: &str) -> String {
    key_header
        .filter(|h| !h.is_empty())
        .and_then(|h| headers.get(h))
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(|| client_ip.to_owned(), str::to_owned)
}

/// Token bucket with rate `rps` and capacity `burst`. Starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: u64,
}

impl TokenBucket {
    pub fn new(burst: f64, now_millis: u64) -> Self {
        Self { tokens: burst, last_refill: now_millis }
    }

    /// Refills for the elapsed time, then tries to take one token.
    pub fn try_acquire(&mut self, rps: f64, burst: f64, now_millis: u64) -> bool {
        let elapsed = now_millis.saturating_sub(self.last_refill) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * rps).min(burst);
        self.last_refill = now_millis;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Share of the map evicted in one go once it is full.
const EVICT_FRACTION: usize = 10;

struct Slot {
    bucket: TokenBucket,
    last_seen: u64,
}

/// Per-route map of token buckets keyed by client identity.
///
/// Memory is bounded two ways: entries idle for longer than `idle_ttl` are
/// swept, and inserting past `max_keys` evicts the least recently seen key.
pub struct LocalLimiter {
    rps: f64,
    burst: f64,
    max_keys: usize,
    idle_ttl_ms: u64,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, Slot>>,
}

impl LocalLimiter {
    pub fn new(rps: f64, burst: u32, max_keys: usize, idle_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            rps: rps.max(0.0),
            burst: f64::from(burst.max(1)),
            max_keys: max_keys.max(1),
            idle_ttl_ms: u64::try_from(idle_ttl.as_millis()).unwrap_or(u64::MAX),
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Non-blocking admission decision for `key`.
    pub fn allow(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);

        if !buckets.contains_key(key) && buckets.len() >= self.max_keys {
            self.evict(&mut buckets, now);
        }

        let slot = buckets.entry(key.to_owned()).or_insert_with(|| Slot {
            bucket: TokenBucket::new(self.burst, now),
            last_seen: now,
        });
        slot.last_seen = now;
        slot.bucket.try_acquire(self.rps, self.burst, now)
    }

    /// Drops idle keys, then the least recently seen tenth of the map, so a
    /// stream of fresh keys pays for the scan once per batch.
    fn evict(&self, buckets: &mut HashMap<String, Slot>, now: u64) {
        let ttl = self.idle_ttl_ms;
        buckets.retain(|_, slot| now.saturating_sub(slot.last_seen) < ttl);
        if buckets.len() < self.max_keys {
            return;
        }

        let excess = buckets.len() + 1 - self.max_keys;
        let batch = excess.max(self.max_keys / EVICT_FRACTION).min(buckets.len());
        let mut by_age: Vec<(u64, String)> = buckets
            .iter()
            .map(|(key, slot)| (slot.last_seen, key.clone()))
            .collect();
        by_age.select_nth_unstable_by_key(batch - 1, |(seen, _)| *seen);
        for (_, key) in &by_age[..batch] {
            buckets.remove(key);
        }
    }

    /// Removes idle buckets. Called periodically by the server.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let ttl = self.idle_ttl_ms;
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, slot| now.saturating_sub(slot.last_seen) < ttl);
        let removed = before - buckets.len();
        if removed > 0 {
            log(LogLevel::Debug, &format!("Swept {removed} idle rate limiters"));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Start of the fixed window containing `now_secs`.
pub fn window_start(now_secs: u64, window_sec: u64) -> u64 {
    let w = window_sec.max(1);
    (now_secs / w) * w
}

/// Store key for the shared fixed window: `rl:<route>:<key>:<windowStart>`.
pub fn window_key(route: &str, user_key: &str, window_start: u64) -> String {
    format!("rl:{route}:{user_key}:{window_start}")
}

/// Counts one request in the shared fixed window and reports whether it is
/// within `limit`. Store errors are returned, never treated as admission.
pub async fn allow_shared(
    counter: &dyn SharedCounter,
    route: &str,
    user_key: &str,
    window_sec: u64,
    limit: u64,
    now_secs: u64,
) -> Result<bool> {
    let window_sec = window_sec.max(1);
    let key = window_key(route, user_key, window_start(now_secs, window_sec));
    let count = incr_with_ttl(counter, &key, Duration::from_secs(window_sec)).await?;
    Ok(u64::try_from(count).is_ok_and(|c| c <= limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::counter::MemoryCounter;
    use axum::http::HeaderValue;

    fn limiter(clock: &Arc<ManualClock>, rps: f64, burst: u32, max_keys: usize) -> LocalLimiter {
        LocalLimiter::new(rps, burst, max_keys, Duration::from_secs(60), clock.clone())
    }

    #[test]
    fn burst_then_reject() {
        let clock = ManualClock::shared();
        let rl = limiter(&clock, 1.0, 2, 100);
        assert!(rl.allow("K"));
        assert!(rl.allow("K"));
        assert!(!rl.allow("K"));
    }

    #[test]
    fn refills_at_rate() {
        let clock = ManualClock::shared();
        let rl = limiter(&clock, 2.0, 1, 100);
        assert!(rl.allow("K"));
        assert!(!rl.allow("K"));
        clock.advance(Duration::from_millis(500));
        assert!(rl.allow("K"));
        assert!(!rl.allow("K"));
    }

    #[test]
    fn admits_at_most_burst_plus_rate_times_t() {
        let clock = ManualClock::shared();
        let rl = limiter(&clock, 5.0, 3, 100);
        let mut admitted = 0;
        // 10 seconds in 10ms steps, 4 attempts per step.
        for _ in 0..1000 {
            for _ in 0..4 {
                if rl.allow("K") {
                    admitted += 1;
                }
            }
            clock.advance(Duration::from_millis(10));
        }
        assert!(admitted <= 3 + 5 * 10, "admitted {admitted}");
        assert!(admitted >= 5 * 10);
    }

    #[test]
    fn keys_are_independent() {
        let clock = ManualClock::shared();
        let rl = limiter(&clock, 1.0, 1, 100);
        assert!(rl.allow("a"));
        assert!(!rl.allow("a"));
        assert!(rl.allow("b"));
    }

    #[test]
    fn map_never_exceeds_cap() {
        let clock = ManualClock::shared();
        let rl = limiter(&clock, 1.0, 1, 16);
        for i in 0..1000 {
            clock.advance(Duration::from_millis(1));
            rl.allow(&format!("attacker-{i}"));
        }
        assert!(rl.len() <= 16);
        // The most recent key survived eviction and is still throttled.
        assert!(!rl.allow("attacker-999"));
    }

    #[test]
    fn full_map_evicts_oldest_batch() {
        let clock = ManualClock::shared();
        let rl = limiter(&clock, 1.0, 1, 100);
        for i in 0..100 {
            clock.advance(Duration::from_millis(1));
            rl.allow(&format!("k{i}"));
        }
        assert_eq!(rl.len(), 100);

        clock.advance(Duration::from_millis(1));
        rl.allow("fresh");
        assert_eq!(rl.len(), 91);

        // The next nine new keys fit without another eviction.
        for i in 0..9 {
            rl.allow(&format!("n{i}"));
        }
        assert_eq!(rl.len(), 100);

        // Oldest keys were dropped and start with a full bucket again.
        assert!(rl.allow("k0"));
        assert!(!rl.allow("k99"));
    }

    #[test]
    fn sweep_drops_idle_keys() {
        let clock = ManualClock::shared();
        let rl = limiter(&clock, 1.0, 1, 100);
        rl.allow("a");
        clock.advance(Duration::from_secs(30));
        rl.allow("b");
        clock.advance(Duration::from_secs(31));
        assert_eq!(rl.sweep(), 1);
        assert_eq!(rl.len(), 1);
    }

    #[test]
    fn client_key_prefers_non_empty_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers, Some("X-Key"), "10.0.0.1"), "10.0.0.1");
        headers.insert("x-key", HeaderValue::from_static(""));
        assert_eq!(client_key(&headers, Some("X-Key"), "10.0.0.1"), "10.0.0.1");
        headers.insert("x-key", HeaderValue::from_static("K"));
        assert_eq!(client_key(&headers, Some("X-Key"), "10.0.0.1"), "K");
        assert_eq!(client_key(&headers, None, "10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn window_start_floors_to_window() {
        assert_eq!(window_start(125, 60), 120);
        assert_eq!(window_start(120, 60), 120);
        assert_eq!(window_key("orders", "K", 120), "rl:orders:K:120");
    }

    #[tokio::test]
    async fn shared_window_caps_each_bucket() {
        let store = MemoryCounter::new();
        let mut admitted = 0;
        for _ in 0..5 {
            if allow_shared(&store, "r", "K", 60, 3, 130).await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        // Next window starts fresh.
        assert!(allow_shared(&store, "r", "K", 60, 3, 180).await.unwrap());
    }
}

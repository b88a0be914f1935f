/* src/upstream.rs */

//! Upstream selection and per-upstream health for one route.
//!
//! Selection order: header override, then load balancing over `upstreams`
//! (skipping ejected hosts), then the canary split. Outcomes feed the
//! outlier detector, which ejects an upstream for a while after
//! `failure_threshold` consecutive failures. Ejection is advisory: when every
//! upstream is ejected one is still returned.

use crate::clock::Clock;
use crate::models::{CanaryBucketing, LoadBalancing, OutlierSpec};
use crate::routing::CompiledRoute;
use axum::http::HeaderMap;
use fancy_log::{LogLevel, log};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Why a particular upstream was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    HeaderRoute,
    Primary,
    Balanced,
    Canary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub upstream: String,
    pub via: Via,
}

#[derive(Debug, Default)]
struct PoolState {
    lb_index: usize,
    active: HashMap<String, usize>,
    fail: HashMap<String, u32>,
    ejected_until: HashMap<String, u64>,
}

impl PoolState {
    fn is_ejected(&self, upstream: &str, now: u64) -> bool {
        self.ejected_until.get(upstream).is_some_and(|&until| now < until)
    }
}

/// Load-balancer and outlier state for one route.
#[derive(Debug)]
pub struct UpstreamPool {
    route: String,
    outlier: Option<OutlierSpec>,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState>,
}

impl UpstreamPool {
    pub fn new(route: &CompiledRoute, clock: Arc<dyn Clock>) -> Self {
        Self {
            route: route.name.clone(),
            outlier: route.outlier_detection.clone(),
            clock,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Picks the upstream for a request. `None` when the route names no
    /// upstream at all.
    pub fn select(&self, route: &CompiledRoute, headers: &HeaderMap, request_id: &str) -> Option<Selection> {
        for hr in &route.header_routes {
            let hit = headers
                .get(&hr.header)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == hr.value);
            if hit {
                return Some(Selection { upstream: hr.upstream.clone(), via: Via::HeaderRoute });
            }
        }

        let mut selection = if route.upstreams.is_empty() {
            route
                .upstream
                .clone()
                .map(|upstream| Selection { upstream, via: Via::Primary })
        } else {
            let upstream = self.balance(&route.upstreams, route.load_balancing);
            Some(Selection { upstream, via: Via::Balanced })
        };

        if let (Some(canary), Some(percent)) = (&route.canary_upstream, route.canary_percent) {
            if f64::from(canary_bucket(request_id, route.canary_bucketing)) < percent {
                selection = Some(Selection { upstream: canary.clone(), via: Via::Canary });
            }
        }

        selection
    }

    fn balance(&self, upstreams: &[String], policy: LoadBalancing) -> String {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        let n = upstreams.len();
        let start = state.lb_index % n;

        match policy {
            LoadBalancing::RoundRobin => {
                let idx = (0..n)
                    .map(|i| (start + i) % n)
                    .find(|&idx| !state.is_ejected(&upstreams[idx], now))
                    .unwrap_or(start);
                state.lb_index = (idx + 1) % n;
                upstreams[idx].clone()
            }
            LoadBalancing::LeastConnections => {
                let mut best: Option<(usize, usize)> = None;
                for (idx, upstream) in upstreams.iter().enumerate() {
                    if state.is_ejected(upstream, now) {
                        continue;
                    }
                    let active = state.active.get(upstream).copied().unwrap_or(0);
                    if best.is_none_or(|(_, min)| active < min) {
                        best = Some((idx, active));
                    }
                }
                let idx = best.map_or(start, |(idx, _)| idx);
                upstreams[idx].clone()
            }
        }
    }

    /// Marks a dispatch to `upstream` as started. The returned guard releases
    /// the in-flight slot when dropped.
    pub fn begin(self: &Arc<Self>, upstream: &str) -> InFlight {
        *self.lock().active.entry(upstream.to_owned()).or_insert(0) += 1;
        InFlight { pool: Arc::clone(self), upstream: upstream.to_owned(), finished: false }
    }

    fn release(&self, upstream: &str) {
        let mut state = self.lock();
        if let Some(n) = state.active.get_mut(upstream) {
            *n = n.saturating_sub(1);
        }
    }

    /// Feeds a dispatch outcome to the outlier detector. Returns `true` when
    /// this failure ejected the upstream.
    fn record(&self, upstream: &str, success: bool) -> bool {
        let Some(outlier) = &self.outlier else {
            return false;
        };
        let mut state = self.lock();
        if success {
            state.fail.insert(upstream.to_owned(), 0);
            return false;
        }

        let fails = state.fail.entry(upstream.to_owned()).or_insert(0);
        *fails += 1;
        if *fails < outlier.failure_threshold.max(1) {
            return false;
        }

        *fails = 0;
        let until = self
            .clock
            .now_millis()
            .saturating_add(outlier.eject_duration_sec.saturating_mul(1000));
        state.ejected_until.insert(upstream.to_owned(), until);
        log(
            LogLevel::Warn,
            &format!(
                "Ejected upstream {upstream} from route '{}' for {}s",
                self.route, outlier.eject_duration_sec
            ),
        );
        true
    }

    pub fn active(&self, upstream: &str) -> usize {
        self.lock().active.get(upstream).copied().unwrap_or(0)
    }

    pub fn failures(&self, upstream: &str) -> u32 {
        self.lock().fail.get(upstream).copied().unwrap_or(0)
    }

    pub fn is_ejected(&self, upstream: &str) -> bool {
        let now = self.clock.now_millis();
        self.lock().is_ejected(upstream, now)
    }
}

/// One in-flight dispatch. Holds the upstream's active slot until dropped.
#[must_use]
pub struct InFlight {
    pool: Arc<UpstreamPool>,
    upstream: String,
    finished: bool,
}

impl InFlight {
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Records the outcome once; later calls are ignored. Returns `true`
    /// when the outcome ejected the upstream.
    pub fn finish(&mut self, success: bool) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.pool.record(&self.upstream, success)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.pool.release(&self.upstream);
    }
}

/// Bucket in `[0, 100)` derived from the correlation id.
pub fn canary_bucket(request_id: &str, bucketing: CanaryBucketing) -> u8 {
    let bucket = match bucketing {
        CanaryBucketing::LastByte => request_id.as_bytes().last().map_or(0, |&b| u64::from(b)),
        CanaryBucketing::Hash => mix(fnv1a(request_id.as_bytes())),
    } % 100;
    u8::try_from(bucket).unwrap_or(0)
}

/// Final avalanche so ids sharing a long prefix still spread evenly.
fn mix(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^ (h >> 33)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}

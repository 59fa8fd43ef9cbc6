//! Per-identity rate limiting over a shared counter store.
//!
//! The limiter itself holds no window state: every decision is a single
//! atomic round-trip to a [`CounterStore`] shared by all server processes, so
//! limits hold across the whole deployment rather than per process.
//!
//! # Algorithms
//!
//! - **Fixed window**: a counter per (identity, policy) that expires
//!   `interval` after its first hit. Hits beyond `max_hits` inside the window
//!   are rejected.
//! - **Sliding window**: a set of hit timestamps per (identity, policy);
//!   timestamps older than `now - interval` are pruned before each decision.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use chatgate_server::rate_limit::{RateLimiter, RateLimitPolicy, RateLimitResult};
//! use chatgate_server::store::MemoryCounterStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new()));
//!     let policy = RateLimitPolicy::fixed_window(Duration::from_secs(30), 5);
//!
//!     match limiter.decide("203.0.113.7", &policy).await.unwrap() {
//!         RateLimitResult::Allowed { remaining } => assert_eq!(remaining, 4),
//!         RateLimitResult::Limited { .. } => unreachable!(),
//!     }
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::store::{CounterStore, StoreError};

/// Header carrying the original client address when behind a proxy.
pub const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";

/// Identity used when no address can be determined.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Default bound on a single store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Windowing algorithm used by a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    FixedWindow,
    SlidingWindow,
}

impl Algorithm {
    fn key_prefix(self) -> &'static str {
        match self {
            Self::FixedWindow => "limiter:fixed-window",
            Self::SlidingWindow => "limiter:sliding-window",
        }
    }
}

/// An immutable admission policy attached to a protected route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitPolicy {
    interval: Duration,
    max_hits: u32,
    algorithm: Algorithm,
}

impl RateLimitPolicy {
    /// Creates a policy. `max_hits` is clamped to at least 1.
    pub const fn new(interval: Duration, max_hits: u32, algorithm: Algorithm) -> Self {
        let max_hits = if max_hits == 0 { 1 } else { max_hits };
        Self {
            interval,
            max_hits,
            algorithm,
        }
    }

    /// Fixed-window policy.
    pub const fn fixed_window(interval: Duration, max_hits: u32) -> Self {
        Self::new(interval, max_hits, Algorithm::FixedWindow)
    }

    /// Sliding-window policy.
    pub const fn sliding_window(interval: Duration, max_hits: u32) -> Self {
        Self::new(interval, max_hits, Algorithm::SlidingWindow)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_hits(&self) -> u32 {
        self.max_hits
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Store key for `identity` under this policy.
    pub fn key_for(&self, identity: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            self.algorithm.key_prefix(),
            self.interval.as_millis(),
            self.max_hits,
            identity
        )
    }

    /// Seconds a rejected caller should wait, rounded up, at least 1.
    fn retry_after_secs(&self) -> u64 {
        let millis = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX);
        millis.div_ceil(1000).max(1)
    }
}

/// Result of a rate limit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// The request is admitted; `remaining` more hits fit in the window.
    Allowed {
        remaining: u32,
    },

    /// The request is rejected.
    ///
    /// The value should be returned in the `Retry-After` HTTP header.
    Limited {
        /// Number of seconds until the caller can retry.
        retry_after_secs: u64,
    },
}

impl RateLimitResult {
    /// Returns `true` if the request is allowed.
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Returns `true` if the request is rate limited.
    #[inline]
    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited { .. })
    }

    /// Remaining hits if allowed, or `None` if limited.
    #[inline]
    pub fn remaining(&self) -> Option<u32> {
        match self {
            Self::Allowed { remaining } => Some(*remaining),
            Self::Limited { .. } => None,
        }
    }

    /// Returns the retry-after duration if rate limited, or `None` if allowed.
    #[inline]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Allowed { .. } => None,
            Self::Limited { retry_after_secs } => Some(*retry_after_secs),
        }
    }

    fn from_hits(hits: i64, policy: &RateLimitPolicy) -> Self {
        let max_hits = i64::from(policy.max_hits);
        if hits > max_hits {
            Self::Limited {
                retry_after_secs: policy.retry_after_secs(),
            }
        } else {
            // 0 <= max_hits - hits <= max_hits, so the cast cannot truncate.
            Self::Allowed {
                remaining: (max_hits - hits.max(0)) as u32,
            }
        }
    }
}

/// Stateless rate limiter backed by a shared [`CounterStore`].
///
/// Cloning is cheap; clones share the same store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl RateLimiter {
    /// Creates a limiter using [`DEFAULT_STORE_TIMEOUT`].
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_timeout(store, DEFAULT_STORE_TIMEOUT)
    }

    /// Creates a limiter whose store round-trips are bounded by `timeout`.
    pub fn with_timeout(store: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Records a hit for `identity` and decides whether to admit it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store is unreachable, times out, or
    /// replies with a non-integer. This is an infrastructure fault, never a
    /// rejection.
    pub async fn decide(
        &self,
        identity: &str,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitResult, StoreError> {
        self.decide_at(identity, policy, unix_millis()).await
    }

    /// Same as [`decide`](Self::decide) with an explicit clock reading in
    /// Unix milliseconds. Only the sliding window consults it.
    pub async fn decide_at(
        &self,
        identity: &str,
        policy: &RateLimitPolicy,
        now_ms: i64,
    ) -> Result<RateLimitResult, StoreError> {
        let key = policy.key_for(identity);

        let round_trip = async {
            match policy.algorithm {
                Algorithm::FixedWindow => self.store.incr_window(&key, policy.interval).await,
                Algorithm::SlidingWindow => {
                    let interval_ms = i64::try_from(policy.interval.as_millis()).unwrap_or(i64::MAX);
                    let member = format!("{now_ms}-{}", Uuid::new_v4().simple());
                    self.store
                        .slide_window(&key, now_ms, interval_ms, &member)
                        .await
                }
            }
        };

        let hits = tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| StoreError::Timeout)??;

        let result = RateLimitResult::from_hits(hits, policy);
        trace!(
            identity = %identity,
            algorithm = ?policy.algorithm,
            hits,
            allowed = result.is_allowed(),
            "Rate limit decision"
        );
        if result.is_limited() {
            debug!(identity = %identity, hits, "Rate limit exceeded");
        }

        Ok(result)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &"<CounterStore>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Determines the identity a request is rate limited under.
///
/// Prefers the first `X-Forwarded-For` entry, then the peer address, then
/// [`UNKNOWN_IDENTITY`]. A missing identity never rejects a request.
pub fn extract_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(HEADER_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    if let Some(forwarded) = forwarded {
        return forwarded.to_string();
    }

    match peer {
        Some(addr) => addr.ip().to_string(),
        None => UNKNOWN_IDENTITY.to_string(),
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

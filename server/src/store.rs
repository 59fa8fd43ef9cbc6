//! Shared counter store backing the rate limiter.
//!
//! The store exposes exactly the two atomic window operations the limiter
//! needs. Each runs as a single indivisible step on the store, so concurrent
//! callers (in this process or any other) never observe a half-updated
//! window.
//!
//! - [`RedisCounterStore`] runs both operations as Lua scripts on Redis.
//! - [`MemoryCounterStore`] keeps the same semantics in-process for local
//!   mode and tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Script, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// INCR the key; arm the expiry only on the first increment of a window.
const FIXED_WINDOW_SCRIPT: &str = r"
local hits = redis.call('INCR', KEYS[1])
if hits == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return hits
";

/// Prune stale members, record this hit, count what is left.
const SLIDING_WINDOW_SCRIPT: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1] - ARGV[2])
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[3])
local hits = redis.call('ZCARD', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return hits
";

/// Errors raised by a counter store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the command failed.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something other than an integer.
    #[error("unexpected counter store reply: {0}")]
    UnexpectedReply(String),

    /// The round-trip did not complete within the operation timeout.
    #[error("counter store operation timed out")]
    Timeout,
}

/// Atomic counter and sorted-set operations shared by all processes.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key` and returns the new count.
    ///
    /// When the increment creates the key (count becomes 1) its expiry is set
    /// to `ttl`; later increments never touch the expiry.
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Drops members scored at or below `now_ms - interval_ms`, records
    /// `member` at `now_ms`, and returns how many members remain.
    async fn slide_window(
        &self,
        key: &str,
        now_ms: i64,
        interval_ms: i64,
        member: &str,
    ) -> Result<i64, StoreError>;
}

// ============================================================================
// Redis
// ============================================================================

/// Counter store backed by Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: MultiplexedConnection,
    fixed_window: Arc<Script>,
    sliding_window: Arc<Script>,
}

impl RedisCounterStore {
    /// Opens a multiplexed connection to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        debug!("Counter store connected");
        Ok(Self::from_connection(connection))
    }

    /// Wraps an existing multiplexed connection.
    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            fixed_window: Arc::new(Script::new(FIXED_WINDOW_SCRIPT)),
            sliding_window: Arc::new(Script::new(SLIDING_WINDOW_SCRIPT)),
        }
    }
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

/// Interprets a script reply as a hit count.
fn reply_to_count(reply: Value) -> Result<i64, StoreError> {
    match reply {
        Value::Int(count) => Ok(count),
        other => Err(StoreError::UnexpectedReply(format!("{other:?}"))),
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut connection = self.connection.clone();
        let reply: Value = self
            .fixed_window
            .key(key)
            .arg(ttl_ms)
            .invoke_async(&mut connection)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        reply_to_count(reply)
    }

    async fn slide_window(
        &self,
        key: &str,
        now_ms: i64,
        interval_ms: i64,
        member: &str,
    ) -> Result<i64, StoreError> {
        let mut connection = self.connection.clone();
        let reply: Value = self
            .sliding_window
            .key(key)
            .arg(now_ms)
            .arg(interval_ms)
            .arg(member)
            .invoke_async(&mut connection)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        reply_to_count(reply)
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug)]
struct FixedEntry {
    hits: i64,
    expires_at: Instant,
}

#[derive(Debug)]
struct WindowEntry {
    /// (score, member), ordered by score.
    members: BTreeSet<(i64, String)>,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryInner {
    counters: HashMap<String, FixedEntry>,
    windows: HashMap<String, WindowEntry>,
}

impl MemoryInner {
    /// Drops every key whose expiry has passed, as Redis would.
    fn evict_expired(&mut self, now: Instant) {
        self.counters.retain(|_, entry| entry.expires_at > now);
        self.windows.retain(|_, entry| entry.expires_at > now);
    }
}

/// In-process counter store with the same semantics as Redis.
///
/// Cloning shares the underlying maps.
#[derive(Debug, Clone, Default)]
pub struct MemoryCounterStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryCounterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys across both window kinds.
    pub async fn key_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.evict_expired(Instant::now());
        inner.counters.len() + inner.windows.len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.evict_expired(now);

        let entry = inner
            .counters
            .entry(key.to_string())
            .or_insert_with(|| FixedEntry {
                hits: 0,
                expires_at: now + ttl,
            });

        entry.hits += 1;
        Ok(entry.hits)
    }

    async fn slide_window(
        &self,
        key: &str,
        now_ms: i64,
        interval_ms: i64,
        member: &str,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.evict_expired(now);

        let ttl = Duration::from_millis(u64::try_from(interval_ms).unwrap_or(0).max(1));
        let entry = inner
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                members: BTreeSet::new(),
                expires_at: now + ttl,
            });

        let cutoff = now_ms - interval_ms;
        entry.members.retain(|(score, _)| *score > cutoff);
        entry.members.insert((now_ms, member.to_string()));
        entry.expires_at = now + ttl;

        Ok(entry.members.len() as i64)
    }
}

//! In-process registry of realtime connections.
//!
//! The registry is the single owner of per-connection state. The websocket
//! itself stays with its connection task; the registry only holds:
//!
//! - the sending half of the connection's bounded outbound queue
//! - a one-shot kill switch used to terminate the connection from outside
//! - the liveness flag toggled by the heartbeat protocol
//! - the [`ConnectionState`] of the connection
//! - the connection's heartbeat timer task
//!
//! # Invariants
//!
//! - Every registered entry owns exactly one armed heartbeat timer.
//! - [`ConnectionRegistry::remove`] aborts the timer before dropping the entry.
//! - A timer that fires for an id no longer registered is a no-op.
//!
//! All operations are synchronous and short; the lock is never held across
//! an `.await`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::protocol::OutboundMessage;

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Process-unique connection identifier, assigned at accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Authenticated,
    Closing,
    Closed,
}

/// Events that drive [`ConnectionState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Accepted,
    AuthSucceeded,
    CloseRequested,
    Closed,
}

impl ConnectionState {
    /// Applies `event`, returning the next state. Events that make no sense
    /// in the current state leave it unchanged.
    #[must_use]
    pub fn on(self, event: ConnectionEvent) -> Self {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            (S::Connecting, E::Accepted) => S::Open,
            (S::Open | S::Authenticated, E::AuthSucceeded) => S::Authenticated,
            (S::Connecting | S::Open | S::Authenticated, E::CloseRequested) => S::Closing,
            (_, E::Closed) => S::Closed,
            (state, _) => state,
        }
    }

    /// Returns `true` once AUTH has succeeded and the connection is not closing.
    pub fn is_authenticated(self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

/// Why a connection was terminated from outside its own task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No PONG arrived between two heartbeat ticks.
    MissedHeartbeat,
    /// The outbound queue was full.
    SlowConsumer,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::MissedHeartbeat => "missed heartbeat",
            Self::SlowConsumer => "slow consumer",
            Self::Shutdown => "server shutdown",
        };
        f.write_str(reason)
    }
}

/// Outcome of a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// The connection was alive; a PING was sent and it is now pending.
    Probe,
    /// The previous PING went unanswered; the connection was terminated.
    Terminate,
    /// The connection is no longer registered.
    Gone,
}

/// Handles returned to the connection task on registration.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    /// Frames to write to the socket, in order.
    pub outbound: mpsc::Receiver<Utf8Bytes>,
    /// Fires when the connection must be terminated from outside.
    pub kill: oneshot::Receiver<CloseReason>,
}

struct ConnectionEntry {
    outbound: mpsc::Sender<Utf8Bytes>,
    kill: Option<oneshot::Sender<CloseReason>>,
    is_alive: bool,
    state: ConnectionState,
    heartbeat: Option<JoinHandle<()>>,
}

impl ConnectionEntry {
    /// Fires the kill switch once; later calls are no-ops.
    fn terminate(&mut self, reason: CloseReason) -> bool {
        self.state = self.state.on(ConnectionEvent::CloseRequested);
        match self.kill.take() {
            Some(kill) => kill.send(reason).is_ok(),
            None => false,
        }
    }

    /// Enqueues a frame without waiting. A full queue terminates the
    /// connection as a slow consumer.
    fn enqueue(&mut self, id: ConnectionId, frame: Utf8Bytes) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection_id = %id, "Outbound queue full, dropping slow consumer");
                self.terminate(CloseReason::SlowConsumer);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(connection_id = %id, "Outbound queue closed");
                false
            }
        }
    }
}

/// Registry of live connections in this process.
///
/// Cloning is cheap; clones share the same map.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<ConnectionId, ConnectionEntry>>>,
    heartbeat_interval: Duration,
    outbound_capacity: usize,
}

impl ConnectionRegistry {
    /// Creates an empty registry whose connections are probed every
    /// `heartbeat_interval`.
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self::with_capacity(heartbeat_interval, DEFAULT_OUTBOUND_CAPACITY)
    }

    /// Creates an empty registry with a custom outbound queue capacity.
    pub fn with_capacity(heartbeat_interval: Duration, outbound_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            heartbeat_interval,
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionEntry>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a new connection: assigns an id, marks it alive and arms
    /// its heartbeat timer.
    pub fn register(&self) -> Registration {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_capacity);
        let (kill_tx, kill_rx) = oneshot::channel();

        let mut connections = self.lock();
        let mut id = ConnectionId::new();
        while connections.contains_key(&id) {
            id = ConnectionId::new();
        }

        connections.insert(
            id,
            ConnectionEntry {
                outbound: outbound_tx,
                kill: Some(kill_tx),
                is_alive: true,
                state: ConnectionState::Connecting.on(ConnectionEvent::Accepted),
                heartbeat: Some(self.spawn_heartbeat(id)),
            },
        );
        debug!(connection_id = %id, connections = connections.len(), "Connection registered");

        Registration {
            id,
            outbound: outbound_rx,
            kill: kill_rx,
        }
    }

    /// Removes a connection, cancelling its heartbeat timer first.
    ///
    /// Returns `false` if the id was not registered.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.lock().remove(&id);
        match removed {
            Some(mut entry) => {
                if let Some(timer) = entry.heartbeat.take() {
                    timer.abort();
                }
                entry.state = entry.state.on(ConnectionEvent::Closed);
                debug!(connection_id = %id, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Marks a connection alive (PONG received).
    pub fn mark_alive(&self, id: ConnectionId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.is_alive = true;
        }
    }

    /// Records a successful AUTH. Returns `false` if the id is unknown.
    pub fn authenticate(&self, id: ConnectionId) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => {
                entry.state = entry.state.on(ConnectionEvent::AuthSucceeded);
                entry.state.is_authenticated()
            }
            None => false,
        }
    }

    /// Moves a connection to `Closing`.
    pub fn begin_close(&self, id: ConnectionId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.state = entry.state.on(ConnectionEvent::CloseRequested);
        }
    }

    /// Terminates a connection from outside its task.
    ///
    /// Returns `false` if the id is unknown or was already terminated.
    pub fn terminate(&self, id: ConnectionId, reason: CloseReason) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => entry.terminate(reason),
            None => false,
        }
    }

    /// Terminates every registered connection.
    pub fn terminate_all(&self, reason: CloseReason) -> usize {
        self.lock()
            .values_mut()
            .map(|entry| entry.terminate(reason))
            .filter(|fired| *fired)
            .count()
    }

    /// Queues a frame for one connection.
    pub fn send(&self, id: ConnectionId, message: &OutboundMessage) -> bool {
        let frame = match message.to_text() {
            Ok(text) => Utf8Bytes::from(text),
            Err(err) => {
                error!(connection_id = %id, error = %err, "Failed to serialize frame");
                return false;
            }
        };
        match self.lock().get_mut(&id) {
            Some(entry) => entry.enqueue(id, frame),
            None => false,
        }
    }

    /// Queues `payload` verbatim for every registered connection.
    ///
    /// Never waits on a connection; returns how many accepted the frame.
    pub fn broadcast(&self, payload: &str) -> usize {
        let frame = Utf8Bytes::from(payload.to_owned());
        let mut connections = self.lock();
        let mut delivered = 0;
        for (id, entry) in connections.iter_mut() {
            if entry.enqueue(*id, frame.clone()) {
                delivered += 1;
            }
        }

        trace!(delivered, connections = connections.len(), "Broadcast payload");
        delivered
    }

    /// Runs one heartbeat tick for `id`.
    ///
    /// If the previous probe went unanswered the connection is terminated;
    /// otherwise it is marked pending and sent a PING.
    pub fn heartbeat_tick(&self, id: ConnectionId) -> HeartbeatAction {
        let mut connections = self.lock();
        let Some(entry) = connections.get_mut(&id) else {
            return HeartbeatAction::Gone;
        };

        if !entry.is_alive {
            warn!(connection_id = %id, "Heartbeat missed, terminating connection");
            entry.terminate(CloseReason::MissedHeartbeat);
            return HeartbeatAction::Terminate;
        }

        entry.is_alive = false;
        match OutboundMessage::Ping.to_text() {
            Ok(ping) => {
                entry.enqueue(id, Utf8Bytes::from(ping));
            }
            Err(err) => error!(connection_id = %id, error = %err, "Failed to serialize PING"),
        }
        trace!(connection_id = %id, "Heartbeat probe sent");
        HeartbeatAction::Probe
    }

    fn spawn_heartbeat(&self, id: ConnectionId) -> JoinHandle<()> {
        let registry = self.clone();
        let interval = self.heartbeat_interval;
        let first_tick = Instant::now() + interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match registry.heartbeat_tick(id) {
                    HeartbeatAction::Probe => {}
                    HeartbeatAction::Terminate | HeartbeatAction::Gone => break,
                }
            }
        })
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns `true` if `id` is registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Liveness flag of `id`, if registered.
    pub fn is_alive(&self, id: ConnectionId) -> Option<bool> {
        self.lock().get(&id).map(|entry| entry.is_alive)
    }

    /// Lifecycle state of `id`, if registered.
    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.lock().get(&id).map(|entry| entry.state)
    }

    /// Returns `true` if `id` is registered with a running heartbeat timer.
    pub fn has_armed_timer(&self, id: ConnectionId) -> bool {
        self.lock()
            .get(&id)
            .and_then(|entry| entry.heartbeat.as_ref())
            .is_some_and(|timer| !timer.is_finished())
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("outbound_capacity", &self.outbound_capacity)
            .finish()
    }
}

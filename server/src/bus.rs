//! Message bus adapter for cross-process fan-out.
//!
//! Every gateway process publishes client MESSAGE frames to one shared
//! channel and holds one subscription to it. Whatever arrives on the
//! subscription, whether it originated locally or on another process, is
//! rebroadcast to every local connection.
//!
//! Delivery follows the bus: at-most-once, no persistence, no replay.
//!
//! - [`RedisBus`] uses Redis PUBLISH / SUBSCRIBE.
//! - [`LocalBus`] uses in-process tokio broadcast channels. Clones share the
//!   same channels, so several gateways in one process behave like several
//!   processes on one Redis.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, error, info, trace, warn};

/// Capacity of the per-process subscription channel.
///
/// A fan-out task that falls further behind than this skips the oldest
/// payloads and receives `RecvError::Lagged`.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Errors raised by the message bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Could not connect to the bus.
    #[error("message bus unavailable: {0}")]
    Unavailable(String),

    /// A publish command failed.
    #[error("failed to publish to '{channel}': {reason}")]
    Publish { channel: String, reason: String },

    /// The publish did not complete within the operation timeout.
    #[error("message bus operation timed out")]
    Timeout,

    /// The subscription stream ended; no further payloads will arrive.
    #[error("subscription to '{0}' closed")]
    SubscriptionClosed(String),
}

/// Receiving half of a bus subscription.
pub type BusSubscription = Receiver<String>;

/// Publish/subscribe over a channel shared by every gateway process.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes `payload` to `channel`.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    /// Subscribes to `channel`.
    ///
    /// The returned receiver reports `RecvError::Closed` once the underlying
    /// subscription is lost.
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError>;
}

// ============================================================================
// Redis
// ============================================================================

/// Message bus backed by Redis pub/sub.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisBus {
    /// Connects the publishing side. Subscriptions open their own connection.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Unavailable(e.to_string()))?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        debug!("Message bus publisher connected");
        Ok(Self { client, publisher })
    }
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus").finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        let mut connection = self.publisher.clone();
        let receivers: i64 = connection
            .publish(channel, payload)
            .await
            .map_err(|e| BusError::Publish {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;

        trace!(channel, receivers, "Published to message bus");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        info!(channel, "Subscribed to message bus");

        let (sender, receiver) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        let channel = channel.to_string();

        // Dropping `sender` when the stream ends closes every receiver.
        tokio::spawn(async move {
            let messages = pubsub.into_on_message();
            tokio::pin!(messages);
            while let Some(message) = messages.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        if sender.send(payload).is_err() {
                            debug!(channel = %channel, "No bus receivers left, stopping pump");
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(channel = %channel, error = %err, "Dropping non-text bus payload");
                    }
                }
            }
            error!(channel = %channel, "Message bus subscription ended");
        });

        Ok(receiver)
    }
}

// ============================================================================
// In-process
// ============================================================================

/// In-process message bus.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    channels: Arc<Mutex<HashMap<String, Sender<String>>>>,
}

impl LocalBus {
    /// Creates a bus with no channels.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> Sender<String> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.sender(channel).receiver_count()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        // No subscribers is not an error: the payload is simply not delivered.
        let receivers = self.sender(channel).send(payload).unwrap_or(0);
        trace!(channel, receivers, "Published to local bus");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        Ok(self.sender(channel).subscribe())
    }
}

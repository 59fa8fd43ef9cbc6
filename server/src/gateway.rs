//! Realtime gateway: per-connection protocol handling and bus fan-out.
//!
//! Each accepted websocket is driven by a single task that owns the socket.
//! The task multiplexes three sources, in priority order:
//!
//! 1. the registry kill switch (heartbeat miss, slow consumer, shutdown)
//! 2. the connection's outbound queue (PINGs and fanned-out payloads)
//! 3. inbound frames from the client
//!
//! MESSAGE frames are never delivered locally by the receiving connection.
//! They are published to the shared bus, and one fan-out task per process
//! relays everything the bus delivers to every local connection. That path
//! is identical whether the message originated here or on another process.
//!
//! Bus failures are not handled per connection. They are reported on the
//! gateway's fault channel and the process is expected to exit.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::auth::TokenAuthenticator;
use crate::bus::{BusError, MessageBus};
use crate::config::Config;
use crate::error::ServerError;
use crate::protocol::{
    decode_frame, InboundMessage, OutboundMessage, INVALID_MESSAGE, INVALID_TOKEN,
    NOT_AUTHENTICATED,
};
use crate::registry::{CloseReason, ConnectionId, ConnectionRegistry, DEFAULT_OUTBOUND_CAPACITY};

/// Tunables for a [`Gateway`].
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Interval between heartbeat probes.
    pub heartbeat_interval: Duration,
    /// Bound on a bus publish and on a single socket write.
    pub operation_timeout: Duration,
    /// Shared pub/sub channel.
    pub channel: String,
    /// Whether MESSAGE frames require a prior successful AUTH.
    pub require_auth: bool,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
}

impl GatewaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            operation_timeout: config.operation_timeout,
            channel: config.bus_channel.clone(),
            require_auth: config.require_auth,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// What the connection task should do after a frame was dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Nothing to send.
    Continue,
    /// Send a frame and keep the connection open.
    Reply(OutboundMessage),
    /// Send a frame, then close the connection.
    Close(OutboundMessage),
}

/// Why a connection task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    PeerClosed,
    Rejected,
    Terminated(CloseReason),
    WriteFailed,
    Fault,
}

/// Shared gateway handle. Cloning is cheap.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    registry: ConnectionRegistry,
    bus: Arc<dyn MessageBus>,
    authenticator: TokenAuthenticator,
    settings: GatewaySettings,
    faults: watch::Sender<Option<String>>,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        bus: Arc<dyn MessageBus>,
        authenticator: TokenAuthenticator,
    ) -> Self {
        let registry =
            ConnectionRegistry::with_capacity(settings.heartbeat_interval, settings.outbound_capacity);
        let (faults, _) = watch::channel(None);

        Self {
            inner: Arc::new(GatewayInner {
                registry,
                bus,
                authenticator,
                settings,
                faults,
            }),
        }
    }

    /// The connection registry of this process.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Number of live connections in this process.
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Subscribes to process-level faults.
    ///
    /// The value is `None` until the first fault is reported.
    pub fn faults(&self) -> watch::Receiver<Option<String>> {
        self.inner.faults.subscribe()
    }

    /// Resolves with the first process-level fault.
    pub async fn fault(&self) -> String {
        let mut faults = self.faults();
        let fault = faults
            .wait_for(Option::is_some)
            .await
            .map(|fault| fault.clone().unwrap_or_default());
        fault.unwrap_or_default()
    }

    fn report_fault(&self, err: &ServerError) {
        error!(error = %err, "Process-level fault");
        self.inner.faults.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(err.to_string());
            true
        });
    }

    /// Terminates every local connection.
    pub fn shutdown(&self) -> usize {
        let closed = self.inner.registry.terminate_all(CloseReason::Shutdown);
        info!(connections = closed, "Closing all realtime connections");
        closed
    }

    // ------------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------------

    /// Subscribes to the shared channel and relays every payload to all
    /// local connections.
    ///
    /// If the subscription is lost a fault is reported and the task ends.
    pub async fn spawn_fanout(&self) -> Result<JoinHandle<()>, BusError> {
        let channel = self.inner.settings.channel.clone();
        let mut subscription = self.inner.bus.subscribe(&channel).await?;
        let gateway = self.clone();

        Ok(tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(payload) => {
                        let delivered = gateway.inner.registry.broadcast(&payload);
                        trace!(delivered, "Fanned out bus payload");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Fan-out lagged behind the bus, payloads dropped");
                    }
                    Err(RecvError::Closed) => {
                        gateway.report_fault(&ServerError::from(BusError::SubscriptionClosed(channel)));
                        break;
                    }
                }
            }
        }))
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Handles one inbound text frame for connection `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Infrastructure`] if the bus publish fails or
    /// times out. The caller must treat that as a process-level fault.
    pub async fn dispatch(&self, id: ConnectionId, text: &str) -> Result<Dispatch, ServerError> {
        let message = match decode_frame(text) {
            Ok(message) => message,
            Err(err) => return Ok(reject(id, err.into())),
        };

        trace!(connection_id = %id, frame = message.tag(), "Dispatching frame");

        match message {
            InboundMessage::Pong => {
                self.inner.registry.mark_alive(id);
                Ok(Dispatch::Continue)
            }
            InboundMessage::Auth { token } => match self.inner.authenticator.verify(&token) {
                Ok(claims) => {
                    self.inner.registry.authenticate(id);
                    info!(connection_id = %id, subject = ?claims.sub, "Connection authenticated");
                    Ok(Dispatch::Reply(OutboundMessage::authenticated()))
                }
                Err(err) => Ok(reject(id, err.into())),
            },
            InboundMessage::Message(frame) => {
                if self.inner.settings.require_auth && !self.is_authenticated(id) {
                    debug!(connection_id = %id, "MESSAGE before AUTH");
                    return Ok(Dispatch::Reply(OutboundMessage::error(NOT_AUTHENTICATED)));
                }
                self.publish(frame).await?;
                Ok(Dispatch::Continue)
            }
            InboundMessage::Ping | InboundMessage::Response | InboundMessage::Listen => {
                Ok(Dispatch::Continue)
            }
        }
    }

    fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.inner
            .registry
            .state(id)
            .is_some_and(|state| state.is_authenticated())
    }

    async fn publish(&self, payload: String) -> Result<(), ServerError> {
        let settings = &self.inner.settings;
        tokio::time::timeout(
            settings.operation_timeout,
            self.inner.bus.publish(&settings.channel, payload),
        )
        .await
        .map_err(|_| BusError::Timeout)??;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    /// Runs an accepted websocket until it closes.
    pub async fn accept(self, socket: WebSocket) {
        self.serve(socket).await;
    }

    async fn serve<S>(self, socket: S)
    where
        S: Stream<Item = Result<Message, axum::Error>> + Sink<Message, Error = axum::Error>,
    {
        let mut registration = self.inner.registry.register();
        let id = registration.id;
        let (mut sink, mut stream) = socket.split();

        info!(connection_id = %id, connections = self.connection_count(), "Realtime connection opened");

        let mut transport_error = false;
        let exit = loop {
            tokio::select! {
                biased;

                reason = &mut registration.kill => {
                    break Exit::Terminated(reason.unwrap_or(CloseReason::Shutdown));
                }

                Some(frame) = registration.outbound.recv() => {
                    if !self.write(&mut sink, frame).await {
                        break Exit::WriteFailed;
                    }
                }

                incoming = stream.next() => {
                    let text = match incoming {
                        None => break Exit::PeerClosed,
                        Some(Err(err)) => {
                            let err = ServerError::from(err);
                            warn!(connection_id = %id, error = %err, "Websocket transport error");
                            // A second consecutive error means the stream is dead.
                            if transport_error {
                                break Exit::PeerClosed;
                            }
                            transport_error = true;
                            continue;
                        }
                        Some(Ok(Message::Text(text))) => text,
                        // Non-UTF-8 payloads decode as empty text and fail validation.
                        Some(Ok(Message::Binary(bytes))) => {
                            Utf8Bytes::from(String::from_utf8(bytes.to_vec()).unwrap_or_default())
                        }
                        Some(Ok(Message::Ping(_))) => {
                            // axum answers transport pings itself.
                            transport_error = false;
                            continue;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.inner.registry.mark_alive(id);
                            transport_error = false;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) => break Exit::PeerClosed,
                    };
                    transport_error = false;

                    match self.dispatch(id, text.as_str()).await {
                        Ok(Dispatch::Continue) => {}
                        Ok(Dispatch::Reply(reply)) => {
                            if !self.reply(&mut sink, &reply).await {
                                break Exit::WriteFailed;
                            }
                        }
                        Ok(Dispatch::Close(reply)) => {
                            self.inner.registry.begin_close(id);
                            self.reply(&mut sink, &reply).await;
                            break Exit::Rejected;
                        }
                        Err(err) => {
                            self.report_fault(&err);
                            break Exit::Fault;
                        }
                    }
                }
            }
        };

        if matches!(exit, Exit::Rejected | Exit::Terminated(_) | Exit::Fault) {
            let _ = tokio::time::timeout(
                self.inner.settings.operation_timeout,
                sink.send(Message::Close(None)),
            )
            .await;
        }

        self.inner.registry.remove(id);
        info!(
            connection_id = %id,
            reason = ?exit,
            connections = self.connection_count(),
            "Realtime connection closed"
        );
    }

    async fn reply<W>(&self, sink: &mut W, reply: &OutboundMessage) -> bool
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        match reply.to_text() {
            Ok(text) => self.write(sink, Utf8Bytes::from(text)).await,
            Err(err) => {
                error!(error = %err, "Failed to serialize reply");
                false
            }
        }
    }

    /// Writes one frame, bounded by the operation timeout.
    async fn write<W>(&self, sink: &mut W, frame: Utf8Bytes) -> bool
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        match tokio::time::timeout(
            self.inner.settings.operation_timeout,
            sink.send(Message::Text(frame)),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                debug!(error = %err, "Failed to write to websocket");
                false
            }
            Err(_) => {
                debug!("Websocket write timed out");
                false
            }
        }
    }
}

/// Maps a rejected frame to the error sent before the connection closes.
fn reject(id: ConnectionId, err: ServerError) -> Dispatch {
    debug!(connection_id = %id, error = %err, "Rejecting frame");
    let reply = match err {
        ServerError::Auth(_) => INVALID_TOKEN,
        _ => INVALID_MESSAGE,
    };
    Dispatch::Close(OutboundMessage::error(reply))
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("registry", &self.inner.registry)
            .field("bus", &"<MessageBus>")
            .field("settings", &self.inner.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::bus::{BusSubscription, LocalBus};
    use crate::registry::ConnectionState;

    const SECRET: &str = "gateway-test-secret";

    fn settings(require_auth: bool) -> GatewaySettings {
        GatewaySettings {
            heartbeat_interval: Duration::from_secs(300),
            operation_timeout: Duration::from_millis(200),
            channel: "realtime".to_string(),
            require_auth,
            outbound_capacity: 16,
        }
    }

    fn authenticator() -> TokenAuthenticator {
        TokenAuthenticator::new(SECRET, Duration::from_secs(60))
    }

    fn gateway(bus: &LocalBus, require_auth: bool) -> Gateway {
        Gateway::new(settings(require_auth), Arc::new(bus.clone()), authenticator())
    }

    /// A bus whose publishes never complete.
    struct StalledBus;

    #[async_trait]
    impl MessageBus for StalledBus {
        async fn publish(&self, _channel: &str, _payload: String) -> Result<(), BusError> {
            std::future::pending().await
        }

        async fn subscribe(&self, _channel: &str) -> Result<BusSubscription, BusError> {
            Err(BusError::Unavailable("stalled".into()))
        }
    }

    /// A socket driven by the test: frames pushed on the client side come
    /// out of the stream, frames written by the gateway land in `sent`.
    struct ScriptedSocket {
        incoming: mpsc::UnboundedReceiver<Result<Message, axum::Error>>,
        sent: mpsc::UnboundedSender<Message>,
    }

    impl Stream for ScriptedSocket {
        type Item = Result<Message, axum::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.incoming.poll_recv(cx)
        }
    }

    impl Sink<Message> for ScriptedSocket {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            let _ = self.sent.send(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    type ClientSide = mpsc::UnboundedSender<Result<Message, axum::Error>>;

    fn scripted_socket() -> (ScriptedSocket, ClientSide, mpsc::UnboundedReceiver<Message>) {
        let (client, incoming) = mpsc::unbounded_channel();
        let (sent, written) = mpsc::unbounded_channel();
        (ScriptedSocket { incoming, sent }, client, written)
    }

    fn text(frame: &str) -> Result<Message, axum::Error> {
        Ok(Message::Text(Utf8Bytes::from(frame.to_string())))
    }

    fn reset() -> Result<Message, axum::Error> {
        Err(axum::Error::new("connection reset by peer"))
    }

    #[tokio::test]
    async fn consecutive_transport_errors_tear_down_connection() {
        let gw = gateway(&LocalBus::new(), false);
        let (socket, client, mut written) = scripted_socket();

        client.send(reset()).unwrap();
        client.send(reset()).unwrap();
        client.send(text("not json")).unwrap();

        tokio::time::timeout(Duration::from_secs(1), gw.clone().serve(socket))
            .await
            .unwrap();

        // The client side is still open, so the errors alone ended the loop.
        assert_eq!(gw.connection_count(), 0);
        assert!(gw.registry().is_empty());
        assert!(written.try_recv().is_err());
        drop(client);
    }

    #[tokio::test]
    async fn single_transport_error_is_only_logged() {
        let gw = gateway(&LocalBus::new(), false);
        let (socket, client, mut written) = scripted_socket();

        client.send(reset()).unwrap();
        client.send(text(r#"{"type":"LISTEN"}"#)).unwrap();
        client.send(reset()).unwrap();
        client.send(text("not json")).unwrap();

        tokio::time::timeout(Duration::from_secs(1), gw.clone().serve(socket))
            .await
            .unwrap();

        match written.try_recv().unwrap() {
            Message::Text(frame) => assert_eq!(
                frame.as_str(),
                OutboundMessage::error(INVALID_MESSAGE).to_text().unwrap()
            ),
            other => panic!("expected an error frame, got {other:?}"),
        }
        assert!(matches!(written.try_recv().unwrap(), Message::Close(None)));
        assert!(gw.registry().is_empty());
        drop(client);
    }

    #[tokio::test]
    async fn peer_close_removes_connection() {
        let gw = gateway(&LocalBus::new(), false);
        let (socket, client, _written) = scripted_socket();
        drop(client);

        tokio::time::timeout(Duration::from_secs(1), gw.clone().serve(socket))
            .await
            .unwrap();
        assert_eq!(gw.connection_count(), 0);
    }

    #[tokio::test]
    async fn invalid_frame_closes_with_error() {
        let gw = gateway(&LocalBus::new(), false);
        let reg = gw.registry().register();

        for bad in ["not json", r#"{"type":"SHOUT"}"#, r#"{"type":"AUTH"}"#] {
            assert_eq!(
                gw.dispatch(reg.id, bad).await.unwrap(),
                Dispatch::Close(OutboundMessage::error(INVALID_MESSAGE))
            );
        }
    }

    #[tokio::test]
    async fn valid_token_authenticates() {
        let gw = gateway(&LocalBus::new(), true);
        let reg = gw.registry().register();
        let token = authenticator().issue(None, Some("user-1")).unwrap();
        let frame = json!({ "type": "AUTH", "data": { "token": token } }).to_string();

        assert_eq!(
            gw.dispatch(reg.id, &frame).await.unwrap(),
            Dispatch::Reply(OutboundMessage::authenticated())
        );
        assert_eq!(gw.registry().state(reg.id), Some(ConnectionState::Authenticated));
    }

    #[tokio::test]
    async fn forged_token_is_rejected() {
        let gw = gateway(&LocalBus::new(), true);
        let reg = gw.registry().register();
        let token = TokenAuthenticator::new("other-secret", Duration::from_secs(60))
            .issue(None, None)
            .unwrap();
        let frame = json!({ "type": "AUTH", "data": { "token": token } }).to_string();

        assert_eq!(
            gw.dispatch(reg.id, &frame).await.unwrap(),
            Dispatch::Close(OutboundMessage::error(INVALID_TOKEN))
        );
        assert_eq!(gw.registry().state(reg.id), Some(ConnectionState::Open));
    }

    #[tokio::test]
    async fn message_is_published_verbatim() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("realtime").await.unwrap();
        let gw = gateway(&bus, false);
        let reg = gw.registry().register();

        let frame = r#"{"type":"MESSAGE","id":123456789012345678901234,"a":1, "body":{"text":"hi"}}"#;
        assert_eq!(gw.dispatch(reg.id, frame).await.unwrap(), Dispatch::Continue);

        let published = rx.recv().await.unwrap();
        assert_eq!(published.as_bytes(), frame.as_bytes());
    }

    #[tokio::test]
    async fn message_before_auth_is_refused_when_required() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("realtime").await.unwrap();
        let gw = gateway(&bus, true);
        let reg = gw.registry().register();

        assert_eq!(
            gw.dispatch(reg.id, r#"{"type":"MESSAGE"}"#).await.unwrap(),
            Dispatch::Reply(OutboundMessage::error(NOT_AUTHENTICATED))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pong_marks_alive() {
        let gw = gateway(&LocalBus::new(), false);
        let reg = gw.registry().register();
        assert_eq!(gw.registry().heartbeat_tick(reg.id), crate::registry::HeartbeatAction::Probe);
        assert_eq!(gw.registry().is_alive(reg.id), Some(false));

        gw.dispatch(reg.id, r#"{"type":"PONG"}"#).await.unwrap();
        assert_eq!(gw.registry().is_alive(reg.id), Some(true));
    }

    #[tokio::test]
    async fn unhandled_tags_are_ignored() {
        let gw = gateway(&LocalBus::new(), false);
        let reg = gw.registry().register();

        for frame in [r#"{"type":"PING"}"#, r#"{"type":"LISTEN"}"#, r#"{"type":"RESPONSE"}"#] {
            assert_eq!(gw.dispatch(reg.id, frame).await.unwrap(), Dispatch::Continue);
        }
    }

    #[tokio::test]
    async fn stalled_publish_is_an_infrastructure_fault() {
        let gw = Gateway::new(settings(false), Arc::new(StalledBus), authenticator());
        let reg = gw.registry().register();

        let err = gw
            .dispatch(reg.id, r#"{"type":"MESSAGE"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Infrastructure(_)));
    }

    #[tokio::test]
    async fn fanout_relays_to_every_connection() {
        let bus = LocalBus::new();
        let gw = gateway(&bus, false);
        let _fanout = gw.spawn_fanout().await.unwrap();
        let mut a = gw.registry().register();
        let mut b = gw.registry().register();

        bus.publish("realtime", r#"{"type":"MESSAGE","x":1}"#.to_string())
            .await
            .unwrap();

        assert_eq!(a.outbound.recv().await.unwrap().as_str(), r#"{"type":"MESSAGE","x":1}"#);
        assert_eq!(b.outbound.recv().await.unwrap().as_str(), r#"{"type":"MESSAGE","x":1}"#);
    }

    #[tokio::test]
    async fn fanout_fails_when_bus_rejects_subscription() {
        let gw = Gateway::new(settings(false), Arc::new(StalledBus), authenticator());
        assert!(gw.spawn_fanout().await.is_err());
    }

    #[tokio::test]
    async fn first_fault_wins() {
        let gw = gateway(&LocalBus::new(), false);
        assert!(gw.faults().borrow().is_none());

        gw.report_fault(&ServerError::infrastructure("first"));
        gw.report_fault(&ServerError::infrastructure("second"));

        assert_eq!(gw.fault().await, "infrastructure fault: first");
    }

    #[tokio::test]
    async fn shutdown_terminates_connections() {
        let gw = gateway(&LocalBus::new(), false);
        let mut reg = gw.registry().register();

        assert_eq!(gw.shutdown(), 1);
        assert_eq!(reg.kill.try_recv().unwrap(), CloseReason::Shutdown);
    }
}

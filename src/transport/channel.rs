use super::connector::{Connection, Connector};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::protocol::{decode_event, ClientMessage, EventKind, ServerEvent};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Where the channel is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// Never connected, or explicitly disconnected
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Waiting out the delay before the next attempt
    Reconnecting,
    /// Retry budget exhausted; only an explicit `connect` leaves this phase
    Failed,
}

/// Observable connection state; only the channel's own task changes it
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    /// Reconnection attempts consumed since the last successful connect
    pub attempt: u32,
    pub last_error: Option<TransportError>,
}

impl ConnectionState {
    pub fn connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    /// Terminal error, if the channel has given up
    pub fn connection_error(&self) -> Option<&TransportError> {
        match self.phase {
            ConnectionPhase::Failed => self.last_error.as_ref(),
            _ => None,
        }
    }
}

/// Fixed-delay, bounded reconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

impl From<&TransportConfig> for ReconnectPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_attempts: config.reconnect_attempts,
            delay: config.reconnect_delay(),
        }
    }
}

/// Transport counters
#[derive(Debug, Default)]
struct TransportStats {
    connect_attempts: AtomicU64,
    reconnects: AtomicU64,
    frames_received: AtomicU64,
    malformed_dropped: AtomicU64,
    events_delivered: AtomicU64,
    stale_discarded: AtomicU64,
}

/// Snapshot of transport counters
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransportStatsSnapshot {
    pub connect_attempts: u64,
    pub reconnects: u64,
    pub frames_received: u64,
    pub malformed_dropped: u64,
    pub events_delivered: u64,
    pub stale_discarded: u64,
}

impl TransportStats {
    fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            stale_discarded: self.stale_discarded.load(Ordering::Relaxed),
        }
    }
}

type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Room events of the active stream
    Stream,
    /// Channel-wide broadcasts, independent of rooms
    Broadcast,
}

struct SubscriberState {
    scope: Scope,
    /// Stream whose events this subscriber accepts
    active: RwLock<Option<String>>,
    handlers: RwLock<Vec<(EventKind, Handler)>>,
}

enum Delivery {
    Delivered,
    Stale,
    /// Outside this subscriber's scope
    Ignored,
}

impl SubscriberState {
    fn new(scope: Scope) -> Self {
        Self {
            scope,
            active: RwLock::new(None),
            handlers: RwLock::new(Vec::new()),
        }
    }

    fn deliver(&self, event: &ServerEvent) -> Delivery {
        let kind = event.kind();

        // Held across the handler calls so a concurrent switch waits for
        // in-flight deliveries of the previous stream to finish.
        let active = self.active.read();
        match self.scope {
            Scope::Broadcast if !kind.is_broadcast() => return Delivery::Ignored,
            Scope::Stream if kind.is_broadcast() => return Delivery::Ignored,
            Scope::Stream if active.as_deref() != Some(event.stream_id()) => {
                return Delivery::Stale
            }
            _ => {}
        }

        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(
                    stream_id = event.stream_id(),
                    event = kind.wire_name(),
                    "Event handler panicked; continuing with the next one"
                );
            }
        }
        Delivery::Delivered
    }
}

struct Shared {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    /// Live subscribers per room; a room is joined while its count is non-zero
    rooms: Mutex<HashMap<String, usize>>,
    subscribers: RwLock<Vec<Weak<SubscriberState>>>,
    /// Sender into the current connection, `None` while disconnected
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    stats: TransportStats,
}

impl Shared {
    fn set_state(&self, phase: ConnectionPhase, attempt: u32, last_error: Option<TransportError>) {
        self.state.send_replace(ConnectionState {
            phase,
            attempt,
            last_error,
        });
    }

    /// Publish a terminal state after the connection task died abnormally
    fn abandon(&self, reason: &str) {
        error!(url = %self.connector.endpoint(), reason, "Connection task ended abnormally");
        {
            let _rooms = self.rooms.lock();
            *self.outbound.lock() = None;
        }
        let attempt = self.state.borrow().attempt;
        self.set_state(
            ConnectionPhase::Failed,
            attempt,
            Some(TransportError::Disconnected {
                reason: reason.to_string(),
            }),
        );
    }

    fn acquire_room(&self, stream_id: &str) {
        let mut rooms = self.rooms.lock();
        let count = rooms.entry(stream_id.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.send_command(ClientMessage::Join {
                stream_id: stream_id.to_string(),
            });
        }
    }

    fn release_room(&self, stream_id: &str) {
        let mut rooms = self.rooms.lock();
        let Some(count) = rooms.get_mut(stream_id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            rooms.remove(stream_id);
            self.send_command(ClientMessage::Leave {
                stream_id: stream_id.to_string(),
            });
        }
    }

    /// Queue a room command on the live connection; dropped while disconnected.
    /// Callers hold the `rooms` lock.
    fn send_command(&self, message: ClientMessage) {
        match self.outbound.lock().as_ref() {
            Some(tx) => {
                debug!(stream_id = message.stream_id(), ?message, "Queueing room command");
                let _ = tx.send(message);
            }
            None => trace!(stream_id = message.stream_id(), "Not connected; room command deferred"),
        }
    }

    fn dispatch(&self, text: &str) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let event = match decode_event(text) {
            Ok(event) => event,
            Err(e) => {
                self.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        trace!(stream_id = event.stream_id(), "Received {}", event.description());

        let subscribers: Vec<Arc<SubscriberState>> = self
            .subscribers
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for subscriber in subscribers {
            match subscriber.deliver(&event) {
                Delivery::Delivered => {
                    self.stats.events_delivered.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::Stale => {
                    self.stats.stale_discarded.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::Ignored => {}
            }
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let endpoint = self.connector.endpoint().to_string();
        let mut attempt: u32 = 0;

        loop {
            let phase = if attempt == 0 {
                ConnectionPhase::Connecting
            } else {
                ConnectionPhase::Reconnecting
            };
            let previous_error = self.state.borrow().last_error.clone();
            self.set_state(phase, attempt, previous_error);
            self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            let failure = match result {
                Ok(connection) => {
                    info!(url = %endpoint, "Connected to telemetry server");
                    attempt = 0;
                    match self.pump(connection, &cancel).await {
                        Some(e) => {
                            warn!(url = %endpoint, error = %e, "Connection lost");
                            e
                        }
                        None => break,
                    }
                }
                Err(e) if !e.is_recoverable() => {
                    error!(url = %endpoint, error = %e, "Connection failed permanently");
                    self.set_state(ConnectionPhase::Failed, attempt, Some(e));
                    return;
                }
                Err(e) => {
                    warn!(url = %endpoint, attempt, error = %e, "Connection attempt failed");
                    e
                }
            };

            if attempt >= self.policy.max_attempts {
                let terminal = TransportError::RetriesExhausted {
                    attempts: attempt,
                    last_error: failure.to_string(),
                };
                error!(url = %endpoint, attempts = attempt, "Giving up on telemetry server");
                self.set_state(ConnectionPhase::Failed, attempt, Some(terminal));
                return;
            }

            attempt += 1;
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            info!(
                url = %endpoint,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = self.policy.delay.as_millis() as u64,
                "Scheduling reconnection"
            );
            self.set_state(ConnectionPhase::Reconnecting, attempt, Some(failure));

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.policy.delay) => {}
            }
        }

        debug!(url = %endpoint, "Connection task cancelled");
    }

    /// Drive one live connection. Returns `None` when cancelled, otherwise
    /// the error that ended it.
    async fn pump(
        &self,
        mut connection: Box<dyn Connection>,
        cancel: &CancellationToken,
    ) -> Option<TransportError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let rooms = self.rooms.lock();
            for stream_id in rooms.keys() {
                let _ = tx.send(ClientMessage::Join {
                    stream_id: stream_id.clone(),
                });
            }
            if !rooms.is_empty() {
                info!(rooms = rooms.len(), "Rejoining rooms");
            }
            *self.outbound.lock() = Some(tx);
        }
        self.set_state(ConnectionPhase::Connected, 0, None);

        let exit = loop {
            tokio::select! {
                _ = cancel.cancelled() => break None,
                Some(message) = rx.recv() => {
                    let text = match message.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode room command");
                            continue;
                        }
                    };
                    if let Err(e) = connection.send(text).await {
                        break Some(e);
                    }
                }
                frame = connection.recv() => match frame {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(e)) => break Some(e),
                    None => break Some(TransportError::Disconnected {
                        reason: "closed by server".to_string(),
                    }),
                },
            }
        };

        {
            let _rooms = self.rooms.lock();
            *self.outbound.lock() = None;
        }

        if exit.is_none() {
            connection.close().await;
        }
        exit
    }
}

struct ConnectionTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One physical connection to the telemetry server, multiplexing every room.
///
/// Owned by whoever mounts the live view; dropping it stops the connection
/// task.
pub struct TransportChannel {
    shared: Arc<Shared>,
    task: Mutex<Option<ConnectionTask>>,
}

impl TransportChannel {
    pub fn new(connector: impl Connector + 'static, policy: ReconnectPolicy) -> Self {
        Self::with_connector(Arc::new(connector), policy)
    }

    pub fn with_connector(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self {
            shared: Arc::new(Shared {
                connector,
                policy,
                state,
                rooms: Mutex::new(HashMap::new()),
                subscribers: RwLock::new(Vec::new()),
                outbound: Mutex::new(None),
                stats: TransportStats::default(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the connection task. No-op while a task is connecting,
    /// connected or retrying; restarts the retry budget after a terminal
    /// failure. Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let mut task = self.task.lock();
        if let Some(running) = task.as_ref() {
            if !running.handle.is_finished() {
                debug!("Connection task already running");
                return;
            }
        }

        info!(url = %self.shared.connector.endpoint(), "Connecting to telemetry server");
        self.shared.set_state(ConnectionPhase::Connecting, 0, None);

        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let inner = tokio::spawn(Arc::clone(&shared).run(cancel.clone()));
        let handle = tokio::spawn(async move {
            match inner.await {
                Err(e) if e.is_panic() => shared.abandon("connection task panicked"),
                Err(e) => debug!(error = %e, "Connection task aborted"),
                Ok(()) => {}
            }
        });
        *task = Some(ConnectionTask { cancel, handle });
    }

    /// Wait until the channel is connected or has failed terminally
    pub async fn connected(&self) -> Result<(), TransportError> {
        let mut state = self.shared.state.subscribe();
        let state = state
            .wait_for(|s| {
                matches!(
                    s.phase,
                    ConnectionPhase::Connected | ConnectionPhase::Failed | ConnectionPhase::Idle
                )
            })
            .await
            .map_err(|_| TransportError::NotConnected)?
            .clone();

        match state.phase {
            ConnectionPhase::Connected => Ok(()),
            ConnectionPhase::Failed => Err(state.last_error.unwrap_or(TransportError::NotConnected)),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Stop the connection task and close the connection
    pub async fn disconnect(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Connection task ended abnormally");
            }
            info!(url = %self.shared.connector.endpoint(), "Disconnected from telemetry server");
        }
        self.shared.set_state(ConnectionPhase::Idle, 0, None);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Rooms currently joined (or to be joined on connect), sorted
    pub fn joined_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.shared.rooms.lock().keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Create an independent subscriber on this channel
    pub fn subscriber(&self) -> StreamSubscriber {
        StreamSubscriber {
            channel: Arc::clone(&self.shared),
            state: self.register(Scope::Stream),
        }
    }

    /// Create a subscriber for channel-wide broadcasts; it joins no room
    pub fn broadcast_subscriber(&self) -> BroadcastSubscriber {
        BroadcastSubscriber {
            state: self.register(Scope::Broadcast),
        }
    }

    fn register(&self, scope: Scope) -> Arc<SubscriberState> {
        let state = Arc::new(SubscriberState::new(scope));
        let mut subscribers = self.shared.subscribers.write();
        subscribers.retain(|s| s.strong_count() > 0);
        subscribers.push(Arc::downgrade(&state));
        state
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

/// Interest in one stream at a time, with typed handlers.
///
/// Handlers run on the connection task and must not call back into the
/// same subscriber.
pub struct StreamSubscriber {
    channel: Arc<Shared>,
    state: Arc<SubscriberState>,
}

impl StreamSubscriber {
    /// Accept events for `stream_id` only, replacing any previous stream.
    ///
    /// Returns once no handler can observe an event of the previous stream.
    pub fn subscribe(&self, stream_id: impl Into<String>) {
        self.subscribe_with(stream_id, || {});
    }

    /// Like `subscribe`, running `on_switch` once the previous stream is
    /// released but before any event of the new one can be delivered.
    ///
    /// Returns whether the active stream changed; `on_switch` only runs if so.
    pub fn subscribe_with<F>(&self, stream_id: impl Into<String>, on_switch: F) -> bool
    where
        F: FnOnce(),
    {
        let stream_id = stream_id.into();
        let mut active = self.state.active.write();
        if active.as_deref() == Some(stream_id.as_str()) {
            return false;
        }

        if let Some(previous) = active.take() {
            self.channel.release_room(&previous);
            info!(from = %previous, to = %stream_id, "Switching stream");
        } else {
            info!(stream_id = %stream_id, "Subscribing to stream");
        }

        self.channel.acquire_room(&stream_id);
        *active = Some(stream_id);
        on_switch();
        true
    }

    /// Release interest in `stream_id`; no-op unless it is the active stream
    pub fn unsubscribe(&self, stream_id: &str) {
        let mut active = self.state.active.write();
        if active.as_deref() != Some(stream_id) {
            trace!(stream_id, "Not subscribed; nothing to release");
            return;
        }

        *active = None;
        self.channel.release_room(stream_id);
        info!(stream_id, "Unsubscribed from stream");
    }

    pub fn active_stream(&self) -> Option<String> {
        self.state.active.read().clone()
    }

    /// Register a handler; handlers for one kind run in registration order
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.state.handlers.write().push((kind, Arc::new(handler)));
    }
}

impl Drop for StreamSubscriber {
    fn drop(&mut self) {
        if let Some(stream_id) = self.state.active.write().take() {
            self.channel.release_room(&stream_id);
        }
    }
}

/// Channel-wide broadcast feed, independent of any room.
///
/// Handlers run on the connection task, like stream handlers.
pub struct BroadcastSubscriber {
    state: Arc<SubscriberState>,
}

impl BroadcastSubscriber {
    /// Register a handler for a broadcast kind; other kinds never reach it
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        if !kind.is_broadcast() {
            warn!(event = kind.wire_name(), "Not a broadcast event; handler will never run");
        }
        self.state.handlers.write().push((kind, Arc::new(handler)));
    }
}

//! A single realtime connection and its reconnect supervisor.

use crate::transport::TransportConnector;
use crate::{TopicEvent, TransportEvent, TransportLink, WireMessage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Realtime server URL (e.g., wss://realtime.example.com/ws).
    pub url: String,
    /// Sent as the `token` query parameter and in the connect frame.
    pub auth_token: Option<String>,
    pub client_id: String,
    pub auto_reconnect: bool,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws".to_string(),
            auth_token: None,
            client_id: "offline-sync".to_string(),
            auto_reconnect: true,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub config: ConnectionConfig,
    pub state: ConnectionState,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Only authoritative while `state` is `Connected`.
    pub subscriptions: Vec<String>,
    pub reconnect_attempts: u32,
}

/// Lifecycle events emitted by connections.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connecting { id: String },
    Connected { id: String },
    Disconnected { id: String, reason: Option<String> },
    Reconnecting { id: String, attempt: u32, delay: Duration },
    ReconnectFailed { id: String, attempts: u32 },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> &str {
        match self {
            Self::Connecting { id }
            | Self::Connected { id }
            | Self::Disconnected { id, .. }
            | Self::Reconnecting { id, .. }
            | Self::ReconnectFailed { id, .. } => id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::ReconnectFailed { .. } => "reconnect_failed",
        }
    }
}

/// Subscriber callback. Runs on the connection task and must not block.
pub type TopicCallback = Arc<dyn Fn(TopicEvent) + Send + Sync>;

/// Delay before reconnect attempt `attempt` (1-based).
pub(crate) fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}

struct ConnectionInner {
    state: ConnectionState,
    last_connected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    reconnect_attempts: u32,
    subscriptions: BTreeMap<String, TopicCallback>,
    /// Present only while connected.
    outbound: Option<mpsc::Sender<WireMessage>>,
}

/// How a live session ended.
enum SessionEnd {
    Shutdown,
    /// Failed before reaching `Connected`.
    Failed(String),
    /// Dropped after reaching `Connected`.
    Lost(Option<String>),
}

/// State shared between the manager and a connection's supervisor task.
pub(crate) struct ConnectionShared {
    id: String,
    config: ConnectionConfig,
    inner: RwLock<ConnectionInner>,
    closed: AtomicBool,
    wake: Notify,
    shutdown_tx: broadcast::Sender<()>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionShared {
    pub(crate) fn new(
        id: String,
        config: ConnectionConfig,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> (Arc<Self>, broadcast::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let shared = Arc::new(Self {
            id,
            config,
            inner: RwLock::new(ConnectionInner {
                state: ConnectionState::Connecting,
                last_connected_at: None,
                last_error: None,
                reconnect_attempts: 0,
                subscriptions: BTreeMap::new(),
                outbound: None,
            }),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            shutdown_tx,
            events,
        });
        (shared, shutdown_rx)
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Emit an event. Callers hold the inner lock so nothing is emitted
    /// after `close` has taken it.
    fn emit(&self, event: ConnectionEvent) {
        if !self.is_closed() {
            let _ = self.events.send(event);
        }
    }

    pub(crate) fn emit_connecting(&self) {
        self.emit(ConnectionEvent::Connecting {
            id: self.id.clone(),
        });
    }

    pub(crate) async fn state(&self) -> ConnectionState {
        self.inner.read().await.state
    }

    pub(crate) async fn snapshot(&self) -> Connection {
        let inner = self.inner.read().await;
        Connection {
            id: self.id.clone(),
            config: self.config.clone(),
            state: inner.state,
            last_connected_at: inner.last_connected_at,
            last_error: inner.last_error.clone(),
            subscriptions: inner.subscriptions.keys().cloned().collect(),
            reconnect_attempts: inner.reconnect_attempts,
        }
    }

    /// Outbound sender, when the connection is live.
    pub(crate) async fn live_outbound(&self) -> Option<mpsc::Sender<WireMessage>> {
        let inner = self.inner.read().await;
        match inner.state {
            ConnectionState::Connected => inner.outbound.clone(),
            _ => None,
        }
    }

    /// Track a topic, subscribing on the wire immediately when live.
    pub(crate) async fn subscribe(&self, topic: &str, callback: TopicCallback) {
        let mut inner = self.inner.write().await;
        inner.subscriptions.insert(topic.to_string(), callback);
        if let Some(outbound) = &inner.outbound {
            let frame = WireMessage::Subscribe {
                topic: topic.to_string(),
            };
            if outbound.send(frame).await.is_err() {
                debug!(connection_id = %self.id, topic, "Subscribe deferred to next connect");
            }
        }
    }

    pub(crate) async fn unsubscribe(&self, topic: &str) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner.subscriptions.remove(topic).is_some();
        if removed {
            if let Some(outbound) = &inner.outbound {
                let _ = outbound
                    .send(WireMessage::Unsubscribe {
                        topic: topic.to_string(),
                    })
                    .await;
            }
        }
        removed
    }

    /// Cut a pending reconnect backoff short.
    pub(crate) fn wake(&self) {
        self.wake.notify_waiters();
    }

    /// Tear down. Idempotent; returns false if already closed.
    pub(crate) async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shutdown_tx.send(());

        let mut inner = self.inner.write().await;
        inner.subscriptions.clear();
        inner.outbound = None;
        inner.state = ConnectionState::Disconnected;
        let _ = self.events.send(ConnectionEvent::Disconnected {
            id: self.id.clone(),
            reason: Some("closed".to_string()),
        });
        info!(connection_id = %self.id, "Connection closed");
        true
    }

    /// Supervisor loop: connect, serve, reconnect with backoff until closed
    /// or out of attempts.
    pub(crate) async fn run(
        self: Arc<Self>,
        connector: Arc<dyn TransportConnector>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut attempt: u32 = 0;

        loop {
            if self.is_closed() {
                break;
            }

            let connected = tokio::select! {
                _ = shutdown.recv() => break,
                result = timeout(self.config.connect_timeout, connector.connect(&self.config)) => {
                    match result {
                        Ok(Ok(link)) => Ok(link),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("connect timed out".to_string()),
                    }
                }
            };

            let (reason, was_live) = match connected {
                Ok(link) => match self.serve(link, &mut shutdown).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Failed(error) => (Some(error), false),
                    SessionEnd::Lost(reason) => {
                        attempt = 0;
                        (reason.or_else(|| Some("connection closed".to_string())), true)
                    }
                },
                Err(error) => {
                    warn!(connection_id = %self.id, error = %error, "Connect failed");
                    (Some(error), false)
                }
            };

            if !self.config.auto_reconnect {
                let mut inner = self.inner.write().await;
                inner.state = ConnectionState::Disconnected;
                inner.outbound = None;
                inner.last_error = reason.clone();
                self.emit(ConnectionEvent::Disconnected {
                    id: self.id.clone(),
                    reason,
                });
                break;
            }

            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                let mut inner = self.inner.write().await;
                inner.state = ConnectionState::Disconnected;
                inner.outbound = None;
                inner.last_error = reason.clone();
                warn!(
                    connection_id = %self.id,
                    attempts = attempt - 1,
                    "Max reconnect attempts reached"
                );
                self.emit(ConnectionEvent::Disconnected {
                    id: self.id.clone(),
                    reason,
                });
                self.emit(ConnectionEvent::ReconnectFailed {
                    id: self.id.clone(),
                    attempts: attempt - 1,
                });
                break;
            }

            let delay = backoff_delay(
                self.config.reconnect_base_delay,
                self.config.reconnect_max_delay,
                attempt,
            );
            // Registered before the state change so a wake issued once
            // `Reconnecting` is observable is never missed.
            let woken = self.wake.notified();
            {
                let mut inner = self.inner.write().await;
                inner.state = ConnectionState::Reconnecting;
                inner.outbound = None;
                inner.reconnect_attempts = attempt;
                inner.last_error = reason.clone();
                if was_live {
                    self.emit(ConnectionEvent::Disconnected {
                        id: self.id.clone(),
                        reason,
                    });
                }
                self.emit(ConnectionEvent::Reconnecting {
                    id: self.id.clone(),
                    attempt,
                    delay,
                });
            }
            info!(
                connection_id = %self.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = woken => debug!(connection_id = %self.id, "Reconnect backoff cut short"),
            }
        }

        debug!(connection_id = %self.id, "Connection supervisor stopped");
    }

    /// Handshake, resubscribe, then pump frames until the session ends.
    async fn serve(
        &self,
        link: TransportLink,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let (outbound, mut inbound, _tasks) = link.into_parts();

        let connect = WireMessage::Connect {
            client_id: self.config.client_id.clone(),
            token: self.config.auth_token.clone(),
        };
        if outbound.send(connect).await.is_err() {
            return SessionEnd::Failed("transport closed during handshake".to_string());
        }

        {
            let mut inner = self.inner.write().await;
            if self.is_closed() {
                return SessionEnd::Shutdown;
            }

            // Every tracked topic goes out before the sender is published,
            // so no send can overtake a resubscribe.
            let topics: Vec<String> = inner.subscriptions.keys().cloned().collect();
            for topic in &topics {
                let frame = WireMessage::Subscribe {
                    topic: topic.clone(),
                };
                if outbound.send(frame).await.is_err() {
                    return SessionEnd::Failed("transport closed during resubscribe".to_string());
                }
            }

            inner.state = ConnectionState::Connected;
            inner.last_connected_at = Some(Utc::now());
            inner.last_error = None;
            inner.reconnect_attempts = 0;
            inner.outbound = Some(outbound.clone());
            self.emit(ConnectionEvent::Connected {
                id: self.id.clone(),
            });
            info!(
                connection_id = %self.id,
                resubscribed = topics.len(),
                "Realtime connection established"
            );
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);

        let reason = loop {
            tokio::select! {
                _ = shutdown.recv() => return SessionEnd::Shutdown,
                _ = heartbeat.tick() => {
                    if outbound.send(WireMessage::Heartbeat).await.is_err() {
                        break Some("transport closed".to_string());
                    }
                }
                event = inbound.recv() => match event {
                    Some(TransportEvent::Message(message)) => self.dispatch(message).await,
                    Some(TransportEvent::Closed(reason)) => break reason,
                    None => break None,
                },
            }
        };

        info!(connection_id = %self.id, reason = ?reason, "Realtime connection lost");
        SessionEnd::Lost(reason)
    }

    async fn dispatch(&self, message: WireMessage) {
        match message {
            WireMessage::ConnectionAck { session_id } => {
                debug!(connection_id = %self.id, session_id = %session_id, "Connection acknowledged");
            }
            WireMessage::Subscribed { topic } => {
                debug!(connection_id = %self.id, topic = %topic, "Subscription confirmed");
            }
            WireMessage::Error { code, message } => {
                warn!(connection_id = %self.id, code = %code, error = %message, "Realtime server error");
            }
            WireMessage::Heartbeat => {}
            other => {
                let Some((topic, event)) = other.into_topic_event() else {
                    debug!(connection_id = %self.id, "Ignoring client-only frame");
                    return;
                };
                // Invoked under the read lock: `close` cannot complete while
                // a callback is running.
                let inner = self.inner.read().await;
                if self.is_closed() {
                    return;
                }
                match inner.subscriptions.get(&topic) {
                    Some(callback) => callback(event),
                    None => debug!(connection_id = %self.id, topic = %topic, "Event for untracked topic"),
                }
            }
        }
    }
}

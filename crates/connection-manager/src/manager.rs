//! Connection registry and the send path with queue fallback.

use crate::connection::ConnectionShared;
use crate::{
    Connection, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionResult,
    ConnectionState, TopicEvent, TransportConnector, WireMessage,
};
use async_trait::async_trait;
use message_queue::{MessageQueue, Priority};
use platform_bridge::{
    BridgeError, BridgeResult, KeyValueStore, MessagePayload, MessageTransport, OutboundMessage,
    SendReceipt,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection limit used when none has been persisted.
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;

const MAX_CONNECTIONS_KEY: &str = "connection_manager.max_connections";

/// Where a `send_message` payload went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the live connection.
    Sent { message_id: String },
    /// Handed to the message queue for later delivery.
    Queued { message_id: String },
}

struct ConnectionEntry {
    shared: Arc<ConnectionShared>,
    task: JoinHandle<()>,
}

/// Owns every realtime connection of the process.
pub struct ConnectionManager {
    defaults: ConnectionConfig,
    connector: Arc<dyn TransportConnector>,
    store: Arc<dyn KeyValueStore>,
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    events: broadcast::Sender<ConnectionEvent>,
    max_connections: AtomicUsize,
    message_queue: RwLock<Option<Arc<MessageQueue>>>,
}

impl ConnectionManager {
    /// Create a manager. The connection limit is read from `store`, falling
    /// back to `default_max_connections`.
    pub fn new(
        defaults: ConnectionConfig,
        default_max_connections: usize,
        connector: Arc<dyn TransportConnector>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);

        let max_connections = match store.get(MAX_CONNECTIONS_KEY) {
            Ok(Some(raw)) => match raw.parse::<usize>() {
                Ok(limit) if limit > 0 => limit,
                _ => {
                    warn!(value = %raw, "Ignoring invalid persisted connection limit");
                    default_max_connections
                }
            },
            Ok(None) => default_max_connections,
            Err(e) => {
                warn!(error = %e, "Failed to read connection limit");
                default_max_connections
            }
        };

        Self {
            defaults,
            connector,
            store,
            connections: RwLock::new(HashMap::new()),
            events,
            max_connections: AtomicUsize::new(max_connections),
            message_queue: RwLock::new(None),
        }
    }

    /// Settings new connections start from.
    pub fn defaults(&self) -> &ConnectionConfig {
        &self.defaults
    }

    /// Route sends on non-live connections into `queue`.
    pub async fn set_message_queue(&self, queue: Arc<MessageQueue>) {
        *self.message_queue.write().await = Some(queue);
    }

    /// Subscribe to lifecycle events of every connection.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::SeqCst)
    }

    /// Change and persist the connection limit. Existing connections stay open.
    pub fn set_max_connections(&self, limit: usize) -> ConnectionResult<()> {
        if limit == 0 {
            return Err(ConnectionError::Connection(
                "connection limit must be at least 1".to_string(),
            ));
        }
        self.max_connections.store(limit, Ordering::SeqCst);
        if let Err(e) = self.store.set(MAX_CONNECTIONS_KEY, &limit.to_string()) {
            warn!(error = %e, "Failed to persist connection limit");
        }
        Ok(())
    }

    /// Allocate a connection and start connecting in the background.
    ///
    /// Returns the id immediately; the connection starts in `Connecting`.
    pub async fn create_connection(&self, config: ConnectionConfig) -> ConnectionResult<String> {
        if config.url.trim().is_empty() {
            return Err(ConnectionError::Connection("url is empty".to_string()));
        }

        let mut connections = self.connections.write().await;
        let limit = self.max_connections();
        if connections.len() >= limit {
            return Err(ConnectionError::LimitReached(limit));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let url = config.url.clone();
        let (shared, shutdown_rx) = ConnectionShared::new(id.clone(), config, self.events.clone());
        shared.emit_connecting();
        let task = tokio::spawn(shared.clone().run(self.connector.clone(), shutdown_rx));
        connections.insert(id.clone(), ConnectionEntry { shared, task });

        info!(connection_id = %id, url = %url, "Connection created");
        Ok(id)
    }

    /// Close and forget a connection. Returns false for unknown ids.
    pub async fn close_connection(&self, id: &str) -> bool {
        let entry = self.connections.write().await.remove(id);
        let Some(entry) = entry else {
            return false;
        };
        entry.shared.close().await;
        if let Err(e) = entry.task.await {
            warn!(connection_id = %id, error = %e, "Connection task ended abnormally");
        }
        true
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for id in ids {
            self.close_connection(&id).await;
        }
    }

    async fn shared(&self, id: &str) -> ConnectionResult<Arc<ConnectionShared>> {
        self.connections
            .read()
            .await
            .get(id)
            .map(|entry| entry.shared.clone())
            .ok_or_else(|| ConnectionError::NotFound(id.to_string()))
    }

    /// Send a chat message on `topic`.
    ///
    /// Live connections transmit immediately. Otherwise the payload goes to
    /// the message queue; without one this fails with `NotConnected`.
    pub async fn send_message(
        &self,
        id: &str,
        topic: &str,
        payload: MessagePayload,
    ) -> ConnectionResult<SendOutcome> {
        if topic.trim().is_empty() {
            return Err(ConnectionError::InvalidPayload("topic is empty".to_string()));
        }
        payload
            .validate()
            .map_err(|e| ConnectionError::InvalidPayload(e.to_string()))?;
        let shared = self.shared(id).await?;

        if let Some(outbound) = shared.live_outbound().await {
            let message_id = uuid::Uuid::new_v4().to_string();
            let frame = WireMessage::Message {
                topic: topic.to_string(),
                message_id: message_id.clone(),
                payload: payload.clone(),
            };
            if outbound.send(frame).await.is_ok() {
                debug!(connection_id = %id, topic, message_id = %message_id, "Message sent");
                return Ok(SendOutcome::Sent { message_id });
            }
            debug!(connection_id = %id, "Transport closed mid-send, falling back to queue");
        }

        let queue = self.message_queue.read().await.clone();
        match queue {
            Some(queue) => {
                let queued = queue.enqueue(topic, payload, Priority::Normal, None)?;
                info!(connection_id = %id, topic, message_id = %queued.id, "Message queued");
                Ok(SendOutcome::Queued {
                    message_id: queued.id,
                })
            }
            None => Err(ConnectionError::NotConnected),
        }
    }

    /// Write an already-identified message to a live connection. No queue
    /// fallback.
    pub async fn transmit(
        &self,
        id: &str,
        topic: &str,
        message: &OutboundMessage,
    ) -> ConnectionResult<()> {
        let outbound = self
            .shared(id)
            .await?
            .live_outbound()
            .await
            .ok_or(ConnectionError::NotConnected)?;
        let frame = WireMessage::Message {
            topic: topic.to_string(),
            message_id: message.id.clone(),
            payload: message.payload.clone(),
        };
        outbound
            .send(frame)
            .await
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    async fn send_ephemeral(&self, id: &str, frame: WireMessage) -> ConnectionResult<()> {
        let outbound = self
            .shared(id)
            .await?
            .live_outbound()
            .await
            .ok_or(ConnectionError::NotConnected)?;
        outbound
            .send(frame)
            .await
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    /// Typing indicator. Never queued.
    pub async fn send_typing(&self, id: &str, topic: &str, is_typing: bool) -> ConnectionResult<()> {
        self.send_ephemeral(
            id,
            WireMessage::Typing {
                topic: topic.to_string(),
                user_id: None,
                is_typing,
            },
        )
        .await
    }

    /// Read receipt. Never queued.
    pub async fn send_read_receipt(
        &self,
        id: &str,
        topic: &str,
        message_id: &str,
    ) -> ConnectionResult<()> {
        self.send_ephemeral(
            id,
            WireMessage::ReadReceipt {
                topic: topic.to_string(),
                message_id: message_id.to_string(),
                read_by: None,
            },
        )
        .await
    }

    /// Track `topic` on a connection. It is (re)subscribed on every connect.
    pub async fn subscribe<F>(&self, id: &str, topic: &str, callback: F) -> ConnectionResult<()>
    where
        F: Fn(TopicEvent) + Send + Sync + 'static,
    {
        if topic.trim().is_empty() {
            return Err(ConnectionError::InvalidPayload("topic is empty".to_string()));
        }
        self.shared(id).await?.subscribe(topic, Arc::new(callback)).await;
        debug!(connection_id = %id, topic, "Subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, id: &str, topic: &str) -> ConnectionResult<bool> {
        Ok(self.shared(id).await?.unsubscribe(topic).await)
    }

    pub async fn state(&self, id: &str) -> Option<ConnectionState> {
        let shared = self.shared(id).await.ok()?;
        Some(shared.state().await)
    }

    pub async fn connection(&self, id: &str) -> Option<Connection> {
        let shared = self.shared(id).await.ok()?;
        Some(shared.snapshot().await)
    }

    pub async fn all_states(&self) -> HashMap<String, ConnectionState> {
        let shared: Vec<Arc<ConnectionShared>> = self
            .connections
            .read()
            .await
            .values()
            .map(|entry| entry.shared.clone())
            .collect();
        let mut states = HashMap::with_capacity(shared.len());
        for connection in shared {
            states.insert(connection.id().to_string(), connection.state().await);
        }
        states
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Skip the remaining backoff of every reconnecting connection.
    pub async fn reconnect_now(&self) {
        for entry in self.connections.read().await.values() {
            entry.shared.wake();
        }
    }
}

/// [`MessageTransport`] over one realtime connection, with an optional
/// fallback transport used while the connection is not live.
pub struct ConnectionTransport {
    manager: Weak<ConnectionManager>,
    connection_id: String,
    fallback: Option<Arc<dyn MessageTransport>>,
}

impl ConnectionTransport {
    pub fn new(
        manager: &Arc<ConnectionManager>,
        connection_id: impl Into<String>,
        fallback: Option<Arc<dyn MessageTransport>>,
    ) -> Self {
        Self {
            manager: Arc::downgrade(manager),
            connection_id: connection_id.into(),
            fallback,
        }
    }
}

#[async_trait]
impl MessageTransport for ConnectionTransport {
    async fn send(
        &self,
        conversation_id: &str,
        message: &OutboundMessage,
    ) -> BridgeResult<SendReceipt> {
        if let Some(manager) = self.manager.upgrade() {
            match manager
                .transmit(&self.connection_id, conversation_id, message)
                .await
            {
                Ok(()) => return Ok(SendReceipt::delivered(None)),
                Err(e) => debug!(
                    connection_id = %self.connection_id,
                    message_id = %message.id,
                    error = %e,
                    "Realtime send unavailable"
                ),
            }
        }

        match &self.fallback {
            Some(fallback) => fallback.send(conversation_id, message).await,
            None => Err(BridgeError::Transport(
                "realtime connection unavailable".to_string(),
            )),
        }
    }
}

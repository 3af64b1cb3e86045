//! Transport connectors.
//!
//! A connector opens one realtime session and hands back a [`TransportLink`]:
//! an outbound frame sender and an inbound event receiver. The connection
//! supervisor owns the link and decides when to reconnect.

use crate::{ConnectionConfig, ConnectionError, ConnectionResult, WireMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 100;

/// Something received from an open session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(WireMessage),
    /// The session ended, with the close reason when known.
    Closed(Option<String>),
}

/// Aborts the transport's I/O tasks when the link is dropped.
#[derive(Default)]
pub(crate) struct TaskGuard(Vec<JoinHandle<()>>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// One open realtime session.
pub struct TransportLink {
    pub outbound: mpsc::Sender<WireMessage>,
    pub inbound: mpsc::Receiver<TransportEvent>,
    tasks: TaskGuard,
}

impl TransportLink {
    pub fn new(outbound: mpsc::Sender<WireMessage>, inbound: mpsc::Receiver<TransportEvent>) -> Self {
        Self {
            outbound,
            inbound,
            tasks: TaskGuard::default(),
        }
    }

    fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = TaskGuard(tasks);
        self
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::Sender<WireMessage>,
        mpsc::Receiver<TransportEvent>,
        TaskGuard,
    ) {
        (self.outbound, self.inbound, self.tasks)
    }
}

/// Opens realtime sessions.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> ConnectionResult<TransportLink>;
}

/// WebSocket connector speaking JSON text frames.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }

    /// Server URL with the auth token appended as the `token` query parameter.
    pub fn endpoint(config: &ConnectionConfig) -> ConnectionResult<String> {
        let mut url = url::Url::parse(&config.url)
            .map_err(|e| ConnectionError::Connection(format!("invalid url {}: {}", config.url, e)))?;
        if let Some(token) = &config.auth_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.to_string())
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, config: &ConnectionConfig) -> ConnectionResult<TransportLink> {
        let endpoint = Self::endpoint(config)?;
        info!(url = %config.url, "Opening realtime WebSocket");

        let (ws_stream, _) = connect_async(endpoint).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WireMessage>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);
        let (control_tx, mut control_rx) = mpsc::channel::<Message>(8);

        // Writer: protocol frames plus pong replies
        let writer = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    Some(control) = control_rx.recv() => control,
                    message = outbound_rx.recv() => match message {
                        Some(message) => match message.to_json() {
                            Ok(json) => Message::Text(json.into()),
                            Err(e) => {
                                warn!(error = %e, "Failed to encode frame");
                                continue;
                            }
                        },
                        None => break,
                    },
                };
                if write.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match WireMessage::from_json(&text) {
                        Ok(message) => {
                            if inbound_tx.send(TransportEvent::Message(message)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to parse realtime frame"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = control_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.as_str().to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            debug!(reason = ?reason, "Realtime WebSocket closed");
            let _ = inbound_tx.send(TransportEvent::Closed(reason)).await;
        });

        Ok(TransportLink::new(outbound_tx, inbound_rx).with_tasks(vec![writer, reader]))
    }
}

/// In-process connector. Every successful connect hands the server side of
/// the session to the paired receiver.
pub struct MemoryConnector {
    sessions: mpsc::UnboundedSender<ServerSession>,
    refuse: AtomicBool,
    attempts: AtomicU32,
}

/// Server end of an in-memory session.
pub struct ServerSession {
    pub url: String,
    from_client: mpsc::Receiver<WireMessage>,
    to_client: mpsc::Sender<TransportEvent>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerSession>) {
        let (sessions, accepted) = mpsc::unbounded_channel();
        let connector = Self {
            sessions,
            refuse: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        };
        (connector, accepted)
    }

    /// Make subsequent connects fail.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, config: &ConnectionConfig) -> ConnectionResult<TransportLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::Connection("connection refused".to_string()));
        }

        let (outbound_tx, from_client) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_client, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let session = ServerSession {
            url: config.url.clone(),
            from_client,
            to_client,
        };
        self.sessions
            .send(session)
            .map_err(|_| ConnectionError::Connection("no server accepting sessions".to_string()))?;

        Ok(TransportLink::new(outbound_tx, inbound_rx))
    }
}

impl ServerSession {
    /// Next frame sent by the client, `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.from_client.recv().await
    }

    /// Push a frame to the client. Returns false if the client is gone.
    pub async fn push(&self, message: WireMessage) -> bool {
        self.to_client
            .send(TransportEvent::Message(message))
            .await
            .is_ok()
    }

    /// End the session from the server side.
    pub async fn close(self, reason: Option<String>) {
        let _ = self.to_client.send(TransportEvent::Closed(reason)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_appends_token() {
        let config = ConnectionConfig {
            url: "wss://realtime.example.com/ws".to_string(),
            auth_token: Some("a b&c".to_string()),
            ..Default::default()
        };
        let endpoint = WebSocketConnector::endpoint(&config).unwrap();
        assert_eq!(endpoint, "wss://realtime.example.com/ws?token=a+b%26c");
    }

    #[test]
    fn test_endpoint_without_token_is_unchanged() {
        let config = ConnectionConfig {
            url: "ws://localhost:8000/ws".to_string(),
            auth_token: None,
            ..Default::default()
        };
        assert_eq!(
            WebSocketConnector::endpoint(&config).unwrap(),
            "ws://localhost:8000/ws"
        );
    }

    #[test]
    fn test_endpoint_rejects_invalid_url() {
        let config = ConnectionConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            WebSocketConnector::endpoint(&config),
            Err(ConnectionError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_connector_pairs_sessions() {
        let (connector, mut accepted) = MemoryConnector::new();
        let link = connector.connect(&ConnectionConfig::default()).await.unwrap();
        let mut session = accepted.recv().await.unwrap();

        link.outbound.send(WireMessage::Heartbeat).await.unwrap();
        assert_eq!(session.recv().await, Some(WireMessage::Heartbeat));

        let (_outbound, mut inbound, _tasks) = link.into_parts();
        session.close(Some("bye".to_string())).await;
        assert_eq!(
            inbound.recv().await,
            Some(TransportEvent::Closed(Some("bye".to_string())))
        );
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_memory_connector_refuses() {
        let (connector, _accepted) = MemoryConnector::new();
        connector.set_refuse(true);
        assert!(connector.connect(&ConnectionConfig::default()).await.is_err());
        assert_eq!(connector.connect_attempts(), 1);
    }
}

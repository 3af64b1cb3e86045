//! Orchestrator: owns the background loops and the wiring between them.

use crate::{OrchestratorError, OrchestratorResult};
use connection_manager::{ConnectionEvent, ConnectionManager, ConnectionState};
use message_queue::{MessageQueue, QueueStats};
use network_monitor::{NetworkInfo, NetworkMonitor};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use sync_queue::{SyncQueue, SyncStats};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pull-based snapshot of every component.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub network: NetworkInfo,
    pub connections: HashMap<String, ConnectionState>,
    pub message_queue: QueueStats,
    pub sync_queue: SyncStats,
}

/// Starts and stops the sync subsystem as one unit.
pub struct SyncOrchestrator {
    monitor: Arc<NetworkMonitor>,
    connections: Arc<ConnectionManager>,
    message_queue: Arc<MessageQueue>,
    sync_queue: Arc<SyncQueue>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        monitor: Arc<NetworkMonitor>,
        connections: Arc<ConnectionManager>,
        message_queue: Arc<MessageQueue>,
        sync_queue: Arc<SyncQueue>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            monitor,
            connections,
            message_queue,
            sync_queue,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn message_queue(&self) -> &Arc<MessageQueue> {
        &self.message_queue
    }

    pub fn sync_queue(&self) -> &Arc<SyncQueue> {
        &self.sync_queue
    }

    /// Spawn every background loop. Can only be called once.
    pub fn start(&self) -> OrchestratorResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyStarted);
        }

        // Subscribe before the monitor's first check so that transition is seen.
        let network_rx = self.monitor.watch();
        let events_rx = self.connections.events();

        let mut tasks = vec![
            self.message_queue.run(self.shutdown_tx.subscribe())?,
            self.sync_queue.run(self.shutdown_tx.subscribe())?,
        ];
        tasks.push(tokio::spawn(watch_network(
            network_rx,
            self.message_queue.clone(),
            self.sync_queue.clone(),
            self.connections.clone(),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(watch_connections(
            events_rx,
            self.message_queue.clone(),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(self.monitor.start());

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        info!("Sync orchestrator started");
        Ok(())
    }

    /// Stop every loop and close every connection. No component callback
    /// runs after this returns.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.monitor.stop().await;
        self.connections.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Sync orchestrator stopped");
    }

    pub async fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            network: self.monitor.current(),
            connections: self.connections.all_states().await,
            message_queue: self.message_queue.stats(),
            sync_queue: self.sync_queue.stats(),
        }
    }
}

/// Request one pass per queue on every offline to reachable transition.
async fn watch_network(
    mut network: watch::Receiver<NetworkInfo>,
    message_queue: Arc<MessageQueue>,
    sync_queue: Arc<SyncQueue>,
    connections: Arc<ConnectionManager>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut reachable = network.borrow_and_update().status.is_reachable();

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            changed = network.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = network.borrow_and_update().status;
                let now_reachable = status.is_reachable();

                if now_reachable && !reachable {
                    info!(status = %status, "Network reachable, resuming delivery");
                    message_queue.request_drain();
                    sync_queue.request_process();
                    connections.reconnect_now().await;
                } else if !now_reachable && reachable {
                    info!("Network offline, delivery paused");
                }
                reachable = now_reachable;
            }
        }
    }

    debug!("Network watcher exited");
}

/// Drain queued messages when a connection comes up while messages are
/// waiting and no pass is running. The drain for a network transition has
/// already been requested, so a reconnect it caused adds none.
async fn watch_connections(
    mut events: broadcast::Receiver<ConnectionEvent>,
    message_queue: Arc<MessageQueue>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(ConnectionEvent::Connected { id }) => {
                let stats = message_queue.stats();
                if stats.pending > 0 && !stats.is_draining {
                    debug!(connection_id = %id, pending = stats.pending, "Connection live, requesting drain");
                    message_queue.request_drain();
                }
            }
            Ok(ConnectionEvent::ReconnectFailed { id, attempts }) => {
                warn!(connection_id = %id, attempts, "Connection gave up reconnecting");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Connection event listener lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }

    debug!("Connection event watcher exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use connection_manager::{ConnectionConfig, MemoryConnector, ServerSession};
    use message_queue::{MessageQueueConfig, Priority};
    use network_monitor::{MonitorConfig, NetworkError, NetworkResult, NetworkStatus, Probe};
    use platform_bridge::{
        BridgeResult, KeyValueStore, MemoryStore, MessagePayload, MessageTransport,
        OutboundMessage, Record, ResourceApi, ResourceType, SendReceipt,
    };
    use serde_json::json;
    use std::time::Duration;
    use sync_queue::{SyncOperation, SyncQueueConfig};
    use tokio::sync::mpsc;

    struct SwitchProbe {
        up: AtomicBool,
    }

    #[async_trait]
    impl Probe for SwitchProbe {
        fn endpoint(&self) -> &str {
            "switch"
        }

        async fn probe(&self) -> NetworkResult<Duration> {
            if self.up.load(Ordering::SeqCst) {
                Ok(Duration::from_millis(5))
            } else {
                Err(NetworkError::Unreachable {
                    endpoint: "switch".to_string(),
                    message: "down".to_string(),
                })
            }
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageTransport for RecordingTransport {
        async fn send(&self, _conversation_id: &str, message: &OutboundMessage) -> BridgeResult<SendReceipt> {
            self.sent.lock().unwrap().push(message.id.clone());
            Ok(SendReceipt::delivered(None))
        }
    }

    #[derive(Default)]
    struct AcceptingApi {
        created: Mutex<Vec<Record>>,
    }

    #[async_trait]
    impl ResourceApi for AcceptingApi {
        async fn create(&self, _resource: ResourceType, record: &Record) -> BridgeResult<Record> {
            self.created.lock().unwrap().push(record.clone());
            Ok(record.clone())
        }

        async fn update(&self, _resource: ResourceType, _id: &str, record: &Record) -> BridgeResult<Record> {
            Ok(record.clone())
        }

        async fn delete(&self, _resource: ResourceType, _id: &str) -> BridgeResult<()> {
            Ok(())
        }

        async fn get(&self, _resource: ResourceType, _id: &str) -> BridgeResult<Option<Record>> {
            Ok(None)
        }
    }

    struct Fixture {
        orchestrator: SyncOrchestrator,
        probe: Arc<SwitchProbe>,
        transport: Arc<RecordingTransport>,
        api: Arc<AcceptingApi>,
        sessions: mpsc::UnboundedReceiver<ServerSession>,
    }

    fn fixture() -> Fixture {
        let probe = Arc::new(SwitchProbe {
            up: AtomicBool::new(false),
        });
        let monitor = Arc::new(NetworkMonitor::new(
            MonitorConfig {
                check_interval: Duration::from_secs(3600),
                probe_timeout: Duration::from_millis(200),
                ..Default::default()
            },
            vec![probe.clone() as Arc<dyn Probe>],
        ));
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let (connector, sessions) = MemoryConnector::new();
        let connections = Arc::new(ConnectionManager::new(
            ConnectionConfig::default(),
            5,
            Arc::new(connector),
            store.clone(),
        ));

        let transport = Arc::new(RecordingTransport::default());
        let message_queue = Arc::new(
            MessageQueue::new(
                MessageQueueConfig {
                    drain_interval: Duration::from_secs(3600),
                    ..Default::default()
                },
                store.clone(),
                transport.clone(),
                monitor.watch(),
            )
            .unwrap(),
        );
        let api = Arc::new(AcceptingApi::default());
        let sync_queue = Arc::new(
            SyncQueue::new(
                SyncQueueConfig {
                    process_interval: Duration::from_secs(3600),
                    ..Default::default()
                },
                store,
                api.clone(),
                monitor.watch(),
            )
            .unwrap(),
        );

        Fixture {
            orchestrator: SyncOrchestrator::new(monitor, connections, message_queue, sync_queue),
            probe,
            transport,
            api,
            sessions,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_reconnect_triggers_exactly_one_pass_per_queue() {
        let f = fixture();
        let orchestrator = &f.orchestrator;
        orchestrator.start().unwrap();
        settle().await;
        assert_eq!(orchestrator.monitor().status(), NetworkStatus::Offline);

        let queue = orchestrator.message_queue();
        let high = queue
            .enqueue("conv-1", MessagePayload::text("urgent"), Priority::High, None)
            .unwrap();
        let normal = queue
            .enqueue("conv-1", MessagePayload::text("later"), Priority::Normal, None)
            .unwrap();
        orchestrator
            .sync_queue()
            .add_item(
                "i-1",
                ResourceType::Patient,
                json!({"id": "p-1", "name": "A", "phone": "555"}).as_object().cloned().unwrap(),
                SyncOperation::Create,
            )
            .unwrap();
        settle().await;
        assert!(f.transport.sent.lock().unwrap().is_empty());

        f.probe.up.store(true, Ordering::SeqCst);
        orchestrator.monitor().check_now().await;

        for _ in 0..100 {
            if queue.stats().completed_passes >= 1 && orchestrator.sync_queue().stats().completed_passes >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        settle().await;

        assert_eq!(*f.transport.sent.lock().unwrap(), vec![high.id, normal.id]);
        assert_eq!(f.api.created.lock().unwrap().len(), 1);
        assert_eq!(queue.stats().completed_passes, 1);
        assert_eq!(orchestrator.sync_queue().stats().completed_passes, 1);

        // Staying online is not a transition.
        orchestrator.monitor().check_now().await;
        settle().await;
        assert_eq!(queue.stats().completed_passes, 1);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_after_transition_adds_no_second_drain() {
        let mut f = fixture();
        let orchestrator = &f.orchestrator;
        orchestrator.start().unwrap();
        settle().await;

        f.probe.up.store(true, Ordering::SeqCst);
        orchestrator.monitor().check_now().await;
        let queue = orchestrator.message_queue();
        for _ in 0..100 {
            if queue.stats().completed_passes >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.stats().completed_passes, 1);

        let mut events = orchestrator.connections().events();
        orchestrator
            .connections()
            .create_connection(ConnectionConfig::default())
            .await
            .unwrap();
        let _session = tokio::time::timeout(Duration::from_secs(5), f.sessions.recv())
            .await
            .unwrap()
            .unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, ConnectionEvent::Connected { .. }) {
                break;
            }
        }
        settle().await;

        assert_eq!(queue.stats().completed_passes, 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let f = fixture();
        f.orchestrator.start().unwrap();
        assert!(matches!(
            f.orchestrator.start(),
            Err(OrchestratorError::AlreadyStarted)
        ));
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_monitor_and_connections() {
        let f = fixture();
        let orchestrator = &f.orchestrator;
        orchestrator.start().unwrap();
        orchestrator
            .connections()
            .create_connection(ConnectionConfig::default())
            .await
            .unwrap();
        assert_eq!(orchestrator.connections().connection_count().await, 1);

        orchestrator.shutdown().await;

        assert!(orchestrator.monitor().is_stopped());
        assert_eq!(orchestrator.connections().connection_count().await, 0);
        assert!(orchestrator.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let f = fixture();
        let orchestrator = &f.orchestrator;
        orchestrator
            .message_queue()
            .enqueue("conv-1", MessagePayload::text("hi"), Priority::Low, None)
            .unwrap();

        let status = orchestrator.status().await;
        assert_eq!(status.network.status, NetworkStatus::Offline);
        assert!(status.connections.is_empty());
        assert_eq!(status.message_queue.pending, 1);
        assert_eq!(status.sync_queue.total, 0);

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["network"]["status"], "offline");
        assert_eq!(value["message_queue"]["pending"], 1);
    }
}

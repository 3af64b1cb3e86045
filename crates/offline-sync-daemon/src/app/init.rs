use crate::app::local::{bridge_client, daemon_pid, running_daemon_pid};
use connection_manager::{ConnectionManager, ConnectionTransport, WebSocketConnector};
use message_queue::MessageQueue;
use network_monitor::NetworkMonitor;
use platform_bridge::{KeyValueStore, MessageTransport, SqliteStore};
use std::sync::Arc;
use sync_config_and_utils::{Config, Paths};
use sync_orchestrator::{
    connection_config, http_probes, message_queue_config, monitor_config, sync_queue_config,
    SyncOrchestrator,
};
use sync_queue::SyncQueue;
use tracing::{info, warn};

/// Take over the pid file. Fails while another daemon is alive; a file left
/// by a dead process is replaced.
fn claim_pid_file(paths: &Paths) -> Result<u32, Box<dyn std::error::Error>> {
    if let Some(pid) = running_daemon_pid(paths) {
        return Err(format!("daemon is already running (PID {})", pid).into());
    }
    let pid_file = paths.pid_file();
    if let Some(stale) = daemon_pid(paths) {
        warn!(path = %pid_file.display(), pid = stale, "Removing stale pid file");
        let _ = std::fs::remove_file(&pid_file);
    }

    paths.ensure_dirs()?;
    let pid = std::process::id();
    std::fs::write(&pid_file, pid.to_string())?;
    Ok(pid)
}

pub async fn run_daemon(config: Config, paths: Paths) -> Result<(), Box<dyn std::error::Error>> {
    let pid_file = paths.pid_file();
    let pid = claim_pid_file(&paths)?;

    info!("Starting offline sync daemon");
    info!(
        bridge_url = %config.bridge.base_url,
        realtime_url = %config.realtime.url,
        probes = config.network.probe_urls.len(),
        "Configuration loaded"
    );

    info!(pid = pid, "Daemon started");

    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&paths.store_file())?);
    info!(path = %paths.store_file().display(), "Durable store opened");

    let bridge = Arc::new(bridge_client(&config)?);

    let monitor = Arc::new(NetworkMonitor::new(
        monitor_config(&config.network),
        http_probes(&config.network)?,
    ));

    let connections = Arc::new(ConnectionManager::new(
        connection_config(&config.realtime, config.bridge.auth_token.clone()),
        config.realtime.max_connections,
        Arc::new(WebSocketConnector::new()),
        store.clone(),
    ));
    let primary = connections
        .create_connection(connections.defaults().clone())
        .await?;

    // Messages go over the realtime connection, or the HTTP bridge while it is down.
    let transport = Arc::new(ConnectionTransport::new(
        &connections,
        primary.clone(),
        Some(bridge.clone() as Arc<dyn MessageTransport>),
    ));
    let message_queue = Arc::new(MessageQueue::new(
        message_queue_config(&config.message_queue),
        store.clone(),
        transport,
        monitor.watch(),
    )?);
    connections.set_message_queue(message_queue.clone()).await;

    let sync_queue = Arc::new(SyncQueue::new(
        sync_queue_config(&config.sync_queue),
        store,
        bridge,
        monitor.watch(),
    )?);

    let orchestrator = SyncOrchestrator::new(monitor, connections, message_queue, sync_queue);
    orchestrator.start()?;

    let status = orchestrator.status().await;
    info!(
        connection_id = %primary,
        pending_messages = status.message_queue.pending,
        pending_items = status.sync_queue.pending,
        unresolved_conflicts = status.sync_queue.unresolved_conflicts,
        "Daemon ready"
    );

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");

    orchestrator.shutdown().await;
    let _ = std::fs::remove_file(&pid_file);
    info!("Daemon stopped");

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
    }
}

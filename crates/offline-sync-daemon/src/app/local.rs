//! Commands that work directly on the durable store while the daemon is down.

use message_queue::MessageQueue;
use network_monitor::NetworkInfo;
use platform_bridge::{HttpBridgeClient, KeyValueStore, Record, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use sync_config_and_utils::{Config, Paths};
use sync_orchestrator::{message_queue_config, sync_queue_config};
use sync_queue::{Resolution, SyncConflict, SyncQueue};
use tokio::sync::watch;
use tracing::info;

/// Both queues opened over the on-disk store.
pub(crate) struct LocalQueues {
    pub messages: MessageQueue,
    pub sync: SyncQueue,
}

pub(crate) fn bridge_client(config: &Config) -> Result<HttpBridgeClient, Box<dyn std::error::Error>> {
    Ok(HttpBridgeClient::new(
        config.bridge.base_url.clone(),
        config.bridge.auth_token.clone(),
        Duration::from_secs(config.bridge.request_timeout_secs),
    )?)
}

/// Open both queues. Their background loops are not started and the
/// network is reported offline, so nothing drains on its own.
pub(crate) fn open_local(
    config: &Config,
    paths: &Paths,
) -> Result<LocalQueues, Box<dyn std::error::Error>> {
    paths.ensure_dirs()?;
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&paths.store_file())?);
    let bridge = Arc::new(bridge_client(config)?);
    let (_, network) = watch::channel(NetworkInfo::unknown());

    let messages = MessageQueue::new(
        message_queue_config(&config.message_queue),
        store.clone(),
        bridge.clone(),
        network.clone(),
    )?;
    let sync = SyncQueue::new(sync_queue_config(&config.sync_queue), store, bridge, network)?;
    Ok(LocalQueues { messages, sync })
}

/// PID recorded in the pid file, if any. The process may be gone.
pub(crate) fn daemon_pid(paths: &Paths) -> Option<u32> {
    std::fs::read_to_string(paths.pid_file())
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence and permission.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub(crate) fn process_alive(_pid: u32) -> bool {
    true
}

/// PID of a daemon that is still alive. A pid file left by a dead process
/// yields `None`.
pub(crate) fn running_daemon_pid(paths: &Paths) -> Option<u32> {
    daemon_pid(paths).filter(|pid| process_alive(*pid))
}

/// Refuse to mutate the store underneath a running daemon.
fn ensure_not_running(paths: &Paths, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    match running_daemon_pid(paths) {
        Some(pid) if !force => Err(format!(
            "daemon appears to be running (PID {}); stop it first or pass --force",
            pid
        )
        .into()),
        _ => Ok(()),
    }
}

fn parse_merged(raw: &str) -> Result<Record, Box<dyn std::error::Error>> {
    match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Object(record) => Ok(record),
        _ => Err("merged payload must be a JSON object".into()),
    }
}

fn print_conflict(conflict: &SyncConflict) {
    let fields: Vec<&str> = conflict.conflict_fields.iter().map(String::as_str).collect();
    println!("{}", conflict.id);
    println!("  Resource: {}", conflict.resource_type);
    println!("  Item:     {}", conflict.item_id);
    println!("  Fields:   {}", fields.join(", "));
    println!("  Detected: {}", conflict.detected_at.to_rfc3339());
    if let Some(resolution) = conflict.resolution {
        println!("  Resolved: {}", resolution);
    }
}

/// Print sync conflicts, unresolved only unless `all` is set.
pub fn list_conflicts(
    config: &Config,
    paths: &Paths,
    all: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let conflicts = if paths.store_file().exists() {
        let local = open_local(config, paths)?;
        if all {
            local.sync.conflicts()
        } else {
            local.sync.unresolved_conflicts()
        }
    } else {
        Vec::new()
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }
    if conflicts.is_empty() {
        println!("No conflicts");
        return Ok(());
    }
    for conflict in &conflicts {
        print_conflict(conflict);
    }
    Ok(())
}

/// Resolve a conflict and push the chosen payload to the platform API.
pub async fn resolve_conflict(
    config: &Config,
    paths: &Paths,
    conflict_id: &str,
    resolution: Resolution,
    merged: Option<&str>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    ensure_not_running(paths, force)?;
    let merged = merged.map(parse_merged).transpose()?;

    let local = open_local(config, paths)?;
    let payload = local
        .sync
        .resolve_conflict(conflict_id, resolution, merged)
        .await?;

    println!("Conflict {} resolved ({})", conflict_id, resolution);
    match payload {
        Some(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
        None => println!("Record stays deleted remotely"),
    }
    Ok(())
}

/// Reset failed messages and sync items. Returns (messages, items).
fn reset_failed(
    local: &LocalQueues,
    conversation_id: Option<&str>,
) -> (usize, usize) {
    let messages = local.messages.retry_failed_messages(conversation_id);
    // Sync items are not scoped to conversations.
    let items = if conversation_id.is_none() {
        local.sync.retry_failed_items()
    } else {
        0
    };
    info!(messages, items, "Reset failed entries");
    (messages, items)
}

pub fn retry_failed(
    config: &Config,
    paths: &Paths,
    conversation_id: Option<&str>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    ensure_not_running(paths, force)?;
    let local = open_local(config, paths)?;
    let (messages, items) = reset_failed(&local, conversation_id);
    println!("Reset {} failed messages and {} failed sync items", messages, items);
    Ok(())
}

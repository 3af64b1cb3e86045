//! Config sections mapped onto component configs.

use crate::OrchestratorResult;
use connection_manager::ConnectionConfig;
use message_queue::MessageQueueConfig;
use network_monitor::{HttpProbe, MonitorConfig, Probe};
use std::sync::Arc;
use std::time::Duration;
use sync_config_and_utils::{
    MessageQueueSettings, NetworkSettings, RealtimeSettings, SyncQueueSettings,
};
use sync_queue::SyncQueueConfig;

pub fn monitor_config(settings: &NetworkSettings) -> MonitorConfig {
    MonitorConfig {
        check_interval: Duration::from_secs(settings.check_interval_secs),
        probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
        slow_threshold: Duration::from_millis(settings.slow_threshold_ms),
        unstable_threshold: settings.unstable_threshold,
    }
}

/// One HTTP probe per configured URL, sharing a client.
pub fn http_probes(settings: &NetworkSettings) -> OrchestratorResult<Vec<Arc<dyn Probe>>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(settings.probe_timeout_ms))
        .build()?;
    Ok(settings
        .probe_urls
        .iter()
        .map(|url| Arc::new(HttpProbe::new(client.clone(), url.clone())) as Arc<dyn Probe>)
        .collect())
}

/// Connection defaults. The realtime token falls back to the bridge token.
pub fn connection_config(settings: &RealtimeSettings, auth_token: Option<String>) -> ConnectionConfig {
    ConnectionConfig {
        url: settings.url.clone(),
        auth_token,
        auto_reconnect: settings.auto_reconnect,
        reconnect_base_delay: Duration::from_millis(settings.reconnect_base_delay_ms),
        reconnect_max_delay: Duration::from_millis(settings.reconnect_max_delay_ms),
        max_reconnect_attempts: settings.max_reconnect_attempts,
        heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
        ..Default::default()
    }
}

pub fn message_queue_config(settings: &MessageQueueSettings) -> MessageQueueConfig {
    MessageQueueConfig {
        drain_interval: Duration::from_secs(settings.drain_interval_secs),
        default_max_retries: settings.default_max_retries,
        retention: Duration::from_secs(settings.retention_secs),
        ..Default::default()
    }
}

pub fn sync_queue_config(settings: &SyncQueueSettings) -> SyncQueueConfig {
    SyncQueueConfig {
        process_interval: Duration::from_secs(settings.process_interval_secs),
        max_retries: settings.max_retries,
        ignored_conflict_fields: settings.ignored_conflict_fields.clone(),
        ..Default::default()
    }
}

//! Network monitor: periodic multi-probe checks with transition broadcasting.

use crate::{NetworkError, NetworkInfo, NetworkResult, NetworkStatus, Probe};
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Callback invoked with the new snapshot on every status transition.
pub type StatusCallback = Arc<dyn Fn(&NetworkInfo) + Send + Sync>;

/// Network monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between periodic checks.
    pub check_interval: Duration,
    /// Timeout applied to each probe.
    pub probe_timeout: Duration,
    /// Average latency above which the network is reported slow.
    pub slow_threshold: Duration,
    /// Consecutive degraded checks before the network is reported unstable.
    pub unstable_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            slow_threshold: Duration::from_secs(2),
            unstable_threshold: 3,
        }
    }
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    callbacks: HashMap<u64, StatusCallback>,
}

type SharedRegistry = Arc<Mutex<ListenerRegistry>>;

/// Handle returned by [`NetworkMonitor::add_listener`].
pub struct ListenerHandle {
    id: u64,
    registry: Weak<Mutex<ListenerRegistry>>,
}

impl ListenerHandle {
    /// Stop receiving transitions. Returns false if already removed.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .callbacks
                .remove(&self.id)
                .is_some(),
            None => false,
        }
    }
}

/// Outcome of classifying one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Evaluation {
    status: NetworkStatus,
    consecutive_failures: u32,
    latency_ms: Option<u64>,
}

/// Classify a check from the latencies of its successful probes.
///
/// A check is degraded when at least one probe failed. Degraded checks
/// increment the failure counter; a fully successful check resets it.
/// Precedence: offline, unstable, slow, online.
fn evaluate(
    latencies: &[Duration],
    probe_count: usize,
    failures_before: u32,
    config: &MonitorConfig,
) -> Evaluation {
    if latencies.is_empty() {
        return Evaluation {
            status: NetworkStatus::Offline,
            consecutive_failures: failures_before.saturating_add(1),
            latency_ms: None,
        };
    }

    let consecutive_failures = if latencies.len() < probe_count {
        failures_before.saturating_add(1)
    } else {
        0
    };

    let total: Duration = latencies.iter().sum();
    let average = total / latencies.len() as u32;

    let status = if consecutive_failures >= config.unstable_threshold {
        NetworkStatus::Unstable
    } else if average > config.slow_threshold {
        NetworkStatus::Slow
    } else {
        NetworkStatus::Online
    };

    Evaluation {
        status,
        consecutive_failures,
        latency_ms: Some(average.as_millis() as u64),
    }
}

/// Multi-probe connectivity detector.
pub struct NetworkMonitor {
    config: MonitorConfig,
    probes: Vec<Arc<dyn Probe>>,
    /// Serializes checks; holds the consecutive degraded-check counter.
    check_state: tokio::sync::Mutex<u32>,
    connection_type: Mutex<Option<String>>,
    status_tx: watch::Sender<NetworkInfo>,
    listeners: SharedRegistry,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl NetworkMonitor {
    pub fn new(config: MonitorConfig, probes: Vec<Arc<dyn Probe>>) -> Self {
        if probes.is_empty() {
            warn!("Network monitor created without probes, status will stay offline");
        }
        let (status_tx, _) = watch::channel(NetworkInfo::unknown());
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            probes,
            check_state: tokio::sync::Mutex::new(0),
            connection_type: Mutex::new(None),
            status_tx,
            listeners: Arc::new(Mutex::new(ListenerRegistry::default())),
            stopped: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Latest snapshot.
    pub fn current(&self) -> NetworkInfo {
        self.status_tx.borrow().clone()
    }

    /// Latest status.
    pub fn status(&self) -> NetworkStatus {
        self.status_tx.borrow().status
    }

    /// Receiver notified on every status transition.
    pub fn watch(&self) -> watch::Receiver<NetworkInfo> {
        self.status_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Register a transition callback. The current snapshot is replayed
    /// to it immediately.
    pub fn add_listener<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&NetworkInfo) + Send + Sync + 'static,
    {
        let callback: StatusCallback = Arc::new(callback);
        let id = {
            let mut registry = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.callbacks.insert(id, callback.clone());
            id
        };

        if !self.is_stopped() {
            callback(&self.current());
        }

        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .len()
    }

    /// Record a platform connectivity change and re-check immediately.
    pub async fn report_platform_change(&self, connection_type: Option<String>) -> NetworkInfo {
        debug!(connection_type = ?connection_type, "Platform reported connectivity change");
        *self
            .connection_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = connection_type;
        self.check_now().await
    }

    async fn run_probe(&self, probe: &dyn Probe) -> NetworkResult<Duration> {
        match tokio::time::timeout(self.config.probe_timeout, probe.probe()).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout {
                endpoint: probe.endpoint().to_string(),
            }),
        }
    }

    /// Probe every endpoint in parallel and publish the result.
    ///
    /// Listeners are only called when the status differs from the previous
    /// snapshot. Does nothing once the monitor is stopped.
    pub async fn check_now(&self) -> NetworkInfo {
        if self.is_stopped() {
            return self.current();
        }

        let mut failures = self.check_state.lock().await;

        let results = join_all(self.probes.iter().map(|probe| self.run_probe(probe.as_ref()))).await;

        let mut latencies = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(latency) => latencies.push(latency),
                Err(e) => debug!(error = %e, "Probe failed"),
            }
        }

        let evaluation = evaluate(&latencies, self.probes.len(), *failures, &self.config);
        *failures = evaluation.consecutive_failures;

        if self.is_stopped() {
            return self.current();
        }

        let info = NetworkInfo {
            status: evaluation.status,
            connection_type: self
                .connection_type
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            speed_mbps: None,
            latency_ms: evaluation.latency_ms,
            last_checked: Utc::now(),
        };

        let mut previous = info.status;
        let changed = self.status_tx.send_if_modified(|current| {
            previous = current.status;
            let changed = current.status != info.status;
            *current = info.clone();
            changed
        });

        debug!(
            status = %info.status,
            ok = latencies.len(),
            probes = self.probes.len(),
            latency_ms = ?info.latency_ms,
            consecutive_failures = evaluation.consecutive_failures,
            "Network check complete"
        );

        if changed {
            info!(from = %previous, to = %info.status, "Network status changed");
            self.notify(&info);
        }

        info
    }

    fn notify(&self, info: &NetworkInfo) {
        let callbacks: Vec<StatusCallback> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(info);
        }
    }

    /// Spawn the periodic check loop. The first check runs immediately.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(monitor.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = monitor.config.check_interval.as_secs(),
                probes = monitor.probes.len(),
                "Network monitor started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if monitor.is_stopped() {
                            break;
                        }
                        monitor.check_now().await;
                    }
                }
            }

            debug!("Network monitor loop exited");
        })
    }

    /// Stop the monitor. Once this returns no listener will be called again.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        // Wait out a check that is already past its stop test.
        drop(self.check_state.lock().await);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .clear();
        info!("Network monitor stopped");
    }
}

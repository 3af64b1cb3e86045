//! Sync queue: FIFO remote apply with conflict detection and bounded retry.

use crate::{
    ConflictResolver, Resolution, SyncConflict, SyncError, SyncItem, SyncOperation, SyncResult,
    SyncStatus,
};
use chrono::Utc;
use network_monitor::NetworkInfo;
use platform_bridge::{BridgeError, BridgeResult, KeyValueStore, Record, ResourceApi, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Sync queue configuration.
#[derive(Debug, Clone)]
pub struct SyncQueueConfig {
    /// Interval between periodic processing passes.
    pub process_interval: Duration,
    /// Failed attempts before an item becomes `failed`.
    pub max_retries: u32,
    /// Fields excluded from conflict diffs.
    pub ignored_conflict_fields: Vec<String>,
    /// Key under which the queue document is persisted.
    pub storage_key: String,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self {
            process_interval: Duration::from_secs(60),
            max_retries: 5,
            ignored_conflict_fields: vec!["updated_at".to_string()],
            storage_key: "sync_queue".to_string(),
        }
    }
}

/// Why a processing call did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyProcessing,
    Offline,
}

/// Counters for one processing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub applied: usize,
    pub conflicts: usize,
    pub retried: usize,
    pub failed: usize,
    /// Left pending behind an earlier unfinished item for the same record.
    pub deferred: usize,
    /// Pass stopped early because the network went offline.
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed(ProcessReport),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total: usize,
    pub pending: usize,
    pub syncing: usize,
    pub failed: usize,
    pub conflict: usize,
    pub unresolved_conflicts: usize,
    pub completed_passes: u64,
    pub is_processing: bool,
}

#[derive(Default, Serialize, Deserialize)]
struct SyncState {
    /// Insertion order.
    items: Vec<SyncItem>,
    conflicts: Vec<SyncConflict>,
}

impl SyncState {
    fn item_mut(&mut self, id: &str) -> Option<&mut SyncItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    fn conflict_mut(&mut self, id: &str) -> Option<&mut SyncConflict> {
        self.conflicts.iter_mut().find(|conflict| conflict.id == id)
    }
}

struct ProcessGuard<'a>(&'a AtomicBool);

impl Drop for ProcessGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Records are ordered per `(resource, record id)`; an item never overtakes
/// an earlier one for the same record.
type RecordKey = (ResourceType, String);

fn record_key(item: &SyncItem) -> RecordKey {
    let id = item.record_id().unwrap_or(&item.id);
    (item.resource_type, id.to_string())
}

/// What a remote apply attempt came to.
enum ApplyResult {
    Applied,
    Conflict(SyncConflict),
    Retry(String),
    Rejected(String),
}

/// Durable queue of record mutations.
pub struct SyncQueue {
    config: SyncQueueConfig,
    store: Arc<dyn KeyValueStore>,
    api: Arc<dyn ResourceApi>,
    resolver: ConflictResolver,
    network: watch::Receiver<NetworkInfo>,
    state: Mutex<SyncState>,
    processing: AtomicBool,
    completed_passes: AtomicU64,
    process_tx: mpsc::Sender<()>,
    process_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl SyncQueue {
    /// Create a queue, restoring persisted items and conflicts.
    ///
    /// Items left in `syncing` go back to `pending`, or to `conflict` when
    /// an unresolved conflict still references them.
    pub fn new(
        config: SyncQueueConfig,
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn ResourceApi>,
        network: watch::Receiver<NetworkInfo>,
    ) -> SyncResult<Self> {
        let state = Self::load(&config.storage_key, store.as_ref())?;
        let resolver = ConflictResolver::new(config.ignored_conflict_fields.iter().cloned());
        let (process_tx, process_rx) = mpsc::channel(1);

        Ok(Self {
            config,
            store,
            api,
            resolver,
            network,
            state: Mutex::new(state),
            processing: AtomicBool::new(false),
            completed_passes: AtomicU64::new(0),
            process_tx,
            process_rx: Mutex::new(Some(process_rx)),
        })
    }

    fn load(key: &str, store: &dyn KeyValueStore) -> SyncResult<SyncState> {
        let Some(raw) = store.get(key)? else {
            return Ok(SyncState::default());
        };
        let mut state: SyncState = serde_json::from_str(&raw)?;

        let paused: HashSet<String> = state
            .conflicts
            .iter()
            .filter(|c| !c.resolved)
            .map(|c| c.item_id.clone())
            .collect();
        let mut recovered = 0;
        for item in state.items.iter_mut() {
            if item.sync_status == SyncStatus::Syncing {
                item.sync_status = if paused.contains(&item.id) {
                    SyncStatus::Conflict
                } else {
                    SyncStatus::Pending
                };
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(count = recovered, "Recovered in-flight sync items");
        }
        debug!(
            items = state.items.len(),
            conflicts = state.conflicts.len(),
            "Loaded sync queue"
        );
        Ok(state)
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the queue document. Failures are logged, never propagated.
    fn persist(&self, state: &SyncState) {
        let result = serde_json::to_string(state)
            .map_err(SyncError::from)
            .and_then(|json| {
                self.store
                    .set(&self.config.storage_key, &json)
                    .map_err(SyncError::from)
            });
        if let Err(e) = result {
            warn!(error = %e, key = %self.config.storage_key, "Failed to persist sync queue");
        }
    }

    fn is_online(&self) -> bool {
        self.network.borrow().status.is_reachable()
    }

    /// Append a mutation and persist it.
    ///
    /// Creates and updates must carry the resource's required fields;
    /// deletes only need the record `id`.
    pub fn add_item(
        &self,
        id: &str,
        resource_type: ResourceType,
        payload: Record,
        operation: SyncOperation,
    ) -> SyncResult<SyncItem> {
        if id.trim().is_empty() {
            return Err(SyncError::Invalid("item id is empty".to_string()));
        }
        let valid = match operation {
            SyncOperation::Delete => resource_type.record_id(&payload).map(|_| ()),
            SyncOperation::Create | SyncOperation::Update => resource_type.validate_record(&payload),
        };
        valid.map_err(|e| SyncError::Invalid(e.to_string()))?;

        let item = SyncItem {
            id: id.to_string(),
            resource_type,
            payload,
            operation,
            created_at: Utc::now(),
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            last_error: None,
        };

        {
            let mut state = self.lock();
            if state.items.iter().any(|existing| existing.id == item.id) {
                return Err(SyncError::Invalid(format!("duplicate item id {}", item.id)));
            }
            state.items.push(item.clone());
            self.persist(&state);
        }

        debug!(
            item_id = %item.id,
            resource = %item.resource_type,
            operation = %item.operation,
            "Added sync item"
        );
        if self.is_online() {
            self.request_process();
        }
        Ok(item)
    }

    /// Ask the background loop for a processing pass. Requests made while
    /// one is already pending are merged.
    pub fn request_process(&self) {
        let _ = self.process_tx.try_send(());
    }

    async fn apply(
        &self,
        resource_type: ResourceType,
        operation: SyncOperation,
        payload: &Record,
    ) -> BridgeResult<()> {
        match operation {
            SyncOperation::Create => {
                self.api.create(resource_type, payload).await?;
            }
            SyncOperation::Update => {
                let id = resource_type.record_id(payload)?;
                self.api.update(resource_type, id, payload).await?;
            }
            SyncOperation::Delete => {
                let id = resource_type.record_id(payload)?;
                match self.api.delete(resource_type, id).await {
                    Ok(()) | Err(BridgeError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Apply one item and classify the result.
    async fn attempt(&self, item: &SyncItem) -> ApplyResult {
        let error = match self
            .apply(item.resource_type, item.operation, &item.payload)
            .await
        {
            Ok(()) => return ApplyResult::Applied,
            Err(e) => e,
        };

        if !error.is_conflict() {
            return if error.is_retryable() {
                ApplyResult::Retry(error.to_string())
            } else {
                ApplyResult::Rejected(error.to_string())
            };
        }

        let Some(record_id) = item.record_id() else {
            return ApplyResult::Rejected(error.to_string());
        };
        match self.api.get(item.resource_type, record_id).await {
            Ok(Some(remote)) if self.resolver.diff(&item.payload, &remote).is_empty() => {
                info!(
                    item_id = %item.id,
                    resource = %item.resource_type,
                    "Remote copy already matches, nothing to apply"
                );
                ApplyResult::Applied
            }
            Ok(remote) => ApplyResult::Conflict(self.resolver.detect(item, remote)),
            Err(fetch_error) => {
                warn!(
                    item_id = %item.id,
                    error = %fetch_error,
                    "Failed to fetch remote copy for conflict"
                );
                ApplyResult::Retry(fetch_error.to_string())
            }
        }
    }

    /// Apply every pending item once, oldest first.
    ///
    /// An item waits while an earlier item for the same record is failed,
    /// paused on a conflict, or did not apply during this pass. Returns
    /// immediately when offline or when another pass is running.
    pub async fn process_queue(&self) -> ProcessOutcome {
        if !self.is_online() {
            debug!("Sync pass skipped, network offline");
            return ProcessOutcome::Skipped(SkipReason::Offline);
        }
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync pass skipped, pass already running");
            return ProcessOutcome::Skipped(SkipReason::AlreadyProcessing);
        }
        let _guard = ProcessGuard(&self.processing);

        let mut report = ProcessReport::default();
        let mut blocked: HashSet<RecordKey> = HashSet::new();
        let candidates: Vec<String> = self.lock().items.iter().map(|item| item.id.clone()).collect();

        for id in candidates {
            if !self.is_online() {
                report.interrupted = true;
                info!("Network went offline, stopping sync pass");
                break;
            }

            let item = {
                let mut state = self.lock();
                let Some(item) = state.item_mut(&id) else {
                    continue;
                };
                let key = record_key(item);
                if item.sync_status != SyncStatus::Pending {
                    blocked.insert(key);
                    continue;
                }
                if blocked.contains(&key) {
                    report.deferred += 1;
                    continue;
                }
                item.sync_status = SyncStatus::Syncing;
                let snapshot = item.clone();
                self.persist(&state);
                snapshot
            };

            let result = self.attempt(&item).await;
            if !matches!(result, ApplyResult::Applied) {
                blocked.insert(record_key(&item));
            }

            let mut state = self.lock();
            match result {
                ApplyResult::Applied => {
                    state.items.retain(|existing| existing.id != id);
                    report.applied += 1;
                    debug!(item_id = %id, resource = %item.resource_type, "Sync item applied");
                }
                ApplyResult::Conflict(conflict) => {
                    if let Some(entry) = state.item_mut(&id) {
                        entry.sync_status = SyncStatus::Conflict;
                        entry.last_error = Some("remote copy diverged".to_string());
                    }
                    warn!(
                        item_id = %id,
                        conflict_id = %conflict.id,
                        resource = %conflict.resource_type,
                        fields = ?conflict.conflict_fields,
                        "Sync conflict detected"
                    );
                    state.conflicts.push(conflict);
                    report.conflicts += 1;
                }
                ApplyResult::Retry(error) => {
                    let max_retries = self.config.max_retries;
                    if let Some(entry) = state.item_mut(&id) {
                        entry.retry_count += 1;
                        entry.last_error = Some(error.clone());
                        if entry.retry_count >= max_retries {
                            entry.sync_status = SyncStatus::Failed;
                            report.failed += 1;
                            warn!(item_id = %id, attempts = entry.retry_count, error = %error, "Sync item failed permanently");
                        } else {
                            entry.sync_status = SyncStatus::Pending;
                            report.retried += 1;
                            debug!(item_id = %id, attempt = entry.retry_count, error = %error, "Sync item will retry");
                        }
                    }
                }
                ApplyResult::Rejected(error) => {
                    if let Some(entry) = state.item_mut(&id) {
                        entry.sync_status = SyncStatus::Failed;
                        entry.last_error = Some(error.clone());
                    }
                    report.failed += 1;
                    warn!(item_id = %id, error = %error, "Sync item rejected");
                }
            }
            self.persist(&state);
        }

        self.completed_passes.fetch_add(1, Ordering::SeqCst);
        if report != ProcessReport::default() {
            info!(
                applied = report.applied,
                conflicts = report.conflicts,
                retried = report.retried,
                failed = report.failed,
                deferred = report.deferred,
                "Sync pass complete"
            );
        }
        ProcessOutcome::Completed(report)
    }

    /// Resolve a conflict and re-apply the chosen payload remotely.
    ///
    /// On success the conflict is marked resolved, its item removed, and the
    /// converged payload returned. `None` means the record converged to
    /// deleted: a remote resolution of a remotely deleted record applies
    /// nothing. On failure the conflict stays open.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        merged: Option<Record>,
    ) -> SyncResult<Option<Record>> {
        let (conflict, item, payload, operation) = {
            let mut state = self.lock();
            let conflict = state
                .conflicts
                .iter()
                .find(|c| c.id == conflict_id)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id)))?;
            if conflict.resolved {
                return Err(SyncError::AlreadyResolved(conflict.id));
            }
            let item = state
                .item_mut(&conflict.item_id)
                .ok_or_else(|| SyncError::NotFound(format!("sync item {}", conflict.item_id)))?;
            if item.sync_status != SyncStatus::Conflict {
                return Err(SyncError::Invalid(format!(
                    "sync item {} is not awaiting resolution",
                    item.id
                )));
            }

            let payload = ConflictResolver::select_payload(&conflict, resolution, merged)?;
            let operation = match (&payload, item.operation, resolution) {
                (None, _, _) => None,
                (Some(_), SyncOperation::Delete, Resolution::Local) => Some(SyncOperation::Delete),
                (Some(_), _, _) if conflict.remote_deleted() => Some(SyncOperation::Create),
                (Some(_), _, _) => Some(SyncOperation::Update),
            };
            if let (Some(record), Some(SyncOperation::Create | SyncOperation::Update)) =
                (&payload, operation)
            {
                conflict
                    .resource_type
                    .validate_record(record)
                    .map_err(|e| SyncError::Invalid(e.to_string()))?;
            }

            // Claim the item before releasing the lock.
            item.sync_status = SyncStatus::Syncing;
            let item = item.clone();
            self.persist(&state);
            (conflict, item, payload, operation)
        };

        info!(
            conflict_id = %conflict.id,
            item_id = %item.id,
            resolution = %resolution,
            remote_deleted = conflict.remote_deleted(),
            "Applying conflict resolution"
        );
        let applied = match (operation, &payload) {
            (Some(operation), Some(record)) => {
                self.apply(conflict.resource_type, operation, record).await
            }
            _ => Ok(()),
        };

        let mut state = self.lock();
        match applied {
            Ok(()) => {
                if let Some(entry) = state.conflict_mut(conflict_id) {
                    if !entry.resolved {
                        entry.resolved = true;
                        entry.resolved_at = Some(Utc::now());
                        entry.resolution = Some(resolution);
                        entry.resolved_payload = payload.clone();
                    }
                }
                state.items.retain(|existing| existing.id != item.id);
                self.persist(&state);
                info!(conflict_id = %conflict_id, "Conflict resolved");
                Ok(payload)
            }
            Err(e) => {
                if let Some(entry) = state.item_mut(&item.id) {
                    entry.sync_status = SyncStatus::Conflict;
                    entry.last_error = Some(e.to_string());
                }
                self.persist(&state);
                warn!(conflict_id = %conflict_id, error = %e, "Conflict resolution failed to apply");
                Err(e.into())
            }
        }
    }

    /// Reset failed items to pending with a fresh retry budget.
    pub fn retry_failed_items(&self) -> usize {
        let count = {
            let mut state = self.lock();
            let mut count = 0;
            for item in state.items.iter_mut() {
                if item.sync_status == SyncStatus::Failed {
                    item.sync_status = SyncStatus::Pending;
                    item.retry_count = 0;
                    item.last_error = None;
                    count += 1;
                }
            }
            if count > 0 {
                self.persist(&state);
            }
            count
        };
        if count > 0 {
            info!(count, "Failed sync items reset for retry");
            if self.is_online() {
                self.request_process();
            }
        }
        count
    }

    /// Drop every failed item.
    pub fn clear_failed(&self) -> usize {
        let mut state = self.lock();
        let before = state.items.len();
        state
            .items
            .retain(|item| item.sync_status != SyncStatus::Failed);
        let removed = before - state.items.len();
        if removed > 0 {
            self.persist(&state);
        }
        removed
    }

    /// Drop resolved conflict records.
    pub fn clear_resolved_conflicts(&self) -> usize {
        let mut state = self.lock();
        let before = state.conflicts.len();
        state.conflicts.retain(|conflict| !conflict.resolved);
        let removed = before - state.conflicts.len();
        if removed > 0 {
            self.persist(&state);
        }
        removed
    }

    /// Remove an item. An open conflict on it stays visible but can no
    /// longer be resolved.
    pub fn remove_item(&self, id: &str) -> bool {
        let mut state = self.lock();
        let before = state.items.len();
        state.items.retain(|item| item.id != id);
        let removed = state.items.len() != before;
        if removed {
            self.persist(&state);
        }
        removed
    }

    pub fn item(&self, id: &str) -> Option<SyncItem> {
        self.lock().items.iter().find(|item| item.id == id).cloned()
    }

    pub fn items(&self) -> Vec<SyncItem> {
        self.lock().items.clone()
    }

    pub fn conflict(&self, id: &str) -> Option<SyncConflict> {
        self.lock().conflicts.iter().find(|c| c.id == id).cloned()
    }

    pub fn conflicts(&self) -> Vec<SyncConflict> {
        self.lock().conflicts.clone()
    }

    pub fn unresolved_conflicts(&self) -> Vec<SyncConflict> {
        self.lock()
            .conflicts
            .iter()
            .filter(|c| !c.resolved)
            .cloned()
            .collect()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SyncStats {
        let state = self.lock();
        let mut stats = SyncStats {
            total: state.items.len(),
            unresolved_conflicts: state.conflicts.iter().filter(|c| !c.resolved).count(),
            completed_passes: self.completed_passes.load(Ordering::SeqCst),
            is_processing: self.is_processing(),
            ..Default::default()
        };
        for item in &state.items {
            match item.sync_status {
                SyncStatus::Pending => stats.pending += 1,
                SyncStatus::Syncing => stats.syncing += 1,
                SyncStatus::Failed => stats.failed += 1,
                SyncStatus::Conflict => stats.conflict += 1,
                SyncStatus::Synced => {}
            }
        }
        stats
    }

    /// Spawn the processing loop. Processes on request and every
    /// `process_interval` until `shutdown` fires.
    pub fn run(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> SyncResult<JoinHandle<()>> {
        let mut trigger = self
            .process_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SyncError::AlreadyStarted)?;

        let queue = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let period = queue.config.process_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "Sync queue loop started");

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    Some(()) = trigger.recv() => {
                        queue.process_queue().await;
                    }
                    _ = ticker.tick() => {
                        queue.process_queue().await;
                    }
                }
            }

            info!("Sync queue loop stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use network_monitor::NetworkStatus;
    use platform_bridge::{MemoryStore, SqliteStore};
    use serde_json::{json, Value};
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::Notify;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn patient(id: &str, name: &str) -> Record {
        record(json!({"id": id, "name": name, "phone": "555-0100"}))
    }

    fn network(status: NetworkStatus) -> (watch::Sender<NetworkInfo>, watch::Receiver<NetworkInfo>) {
        let mut info = NetworkInfo::unknown();
        info.status = status;
        watch::channel(info)
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Create(String),
        Update(String, Record),
        Delete(String),
        Get(String),
    }

    /// In-memory remote with scripted failures.
    #[derive(Default)]
    struct ScriptedApi {
        remote: Mutex<HashMap<String, Record>>,
        calls: Mutex<Vec<Call>>,
        conflicting: Mutex<HashSet<String>>,
        failures: Mutex<VecDeque<BridgeError>>,
        gate: Mutex<Option<Arc<(Notify, Notify)>>>,
    }

    impl ScriptedApi {
        fn with_remote(records: Vec<Record>) -> Self {
            let api = Self::default();
            for r in records {
                let id = r["id"].as_str().unwrap().to_string();
                api.remote.lock().unwrap().insert(id, r);
            }
            api
        }

        fn conflict_on(&self, id: &str) {
            self.conflicting.lock().unwrap().insert(id.to_string());
        }

        fn fail_next(&self, error: BridgeError) {
            self.failures.lock().unwrap().push_back(error);
        }

        /// Hold every later call until the test releases it.
        fn hold_calls(&self) -> Arc<(Notify, Notify)> {
            let gate = Arc::new((Notify::new(), Notify::new()));
            *self.gate.lock().unwrap() = Some(gate.clone());
            gate
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        async fn enter(&self, id: &str) -> BridgeResult<()> {
            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.0.notify_one();
                gate.1.notified().await;
            }
            if let Some(error) = self.failures.lock().unwrap().pop_front() {
                return Err(error);
            }
            if self.conflicting.lock().unwrap().remove(id) {
                return Err(BridgeError::Conflict {
                    resource: "patient".to_string(),
                    id: id.to_string(),
                    message: "version mismatch".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ResourceApi for ScriptedApi {
        async fn create(&self, resource: ResourceType, record: &Record) -> BridgeResult<Record> {
            let id = resource.record_id(record)?.to_string();
            self.calls.lock().unwrap().push(Call::Create(id.clone()));
            self.enter(&id).await?;
            self.remote.lock().unwrap().insert(id, record.clone());
            Ok(record.clone())
        }

        async fn update(&self, _resource: ResourceType, id: &str, record: &Record) -> BridgeResult<Record> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Update(id.to_string(), record.clone()));
            self.enter(id).await?;
            self.remote.lock().unwrap().insert(id.to_string(), record.clone());
            Ok(record.clone())
        }

        async fn delete(&self, resource: ResourceType, id: &str) -> BridgeResult<()> {
            self.calls.lock().unwrap().push(Call::Delete(id.to_string()));
            self.enter(id).await?;
            match self.remote.lock().unwrap().remove(id) {
                Some(_) => Ok(()),
                None => Err(BridgeError::NotFound {
                    resource: resource.to_string(),
                    id: id.to_string(),
                }),
            }
        }

        async fn get(&self, _resource: ResourceType, id: &str) -> BridgeResult<Option<Record>> {
            self.calls.lock().unwrap().push(Call::Get(id.to_string()));
            Ok(self.remote.lock().unwrap().get(id).cloned())
        }
    }

    fn queue_with(
        api: Arc<ScriptedApi>,
        store: Arc<dyn KeyValueStore>,
        rx: watch::Receiver<NetworkInfo>,
    ) -> SyncQueue {
        SyncQueue::new(SyncQueueConfig::default(), store, api, rx).unwrap()
    }

    fn completed(outcome: ProcessOutcome) -> ProcessReport {
        match outcome {
            ProcessOutcome::Completed(report) => report,
            other => panic!("expected completed pass, got {other:?}"),
        }
    }

    fn transient() -> BridgeError {
        BridgeError::Transport("connection reset".to_string())
    }

    #[tokio::test]
    async fn applies_items_in_fifo_order_and_removes_them() {
        let (_tx, rx) = network(NetworkStatus::Online);
        let api = Arc::new(ScriptedApi::with_remote(vec![patient("p-2", "Old")]));
        let queue = queue_with(api.clone(), Arc::new(MemoryStore::new()), rx);

        queue.add_item("i-1", ResourceType::Patient, patient("p-1", "A"), SyncOperation::Create).unwrap();
        queue.add_item("i-2", ResourceType::Patient, patient("p-2", "B"), SyncOperation::Update).unwrap();
        queue
            .add_item("i-3", ResourceType::Patient, record(json!({"id": "p-2"})), SyncOperation::Delete)
            .unwrap();

        let report = completed(queue.process_queue().await);
        assert_eq!(report.applied, 3);
        assert_eq!(
            api.calls(),
            vec![
                Call::Create("p-1".to_string()),
                Call::Update("p-2".to_string(), patient("p-2", "B")),
                Call::Delete("p-2".to_string()),
            ]
        );
        assert!(queue.items().is_empty());
        assert_eq!(queue.stats().completed_passes, 1);
    }

    #[tokio::test]
    async fn conflict_pauses_item_and_remote_resolution_adopts_remote_copy() {
        let (_tx, rx) = network(NetworkStatus::Online);
        let remote = record(json!({"id": "p-1", "name": "Remote", "phone": "555-0100", "updated_at": "t2"}));
        let api = Arc::new(ScriptedApi::with_remote(vec![remote.clone()]));
        api.conflict_on("p-1");
        let queue = queue_with(api.clone(), Arc::new(MemoryStore::new()), rx);

        let local = record(json!({"id": "p-1", "name": "Local", "phone": "555-0100", "updated_at": "t1"}));
        queue.add_item("i-1", ResourceType::Patient, local.clone(), SyncOperation::Update).unwrap();

        let report = completed(queue.process_queue().await);
        assert_eq!(report.conflicts, 1);
        assert_eq!(queue.item("i-1").unwrap().sync_status, SyncStatus::Conflict);

        let conflicts = queue.unresolved_conflicts();
        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0];
        assert_eq!(conflict.item_id, "i-1");
        assert_eq!(conflict.local_payload, local);
        assert_eq!(conflict.remote_payload.as_ref(), Some(&remote));
        assert_eq!(conflict.conflict_fields.iter().collect::<Vec<_>>(), vec!["name"]);

        // Paused: further passes do not touch the item.
        let calls_before = api.calls().len();
        completed(queue.process_queue().await);
        assert_eq!(api.calls().len(), calls_before);

        let converged = queue
            .resolve_conflict(&conflict.id, Resolution::Remote, None)
            .await
            .unwrap();
        assert_eq!(converged.as_ref(), Some(&remote));
        assert_eq!(
            serde_json::to_string(&converged).unwrap(),
            serde_json::to_string(&remote).unwrap()
        );

        let resolved = queue.conflict(&conflict.id).unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolution, Some(Resolution::Remote));
        assert_eq!(resolved.resolved_payload.as_ref(), Some(&remote));
        assert!(queue.item("i-1").is_none());
        assert!(queue.unresolved_conflicts().is_empty());
        assert_eq!(api.calls().last(), Some(&Call::Update("p-1".to_string(), remote)));

        assert!(matches!(
            queue.resolve_conflict(&conflict.id, Resolution::Local, None).await,
            Err(SyncError::AlreadyResolved(_))
        ));
    }

    #[tokio::test]
    async fn merge_resolution_requires_payload() {
        let (_tx, rx) = network(NetworkStatus::Online);
        let api = Arc::new(ScriptedApi::with_remote(vec![patient("p-1", "Remote")]));
        api.conflict_on("p-1");
        let queue = queue_with(api.clone(), Arc::new(MemoryStore::new()), rx);
        queue.add_item("i-1", ResourceType::Patient, patient("p-1", "Local"), SyncOperation::Update).unwrap();
        completed(queue.process_queue().await);
        let conflict_id = queue.unresolved_conflicts()[0].id.clone();

        assert!(matches!(
            queue.resolve_conflict(&conflict_id, Resolution::Merge, None).await,
            Err(SyncError::MissingMergedPayload)
        ));
        assert!(!queue.conflict(&conflict_id).unwrap().resolved);

        let merged = patient("p-1", "Local Remote");
        let result = queue
            .resolve_conflict(&conflict_id, Resolution::Merge, Some(merged.clone()))
            .await
            .unwrap();
        assert_eq!(result, Some(merged.clone()));
        assert_eq!(api.remote.lock().unwrap().get("p-1"), Some(&merged));
    }

    #[tokio::test]
    async fn failed_resolution_keeps_conflict_open() {
        let (_tx, rx) = network(NetworkStatus::Online);
        let api = Arc::new(ScriptedApi::with_remote(vec![patient("p-1", "Remote")]));
        api.conflict_on("p-1");
        let queue = queue_with(api.clone(), Arc::new(MemoryStore::new()), rx);
        queue.add_item("i-1", ResourceType::Patient, patient("p-1", "Local"), SyncOperation::Update).unwrap();
        completed(queue.process_queue().await);
        let conflict_id = queue.unresolved_conflicts()[0].id.clone();

        api.fail_next(transient());
        assert!(queue.resolve_conflict(&conflict_id, Resolution::Local, None).await.is_err());
        assert!(!queue.conflict(&conflict_id).unwrap().resolved);
        assert_eq!(queue.item("i-1").unwrap().sync_status, SyncStatus::Conflict);

        queue.resolve_conflict(&conflict_id, Resolution::Local, None).await.unwrap();
        assert_eq!(api.remote.lock().unwrap().get("p-1"), Some(&patient("p-1", "Local")));
    }

    #[tokio::test]
    async fn later_item_waits_for_earlier_item_on_same_record() {
        let (_tx, rx) = network(NetworkStatus::Online);
        let api = Arc::new(ScriptedApi::with_remote(vec![patient("p-1", "Old"), patient("p-2", "Old")]));
        let queue = queue_with(api.clone(), Arc::new(MemoryStore::new()), rx);

        queue.add_item("i-1", ResourceType::Patient, patient("p-1", "New"), SyncOperation::Update).unwrap();
        queue
            .add_item("i-2", ResourceType::Patient, record(json!({"id": "p-1"})), SyncOperation::Delete)
            .unwrap();
        queue.add_item("i-3", ResourceType::Patient, patient("p-2", "New"), SyncOperation::Update).unwrap();

        api.fail_next(transient());
        let report = completed(queue.process_queue().await);
        assert_eq!(report.retried, 1);
        assert_eq!(report.deferred, 1);
        // Other records are not held back.
        assert_eq!(report.applied, 1);
        assert_eq!(queue.item("i-2").unwrap().sync_status, SyncStatus::Pending);
        assert_eq!(queue.item("i-2").unwrap().retry_count, 0);
        assert!(!api.calls().contains(&Call::Delete("p-1".to_string())));

        let report = completed(queue.process_queue().await);
        assert_eq!(report.applied, 2);
        assert_eq!(report.deferred, 0);
        assert!(queue.items().is_empty());
        assert!(api.remote.lock().unwrap().get("p-1").is_none());
        assert_eq!(
            api.calls(),
            vec![
                Call::Update("p-1".to_string(), patient("p-1", "New")),
                Call::Update("p-2".to_string(), patient("p-2", "New")),
                Call::Update("p-1".to_string(), patient("p-1", "New")),
                Call::Delete("p-1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn item_behind_a_conflict_waits_for_resolution() {
        let (_tx, rx) = network(NetworkStatus::Online);
        let api = Arc::new(ScriptedApi::with_remote(vec![patient("p-1", "Remote")]));
        api.conflict_on("p-1");
        let queue = queue_with(api.clone(), Arc::new(MemoryStore::new()), rx);

        queue.add_item("i-1", ResourceType::Patient, patient("p-1", "Local"), SyncOperation::Update).unwrap();
        queue.add_item("i-2", ResourceType::Patient, patient("p-1", "Later"), SyncOperation::Update).unwrap();

        let report = completed(queue.process_queue().await);
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(completed(queue.process_queue().await).deferred, 1);

        let conflict_id = queue.unresolved_conflicts()[0].id.clone();
        queue.resolve_conflict(&conflict_id, Resolution::Local, None).await.unwrap();
        let report = completed(queue.process_queue().await);
        assert_eq!(report.applied, 1);
        assert_eq!(api.remote.lock().unwrap().get("p-1"), Some(&patient("p-1", "Later")));
    }

    #[tokio::test]
    async fn remotely_deleted_record_resolves_without_resurrection() {
        let (_tx, rx) = network(NetworkStatus::Online);
        let api = Arc::new(ScriptedApi::default());
        api.conflict_on("p-1");
        api.conflict_on("p-2");
        let queue = queue_with(api.clone(), Arc::new(MemoryStore::new()), rx);
        queue.add_item("i-1", ResourceType::Patient, patient("p-1", "Local"), SyncOperation::Update).unwrap();
        queue.add_item("i-2", ResourceType::Patient, patient("p-2", "Keep"), SyncOperation::Update).unwrap();

        assert_eq!(completed(queue.process_queue().await).conflicts, 2);
        let conflicts = queue.unresolved_conflicts();
        assert!(conflicts.iter().all(|c| c.remote_deleted()));
        let first = conflicts.iter().find(|c| c.item_id == "i-1").unwrap();
        assert_eq!(
            first.conflict_fields.iter().collect::<Vec<_>>(),
            vec!["id", "name", "phone"]
        );

        let calls_before = api.calls().len();
        let converged = queue.resolve_conflict(&first.id, Resolution::Remote, None).await.unwrap();
        assert_eq!(converged, None);
        assert_eq!(api.calls().len(), calls_before);
        let resolved = queue.conflict(&first.id).unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolution, Some(Resolution::Remote));
        assert_eq!(resolved.resolved_payload, None);
        assert!(queue.item("i-1").is_none());
        assert!(api.remote.lock().unwrap().get("p-1").is_none());

        // Keeping the local copy recreates the record.
        let second = conflicts.iter().find(|c| c.item_id == "i-2").unwrap();
        let kept = queue.resolve_conflict(&second.id, Resolution::Local, None).await.unwrap();
        assert_eq!(kept, Some(patient("p-2", "Keep")));
        assert_eq!(api.calls().last(), Some(&Call::Create("p-2".to_string())));
        assert_eq!(api.remote.lock().unwrap().get("p-2"), Some(&patient("p-2", "Keep")));
    }

    #[tokio::test]
    async fn concurrent_resolutions_apply_only_once() {
        let (_tx, rx) = network(NetworkStatus::Online);
        let api = Arc::new(ScriptedApi::with_remote(vec![patient("p-1", "Remote")]));
        api.conflict_on("p-1");
        let queue = Arc::new(queue_with(api.clone(), Arc::new(MemoryStore::new()), rx));
        queue.add_item("i-1", ResourceType::Patient, patient("p-1", "Local"), SyncOperation::Update).unwrap();
        completed(queue.process_queue().await);
        let conflict_id = queue.unresolved_conflicts()[0].id.clone();

        let gate = api.hold_calls();
        let first = {
            let queue = queue.clone();
            let conflict_id = conflict_id.clone();
            tokio::spawn(async move { queue.resolve_conflict(&conflict_id, Resolution::Local, None).await })
        };
        gate.0.notified().await;

        assert!(matches!(
            queue.resolve_conflict(&conflict_id, Resolution::Remote, None).await,
            Err(SyncError::Invalid(_))
        ));
        gate.1.notify_one();

        assert_eq!(first.await.unwrap().unwrap(), Some(patient("p-1", "Local")));
        let resolved = queue.conflict(&conflict_id).unwrap();
        assert_eq!(resolved.resolution, Some(Resolution::Local));
        assert_eq!(resolved.resolved_payload, Some(patient("p-1", "Local")));
        assert_eq!(api.remote.lock().unwrap().get("p-1"), Some(&patient("p-1", "Local")));
        let updates = api.calls().iter().filter(|c| matches!(c, Call::Update(..))).count();
        assert_eq!(updates, 2);
    }

    #[tokio::test]
    async fn divergence_only_in_ignored_fields_counts_as_applied() {
        let (_tx, rx) = network(NetworkStatus::Online);
        let remote = record(json!({"id": "p-1", "name": "A", "phone": "555-0100", "updated_at": "t2"}));
        let api = Arc::new(ScriptedApi::with_remote(vec![remote.clone()]));
        api.conflict_on("p-1");
        let queue = queue_with(api.clone(), Arc::new(MemoryStore::new()), rx);
        let local = record(json!({"id": "p-1", "name": "A", "phone": "555-0100", "updated_at": "t1"}));
        queue.add_item("i-1", ResourceType::Patient, local.clone(), SyncOperation::Update).unwrap();

        let report = completed(queue.process_queue().await);
        assert_eq!(report.applied, 1);
        assert_eq!(report.conflicts, 0);
        assert!(queue.items().is_empty());
        assert!(queue.conflicts().is_empty());
        assert_eq!(
            api.calls(),
            vec![Call::Update("p-1".to_string(), local), Call::Get("p-1".to_string())]
        );
    }

    #[tokio::test]
    async fn transient_failures_are_bounded_and_retained() {
        let (_tx, rx) = network(NetworkStatus::Online);
        let api = Arc::new(ScriptedApi::default());
        let config = SyncQueueConfig {
            max_retries: 2,
            ..Default::default()
        };
        let queue = SyncQueue::new(config, Arc::new(MemoryStore::new()), api.clone(), rx).unwrap();
        queue.add_item("i-1", ResourceType::Patient, patient("p-1", "A"), SyncOperation::Create).unwrap();

        api.fail_next(transient());
        let report = completed(queue.process_queue().await);
        assert_eq!(report.retried, 1);
        assert_eq!(queue.item("i-1").unwrap().retry_count, 1);

        api.fail_next(transient());
        let report = completed(queue.process_queue().await);
        assert_eq!(report.failed, 1);
        let failed = queue.item("i-1").unwrap();
        assert_eq!(failed.sync_status, SyncStatus::Failed);
        assert_eq!(failed.retry_count, 2);
        assert_eq!(failed.last_error.as_deref(), Some("Transport error: connection reset"));

        completed(queue.process_queue().await);
        assert_eq!(api.calls().len(), 2);
        assert_eq!(queue.stats().failed, 1);

        assert_eq!(queue.retry_failed_items(), 1);
        let report = completed(queue.process_queue().await);
        assert_eq!(report.applied, 1);
        assert!(queue.items().is_empty());
    }

    #[tokio::test]
    async fn permanent_rejection_fails_immediately_and_can_be_cleared() {
        let (_tx, rx) = network(NetworkStatus::Online);
        let api = Arc::new(ScriptedApi::default());
        let queue = queue_with(api.clone(), Arc::new(MemoryStore::new()), rx);
        queue.add_item("i-1", ResourceType::Patient, patient("p-1", "A"), SyncOperation::Create).unwrap();

        api.fail_next(BridgeError::Status {
            status: 422,
            message: "phone invalid".to_string(),
        });
        let report = completed(queue.process_queue().await);
        assert_eq!(report.failed, 1);
        assert_eq!(queue.item("i-1").unwrap().retry_count, 0);

        assert_eq!(queue.clear_failed(), 1);
        assert!(queue.items().is_empty());
    }

    #[tokio::test]
    async fn delete_of_missing_record_counts_as_applied() {
        let (_tx, rx) = network(NetworkStatus::Online);
        let api = Arc::new(ScriptedApi::default());
        let queue = queue_with(api, Arc::new(MemoryStore::new()), rx);
        queue
            .add_item("i-1", ResourceType::Consultation, record(json!({"id": "c-1"})), SyncOperation::Delete)
            .unwrap();

        let report = completed(queue.process_queue().await);
        assert_eq!(report.applied, 1);
        assert!(queue.items().is_empty());
    }

    #[tokio::test]
    async fn offline_and_concurrent_passes_are_skipped() {
        let (tx, rx) = network(NetworkStatus::Offline);
        let api = Arc::new(ScriptedApi::default());
        let gate = api.hold_calls();
        let queue = Arc::new(queue_with(api.clone(), Arc::new(MemoryStore::new()), rx));
        queue.add_item("i-1", ResourceType::Patient, patient("p-1", "A"), SyncOperation::Create).unwrap();

        assert_eq!(queue.process_queue().await, ProcessOutcome::Skipped(SkipReason::Offline));

        tx.send_modify(|info| info.status = NetworkStatus::Online);
        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.process_queue().await })
        };
        gate.0.notified().await;
        assert_eq!(
            queue.process_queue().await,
            ProcessOutcome::Skipped(SkipReason::AlreadyProcessing)
        );
        gate.1.notify_one();

        assert_eq!(completed(first.await.unwrap()).applied, 1);
        assert_eq!(api.calls().len(), 1);
        assert_eq!(queue.stats().completed_passes, 1);
    }

    #[test]
    fn add_item_validates_payloads() {
        let (_tx, rx) = network(NetworkStatus::Offline);
        let queue = queue_with(Arc::new(ScriptedApi::default()), Arc::new(MemoryStore::new()), rx);

        let missing_phone = record(json!({"id": "p-1", "name": "A"}));
        assert!(matches!(
            queue.add_item("i-1", ResourceType::Patient, missing_phone, SyncOperation::Create),
            Err(SyncError::Invalid(_))
        ));
        assert!(matches!(
            queue.add_item("i-1", ResourceType::Patient, record(json!({"name": "A"})), SyncOperation::Delete),
            Err(SyncError::Invalid(_))
        ));

        queue
            .add_item("i-1", ResourceType::Patient, record(json!({"id": "p-1"})), SyncOperation::Delete)
            .unwrap();
        assert!(matches!(
            queue.add_item("i-1", ResourceType::Patient, patient("p-1", "A"), SyncOperation::Update),
            Err(SyncError::Invalid(_))
        ));
        assert_eq!(queue.stats().pending, 1);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> =
            Arc::new(SqliteStore::open(&dir.path().join("store.sqlite")).unwrap());
        let (_tx, rx) = network(NetworkStatus::Online);

        let api = Arc::new(ScriptedApi::with_remote(vec![patient("p-1", "Remote")]));
        api.conflict_on("p-1");
        let queue = queue_with(api.clone(), store.clone(), rx.clone());
        queue.add_item("i-1", ResourceType::Patient, patient("p-1", "Local"), SyncOperation::Update).unwrap();
        completed(queue.process_queue().await);

        let (_offline_tx, offline_rx) = network(NetworkStatus::Offline);
        let restarted = queue_with(api, store, offline_rx);

        assert_eq!(restarted.items().len(), 1);
        assert_eq!(restarted.item("i-1").unwrap().sync_status, SyncStatus::Conflict);
        assert_eq!(restarted.unresolved_conflicts().len(), 1);
        assert_eq!(
            restarted.unresolved_conflicts()[0].conflict_fields.iter().collect::<Vec<_>>(),
            vec!["name"]
        );
    }

    #[tokio::test]
    async fn syncing_items_recover_on_load() {
        let store = Arc::new(MemoryStore::new());
        let item = SyncItem {
            id: "i-1".to_string(),
            resource_type: ResourceType::Patient,
            payload: patient("p-1", "A"),
            operation: SyncOperation::Create,
            created_at: Utc::now(),
            sync_status: SyncStatus::Syncing,
            retry_count: 1,
            last_error: None,
        };
        let document = json!({"items": [item], "conflicts": []});
        store.set("sync_queue", &document.to_string()).unwrap();

        let (_tx, rx) = network(NetworkStatus::Offline);
        let queue = queue_with(Arc::new(ScriptedApi::default()), store, rx);
        let recovered = queue.item("i-1").unwrap();
        assert_eq!(recovered.sync_status, SyncStatus::Pending);
        assert_eq!(recovered.retry_count, 1);
    }

    #[tokio::test]
    async fn run_loop_processes_on_request() {
        let (_tx, rx) = network(NetworkStatus::Online);
        let api = Arc::new(ScriptedApi::default());
        let config = SyncQueueConfig {
            process_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let queue = Arc::new(SyncQueue::new(config, Arc::new(MemoryStore::new()), api.clone(), rx).unwrap());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = queue.run(shutdown_rx).unwrap();
        assert!(matches!(queue.run(shutdown_tx.subscribe()), Err(SyncError::AlreadyStarted)));

        queue.add_item("i-1", ResourceType::Patient, patient("p-1", "A"), SyncOperation::Create).unwrap();
        for _ in 0..50 {
            if queue.items().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.items().is_empty());
        assert_eq!(api.calls(), vec![Call::Create("p-1".to_string())]);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}

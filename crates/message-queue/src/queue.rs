//! Message queue with priority ordering, bounded retry, and durable state.

use crate::{MessageStatus, Priority, QueueError, QueueResult, QueuedMessage};
use chrono::{DateTime, Utc};
use network_monitor::NetworkInfo;
use platform_bridge::{KeyValueStore, MessagePayload, MessageTransport};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Message queue configuration.
#[derive(Debug, Clone)]
pub struct MessageQueueConfig {
    /// Interval between periodic drain passes.
    pub drain_interval: Duration,
    /// Retry bound applied when the producer passes none.
    pub default_max_retries: u32,
    /// How long sent messages stay queryable before purge.
    pub retention: Duration,
    /// Key under which the queue document is persisted.
    pub storage_key: String,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            drain_interval: Duration::from_secs(30),
            default_max_retries: 3,
            retention: Duration::from_secs(300),
            storage_key: "message_queue".to_string(),
        }
    }
}

/// Why a drain call did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyDraining,
    Offline,
}

/// Counters for one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    /// Failed but still under the retry bound.
    pub retried: usize,
    /// Reached the retry bound during this pass.
    pub failed: usize,
    /// Skipped because an earlier message of the same conversation failed.
    pub deferred: usize,
    pub purged: usize,
    /// Pass stopped early because the network went offline.
    pub interrupted: bool,
}

/// Result of [`MessageQueue::drain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    Skipped(SkipReason),
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub sending: usize,
    pub sent: usize,
    pub failed: usize,
    pub completed_passes: u64,
    pub is_draining: bool,
}

#[derive(Default)]
struct QueueState {
    /// Kept sorted by (priority rank, seq).
    messages: Vec<QueuedMessage>,
    next_seq: u64,
}

#[derive(Serialize)]
struct PersistedQueueRef<'a> {
    next_seq: u64,
    messages: &'a [QueuedMessage],
}

#[derive(Deserialize)]
struct PersistedQueue {
    next_seq: u64,
    messages: Vec<QueuedMessage>,
}

/// Resets the drain flag when a pass ends, including on early return.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Durable outbound message queue.
pub struct MessageQueue {
    config: MessageQueueConfig,
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn MessageTransport>,
    network: watch::Receiver<NetworkInfo>,
    state: Mutex<QueueState>,
    draining: AtomicBool,
    completed_passes: AtomicU64,
    drain_tx: mpsc::Sender<()>,
    drain_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl MessageQueue {
    /// Create a queue, restoring any state persisted under the storage key.
    ///
    /// Messages left in `sending` by a previous process are reset to `pending`.
    pub fn new(
        config: MessageQueueConfig,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn MessageTransport>,
        network: watch::Receiver<NetworkInfo>,
    ) -> QueueResult<Self> {
        let state = Self::load(&config.storage_key, store.as_ref())?;
        // Capacity 1: concurrent drain requests coalesce into one pending trigger.
        let (drain_tx, drain_rx) = mpsc::channel(1);

        Ok(Self {
            config,
            store,
            transport,
            network,
            state: Mutex::new(state),
            draining: AtomicBool::new(false),
            completed_passes: AtomicU64::new(0),
            drain_tx,
            drain_rx: Mutex::new(Some(drain_rx)),
        })
    }

    fn load(key: &str, store: &dyn KeyValueStore) -> QueueResult<QueueState> {
        let Some(raw) = store.get(key)? else {
            return Ok(QueueState::default());
        };
        let persisted: PersistedQueue = serde_json::from_str(&raw)?;

        let mut messages = persisted.messages;
        let mut recovered = 0;
        for message in messages.iter_mut() {
            if message.status == MessageStatus::Sending {
                message.status = MessageStatus::Pending;
                recovered += 1;
            }
        }
        messages.sort_by_key(QueuedMessage::sort_key);

        let next_seq = messages
            .iter()
            .map(|m| m.seq + 1)
            .max()
            .unwrap_or(0)
            .max(persisted.next_seq);

        if recovered > 0 {
            info!(count = recovered, "Recovered in-flight messages to pending");
        }
        debug!(count = messages.len(), "Loaded message queue");
        Ok(QueueState { messages, next_seq })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the queue document. Failures are logged, never propagated.
    fn persist(&self, state: &QueueState) {
        let document = PersistedQueueRef {
            next_seq: state.next_seq,
            messages: &state.messages,
        };
        let result = serde_json::to_string(&document)
            .map_err(QueueError::from)
            .and_then(|json| {
                self.store
                    .set(&self.config.storage_key, &json)
                    .map_err(QueueError::from)
            });
        if let Err(e) = result {
            warn!(error = %e, key = %self.config.storage_key, "Failed to persist message queue");
        }
    }

    fn is_online(&self) -> bool {
        self.network.borrow().status.is_reachable()
    }

    /// Add a message in priority order and persist it.
    ///
    /// A drain is requested when the network is reachable.
    pub fn enqueue(
        &self,
        conversation_id: &str,
        payload: MessagePayload,
        priority: Priority,
        max_retries: Option<u32>,
    ) -> QueueResult<QueuedMessage> {
        if conversation_id.trim().is_empty() {
            return Err(QueueError::Invalid("conversation id is empty".to_string()));
        }
        payload
            .validate()
            .map_err(|e| QueueError::Invalid(e.to_string()))?;
        let max_retries = max_retries.unwrap_or(self.config.default_max_retries);
        if max_retries == 0 {
            return Err(QueueError::Invalid(
                "max_retries must be at least 1".to_string(),
            ));
        }

        let message = {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;

            let message = QueuedMessage {
                id: uuid::Uuid::new_v4().to_string(),
                conversation_id: conversation_id.to_string(),
                payload,
                created_at: Utc::now(),
                retry_count: 0,
                max_retries,
                priority,
                status: MessageStatus::Pending,
                last_error: None,
                seq,
                sent_at: None,
                server_id: None,
            };

            let key = message.sort_key();
            let index = state.messages.partition_point(|m| m.sort_key() <= key);
            state.messages.insert(index, message.clone());
            self.persist(&state);
            message
        };

        debug!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            priority = %message.priority,
            kind = message.payload.kind(),
            "Enqueued message"
        );

        if self.is_online() {
            self.request_drain();
        }
        Ok(message)
    }

    /// Ask the background loop for a drain pass. Requests made while one is
    /// already pending are merged.
    pub fn request_drain(&self) {
        let _ = self.drain_tx.try_send(());
    }

    /// Attempt every pending message once, in priority order.
    ///
    /// Returns immediately when offline or when another pass is running.
    pub async fn drain(&self) -> DrainOutcome {
        if !self.is_online() {
            debug!("Drain skipped, network offline");
            return DrainOutcome::Skipped(SkipReason::Offline);
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain skipped, pass already running");
            return DrainOutcome::Skipped(SkipReason::AlreadyDraining);
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport {
            purged: self.purge_expired_at(Utc::now()),
            ..Default::default()
        };

        let candidates: Vec<String> = self
            .lock()
            .messages
            .iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .map(|m| m.id.clone())
            .collect();

        let mut blocked_conversations: HashSet<String> = HashSet::new();

        for id in candidates {
            if !self.is_online() {
                report.interrupted = true;
                info!("Network went offline, stopping drain pass");
                break;
            }

            let message = {
                let mut state = self.lock();
                let Some(message) = state.messages.iter_mut().find(|m| m.id == id) else {
                    continue;
                };
                if message.status != MessageStatus::Pending {
                    continue;
                }
                if blocked_conversations.contains(&message.conversation_id) {
                    report.deferred += 1;
                    continue;
                }
                message.status = MessageStatus::Sending;
                let snapshot = message.clone();
                self.persist(&state);
                snapshot
            };

            let outbound = message.to_outbound();
            let result = self
                .transport
                .send(&message.conversation_id, &outbound)
                .await;

            let outcome: Result<Option<String>, String> = match result {
                Ok(receipt) if receipt.success => Ok(receipt.id),
                Ok(receipt) => Err(receipt
                    .error
                    .unwrap_or_else(|| "rejected by platform".to_string())),
                Err(e) => Err(e.to_string()),
            };

            let mut state = self.lock();
            let Some(entry) = state.messages.iter_mut().find(|m| m.id == id) else {
                // Cleared while the send was in flight.
                continue;
            };

            match outcome {
                Ok(server_id) => {
                    entry.status = MessageStatus::Sent;
                    entry.sent_at = Some(Utc::now());
                    entry.last_error = None;
                    entry.server_id = server_id;
                    report.sent += 1;
                    debug!(message_id = %id, "Message sent");
                }
                Err(error) => {
                    entry.retry_count += 1;
                    entry.last_error = Some(error.clone());
                    blocked_conversations.insert(entry.conversation_id.clone());
                    if entry.retry_count >= entry.max_retries {
                        entry.status = MessageStatus::Failed;
                        report.failed += 1;
                        warn!(
                            message_id = %id,
                            conversation_id = %entry.conversation_id,
                            attempts = entry.retry_count,
                            error = %error,
                            "Message failed permanently"
                        );
                    } else {
                        entry.status = MessageStatus::Pending;
                        report.retried += 1;
                        debug!(
                            message_id = %id,
                            attempt = entry.retry_count,
                            max_retries = entry.max_retries,
                            error = %error,
                            "Message send failed, will retry"
                        );
                    }
                }
            }
            self.persist(&state);
        }

        self.completed_passes.fetch_add(1, Ordering::SeqCst);
        if report.sent + report.retried + report.failed > 0 {
            info!(
                sent = report.sent,
                retried = report.retried,
                failed = report.failed,
                deferred = report.deferred,
                "Drain pass complete"
            );
        }
        DrainOutcome::Completed(report)
    }

    /// Reset failed messages to pending with a fresh retry budget.
    pub fn retry_failed_messages(&self, conversation_id: Option<&str>) -> usize {
        let count = {
            let mut state = self.lock();
            let mut count = 0;
            for message in state.messages.iter_mut() {
                let matches = conversation_id.map_or(true, |c| message.conversation_id == c);
                if matches && message.status == MessageStatus::Failed {
                    message.status = MessageStatus::Pending;
                    message.retry_count = 0;
                    message.last_error = None;
                    count += 1;
                }
            }
            if count > 0 {
                self.persist(&state);
            }
            count
        };

        if count > 0 {
            info!(count, conversation_id = ?conversation_id, "Failed messages reset for retry");
            if self.is_online() {
                self.request_drain();
            }
        }
        count
    }

    /// Drop sent messages older than the retention window.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let mut state = self.lock();
        let before = state.messages.len();
        state.messages.retain(|m| match (m.status, m.sent_at) {
            (MessageStatus::Sent, Some(sent_at)) => sent_at + retention > now,
            _ => true,
        });
        let purged = before - state.messages.len();
        if purged > 0 {
            self.persist(&state);
            debug!(count = purged, "Purged expired sent messages");
        }
        purged
    }

    /// Remove messages of one conversation, or all messages.
    pub fn clear(&self, conversation_id: Option<&str>) -> usize {
        let mut state = self.lock();
        let before = state.messages.len();
        match conversation_id {
            Some(conversation_id) => state
                .messages
                .retain(|m| m.conversation_id != conversation_id),
            None => state.messages.clear(),
        }
        let removed = before - state.messages.len();
        if removed > 0 {
            self.persist(&state);
        }
        removed
    }

    /// Remove one message by id.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.lock();
        let before = state.messages.len();
        state.messages.retain(|m| m.id != id);
        let removed = state.messages.len() != before;
        if removed {
            self.persist(&state);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<QueuedMessage> {
        self.lock().messages.iter().find(|m| m.id == id).cloned()
    }

    /// Messages in drain order, optionally for one conversation.
    pub fn messages(&self, conversation_id: Option<&str>) -> Vec<QueuedMessage> {
        self.lock()
            .messages
            .iter()
            .filter(|m| conversation_id.map_or(true, |c| m.conversation_id == c))
            .cloned()
            .collect()
    }

    pub fn failed_messages(&self) -> Vec<QueuedMessage> {
        self.lock()
            .messages
            .iter()
            .filter(|m| m.status == MessageStatus::Failed)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let mut stats = QueueStats {
            total: state.messages.len(),
            completed_passes: self.completed_passes.load(Ordering::SeqCst),
            is_draining: self.is_draining(),
            ..Default::default()
        };
        for message in &state.messages {
            match message.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Sending => stats.sending += 1,
                MessageStatus::Sent => stats.sent += 1,
                MessageStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Spawn the drain loop. Drains on request and every `drain_interval`
    /// until `shutdown` fires.
    pub fn run(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> QueueResult<JoinHandle<()>> {
        let mut trigger = self
            .drain_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(QueueError::AlreadyStarted)?;

        let queue = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let period = queue.config.drain_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "Message queue loop started");

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    Some(()) = trigger.recv() => {
                        queue.drain().await;
                    }
                    _ = ticker.tick() => {
                        queue.drain().await;
                    }
                }
            }

            info!("Message queue loop stopped");
        }))
    }
}

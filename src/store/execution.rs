//! Execution record store -- single source of truth for executions.
//!
//! Records are kept newest first. They change only through channel
//! messages (`apply_channel_message`) or explicit user actions
//! (cancel/pause/resume, refresh, import). At most one live channel is
//! open per store; opening another replaces it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{FallbackPolicy, StoreError, Synced};
use crate::api::{ApiError, Control, CrewApi};
use crate::channel::{ChannelError, ChannelMessage, Connector, LiveChannel, MessageSink};
use crate::model::{new_id, ExecutionRecord, ExecutionStatus, LogEntry, SystemMetrics};
use crate::notify::NotificationQueue;
use crate::storage::{self, Pool};

/// Per-status counts. `success_rate` is `completed / total`, 0 when empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub paused: usize,
    pub success_rate: f64,
}

/// Exported form of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionBundle {
    pub execution: ExecutionRecord,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(with = "crate::model::timestamp")]
    pub exported_at: DateTime<Utc>,
}

#[derive(Default)]
struct ExecutionState {
    records: Vec<ExecutionRecord>,
    current: Option<String>,
    metrics: SystemMetrics,
}

struct Inner {
    api: Arc<dyn CrewApi>,
    connector: Arc<dyn Connector>,
    notifications: NotificationQueue,
    fallback: FallbackPolicy,
    pool: Option<Pool>,
    state: RwLock<ExecutionState>,
    channel: Mutex<Option<LiveChannel>>,
    /// Serialises channel replacement.
    opening: Mutex<()>,
    generation: AtomicU64,
    /// Generation whose frames are accepted; 0 when no channel is open.
    active: AtomicU64,
    changes: broadcast::Sender<String>,
}

/// Shared handle to the execution store. Cloning is cheap.
#[derive(Clone)]
pub struct ExecutionStore {
    inner: Arc<Inner>,
}

impl ExecutionStore {
    pub fn new(
        api: Arc<dyn CrewApi>,
        connector: Arc<dyn Connector>,
        notifications: NotificationQueue,
        fallback: FallbackPolicy,
        pool: Option<Pool>,
    ) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                api,
                connector,
                notifications,
                fallback,
                pool,
                state: RwLock::new(ExecutionState::default()),
                channel: Mutex::new(None),
                opening: Mutex::new(()),
                generation: AtomicU64::new(0),
                active: AtomicU64::new(0),
                changes,
            }),
        }
    }

    /// Load persisted records and the metrics snapshot.
    pub async fn load(&self) -> anyhow::Result<usize> {
        let Some(pool) = &self.inner.pool else {
            return Ok(0);
        };
        let records = storage::load_executions(pool)?;
        let metrics = storage::load_metrics(pool)?.unwrap_or_default();
        let count = records.len();
        let mut state = self.inner.state.write().await;
        state.records = records;
        state.metrics = metrics;
        debug!(count, "loaded stored executions");
        Ok(count)
    }

    /// Ids of records as they change. Lagging receivers skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inner.changes.subscribe()
    }

    // -----------------------------------------------------------------------
    // Remote operations
    // -----------------------------------------------------------------------

    /// Launch a run of `crew_id` and follow it on the live channel.
    pub async fn execute(
        &self,
        crew_id: &str,
        crew_name: Option<&str>,
        params: Value,
    ) -> Result<Synced<ExecutionRecord>, StoreError> {
        info!(%crew_id, "launching execution");
        let body = match self.inner.api.execute(crew_id, &params).await {
            Ok(body) => body,
            Err(e) if e.is_transport() && self.inner.fallback == FallbackPolicy::Local => {
                warn!(%crew_id, error = %e, "service unreachable, recording a local execution");
                let mut record = ExecutionRecord::new(
                    crew_id,
                    Some(crew_name.unwrap_or("Unknown Crew")),
                    ExecutionStatus::Running,
                );
                record.logs.push(LogEntry::new("info", "Mock execution started"));
                self.insert_front(record.clone()).await;
                return Ok(Synced::local(record));
            }
            Err(e) => {
                error!(%crew_id, error = %e, "execution request failed");
                return Err(e.into());
            }
        };

        let mut record = ExecutionRecord::from_json(body).map_err(|e| ApiError::Decode {
            path: format!("crews/{}/execute", crew_id),
            reason: e.to_string(),
        })?;
        if record.crew_id.is_empty() {
            record.crew_id = crew_id.to_string();
        }
        if record.crew_name.is_none() {
            record.crew_name = crew_name.map(str::to_string);
        }
        if record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
        info!(execution_id = %record.id, %crew_id, status = %record.status, "execution started");
        self.insert_front(record.clone()).await;

        if let Err(e) = self.follow(&record.id).await {
            warn!(execution_id = %record.id, error = %e, "live updates unavailable");
            self.inner
                .notifications
                .warning("Live updates unavailable", e.to_string());
        }
        Ok(Synced::remote(record))
    }

    pub async fn cancel(&self, id: &str) -> Result<ExecutionRecord, StoreError> {
        self.control(id, Control::Cancel, ExecutionStatus::Cancelled).await
    }

    pub async fn pause(&self, id: &str) -> Result<ExecutionRecord, StoreError> {
        self.control(id, Control::Pause, ExecutionStatus::Paused).await
    }

    pub async fn resume(&self, id: &str) -> Result<ExecutionRecord, StoreError> {
        self.control(id, Control::Resume, ExecutionStatus::Running).await
    }

    async fn control(
        &self,
        id: &str,
        action: Control,
        status: ExecutionStatus,
    ) -> Result<ExecutionRecord, StoreError> {
        if self.get(id).await.is_none() {
            return Err(not_found(id));
        }
        if let Err(e) = self.inner.api.control(id, action).await {
            warn!(execution_id = %id, %action, error = %e, "execution control rejected");
            self.inner
                .notifications
                .error(format!("Failed to {} execution", action), e.to_string());
            return Err(e.into());
        }
        info!(execution_id = %id, %action, "execution control acknowledged");
        if action == Control::Cancel {
            // no frame from this execution's channel may land after the cancel
            self.shutdown_channel(Some(id)).await;
        }
        self.mutate(id, |rec| rec.transition(status))
            .await
            .ok_or_else(|| not_found(id))
    }

    /// Re-read one execution from the service and replace the local copy.
    pub async fn refresh(&self, id: &str) -> Result<Synced<ExecutionRecord>, StoreError> {
        match self.inner.api.execution(id).await {
            Ok(body) => {
                let record = ExecutionRecord::from_json(body).map_err(|e| ApiError::Decode {
                    path: format!("executions/{}", id),
                    reason: e.to_string(),
                })?;
                self.upsert(record.clone()).await;
                Ok(Synced::remote(record))
            }
            Err(e) if e.is_transport() && self.inner.fallback == FallbackPolicy::Local => {
                debug!(execution_id = %id, error = %e, "using stored execution");
                self.get(id).await.map(Synced::local).ok_or_else(|| not_found(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch the full log for an execution and store it on the record.
    pub async fn fetch_logs(&self, id: &str) -> Result<Synced<Vec<LogEntry>>, StoreError> {
        match self.inner.api.execution_logs(id).await {
            Ok(raw) => {
                let logs: Vec<LogEntry> = raw
                    .into_iter()
                    .filter_map(|v| match serde_json::from_value(v) {
                        Ok(entry) => Some(entry),
                        Err(e) => {
                            warn!(execution_id = %id, error = %e, "skipping unreadable log line");
                            None
                        }
                    })
                    .collect();
                let stored = logs.clone();
                self.mutate(id, move |rec| rec.logs = stored).await;
                Ok(Synced::remote(logs))
            }
            Err(e) if e.is_transport() && self.inner.fallback == FallbackPolicy::Local => self
                .get(id)
                .await
                .map(|rec| Synced::local(rec.logs))
                .ok_or_else(|| not_found(id)),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Live channel
    // -----------------------------------------------------------------------

    /// Open the live channel for `execution_id`, replacing any open one.
    ///
    /// The previous channel's task is stopped and joined first, so none of
    /// its frames are applied once this returns.
    pub async fn follow(&self, execution_id: &str) -> Result<(), ChannelError> {
        let _opening = self.inner.opening.lock().await;

        let previous = self.inner.channel.lock().await.take();
        if let Some(prev) = previous {
            self.inner.active.store(0, Ordering::SeqCst);
            info!(
                replaced = %prev.execution_id(),
                execution_id = %execution_id,
                "replacing live channel"
            );
            prev.shutdown().await;
        }

        let frames = self.inner.connector.connect(execution_id).await?;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // slot stays locked until the handle is installed, so a fast terminal
        // frame cannot look for the channel before it exists
        let mut slot = self.inner.channel.lock().await;
        self.inner.active.store(generation, Ordering::SeqCst);
        *slot = Some(LiveChannel::spawn(execution_id, generation, frames, self.clone()));
        Ok(())
    }

    /// Execution the live channel is scoped to, if one is open.
    pub async fn live_execution(&self) -> Option<String> {
        self.inner
            .channel
            .lock()
            .await
            .as_ref()
            .map(|c| c.execution_id().to_string())
    }

    /// Stop the channel without waiting. Used from inside the channel task.
    async fn close_channel_for(&self, execution_id: &str) {
        let mut slot = self.inner.channel.lock().await;
        if slot.as_ref().is_some_and(|c| c.execution_id() == execution_id) {
            if let Some(channel) = slot.take() {
                self.inner.active.store(0, Ordering::SeqCst);
                channel.close();
                info!(%execution_id, "live channel closed");
            }
        }
    }

    /// Stop the channel and wait for its task. Never called from the task.
    async fn shutdown_channel(&self, only: Option<&str>) {
        let taken = {
            let mut slot = self.inner.channel.lock().await;
            match (only, slot.as_ref()) {
                (Some(id), Some(c)) if c.execution_id() != id => None,
                _ => slot.take(),
            }
        };
        if let Some(channel) = taken {
            self.inner.active.store(0, Ordering::SeqCst);
            let execution_id = channel.execution_id().to_string();
            channel.shutdown().await;
            info!(%execution_id, "live channel shut down");
        }
    }

    /// Apply one push message to the store.
    pub async fn apply_channel_message(&self, message: ChannelMessage) {
        match message {
            ChannelMessage::ExecutionUpdate(patch) => {
                let Some(id) = patch.get("id").and_then(Value::as_str).map(str::to_string) else {
                    debug!("execution update without id");
                    return;
                };
                let mut failure = None;
                let updated = self
                    .mutate(&id, |rec| {
                        if let Err(e) = rec.merge(&patch) {
                            failure = Some(e);
                        }
                    })
                    .await;
                match (updated, failure) {
                    (None, _) => debug!(execution_id = %id, "update for unknown execution"),
                    (Some(_), Some(e)) => {
                        warn!(execution_id = %id, error = %e, "execution update did not apply")
                    }
                    (Some(rec), None) => debug!(execution_id = %id, status = %rec.status, "execution updated"),
                }
            }
            ChannelMessage::LogUpdate(log) => {
                let target = match log.execution_id {
                    Some(id) => Some(id),
                    None => match self.live_execution().await {
                        Some(id) => Some(id),
                        None => self.inner.state.read().await.current.clone(),
                    },
                };
                let entry = LogEntry {
                    id: new_id(),
                    timestamp: Utc::now(),
                    level: log.level.unwrap_or_else(|| "info".to_string()),
                    message: log.message,
                    source: log.source.unwrap_or_else(|| "system".to_string()),
                };
                match target {
                    Some(id) => {
                        if self.mutate(&id, |rec| rec.logs.push(entry)).await.is_none() {
                            debug!(execution_id = %id, "log line for unknown execution");
                        }
                    }
                    None => debug!("log line with no execution to attach to"),
                }
            }
            ChannelMessage::SystemMetrics(metrics) => {
                self.inner.state.write().await.metrics = metrics.clone();
                if let Some(pool) = &self.inner.pool {
                    if let Err(e) = storage::save_metrics(pool, &metrics) {
                        warn!(error = %e, "failed to persist system metrics");
                    }
                }
            }
            ChannelMessage::ExecutionComplete(done) => {
                let updated = self
                    .mutate(&done.id, |rec| {
                        if let Some(result) = done.result {
                            rec.result = Some(result);
                        }
                        if let Some(ms) = done.duration_ms {
                            rec.duration_ms = ms;
                        }
                        rec.error = None;
                        rec.transition(ExecutionStatus::Completed);
                    })
                    .await;
                self.close_channel_for(&done.id).await;
                match updated {
                    Some(rec) => {
                        info!(execution_id = %rec.id, "execution completed");
                        self.inner
                            .notifications
                            .success("Execution completed", display_name(&rec));
                    }
                    None => debug!(execution_id = %done.id, "completion for unknown execution"),
                }
            }
            ChannelMessage::ExecutionError(failure) => {
                let message = failure
                    .error
                    .unwrap_or_else(|| "execution failed".to_string());
                let updated = self
                    .mutate(&failure.id, |rec| {
                        rec.error = Some(message.clone());
                        rec.result = None;
                        rec.transition(ExecutionStatus::Failed);
                    })
                    .await;
                self.close_channel_for(&failure.id).await;
                match updated {
                    Some(rec) => {
                        warn!(execution_id = %rec.id, error = %message, "execution failed");
                        self.inner.notifications.error(
                            "Execution failed",
                            format!("{}: {}", display_name(&rec), message),
                        );
                    }
                    None => debug!(execution_id = %failure.id, "failure for unknown execution"),
                }
            }
            ChannelMessage::Unknown { kind } => {
                debug!(%kind, "ignoring unknown channel message");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn list(&self) -> Vec<ExecutionRecord> {
        self.inner.state.read().await.records.clone()
    }

    pub async fn get(&self, id: &str) -> Option<ExecutionRecord> {
        self.inner
            .state
            .read()
            .await
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Make `id` the focused execution.
    pub async fn focus(&self, id: &str) -> Option<ExecutionRecord> {
        let mut state = self.inner.state.write().await;
        let record = state.records.iter().find(|r| r.id == id).cloned()?;
        state.current = Some(record.id.clone());
        Some(record)
    }

    pub async fn current(&self) -> Option<ExecutionRecord> {
        let state = self.inner.state.read().await;
        let id = state.current.as_deref()?;
        state.records.iter().find(|r| r.id == id).cloned()
    }

    pub async fn by_status(&self, status: ExecutionStatus) -> Vec<ExecutionRecord> {
        let state = self.inner.state.read().await;
        state.records.iter().filter(|r| r.status == status).cloned().collect()
    }

    pub async fn by_crew(&self, crew_id: &str) -> Vec<ExecutionRecord> {
        let state = self.inner.state.read().await;
        state.records.iter().filter(|r| r.crew_id == crew_id).cloned().collect()
    }

    pub async fn metrics(&self) -> SystemMetrics {
        self.inner.state.read().await.metrics.clone()
    }

    /// Counts per status, recomputed on every call.
    pub async fn stats(&self) -> ExecutionStats {
        let state = self.inner.state.read().await;
        let mut stats = ExecutionStats {
            total: state.records.len(),
            ..ExecutionStats::default()
        };
        for rec in &state.records {
            match rec.status {
                ExecutionStatus::Pending => stats.pending += 1,
                ExecutionStatus::Running => stats.running += 1,
                ExecutionStatus::Completed => stats.completed += 1,
                ExecutionStatus::Failed => stats.failed += 1,
                ExecutionStatus::Cancelled => stats.cancelled += 1,
                ExecutionStatus::Paused => stats.paused += 1,
            }
        }
        if stats.total > 0 {
            stats.success_rate = stats.completed as f64 / stats.total as f64;
        }
        stats
    }

    // -----------------------------------------------------------------------
    // Export / import / teardown
    // -----------------------------------------------------------------------

    pub async fn export(&self, id: &str) -> Result<ExecutionBundle, StoreError> {
        let execution = self.get(id).await.ok_or_else(|| not_found(id))?;
        Ok(ExecutionBundle {
            logs: execution.logs.clone(),
            execution,
            exported_at: Utc::now(),
        })
    }

    /// Merge an exported bundle back in, replacing a record with the same id.
    pub async fn import(&self, bundle: ExecutionBundle) -> ExecutionRecord {
        let mut record = bundle.execution;
        record.transition(record.status);
        if record.logs.is_empty() {
            record.logs = bundle.logs;
        }
        self.upsert(record.clone()).await;
        info!(execution_id = %record.id, "execution imported");
        record
    }

    /// Drop every record, the metrics snapshot and the live channel.
    pub async fn clear(&self) {
        self.shutdown_channel(None).await;
        {
            let mut state = self.inner.state.write().await;
            *state = ExecutionState::default();
        }
        if let Some(pool) = &self.inner.pool {
            let cleared = storage::clear_executions(pool)
                .and_then(|_| storage::save_metrics(pool, &SystemMetrics::default()));
            if let Err(e) = cleared {
                warn!(error = %e, "failed to clear stored executions");
            }
        }
    }

    /// Close the live channel and wait for its task to finish.
    pub async fn shutdown(&self) {
        self.shutdown_channel(None).await;
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn insert_front(&self, record: ExecutionRecord) {
        {
            let mut state = self.inner.state.write().await;
            state.current = Some(record.id.clone());
            state.records.insert(0, record.clone());
        }
        self.persist(&record);
        let _ = self.inner.changes.send(record.id);
    }

    async fn upsert(&self, record: ExecutionRecord) {
        {
            let mut state = self.inner.state.write().await;
            match state.records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record.clone(),
                None => state.records.insert(0, record.clone()),
            }
        }
        self.persist(&record);
        let _ = self.inner.changes.send(record.id);
    }

    /// Mutate one record under the write lock, then persist and announce it.
    async fn mutate<F>(&self, id: &str, f: F) -> Option<ExecutionRecord>
    where
        F: FnOnce(&mut ExecutionRecord),
    {
        let updated = {
            let mut state = self.inner.state.write().await;
            let record = state.records.iter_mut().find(|r| r.id == id)?;
            f(record);
            record.clone()
        };
        self.persist(&updated);
        let _ = self.inner.changes.send(updated.id.clone());
        Some(updated)
    }

    fn persist(&self, record: &ExecutionRecord) {
        if let Some(pool) = &self.inner.pool {
            if let Err(e) = storage::save_execution(pool, record) {
                warn!(execution_id = %record.id, error = %e, "failed to persist execution");
            }
        }
    }
}

#[async_trait]
impl MessageSink for ExecutionStore {
    async fn deliver(&self, generation: u64, message: ChannelMessage) {
        if self.inner.active.load(Ordering::SeqCst) != generation {
            debug!(generation, kind = message.kind(), "dropping frame from a replaced channel");
            return;
        }
        self.apply_channel_message(message).await;
    }

    async fn disconnected(&self, generation: u64) {
        let mut slot = self.inner.channel.lock().await;
        if slot.as_ref().is_some_and(|c| c.generation() == generation) {
            slot.take();
            let _ = self.inner.active.compare_exchange(
                generation,
                0,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}

fn not_found(id: &str) -> StoreError {
    StoreError::NotFound {
        kind: "execution",
        id: id.to_string(),
    }
}

fn display_name(rec: &ExecutionRecord) -> String {
    rec.crew_name.clone().unwrap_or_else(|| rec.id.clone())
}

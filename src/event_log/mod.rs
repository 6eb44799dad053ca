//! EventLogService - Event Recording
//!
//! ## Responsibilities
//!
//! - Ring buffer of recent lifecycle events for in-process queries
//! - Append-only JSONL persistence, partitioned by calendar day:
//!   `YYYY-MM-DD.log` (classifications), `YYYY-MM-DD_events.log` (state
//!   events), `YYYY-MM-DD_notifications.log` (notification attempts)
//!
//! Persistence is fire-and-forget: a write failure is logged and swallowed,
//! never surfaced to the pipeline.

use crate::state_machine::StateEvent;
use crate::worker_pool::ClassificationResult;
use chrono::Utc;
use serde_json::json;
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

/// Default ring buffer capacity
const DEFAULT_CAPACITY: usize = 2000;

/// Ring buffer for events
struct EventRingBuffer {
    events: VecDeque<StateEvent>,
    capacity: usize,
}

impl EventRingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, event: StateEvent) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn latest(&self, count: usize) -> Vec<StateEvent> {
        self.events.iter().rev().take(count).cloned().collect()
    }

    fn by_device(&self, device_id: &str, count: usize) -> Vec<StateEvent> {
        self.events
            .iter()
            .rev()
            .filter(|e| e.device_id == device_id)
            .take(count)
            .cloned()
            .collect()
    }
}

/// EventLogService instance
pub struct EventLogService {
    buffer: RwLock<EventRingBuffer>,
    log_dir: PathBuf,
    // Serializes appends so interleaved records stay line-atomic
    write_lock: Mutex<()>,
}

impl EventLogService {
    pub fn new(log_dir: PathBuf, capacity: usize) -> Self {
        Self {
            buffer: RwLock::new(EventRingBuffer::new(capacity)),
            log_dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_defaults(log_dir: PathBuf) -> Self {
        Self::new(log_dir, DEFAULT_CAPACITY)
    }

    /// Record a committed lifecycle event
    pub async fn record_event(&self, event: &StateEvent) {
        {
            let mut buffer = self.buffer.write().await;
            buffer.push(event.clone());
        }

        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "device_id": event.device_id,
            "event_type": event.event_type.as_str(),
            "old_state": event.old_state,
            "new_state": event.new_state,
            "details": event.details,
        });
        self.append("_events", &entry).await;
    }

    /// Record an accepted classification (and its event, if one committed)
    pub async fn record_classification(
        &self,
        result: &ClassificationResult,
        event: Option<&StateEvent>,
    ) {
        let mut data = json!({
            "captured_at": result.captured_at.to_rfc3339(),
            "class": result.label,
            "confidence": result.confidence,
        });
        if let Some(probs) = &result.all_probs {
            data["all_probs"] = json!(probs);
        }
        if let Some(event) = event {
            data["state_event"] = json!({
                "event_type": event.event_type.as_str(),
                "old_state": event.old_state,
                "new_state": event.new_state,
                "details": event.details,
            });
        }

        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "device_id": result.device_id,
            "data": data,
        });
        self.append("", &entry).await;
    }

    /// Record a notification attempt and its outcome
    pub async fn record_notification(
        &self,
        device_id: &str,
        code: i32,
        message: &str,
        status_code: u16,
        response: &str,
    ) {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "device_id": device_id,
            "type": "notification_sent",
            "code": code,
            "message": message,
            "status_code": status_code,
            "response": response,
        });
        self.append("_notifications", &entry).await;
    }

    /// Most recent events, newest first
    pub async fn latest(&self, count: usize) -> Vec<StateEvent> {
        self.buffer.read().await.latest(count)
    }

    /// Most recent events for one device, newest first
    pub async fn by_device(&self, device_id: &str, count: usize) -> Vec<StateEvent> {
        self.buffer.read().await.by_device(device_id, count)
    }

    /// Events currently buffered
    pub async fn count(&self) -> usize {
        self.buffer.read().await.events.len()
    }

    /// Path of today's partition for the given suffix
    pub fn partition_path(&self, suffix: &str) -> PathBuf {
        let today = Utc::now().format("%Y-%m-%d");
        self.log_dir.join(format!("{}{}.log", today, suffix))
    }

    /// Append one JSON line; failures are logged and swallowed
    async fn append(&self, suffix: &str, entry: &serde_json::Value) {
        let path = self.partition_path(suffix);
        let _guard = self.write_lock.lock().await;

        if let Err(e) = self.try_append(&path, entry).await {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "Log append failed"
            );
        }
    }

    async fn try_append(
        &self,
        path: &PathBuf,
        entry: &serde_json::Value,
    ) -> std::io::Result<()> {
        fs::create_dir_all(&self.log_dir).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let mut line = entry.to_string();
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

//! Stream Status Tracker
//!
//! Tracks per-device stream connection status to detect lost/recovered
//! transitions. Only transitions are logged to avoid spamming the log while
//! a source stays down.

use std::collections::HashMap;
use tokio::sync::RwLock;

/// Stream connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Initial state (never attempted)
    Unknown,
    /// Source is connected and delivering frames
    Online,
    /// Source is unreachable or failing reads
    Offline,
}

/// Stream status transition event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatusEvent {
    /// Stream went from Online to Offline
    Lost,
    /// Stream went from Offline to Online
    Recovered,
}

/// Tracks stream connection status and detects transitions
pub struct StreamStatusTracker {
    /// Current status of each device (device_id -> status)
    statuses: RwLock<HashMap<String, ConnectionStatus>>,
}

impl StreamStatusTracker {
    pub fn new() -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Update stream status and return a transition event if any
    ///
    /// Returns:
    /// - `Some(Lost)` on Online -> Offline, or when the first attempt fails
    /// - `Some(Recovered)` on Offline -> Online
    /// - `None` when nothing changed
    pub async fn update_status(
        &self,
        device_id: &str,
        is_online: bool,
    ) -> Option<StreamStatusEvent> {
        let mut statuses = self.statuses.write().await;
        let prev = statuses
            .get(device_id)
            .copied()
            .unwrap_or(ConnectionStatus::Unknown);

        let new_status = if is_online {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        };
        statuses.insert(device_id.to_string(), new_status);

        match (prev, new_status) {
            (ConnectionStatus::Online, ConnectionStatus::Offline) => {
                tracing::warn!(device_id = %device_id, "Stream connection lost");
                Some(StreamStatusEvent::Lost)
            }
            (ConnectionStatus::Offline, ConnectionStatus::Online) => {
                tracing::info!(device_id = %device_id, "Stream connection recovered");
                Some(StreamStatusEvent::Recovered)
            }
            (ConnectionStatus::Unknown, ConnectionStatus::Offline) => {
                tracing::warn!(device_id = %device_id, "Initial stream connect failed");
                Some(StreamStatusEvent::Lost)
            }
            _ => None,
        }
    }

    /// Current status for a device
    pub async fn get_status(&self, device_id: &str) -> ConnectionStatus {
        self.statuses
            .read()
            .await
            .get(device_id)
            .copied()
            .unwrap_or(ConnectionStatus::Unknown)
    }

    /// Devices currently offline
    pub async fn get_offline_devices(&self) -> Vec<String> {
        self.statuses
            .read()
            .await
            .iter()
            .filter(|(_, status)| **status == ConnectionStatus::Offline)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forget a device (e.g. stream removed)
    pub async fn remove(&self, device_id: &str) {
        self.statuses.write().await.remove(device_id);
    }
}

impl Default for StreamStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

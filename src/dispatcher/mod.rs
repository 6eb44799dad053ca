//! ResultDispatcher - Output Queue Drain + Per-Device Ordering
//!
//! ## Responsibilities
//!
//! - Drain the worker pool output queue, staying responsive to stop
//! - Reject results below the confidence threshold
//! - Reorder per-device results by capture timestamp before the state
//!   machine sees them (workers finish out of order)
//! - Forward committed events to the event log and notification gateway
//!
//! The dispatcher is the single writer for every device session; state
//! updates for one device never interleave.

use crate::event_log::EventLogService;
use crate::notifier::NotificationGateway;
use crate::state_machine::{DeviceStateMachine, ScreenState};
use crate::worker_pool::ClassificationResult;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

/// Output queue poll timeout; bounds reaction time to the stop flag
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Buffered result awaiting release
struct Held {
    arrived: Instant,
    result: ClassificationResult,
}

/// Per-device reorder buffer.
///
/// Workers run in parallel, so results for one device can complete out of
/// capture order. Each accepted result is held for a short window and
/// released in `captured_at` order; anything arriving behind the last
/// released timestamp is dropped. Downstream therefore sees strictly
/// increasing per-device timestamps.
pub struct ReorderBuffer {
    hold: Duration,
    pending: HashMap<String, Vec<Held>>,
    last_released: HashMap<String, DateTime<Utc>>,
}

impl ReorderBuffer {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            pending: HashMap::new(),
            last_released: HashMap::new(),
        }
    }

    pub fn insert(&mut self, result: ClassificationResult) {
        self.pending
            .entry(result.device_id.clone())
            .or_default()
            .push(Held {
                arrived: Instant::now(),
                result,
            });
    }

    /// Release, in timestamp order, every held result whose hold window has
    /// elapsed; late results are discarded
    pub fn drain_ready(&mut self) -> Vec<ClassificationResult> {
        self.release(Some(Instant::now()))
    }

    /// Release everything regardless of age (shutdown path)
    pub fn drain_all(&mut self) -> Vec<ClassificationResult> {
        self.release(None)
    }

    fn release(&mut self, now: Option<Instant>) -> Vec<ClassificationResult> {
        let mut released = Vec::new();

        for (device_id, held) in self.pending.iter_mut() {
            let mut ready: Vec<Held> = Vec::new();
            let mut keep: Vec<Held> = Vec::new();
            for h in held.drain(..) {
                let elapsed = match now {
                    Some(now) => now.duration_since(h.arrived) >= self.hold,
                    None => true,
                };
                if elapsed {
                    ready.push(h);
                } else {
                    keep.push(h);
                }
            }
            *held = keep;

            ready.sort_by_key(|h| h.result.captured_at);
            for h in ready {
                let last = self.last_released.get(device_id).copied();
                if let Some(last) = last {
                    if h.result.captured_at <= last {
                        tracing::warn!(
                            device_id = %device_id,
                            captured_at = %h.result.captured_at,
                            last_released = %last,
                            "Late result discarded (ordering)"
                        );
                        continue;
                    }
                }
                self.last_released
                    .insert(device_id.clone(), h.result.captured_at);
                released.push(h.result);
            }
        }

        self.pending.retain(|_, held| !held.is_empty());
        // Stable order across devices for deterministic downstream handling
        released.sort_by(|a, b| {
            a.device_id
                .cmp(&b.device_id)
                .then(a.captured_at.cmp(&b.captured_at))
        });
        released
    }

    pub fn pending_len(&self) -> usize {
        self.pending.values().map(|v| v.len()).sum()
    }
}

/// Drains classification results into the state machine
pub struct ResultDispatcher {
    threshold: f32,
    reorder: ReorderBuffer,
    state_machine: Arc<RwLock<DeviceStateMachine>>,
    gateway: Arc<NotificationGateway>,
    event_log: Arc<EventLogService>,
    running: Arc<RwLock<bool>>,
}

impl ResultDispatcher {
    pub fn new(
        threshold: f32,
        reorder_hold: Duration,
        state_machine: Arc<RwLock<DeviceStateMachine>>,
        gateway: Arc<NotificationGateway>,
        event_log: Arc<EventLogService>,
        running: Arc<RwLock<bool>>,
    ) -> Self {
        Self {
            threshold,
            reorder: ReorderBuffer::new(reorder_hold),
            state_machine,
            gateway,
            event_log,
            running,
        }
    }

    /// Drain loop; exits when the stop flag clears or the queue closes
    pub async fn run(mut self, mut output_rx: mpsc::UnboundedReceiver<ClassificationResult>) {
        tracing::info!(threshold = self.threshold, "Result dispatcher started");

        loop {
            if !*self.running.read().await {
                break;
            }

            match tokio::time::timeout(POLL_TIMEOUT, output_rx.recv()).await {
                Ok(Some(result)) => self.accept(result),
                Ok(None) => break, // pool gone
                Err(_) => {}       // poll timeout: fall through to release
            }

            let ready = self.reorder.drain_ready();
            for result in ready {
                self.apply(result).await;
            }
        }

        // Drain what the workers already produced; by shutdown order the
        // pool is sentinel-stopped at this point, so the channel closes
        // once the last worker exits
        while let Some(result) = output_rx.recv().await {
            self.accept(result);
        }

        // Flush whatever is still held so no accepted result is lost
        for result in self.reorder.drain_all() {
            self.apply(result).await;
        }
        tracing::info!("Result dispatcher stopped");
    }

    /// Confidence gate + reorder admission
    fn accept(&mut self, result: ClassificationResult) {
        if result.confidence < self.threshold {
            tracing::debug!(
                device_id = %result.device_id,
                label = %result.label,
                confidence = result.confidence,
                threshold = self.threshold,
                "Result below confidence threshold, rejected"
            );
            return;
        }
        self.reorder.insert(result);
    }

    /// Feed one ordered result to the state machine and fan out the event
    async fn apply(&self, result: ClassificationResult) {
        let Some(detected) = ScreenState::parse(&result.label) else {
            tracing::warn!(
                device_id = %result.device_id,
                label = %result.label,
                "Unknown classifier label, ignored"
            );
            return;
        };

        let event = {
            let mut sm = self.state_machine.write().await;
            sm.update(
                &result.device_id,
                detected,
                result.confidence,
                result.captured_at,
            )
        };

        self.event_log
            .record_classification(&result, event.as_ref())
            .await;

        if let Some(event) = event {
            self.event_log.record_event(&event).await;
            self.gateway.notify_event(&event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn result(device_id: &str, label: &str, confidence: f32, offset_ms: i64) -> ClassificationResult {
        let base = DateTime::parse_from_rfc3339("2026-01-15T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        ClassificationResult {
            device_id: device_id.to_string(),
            label: label.to_string(),
            confidence,
            captured_at: base + ChronoDuration::milliseconds(offset_ms),
            all_probs: None,
        }
    }

    #[test]
    fn test_reorder_by_timestamp() {
        let mut buffer = ReorderBuffer::new(Duration::ZERO);
        buffer.insert(result("dev-1", "scan", 0.9, 300));
        buffer.insert(result("dev-1", "start", 0.9, 100));
        buffer.insert(result("dev-1", "list", 0.9, 200));

        let released = buffer.drain_ready();
        let labels: Vec<_> = released.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["start", "list", "scan"]);
    }

    #[test]
    fn test_late_result_is_discarded() {
        let mut buffer = ReorderBuffer::new(Duration::ZERO);
        buffer.insert(result("dev-1", "scan", 0.9, 500));
        assert_eq!(buffer.drain_ready().len(), 1);

        // Arrives after a newer result was already released
        buffer.insert(result("dev-1", "start", 0.9, 100));
        assert!(buffer.drain_ready().is_empty());
    }

    #[test]
    fn test_devices_do_not_interfere() {
        let mut buffer = ReorderBuffer::new(Duration::ZERO);
        buffer.insert(result("dev-2", "start", 0.9, 500));
        buffer.insert(result("dev-1", "start", 0.9, 100));

        let released = buffer.drain_ready();
        assert_eq!(released.len(), 2);

        // dev-2's old timestamp is fine; ordering is per device
        buffer.insert(result("dev-1", "scan", 0.9, 200));
        assert_eq!(buffer.drain_ready().len(), 1);
    }

    #[test]
    fn test_hold_window_delays_release() {
        let mut buffer = ReorderBuffer::new(Duration::from_secs(60));
        buffer.insert(result("dev-1", "scan", 0.9, 100));

        assert!(buffer.drain_ready().is_empty());
        assert_eq!(buffer.pending_len(), 1);

        // Shutdown path releases regardless of age
        assert_eq!(buffer.drain_all().len(), 1);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_stop_drains_queued_results() {
        use crate::config::AppConfig;

        let log_dir =
            std::env::temp_dir().join(format!("checkout-disp-{}", uuid::Uuid::new_v4()));
        let event_log = Arc::new(EventLogService::with_defaults(log_dir));
        let config = Arc::new(AppConfig::default());
        let gateway = Arc::new(NotificationGateway::from_config(config, event_log.clone()));
        let state_machine = Arc::new(RwLock::new(DeviceStateMachine::new()));

        // Flag already cleared: results sitting in the channel at stop time
        // must still reach the state machine
        let running = Arc::new(RwLock::new(false));
        let dispatcher = ResultDispatcher::new(
            0.5,
            Duration::from_secs(60),
            state_machine.clone(),
            gateway,
            event_log.clone(),
            running,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(result("dev-1", "start", 0.9, 100)).unwrap();
        tx.send(result("dev-1", "scan", 0.9, 200)).unwrap();
        drop(tx);

        dispatcher.run(rx).await;

        let sm = state_machine.read().await;
        let device = sm.device("dev-1").expect("queued results applied");
        assert_eq!(device.current_state, ScreenState::Scan);
        assert_eq!(event_log.count().await, 2); // session_start + product_scan
    }

    #[test]
    fn test_duplicate_timestamp_is_discarded() {
        let mut buffer = ReorderBuffer::new(Duration::ZERO);
        buffer.insert(result("dev-1", "scan", 0.9, 100));
        assert_eq!(buffer.drain_ready().len(), 1);

        // Same cached frame sampled twice
        buffer.insert(result("dev-1", "scan", 0.9, 100));
        assert!(buffer.drain_ready().is_empty());
    }
}

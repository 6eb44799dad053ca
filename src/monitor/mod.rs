//! ScreenMonitor - Pipeline Orchestrator
//!
//! ## Responsibilities
//!
//! - Own and wire every pipeline stage: streams, samplers, worker pool,
//!   dispatcher, state machine, notifications
//! - Lifecycle: start everything, stop in dependency order (producers
//!   before consumers) so no stage reads from a dead peer
//! - Surface per-device status for operational queries
//!
//! One monitor instance runs the whole fleet of configured devices.

use crate::classifier::Classifier;
use crate::config::AppConfig;
use crate::dispatcher::ResultDispatcher;
use crate::event_log::EventLogService;
use crate::notifier::NotificationGateway;
use crate::state_machine::{DeviceStateMachine, DeviceStatus, SessionInfo};
use crate::stream_manager::{FrameSource, StreamManager};
use crate::stream_status::{ConnectionStatus, StreamStatusTracker};
use crate::worker_pool::{ClassificationTask, ClassificationWorkerPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Bounded join timeout for sampler and dispatcher tasks on stop
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Orchestrates the full monitoring pipeline
pub struct ScreenMonitor {
    config: Arc<AppConfig>,
    classifier: Arc<dyn Classifier>,
    event_log: Arc<EventLogService>,
    state_machine: Arc<RwLock<DeviceStateMachine>>,
    status: Arc<StreamStatusTracker>,
    gateway: Arc<NotificationGateway>,
    streams: Mutex<HashMap<String, Arc<StreamManager>>>,
    pool: Mutex<Option<Arc<ClassificationWorkerPool>>>,
    sampler_handles: Mutex<Vec<JoinHandle<()>>>,
    dispatcher_handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<RwLock<bool>>,
}

impl ScreenMonitor {
    pub fn new(config: Arc<AppConfig>, classifier: Arc<dyn Classifier>) -> Self {
        let event_log = Arc::new(EventLogService::with_defaults(config.log_dir.clone()));
        let gateway = Arc::new(NotificationGateway::from_config(
            config.clone(),
            event_log.clone(),
        ));
        Self {
            config,
            classifier,
            event_log,
            state_machine: Arc::new(RwLock::new(DeviceStateMachine::new())),
            status: Arc::new(StreamStatusTracker::new()),
            gateway,
            streams: Mutex::new(HashMap::new()),
            pool: Mutex::new(None),
            sampler_handles: Mutex::new(Vec::new()),
            dispatcher_handle: Mutex::new(None),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Register a device's video source; must happen before start()
    pub async fn add_stream(&self, device_id: &str, source: Arc<dyn FrameSource>) {
        let manager = Arc::new(StreamManager::new(
            device_id.to_string(),
            source,
            self.status.clone(),
        ));
        self.streams
            .lock()
            .await
            .insert(device_id.to_string(), manager);
        tracing::info!(device_id = %device_id, "Stream registered");
    }

    /// Start the pipeline; idempotent if already running
    pub async fn start(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!("Monitor already running");
                return;
            }
            *running = true;
        }

        let detection = &self.config.detection;
        let (pool, output_rx) =
            ClassificationWorkerPool::spawn(self.classifier.clone(), detection.worker_count);
        let pool = Arc::new(pool);
        *self.pool.lock().await = Some(pool.clone());

        // Dispatcher consumes the pool output; hold window of two sample
        // intervals covers worker completion skew
        let reorder_hold = Duration::from_millis(detection.sample_interval_ms * 2);
        let dispatcher = ResultDispatcher::new(
            detection.confidence_threshold,
            reorder_hold,
            self.state_machine.clone(),
            self.gateway.clone(),
            self.event_log.clone(),
            self.running.clone(),
        );
        *self.dispatcher_handle.lock().await = Some(tokio::spawn(dispatcher.run(output_rx)));

        // Streams plus one sampler per device
        let sample_interval = Duration::from_millis(detection.sample_interval_ms);
        let streams = self.streams.lock().await;
        let mut samplers = self.sampler_handles.lock().await;
        for (device_id, manager) in streams.iter() {
            manager.start().await;
            samplers.push(tokio::spawn(Self::sampler_loop(
                device_id.clone(),
                manager.clone(),
                pool.clone(),
                sample_interval,
                self.running.clone(),
            )));
        }

        tracing::info!(
            devices = streams.len(),
            workers = detection.worker_count,
            sample_interval_ms = detection.sample_interval_ms,
            "Monitor started"
        );
    }

    /// Grab the latest cached frame on every tick and submit it for
    /// classification; a full pool sheds the frame
    async fn sampler_loop(
        device_id: String,
        manager: Arc<StreamManager>,
        pool: Arc<ClassificationWorkerPool>,
        sample_interval: Duration,
        running: Arc<RwLock<bool>>,
    ) {
        let mut ticker = tokio::time::interval(sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while *running.read().await {
            ticker.tick().await;

            let Some(frame) = manager.get_frame().await else {
                continue; // stream not delivering yet
            };

            pool.submit(ClassificationTask {
                device_id: device_id.clone(),
                frame: frame.data,
                captured_at: frame.captured_at,
            })
            .await;
        }
        tracing::debug!(device_id = %device_id, "Sampler stopped");
    }

    /// Stop the pipeline in dependency order: streams, samplers, pool,
    /// dispatcher. Idempotent.
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }
        tracing::info!("Monitor stopping");

        // 1. Streams stop producing frames
        for manager in self.streams.lock().await.values() {
            manager.stop().await;
        }

        // 2. Samplers notice the flag; join with a bound
        for handle in self.sampler_handles.lock().await.drain(..) {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("Sampler did not stop in time");
            }
        }

        // 3. Pool drains and workers exit
        if let Some(pool) = self.pool.lock().await.take() {
            pool.shutdown().await;
        }

        // 4. Dispatcher flushes held results and exits
        if let Some(mut handle) = self.dispatcher_handle.lock().await.take() {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("Dispatcher did not stop in time, aborting");
                handle.abort();
            }
        }

        tracing::info!("Monitor stopped");
    }

    /// Session + debounce status for one device
    pub async fn device_status(&self, device_id: &str) -> Option<DeviceStatus> {
        self.state_machine.read().await.device_status(device_id)
    }

    /// Status for every device the state machine has seen
    pub async fn all_devices_status(&self) -> Vec<DeviceStatus> {
        self.state_machine.read().await.all_devices_status()
    }

    /// Current session details for one device
    pub async fn session_info(&self, device_id: &str) -> Option<SessionInfo> {
        self.state_machine.read().await.session_info(device_id)
    }

    /// Stream connectivity for one device
    pub async fn stream_status(&self, device_id: &str) -> ConnectionStatus {
        self.status.get_status(device_id).await
    }

    pub fn event_log(&self) -> Arc<EventLogService> {
        self.event_log.clone()
    }
}

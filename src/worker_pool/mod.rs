//! ClassificationWorkerPool - Bounded Classification Concurrency
//!
//! ## Responsibilities
//!
//! - Fixed set of supervised workers pulling tasks from a bounded queue
//! - Load shedding: a full input queue drops the frame (recency beats
//!   completeness; stale frames are worthless)
//! - Per-task failure containment: a bad frame never removes a worker
//! - Sentinel-based shutdown with a bounded force-terminate
//!
//! Workers communicate exclusively through the two queues; the output side
//! is drained by the ResultDispatcher.

use crate::classifier::Classifier;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Submission timeout before a frame is shed
const SUBMIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-worker join timeout during shutdown
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One frame queued for classification
#[derive(Debug)]
pub struct ClassificationTask {
    pub device_id: String,
    pub frame: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// Classification outcome for one frame
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub device_id: String,
    pub label: String,
    pub confidence: f32,
    pub captured_at: DateTime<Utc>,
    pub all_probs: Option<HashMap<String, f32>>,
}

/// Queue message; `None` is the per-worker shutdown sentinel
type PoolMessage = Option<ClassificationTask>;

/// Fixed pool of classification workers
pub struct ClassificationWorkerPool {
    input_tx: mpsc::Sender<PoolMessage>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    dropped: AtomicU64,
}

impl ClassificationWorkerPool {
    /// Spawn `worker_count` workers; returns the pool and the output queue
    /// receiver to hand to the dispatcher
    pub fn spawn(
        classifier: Arc<dyn Classifier>,
        worker_count: usize,
    ) -> (Self, mpsc::UnboundedReceiver<ClassificationResult>) {
        let worker_count = worker_count.max(1);
        // Capacity 2N: enough to keep workers busy, small enough that
        // anything beyond it is already stale
        let (input_tx, input_rx) = mpsc::channel::<PoolMessage>(worker_count * 2);
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let input_rx = Arc::new(Mutex::new(input_rx));
        let mut handles = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let input_rx = input_rx.clone();
            let output_tx = output_tx.clone();
            let classifier = classifier.clone();

            handles.push(tokio::spawn(async move {
                tracing::debug!(worker_id = worker_id, "Classification worker started");
                loop {
                    // Hold the receiver lock only for the pull itself
                    let message = { input_rx.lock().await.recv().await };
                    let task = match message {
                        Some(Some(task)) => task,
                        // Sentinel or closed channel
                        Some(None) | None => break,
                    };

                    match classifier.classify(&task.frame).await {
                        Ok(c) => {
                            let result = ClassificationResult {
                                device_id: task.device_id,
                                label: c.label,
                                confidence: c.confidence,
                                captured_at: task.captured_at,
                                all_probs: c.all_probs,
                            };
                            if output_tx.send(result).is_err() {
                                break; // dispatcher gone
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                worker_id = worker_id,
                                device_id = %task.device_id,
                                error = %e,
                                "Classification failed, frame skipped"
                            );
                        }
                    }
                }
                tracing::debug!(worker_id = worker_id, "Classification worker stopped");
            }));
        }

        (
            Self {
                input_tx,
                handles: Mutex::new(handles),
                worker_count,
                dropped: AtomicU64::new(0),
            },
            output_rx,
        )
    }

    /// Submit a task; returns false when the queue stayed full past the
    /// submission timeout and the frame was shed
    pub async fn submit(&self, task: ClassificationTask) -> bool {
        let device_id = task.device_id.clone();
        match self.input_tx.send_timeout(Some(task), SUBMIT_TIMEOUT).await {
            Ok(()) => true,
            Err(_) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    device_id = %device_id,
                    dropped_total = total,
                    "Input queue full, frame dropped"
                );
                false
            }
        }
    }

    /// Frames shed so far
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// One sentinel per worker, bounded join, then force-terminate stragglers
    pub async fn shutdown(&self) {
        for _ in 0..self.worker_count {
            if self
                .input_tx
                .send_timeout(None, Duration::from_secs(1))
                .await
                .is_err()
            {
                break;
            }
        }

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for mut handle in handles {
            if tokio::time::timeout(WORKER_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("Worker did not exit in time, aborting");
                handle.abort();
            }
        }
        tracing::info!(worker_count = self.worker_count, "Worker pool stopped");
    }
}

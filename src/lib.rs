//! Checkout Monitor Library
//!
//! Self-Checkout Screen Monitoring System
//!
//! ## Architecture (8 Components)
//!
//! 1. AppConfig - Device map, detection parameters, notification targets
//! 2. StreamManager - Per-device frame acquisition with reconnection
//! 3. StreamStatusTracker - Connection lost/recovered transition tracking
//! 4. ClassificationWorkerPool - Bounded worker pool with load shedding
//! 5. ResultDispatcher - Confidence gate + per-device timestamp reordering
//! 6. DeviceStateMachine - Session lifecycle with debounce confirmation
//! 7. NotificationGateway - HTTP device notifications + MQTT dismiss channel
//! 8. EventLogService - Ring buffer + day-partitioned JSONL persistence
//!
//! ## Design Principles
//!
//! - Single writer per device: all state updates flow through one dispatcher
//! - Backpressure by shedding: only the freshest frame has value
//! - No condition in the core is process-fatal

pub mod config;
pub mod classifier;
pub mod dispatcher;
pub mod event_log;
pub mod monitor;
pub mod notifier;
pub mod state_machine;
pub mod stream_manager;
pub mod stream_status;
pub mod worker_pool;
pub mod error;

pub use error::{Error, Result};

//! Notifier - Device Notifications + Dismiss Channel
//!
//! ## Responsibilities
//!
//! - HTTP notifications to the checkout terminal's listener (code + message)
//! - MQTT dismiss publishes to the paired display device
//! - Map committed lifecycle events to the notification protocol
//!
//! Every send is best-effort: failures are logged and reported as `false`,
//! never propagated. A dead terminal must not stall the pipeline.

use crate::config::AppConfig;
use crate::event_log::EventLogService;
use crate::state_machine::{EventType, StateEvent};
use chrono::Utc;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Notification codes understood by the terminal listener
pub const CODE_SESSION_START: i32 = 101;
pub const CODE_PRODUCT_SCAN: i32 = 102;
pub const CODE_SESSION_END: i32 = 106;

const MSG_SESSION_START: &str = "スキャンチェック開始";
const MSG_PRODUCT_SCAN: &str = "商品スキャン";
const MSG_SESSION_END: &str = "スキャンチェック終了";

/// HTTP timeout for terminal notifications; terminals answer fast or not
/// at all
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends HTTP notifications to terminal devices
pub struct DeviceNotifier {
    client: reqwest::Client,
    config: Arc<AppConfig>,
    event_log: Arc<EventLogService>,
}

impl DeviceNotifier {
    pub fn new(config: Arc<AppConfig>, event_log: Arc<EventLogService>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            config,
            event_log,
        }
    }

    /// Send one notification; returns whether the terminal accepted it
    pub async fn notify(&self, device_id: &str, code: i32, message: &str) -> bool {
        let Some(url) = self.config.notify_url(device_id) else {
            tracing::warn!(device_id = %device_id, "Notification for unknown device, skipped");
            return false;
        };

        let payload = json!({
            "code": code,
            "message": message,
        });

        let outcome = self
            .client
            .post(&url)
            .header("X-Device-ID", device_id)
            .json(&payload)
            .send()
            .await;

        match outcome {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                self.event_log
                    .record_notification(device_id, code, message, status.as_u16(), &body)
                    .await;
                if status.is_success() {
                    tracing::info!(
                        device_id = %device_id,
                        code = code,
                        "Notification delivered"
                    );
                    true
                } else {
                    tracing::warn!(
                        device_id = %device_id,
                        code = code,
                        status = %status,
                        "Notification rejected by terminal"
                    );
                    false
                }
            }
            Err(e) => {
                tracing::warn!(
                    device_id = %device_id,
                    code = code,
                    error = %e,
                    "Notification send failed"
                );
                self.event_log
                    .record_notification(device_id, code, message, 0, &e.to_string())
                    .await;
                false
            }
        }
    }

    pub async fn send_session_start(&self, device_id: &str) -> bool {
        self.notify(device_id, CODE_SESSION_START, MSG_SESSION_START)
            .await
    }

    pub async fn send_product_scan(&self, device_id: &str) -> bool {
        self.notify(device_id, CODE_PRODUCT_SCAN, MSG_PRODUCT_SCAN)
            .await
    }

    pub async fn send_session_end(&self, device_id: &str) -> bool {
        self.notify(device_id, CODE_SESSION_END, MSG_SESSION_END)
            .await
    }
}

/// Publishes dismiss commands to display devices over MQTT
pub struct DismissPublisher {
    client: AsyncClient,
    topic: String,
    // Driver task; aborted on drop so it cannot outlive the publisher
    eventloop_task: tokio::task::JoinHandle<()>,
}

impl DismissPublisher {
    /// Connect to the broker and spawn the event-loop driver task
    pub fn connect(broker_host: &str, broker_port: u16, topic: String) -> Self {
        let mut options = MqttOptions::new(
            format!("checkout-monitor-{}", uuid::Uuid::new_v4()),
            broker_host,
            broker_port,
        );
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let eventloop_task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "MQTT event loop error, reconnecting");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Self {
            client,
            topic,
            eventloop_task,
        }
    }

    /// Publish a dismiss for the given display device
    pub async fn send_dismiss(&self, target_device_id: &str) -> bool {
        let payload = json!({
            "text": "",
            "command": "dismiss",
            "targetDeviceId": target_device_id,
            "timestamp": Utc::now().to_rfc3339(),
        });

        match self
            .client
            .publish(
                &self.topic,
                QoS::AtLeastOnce,
                false,
                payload.to_string(),
            )
            .await
        {
            Ok(()) => {
                tracing::info!(target = %target_device_id, "Dismiss published");
                true
            }
            Err(e) => {
                tracing::warn!(
                    target = %target_device_id,
                    error = %e,
                    "Dismiss publish failed"
                );
                false
            }
        }
    }
}

impl Drop for DismissPublisher {
    fn drop(&mut self) {
        self.eventloop_task.abort();
    }
}

/// Maps lifecycle events to the notification protocol
pub struct NotificationGateway {
    notifier: DeviceNotifier,
    dismiss: Option<DismissPublisher>,
    config: Arc<AppConfig>,
}

impl NotificationGateway {
    pub fn new(
        notifier: DeviceNotifier,
        dismiss: Option<DismissPublisher>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            notifier,
            dismiss,
            config,
        }
    }

    /// From the config's MQTT section, if present
    pub fn from_config(config: Arc<AppConfig>, event_log: Arc<EventLogService>) -> Self {
        let notifier = DeviceNotifier::new(config.clone(), event_log);
        let dismiss = config.mqtt.as_ref().map(|m| {
            DismissPublisher::connect(&m.broker_host, m.broker_port, m.topic.clone())
        });
        Self::new(notifier, dismiss, config)
    }

    /// Fan a committed event out to the terminal (and display, for scans).
    /// view_list and plain state changes carry no notification.
    pub async fn notify_event(&self, event: &StateEvent) {
        match event.event_type {
            EventType::SessionStart => {
                self.notifier.send_session_start(&event.device_id).await;
            }
            EventType::ProductScan => {
                self.notifier.send_product_scan(&event.device_id).await;
                if let Some(dismiss) = &self.dismiss {
                    if let Some(target) = self.config.dismiss_target(&event.device_id) {
                        dismiss.send_dismiss(target).await;
                    }
                }
            }
            EventType::SessionEnd => {
                self.notifier.send_session_end(&event.device_id).await;
            }
            EventType::ViewList | EventType::StateChange => {}
        }
    }
}

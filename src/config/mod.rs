//! AppConfig - Device map, detection parameters, notification targets
//!
//! ## Responsibilities
//!
//! - Load YAML config (device map, detection section, optional MQTT section)
//! - Derive RTSP and notification URLs per device
//! - Env-var overrides for deployment-specific values
//!
//! Missing optional sections disable the dependent feature instead of
//! failing startup.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Port the device-side notification listener runs on
const NOTIFY_PORT: u16 = 9999;

/// Port of the per-device RTSP relay
const RTSP_PORT: u16 = 8554;

/// Per-device configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Terminal network address; RTSP and notification URLs derive from it
    pub hostip: String,

    /// Paired display device for the MQTT dismiss channel
    #[serde(default)]
    pub display_id: Option<String>,
}

/// Detection pipeline parameters
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Classifier service base URL
    #[serde(default = "default_classifier_url")]
    pub classifier_url: String,

    /// Number of classification workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Minimum confidence for a result to reach the state machine
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Frame sampling interval per device (milliseconds)
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

fn default_classifier_url() -> String {
    "http://127.0.0.1:9100".to_string()
}

fn default_worker_count() -> usize {
    5
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_sample_interval_ms() -> u64 {
    500
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            classifier_url: default_classifier_url(),
            worker_count: default_worker_count(),
            confidence_threshold: default_confidence_threshold(),
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

/// MQTT broker settings for the dismiss side-channel
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,

    #[serde(default = "default_mqtt_port")]
    pub broker_port: u16,

    pub topic: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// device_id -> device settings
    #[serde(default)]
    pub device: HashMap<String, DeviceConfig>,

    /// Detection pipeline parameters
    #[serde(default)]
    pub detection: DetectionConfig,

    /// MQTT dismiss channel; absent = feature disabled
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,

    /// Directory for day-partitioned JSONL logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl AppConfig {
    /// Load configuration from a YAML file and apply env overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config: AppConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))?;

        // Env overrides for deployment-specific values
        if let Ok(url) = std::env::var("CLASSIFIER_URL") {
            config.detection.classifier_url = url;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// RTSP URL for one device, or None if the device is unknown
    pub fn rtsp_url(&self, device_id: &str) -> Option<String> {
        self.device
            .get(device_id)
            .map(|d| format!("rtsp://{}:{}/{}", d.hostip, RTSP_PORT, device_id))
    }

    /// device_id -> RTSP URL for every configured device
    pub fn rtsp_urls(&self) -> HashMap<String, String> {
        self.device
            .keys()
            .filter_map(|id| self.rtsp_url(id).map(|url| (id.clone(), url)))
            .collect()
    }

    /// Notification endpoint for one device
    pub fn notify_url(&self, device_id: &str) -> Option<String> {
        self.device
            .get(device_id)
            .map(|d| format!("http://{}:{}/selfregistration/", d.hostip, NOTIFY_PORT))
    }

    /// Paired display device for the dismiss channel, if configured
    pub fn dismiss_target(&self, device_id: &str) -> Option<&str> {
        self.device
            .get(device_id)
            .and_then(|d| d.display_id.as_deref())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: HashMap::new(),
            detection: DetectionConfig::default(),
            mqtt: None,
            log_dir: default_log_dir(),
        }
    }
}

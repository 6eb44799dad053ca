//! Classifier - Screen Classification Adapter
//!
//! ## Responsibilities
//!
//! - Boundary to the external image classifier (one frame in, label +
//!   confidence out)
//! - Per-call error containment: any failure is "no usable result" for that
//!   frame, never fatal
//!
//! The model format and inference backend live behind this seam; the default
//! adapter talks HTTP to a classifier service.

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Classification of a single frame
#[derive(Debug, Clone)]
pub struct Classification {
    /// Top-1 label (expected: idle/start/scan/list/over)
    pub label: String,
    /// Top-1 confidence in [0, 1]
    pub confidence: f32,
    /// Full label -> probability map, when the backend returns one
    pub all_probs: Option<HashMap<String, f32>>,
}

/// Screen classifier boundary
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify one JPEG frame
    async fn classify(&self, frame: &[u8]) -> Result<Classification>;
}

/// Response shape of the classifier service
#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    label: String,
    confidence: f32,
    #[serde(default)]
    probs: Option<HashMap<String, f32>>,
}

/// HTTP-backed classifier adapter
pub struct HttpClassifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClassifier {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self { client, base_url }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, frame: &[u8]) -> Result<Classification> {
        let part = Part::bytes(frame.to_vec())
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| Error::Classifier(format!("invalid frame part: {}", e)))?;
        let form = Form::new().part("image", part);

        let url = format!("{}/classify", self.base_url);
        let resp = self.client.post(&url).multipart(form).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Api(format!(
                "classifier returned {}",
                resp.status()
            )));
        }

        let body: ClassifyResponse = resp
            .json()
            .await
            .map_err(|e| Error::Classifier(format!("invalid classifier response: {}", e)))?;

        Ok(Classification {
            label: body.label,
            confidence: body.confidence.clamp(0.0, 1.0),
            all_probs: body.probs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let json = r#"{"label": "scan", "confidence": 0.92, "probs": {"scan": 0.92, "list": 0.05}}"#;
        let resp: ClassifyResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.label, "scan");
        assert_eq!(resp.confidence, 0.92);
        assert_eq!(resp.probs.unwrap().len(), 2);
    }

    #[test]
    fn test_response_probs_optional() {
        let json = r#"{"label": "idle", "confidence": 0.7}"#;
        let resp: ClassifyResponse = serde_json::from_str(json).unwrap();
        assert!(resp.probs.is_none());
    }
}

//! checkout-monitor - Self-Checkout Screen Monitoring Service
//!
//! Watches the screen of each configured self-checkout terminal over RTSP,
//! classifies frames, and turns the noisy per-frame labels into reliable
//! session lifecycle events with device notifications.

use checkout_monitor::classifier::HttpClassifier;
use checkout_monitor::config::AppConfig;
use checkout_monitor::monitor::ScreenMonitor;
use checkout_monitor::stream_manager::{FfmpegSource, FrameSource};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "checkout_monitor=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/config.yaml".to_string());
    let config = Arc::new(AppConfig::load(&config_path)?);
    tracing::info!(
        config = %config_path,
        devices = config.device.len(),
        classifier_url = %config.detection.classifier_url,
        "Configuration loaded"
    );

    let classifier = Arc::new(HttpClassifier::new(
        config.detection.classifier_url.clone(),
    ));
    let monitor = ScreenMonitor::new(config.clone(), classifier);

    for (device_id, rtsp_url) in config.rtsp_urls() {
        tracing::info!(device_id = %device_id, rtsp_url = %rtsp_url, "Adding device stream");
        let source: Arc<dyn FrameSource> = Arc::new(FfmpegSource::new(rtsp_url));
        monitor.add_stream(&device_id, source).await;
    }

    monitor.start().await;
    tracing::info!("checkout-monitor running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    monitor.stop().await;
    Ok(())
}

//! StreamManager - Per-Device Frame Acquisition
//!
//! ## Responsibilities
//!
//! - Keep one fresh frame available per device despite unreliable sources
//! - Reconnect with fixed backoff on connect/read failure, forever
//! - Single-slot latest-frame cache: stale frames are overwritten, never
//!   queued
//!
//! Acquisition runs ffmpeg as a child process reading the RTSP source and
//! emitting an MJPEG stream on stdout; frames are split on JPEG SOI/EOI
//! markers. `kill_on_drop` guarantees the process dies with its reader.

use crate::error::{Error, Result};
use crate::stream_status::StreamStatusTracker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Fixed reconnect backoff
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Bounded join timeout on stop
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Read chunk size for the ffmpeg stdout pipe
const READ_CHUNK: usize = 64 * 1024;

/// Upper bound on a single buffered frame before the stream is considered
/// corrupt and the connection recycled
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// One captured frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// JPEG bytes
    pub data: Vec<u8>,
    /// Capture timestamp
    pub captured_at: DateTime<Utc>,
}

/// Opens connections to a video source
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn open(&self) -> Result<Box<dyn FrameReader>>;
}

/// One open connection delivering frames
#[async_trait]
pub trait FrameReader: Send {
    async fn read_frame(&mut self) -> Result<Frame>;
}

/// ffmpeg-backed RTSP source
pub struct FfmpegSource {
    rtsp_url: String,
}

impl FfmpegSource {
    pub fn new(rtsp_url: String) -> Self {
        Self { rtsp_url }
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    async fn open(&self) -> Result<Box<dyn FrameReader>> {
        // -rtsp_transport tcp: more reliable than UDP
        // -f image2pipe -vcodec mjpeg: continuous JPEG stream on stdout
        let mut child = Command::new("ffmpeg")
            .args([
                "-rtsp_transport", "tcp",
                "-i", &self.rtsp_url,
                "-f", "image2pipe",
                "-vcodec", "mjpeg",
                "-q:v", "5",
                "-loglevel", "error",
                "-",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Stream(format!("ffmpeg spawn failed: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Stream("ffmpeg stdout not captured".to_string()))?;

        Ok(Box::new(FfmpegReader {
            _child: child,
            stdout,
            buf: Vec::new(),
        }))
    }
}

/// Reads JPEG frames out of a running ffmpeg process
struct FfmpegReader {
    // Held so kill_on_drop fires when the reader is dropped
    _child: Child,
    stdout: ChildStdout,
    buf: Vec<u8>,
}

#[async_trait]
impl FrameReader for FfmpegReader {
    async fn read_frame(&mut self) -> Result<Frame> {
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            if let Some(frame) = extract_jpeg(&mut self.buf) {
                return Ok(Frame {
                    data: frame,
                    captured_at: Utc::now(),
                });
            }
            if self.buf.len() > MAX_FRAME_BYTES {
                return Err(Error::Stream("no frame boundary in stream".to_string()));
            }

            let n = self
                .stdout
                .read(&mut chunk)
                .await
                .map_err(|e| Error::Stream(format!("ffmpeg read failed: {}", e)))?;
            if n == 0 {
                return Err(Error::Stream("ffmpeg stream ended".to_string()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Extract one complete JPEG (SOI..EOI) from the front of `buf`
fn extract_jpeg(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let soi = find_marker(buf, 0, [0xFF, 0xD8])?;
    let eoi = find_marker(buf, soi + 2, [0xFF, 0xD9])?;
    let frame = buf[soi..eoi + 2].to_vec();
    buf.drain(..eoi + 2);
    Some(frame)
}

fn find_marker(buf: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|p| p + from)
}

/// Maintains a live connection to one device's video source and caches the
/// latest frame
pub struct StreamManager {
    device_id: String,
    source: Arc<dyn FrameSource>,
    latest: Arc<RwLock<Option<Frame>>>,
    running: Arc<RwLock<bool>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    status: Arc<StreamStatusTracker>,
}

impl StreamManager {
    pub fn new(
        device_id: String,
        source: Arc<dyn FrameSource>,
        status: Arc<StreamStatusTracker>,
    ) -> Self {
        Self {
            device_id,
            source,
            latest: Arc::new(RwLock::new(None)),
            running: Arc::new(RwLock::new(false)),
            handle: Mutex::new(None),
            status,
        }
    }

    /// Start the acquisition loop; idempotent if already running
    pub async fn start(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!(device_id = %self.device_id, "Stream already running");
                return;
            }
            *running = true;
        }

        let device_id = self.device_id.clone();
        let source = self.source.clone();
        let latest = self.latest.clone();
        let running = self.running.clone();
        let status = self.status.clone();

        let handle = tokio::spawn(async move {
            Self::acquisition_loop(device_id, source, latest, running, status).await;
        });
        *self.handle.lock().await = Some(handle);
    }

    /// Every error in here is transient; the loop only exits on stop()
    async fn acquisition_loop(
        device_id: String,
        source: Arc<dyn FrameSource>,
        latest: Arc<RwLock<Option<Frame>>>,
        running: Arc<RwLock<bool>>,
        status: Arc<StreamStatusTracker>,
    ) {
        let mut reader: Option<Box<dyn FrameReader>> = None;

        while *running.read().await {
            if reader.is_none() {
                match source.open().await {
                    Ok(r) => {
                        status.update_status(&device_id, true).await;
                        tracing::info!(device_id = %device_id, "Stream connected");
                        reader = Some(r);
                    }
                    Err(e) => {
                        status.update_status(&device_id, false).await;
                        tracing::warn!(
                            device_id = %device_id,
                            error = %e,
                            retry_in_secs = RECONNECT_DELAY.as_secs(),
                            "Stream connect failed"
                        );
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                }
            }

            let read = match reader.as_mut() {
                Some(r) => r.read_frame().await,
                None => continue,
            };

            match read {
                Ok(frame) => {
                    *latest.write().await = Some(frame);
                }
                Err(e) => {
                    // Release the connection and back off
                    reader = None;
                    status.update_status(&device_id, false).await;
                    tracing::warn!(
                        device_id = %device_id,
                        error = %e,
                        "Frame read failed, reconnecting"
                    );
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }

        tracing::info!(device_id = %device_id, "Stream acquisition stopped");
    }

    /// Defensive copy of the latest cached frame; never blocks acquisition
    pub async fn get_frame(&self) -> Option<Frame> {
        self.latest.read().await.clone()
    }

    /// Whether at least one frame has ever arrived
    pub async fn has_frame(&self) -> bool {
        self.latest.read().await.is_some()
    }

    /// Signal loop termination and join with a bounded timeout; a loop
    /// wedged in a read is aborted so the reader (and its ffmpeg child)
    /// is always released
    pub async fn stop(&self) {
        *self.running.write().await = false;

        if let Some(mut handle) = self.handle.lock().await.take() {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    device_id = %self.device_id,
                    "Acquisition loop did not stop in time, aborting"
                );
                handle.abort();
                let _ = handle.await;
            }
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// In-memory source: fails to read after `fail_after` frames, then
    /// reconnects cleanly
    struct StubSource {
        opens: Arc<AtomicU32>,
        fail_after: u32,
    }

    struct StubReader {
        reads: u32,
        fail_after: u32,
        seq: Arc<AtomicU32>,
    }

    #[async_trait]
    impl FrameSource for StubSource {
        async fn open(&self) -> Result<Box<dyn FrameReader>> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubReader {
                reads: 0,
                fail_after: self.fail_after,
                seq: Arc::new(AtomicU32::new(n * 1000)),
            }))
        }
    }

    #[async_trait]
    impl FrameReader for StubReader {
        async fn read_frame(&mut self) -> Result<Frame> {
            if self.reads >= self.fail_after {
                return Err(Error::Stream("stub read failure".to_string()));
            }
            self.reads += 1;
            let n = self.seq.fetch_add(1, Ordering::SeqCst);
            // Pace the stub so the test loop does not spin
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Frame {
                data: n.to_be_bytes().to_vec(),
                captured_at: Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn test_latest_frame_is_overwritten() {
        let status = Arc::new(StreamStatusTracker::new());
        let opens = Arc::new(AtomicU32::new(0));
        let source = Arc::new(StubSource {
            opens: opens.clone(),
            fail_after: u32::MAX,
        });
        let manager = StreamManager::new("dev-1".into(), source, status);

        assert!(manager.get_frame().await.is_none());
        manager.start().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let first = manager.get_frame().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = manager.get_frame().await.unwrap();
        assert!(second.data > first.data, "cache should hold newer frames");

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let status = Arc::new(StreamStatusTracker::new());
        let opens = Arc::new(AtomicU32::new(0));
        let source = Arc::new(StubSource {
            opens: opens.clone(),
            fail_after: u32::MAX,
        });
        let manager = StreamManager::new("dev-1".into(), source, status);

        manager.start().await;
        manager.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_read_failure() {
        let status = Arc::new(StreamStatusTracker::new());
        let opens = Arc::new(AtomicU32::new(0));
        let source = Arc::new(StubSource {
            opens: opens.clone(),
            fail_after: 2,
        });
        let manager = StreamManager::new("dev-1".into(), source, status);

        manager.start().await;
        // Two reads, a failure, the 5s backoff, then a reconnect
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(opens.load(Ordering::SeqCst) >= 2);
        assert!(manager.has_frame().await);

        manager.stop().await;
    }

    /// Source whose reader blocks forever in read_frame; dropping the
    /// reader flips the flag so release is observable
    struct WedgedSource {
        released: Arc<AtomicBool>,
    }

    struct WedgedReader {
        released: Arc<AtomicBool>,
    }

    impl Drop for WedgedReader {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FrameSource for WedgedSource {
        async fn open(&self) -> Result<Box<dyn FrameReader>> {
            Ok(Box::new(WedgedReader {
                released: self.released.clone(),
            }))
        }
    }

    #[async_trait]
    impl FrameReader for WedgedReader {
        async fn read_frame(&mut self) -> Result<Frame> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_wedged_reader() {
        let status = Arc::new(StreamStatusTracker::new());
        let released = Arc::new(AtomicBool::new(false));
        let source = Arc::new(WedgedSource {
            released: released.clone(),
        });
        let manager = StreamManager::new("dev-1".into(), source, status);

        manager.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!released.load(Ordering::SeqCst));

        // The loop never observes the flag (stuck in read_frame); stop must
        // abort it and drop the reader before returning
        manager.stop().await;
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_extract_jpeg_from_stream() {
        let mut buf = vec![0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0xFF, 0xD8, 0x03];
        let frame = extract_jpeg(&mut buf).unwrap();
        assert_eq!(frame, vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
        // Remainder keeps the partial next frame
        assert_eq!(buf, vec![0xFF, 0xD8, 0x03]);
        assert!(extract_jpeg(&mut buf).is_none());
    }
}

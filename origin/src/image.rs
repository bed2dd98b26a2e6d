//! Image acquisition pipeline
//!
//! `NewImageReady` notifications turn into HTTP downloads from the device's
//! image server. Completed downloads update the camera state machine and are
//! published as events.

use crate::camera::CameraState;
use crate::client::BackendState;
use crate::error::{OriginError, OriginResult};
use crate::event::{DownloadedImage, OriginEvent};
use crate::protocol::IMAGE_PATH_PREFIX;
use crate::ORIGIN_DEFAULT_PORT;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Format of a remote image, detected from its file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageFormat {
    /// Full-quality snapshot
    Tiff,
    /// Live-view frame
    Jpeg,
    Raw,
}

impl ImageFormat {
    pub fn from_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".tif") || lower.ends_with(".tiff") {
            ImageFormat::Tiff
        } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
            ImageFormat::Jpeg
        } else {
            ImageFormat::Raw
        }
    }

    /// TIFF images are snapshots, anything else belongs to the live stream
    pub fn is_snapshot(&self) -> bool {
        *self == ImageFormat::Tiff
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ImageFormat::Tiff => "TIFF",
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Raw => "RAW",
        }
    }
}

/// Metadata from the most recent `NewImageReady`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageNotification {
    pub remote_path: String,
    /// Radians
    pub ra: f64,
    /// Radians
    pub dec: f64,
    pub exposure: f64,
}

/// One download to run
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub notification: ImageNotification,
    pub format: ImageFormat,
    /// The download finishes an exposure started with `start_exposure`
    pub exposure_driven: bool,
}

impl DownloadRequest {
    pub fn new(notification: ImageNotification, exposure_driven: bool) -> Self {
        let format = ImageFormat::from_path(&notification.remote_path);
        Self {
            notification,
            format,
            exposure_driven,
        }
    }
}

/// Build the image server URL for a remote path
pub fn image_url(host: &str, port: u16, remote_path: &str) -> String {
    let path = remote_path.trim_start_matches('/');
    if port == ORIGIN_DEFAULT_PORT {
        format!("http://{}{}{}", host, IMAGE_PATH_PREFIX, path)
    } else {
        format!("http://{}:{}{}{}", host, port, IMAGE_PATH_PREFIX, path)
    }
}

/// Fetches image bytes from the device
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, host: &str, remote_path: &str) -> OriginResult<Vec<u8>>;
}

/// [`ImageSource`] backed by the device's HTTP image server
pub struct HttpImageSource {
    http_client: reqwest::Client,
    port: u16,
}

impl HttpImageSource {
    pub fn new(timeout: Duration, port: u16) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to configure image HTTP client ({}), using defaults", e);
                reqwest::Client::new()
            });
        Self { http_client, port }
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, host: &str, remote_path: &str) -> OriginResult<Vec<u8>> {
        let url = image_url(host, self.port, remote_path);
        debug!("Downloading image from {}", url);

        let download_err = |e: reqwest::Error| OriginError::Download {
            path: remote_path.to_string(),
            message: e.to_string(),
        };

        let response = self
            .http_client
            .get(&url)
            .header("Cache-Control", "no-cache")
            .header("Accept", "*/*")
            .send()
            .await
            .map_err(download_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(OriginError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let bytes = response.bytes().await.map_err(download_err)?;
        Ok(bytes.to_vec())
    }
}

/// Runs downloads and applies their results to the shared backend state
#[derive(Clone)]
pub struct ImagePipeline {
    source: Arc<dyn ImageSource>,
    state: Arc<RwLock<BackendState>>,
    event_tx: broadcast::Sender<OriginEvent>,
}

impl ImagePipeline {
    pub(crate) fn new(
        source: Arc<dyn ImageSource>,
        state: Arc<RwLock<BackendState>>,
        event_tx: broadcast::Sender<OriginEvent>,
    ) -> Self {
        Self {
            source,
            state,
            event_tx,
        }
    }

    /// Start a download task. Downloads are never cancelled once started.
    pub fn spawn_download(&self, host: String, request: DownloadRequest) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let result = pipeline
                .source
                .fetch(&host, &request.notification.remote_path)
                .await;
            pipeline.complete(request, result).await;
        })
    }

    pub(crate) async fn complete(&self, request: DownloadRequest, result: OriginResult<Vec<u8>>) {
        let path = request.notification.remote_path.clone();

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Image download failed for {}: {}", path, e);
                let mut state = self.state.write().await;
                if request.format.is_snapshot() {
                    state.snapshot_in_flight = false;
                }
                if request.exposure_driven && state.camera.download_failed().is_ok() {
                    drop(state);
                    self.emit(OriginEvent::CameraStateChanged(CameraState::Error));
                }
                return;
            }
        };

        debug!(
            "Downloaded {} bytes ({}) from {}",
            bytes.len(),
            request.format.tag(),
            path
        );
        let data = Arc::new(bytes);
        let image = DownloadedImage {
            remote_path: path.clone(),
            data: data.clone(),
            ra: request.notification.ra,
            dec: request.notification.dec,
            exposure: request.notification.exposure,
            format: request.format,
        };

        if request.exposure_driven {
            let mut state = self.state.write().await;
            match state.camera.download_finished(data.clone(), request.format) {
                Ok(()) => {
                    state.image_ready = true;
                    drop(state);
                    info!("Exposure image ready: {}", path);
                    self.emit(OriginEvent::ImageReady {
                        remote_path: path.clone(),
                    });
                    self.emit(OriginEvent::CameraStateChanged(CameraState::Idle));
                }
                Err(e) => debug!("Exposure download for {} arrived late: {}", path, e),
            }
        }

        if request.format.is_snapshot() {
            self.state.write().await.snapshot_in_flight = false;
            info!("Snapshot complete, resuming live stream");
            self.emit(OriginEvent::SnapshotDownloaded(image));
        } else if !request.exposure_driven {
            match ::image::load_from_memory(&data) {
                Ok(frame) => {
                    let mut state = self.state.write().await;
                    state.last_live_image = Some(frame);
                    state.image_ready = true;
                    drop(state);
                    self.emit(OriginEvent::LiveImageDownloaded(image));
                }
                Err(e) => warn!("Live frame {}: {}", path, OriginError::from(e)),
            }
        }
    }

    fn emit(&self, event: OriginEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn pipeline() -> (
        ImagePipeline,
        Arc<RwLock<BackendState>>,
        broadcast::Receiver<OriginEvent>,
    ) {
        struct Unused;
        #[async_trait]
        impl ImageSource for Unused {
            async fn fetch(&self, _: &str, _: &str) -> OriginResult<Vec<u8>> {
                Err(OriginError::NoHost)
            }
        }

        let state = Arc::new(RwLock::new(BackendState::default()));
        let (tx, rx) = broadcast::channel(32);
        (
            ImagePipeline::new(Arc::new(Unused), state.clone(), tx),
            state,
            rx,
        )
    }

    fn notification(path: &str) -> ImageNotification {
        ImageNotification {
            remote_path: path.to_string(),
            ra: 1.0,
            dec: 0.5,
            exposure: 2.0,
        }
    }

    fn tiny_png() -> Vec<u8> {
        let img = ::image::RgbImage::from_pixel(2, 2, ::image::Rgb([10, 20, 30]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ::image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(ImageFormat::from_path("Images/a.TIFF"), ImageFormat::Tiff);
        assert_eq!(ImageFormat::from_path("a.tif"), ImageFormat::Tiff);
        assert_eq!(ImageFormat::from_path("live/0.jpg"), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::from_path("x.JPEG"), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::from_path("frame.fits"), ImageFormat::Raw);
        assert!(ImageFormat::Tiff.is_snapshot());
        assert!(!ImageFormat::Jpeg.is_snapshot());
        assert_eq!(ImageFormat::Raw.tag(), "RAW");
    }

    #[test]
    fn test_image_url() {
        assert_eq!(
            image_url("192.168.1.20", 80, "Images/Temp/0.jpg"),
            "http://192.168.1.20/SmartScope-1.0/dev2/Images/Temp/0.jpg"
        );
        assert_eq!(
            image_url("localhost", 8080, "/Images/x.tiff"),
            "http://localhost:8080/SmartScope-1.0/dev2/Images/x.tiff"
        );
    }

    #[tokio::test]
    async fn test_exposure_download_success() {
        let (pipeline, state, mut rx) = pipeline();
        {
            let mut s = state.write().await;
            s.camera.begin_exposure(1.0, 200, Utc::now()).unwrap();
            s.camera.image_arrived();
            s.snapshot_in_flight = true;
        }

        let request = DownloadRequest::new(notification("Images/shot.tiff"), true);
        pipeline.complete(request, Ok(vec![7u8; 64])).await;

        let s = state.read().await;
        assert_eq!(s.camera.state(), CameraState::Idle);
        assert!(s.image_ready);
        assert!(!s.snapshot_in_flight);
        assert_eq!(s.camera.record().format, Some(ImageFormat::Tiff));
        assert_eq!(s.camera.record().data.as_ref().map(|d| d.len()), Some(64));
        drop(s);

        assert!(matches!(rx.recv().await.unwrap(), OriginEvent::ImageReady { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            OriginEvent::CameraStateChanged(CameraState::Idle)
        ));
        match rx.recv().await.unwrap() {
            OriginEvent::SnapshotDownloaded(img) => {
                assert_eq!(img.ra, 1.0);
                assert_eq!(img.exposure, 2.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exposure_download_failure_sets_error() {
        let (pipeline, state, mut rx) = pipeline();
        {
            let mut s = state.write().await;
            s.camera.begin_exposure(1.0, 200, Utc::now()).unwrap();
            s.camera.image_arrived();
            s.snapshot_in_flight = true;
        }

        let request = DownloadRequest::new(notification("Images/shot.tiff"), true);
        pipeline
            .complete(
                request,
                Err(OriginError::HttpStatus {
                    status: 500,
                    url: "http://x".to_string(),
                }),
            )
            .await;

        let s = state.read().await;
        assert_eq!(s.camera.state(), CameraState::Error);
        assert!(!s.snapshot_in_flight);
        assert!(!s.image_ready);
        drop(s);
        assert!(matches!(
            rx.recv().await.unwrap(),
            OriginEvent::CameraStateChanged(CameraState::Error)
        ));
    }

    #[tokio::test]
    async fn test_live_frame_decoded() {
        let (pipeline, state, mut rx) = pipeline();
        let request = DownloadRequest::new(notification("Images/Temp/0.jpg"), false);
        pipeline.complete(request, Ok(tiny_png())).await;

        let s = state.read().await;
        assert!(s.image_ready);
        assert_eq!(s.last_live_image.as_ref().map(|i| i.width()), Some(2));
        assert_eq!(s.camera.state(), CameraState::Idle);
        drop(s);
        assert!(matches!(
            rx.recv().await.unwrap(),
            OriginEvent::LiveImageDownloaded(_)
        ));
    }

    #[tokio::test]
    async fn test_undecodable_live_frame_dropped() {
        let (pipeline, state, mut rx) = pipeline();
        let request = DownloadRequest::new(notification("Images/Temp/0.jpg"), false);
        pipeline.complete(request, Ok(vec![0, 1, 2, 3])).await;

        let s = state.read().await;
        assert!(!s.image_ready);
        assert!(s.last_live_image.is_none());
        drop(s);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_http_source_reports_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        });

        let source = HttpImageSource::new(Duration::from_secs(5), port);
        let err = source.fetch("127.0.0.1", "Images/missing.jpg").await.unwrap_err();
        match err {
            OriginError::HttpStatus { status, url } => {
                assert_eq!(status, 404);
                assert!(url.ends_with("/SmartScope-1.0/dev2/Images/missing.jpg"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}

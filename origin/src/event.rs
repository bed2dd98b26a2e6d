//! Typed events raised by the Origin client

use crate::camera::CameraState;
use crate::image::ImageFormat;
use crate::TelescopeStatus;
use std::sync::Arc;

/// A downloaded image with the metadata of the notification that announced it
#[derive(Debug, Clone)]
pub struct DownloadedImage {
    pub remote_path: String,
    pub data: Arc<Vec<u8>>,
    /// Right ascension in radians, as reported by the device
    pub ra: f64,
    /// Declination in radians, as reported by the device
    pub dec: f64,
    pub exposure: f64,
    pub format: ImageFormat,
}

/// Origin client event
#[derive(Debug, Clone)]
pub enum OriginEvent {
    /// WebSocket handshake completed
    Connected,
    /// Transport closed, locally or by the device
    Disconnected,
    /// Aggregated status was recomputed from telemetry
    StatusUpdated(TelescopeStatus),
    ExposureStarted,
    /// Image notification arrived for a running exposure
    ExposureComplete,
    CameraStateChanged(CameraState),
    CameraModeChanged {
        is_manual: bool,
    },
    CaptureParametersChanged {
        exposure: f64,
        iso: i32,
    },
    CameraInfoReceived {
        camera_id: String,
        model: String,
    },
    SnapshotRequested,
    /// Exposure image downloaded and stored
    ImageReady {
        remote_path: String,
    },
    SnapshotDownloaded(DownloadedImage),
    LiveImageDownloaded(DownloadedImage),
}

//! Origin camera control
//!
//! Holds the acquisition state machine and the `OriginCamera` wrapper that
//! turns camera operations into protocol commands.

use crate::client::OriginClient;
use crate::error::{OriginError, OriginResult};
use crate::event::OriginEvent;
use crate::image::{ImageFormat, ImageNotification};
use crate::protocol::{commands, destinations};
use chrono::{DateTime, Utc};
use ::image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Camera acquisition state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraState {
    Idle = 0,
    Exposing = 1,
    Reading = 2,
    Error = 3,
}

impl From<i32> for CameraState {
    fn from(value: i32) -> Self {
        match value {
            0 => CameraState::Idle,
            1 => CameraState::Exposing,
            2 => CameraState::Reading,
            _ => CameraState::Error,
        }
    }
}

impl std::fmt::Display for CameraState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraState::Idle => write!(f, "Idle"),
            CameraState::Exposing => write!(f, "Exposing"),
            CameraState::Reading => write!(f, "Reading"),
            CameraState::Error => write!(f, "Error"),
        }
    }
}

/// Parameters and result of the most recent exposure
#[derive(Debug, Clone, Default)]
pub struct ExposureRecord {
    pub duration_secs: f64,
    pub gain: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub data: Option<Arc<Vec<u8>>>,
    pub format: Option<ImageFormat>,
}

/// Acquisition state machine.
///
/// Idle -> Exposing -> Reading -> Idle | Error. Only `Idle` accepts a new
/// exposure and only `reset_error` leaves `Error`.
#[derive(Debug, Clone)]
pub struct CameraStateMachine {
    state: CameraState,
    record: ExposureRecord,
}

impl Default for CameraStateMachine {
    fn default() -> Self {
        Self {
            state: CameraState::Idle,
            record: ExposureRecord {
                gain: 200,
                ..Default::default()
            },
        }
    }
}

impl CameraStateMachine {
    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn record(&self) -> &ExposureRecord {
        &self.record
    }

    /// Check the guard for a new exposure without changing anything
    pub fn can_start(&self) -> OriginResult<()> {
        match self.state {
            CameraState::Idle => Ok(()),
            other => Err(OriginError::CameraBusy(other)),
        }
    }

    /// Idle -> Exposing
    pub fn begin_exposure(
        &mut self,
        duration_secs: f64,
        gain: i32,
        now: DateTime<Utc>,
    ) -> OriginResult<()> {
        self.can_start()?;
        self.record = ExposureRecord {
            duration_secs,
            gain,
            start_time: Some(now),
            data: None,
            format: None,
        };
        self.state = CameraState::Exposing;
        Ok(())
    }

    /// Exposing -> Idle
    pub fn abort(&mut self) -> OriginResult<()> {
        self.require_state(CameraState::Exposing)?;
        self.state = CameraState::Idle;
        Ok(())
    }

    /// Exposing -> Reading. Returns false if no exposure was waiting.
    pub fn image_arrived(&mut self) -> bool {
        if self.state == CameraState::Exposing {
            self.state = CameraState::Reading;
            true
        } else {
            false
        }
    }

    /// Reading -> Idle, keeping the downloaded bytes
    pub fn download_finished(
        &mut self,
        data: Arc<Vec<u8>>,
        format: ImageFormat,
    ) -> OriginResult<()> {
        self.require_state(CameraState::Reading)?;
        self.record.data = Some(data);
        self.record.format = Some(format);
        self.state = CameraState::Idle;
        Ok(())
    }

    /// Reading -> Error
    pub fn download_failed(&mut self) -> OriginResult<()> {
        self.require_state(CameraState::Reading)?;
        self.state = CameraState::Error;
        Ok(())
    }

    /// Error -> Idle
    pub fn reset_error(&mut self) -> OriginResult<()> {
        self.require_state(CameraState::Error)?;
        self.state = CameraState::Idle;
        Ok(())
    }

    pub(crate) fn set_gain(&mut self, gain: i32) {
        self.record.gain = gain;
    }

    fn require_state(&self, expected: CameraState) -> OriginResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(OriginError::InvalidCameraState {
                expected,
                actual: self.state,
            })
        }
    }
}

/// Cached capture parameters reported by or sent to the camera
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub exposure_secs: f64,
    pub iso: i32,
    pub manual_mode: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            exposure_secs: 0.1,
            iso: 200,
            manual_mode: false,
        }
    }
}

/// Origin camera wrapper
pub struct OriginCamera {
    client: Arc<RwLock<OriginClient>>,
}

impl OriginCamera {
    /// Create a new Origin camera wrapper
    pub fn new(client: Arc<RwLock<OriginClient>>) -> Self {
        Self { client }
    }

    /// Start an exposure. Requires a logical connection and an idle camera.
    pub async fn start_exposure(&self, duration_secs: f64, iso: i32) -> OriginResult<()> {
        let client = self.client.read().await;
        if !client.is_logically_connected().await {
            warn!("Cannot start exposure - not connected");
            return Err(OriginError::NotLogicallyConnected);
        }

        let shared = client.shared();
        let mut state = shared.write().await;
        if let Err(e) = state.camera.can_start() {
            warn!("Cannot start exposure - camera busy ({})", state.camera.state());
            return Err(e);
        }

        client
            .dispatcher()
            .send_command(
                commands::RUN_SAMPLE_CAPTURE,
                destinations::TASK_CONTROLLER,
                json!({ "ExposureTime": duration_secs, "ISO": iso }),
            )
            .await?;

        state.camera.begin_exposure(duration_secs, iso, Utc::now())?;
        state.image_ready = false;
        state.last_live_image = None;
        drop(state);

        info!("Started exposure: {} sec, ISO: {}", duration_secs, iso);
        client.emit(OriginEvent::ExposureStarted);
        client.emit(OriginEvent::CameraStateChanged(CameraState::Exposing));
        Ok(())
    }

    /// Abort a running exposure. Any download already issued still completes.
    pub async fn abort_exposure(&self) -> OriginResult<()> {
        let client = self.client.read().await;
        let shared = client.shared();
        let mut state = shared.write().await;
        if state.camera.state() != CameraState::Exposing {
            return Err(OriginError::InvalidCameraState {
                expected: CameraState::Exposing,
                actual: state.camera.state(),
            });
        }

        client
            .dispatcher()
            .send_command(commands::ABORT_EXPOSURE, destinations::CAMERA, json!({}))
            .await?;

        state.camera.abort()?;
        drop(state);

        info!("Aborted exposure");
        client.emit(OriginEvent::CameraStateChanged(CameraState::Idle));
        Ok(())
    }

    /// Clear a failed download so exposures can start again
    pub async fn reset_error(&self) -> OriginResult<()> {
        let client = self.client.read().await;
        client.shared().write().await.camera.reset_error()?;
        client.emit(OriginEvent::CameraStateChanged(CameraState::Idle));
        Ok(())
    }

    /// Set gain (ISO on this camera) for subsequent exposures
    pub async fn set_gain(&self, gain: i32) -> OriginResult<()> {
        let client = self.client.read().await;
        if !client.is_logically_connected().await {
            return Err(OriginError::NotLogicallyConnected);
        }

        let shared = client.shared();
        let mut state = shared.write().await;
        let exposure = state.camera.record().duration_secs;
        client
            .dispatcher()
            .send_command(
                commands::SET_CAPTURE_PARAMETERS,
                destinations::CAMERA,
                json!({ "ISO": gain, "Exposure": exposure }),
            )
            .await?;
        state.camera.set_gain(gain);
        info!("Set gain/ISO to: {}", gain);
        Ok(())
    }

    /// Request a single snapshot. Live frames are suppressed until it lands.
    pub async fn take_snapshot(&self, exposure_secs: f64, iso: i32) -> OriginResult<()> {
        let client = self.client.read().await;
        let shared = client.shared();
        let mut state = shared.write().await;
        client
            .dispatcher()
            .send_command(
                commands::RUN_SAMPLE_CAPTURE,
                destinations::TASK_CONTROLLER,
                json!({ "ExposureTime": exposure_secs, "ISO": iso }),
            )
            .await?;
        state.snapshot_in_flight = true;
        drop(state);

        info!("Taking snapshot: exposure = {} ISO = {}", exposure_secs, iso);
        client.emit(OriginEvent::SnapshotRequested);
        Ok(())
    }

    /// Snapshot with the cached capture settings
    pub async fn take_single_snapshot(&self) -> OriginResult<()> {
        let settings = self.capture_settings().await;
        self.take_snapshot(settings.exposure_secs, settings.iso).await
    }

    pub async fn set_manual_mode(&self) -> OriginResult<()> {
        self.send(commands::SET_ENABLE_MANUAL, destinations::LIVE_STREAM, json!({}))
            .await
    }

    pub async fn set_auto_mode(&self) -> OriginResult<()> {
        self.send(commands::SET_ENABLE_AUTO, destinations::LIVE_STREAM, json!({}))
            .await
    }

    pub async fn get_camera_mode(&self) -> OriginResult<()> {
        self.send(commands::GET_ENABLE_MANUAL, destinations::LIVE_STREAM, json!({}))
            .await
    }

    pub async fn get_capture_parameters(&self) -> OriginResult<()> {
        self.send(commands::GET_CAPTURE_PARAMETERS, destinations::CAMERA, json!({}))
            .await
    }

    pub async fn set_capture_parameters(&self, exposure_secs: f64, iso: i32) -> OriginResult<()> {
        self.send(
            commands::SET_CAPTURE_PARAMETERS,
            destinations::CAMERA,
            json!({ "Exposure": exposure_secs, "ISO": iso }),
        )
        .await
    }

    /// Change exposure keeping the cached ISO
    pub async fn set_exposure(&self, seconds: f64) -> OriginResult<()> {
        let iso = self.capture_settings().await.iso;
        self.set_capture_parameters(seconds, iso).await
    }

    /// Change ISO keeping the cached exposure
    pub async fn set_iso(&self, iso: i32) -> OriginResult<()> {
        let exposure = self.capture_settings().await.exposure_secs;
        self.set_capture_parameters(exposure, iso).await
    }

    pub async fn get_camera_info(&self) -> OriginResult<()> {
        self.send(commands::GET_CAMERA_INFO, destinations::CAMERA, json!({}))
            .await
    }

    /// Start a named imaging session and return its uuid.
    ///
    /// Does not wait for frames; results arrive as `NewImageReady`
    /// notifications.
    pub async fn start_imaging(
        &self,
        gain: i32,
        binning: i32,
        exposure_micros: u64,
    ) -> OriginResult<String> {
        let client = self.client.read().await;
        let dispatcher = client.dispatcher();
        let session = uuid::Uuid::new_v4().to_string();

        dispatcher
            .send_command(
                commands::SET_CAPTURE_PARAMETERS,
                destinations::CAMERA,
                json!({
                    "ISO": gain,
                    "Binning": binning,
                    "Exposure": exposure_micros as f64 / 1_000_000.0,
                }),
            )
            .await?;
        dispatcher
            .send_command(
                commands::RUN_IMAGING,
                destinations::TASK_CONTROLLER,
                json!({
                    "Name": format!("AlpacaCapture_{}", Utc::now().format("%Y%m%d_%H%M%S")),
                    "Uuid": session,
                    "SaveRawImage": true,
                }),
            )
            .await?;

        info!("Imaging session {} started", session);
        Ok(session)
    }

    pub async fn cancel_imaging(&self) -> OriginResult<()> {
        self.send(commands::CANCEL_IMAGING, destinations::TASK_CONTROLLER, json!({}))
            .await
    }

    async fn send(
        &self,
        command: &str,
        destination: &str,
        params: serde_json::Value,
    ) -> OriginResult<()> {
        let client = self.client.read().await;
        client
            .dispatcher()
            .send_command(command, destination, params)
            .await
            .map(|_| ())
    }

    // =========================================================================
    // Cached state accessors
    // =========================================================================

    pub async fn state(&self) -> CameraState {
        self.client.read().await.shared().read().await.camera.state()
    }

    pub async fn is_exposing(&self) -> bool {
        self.state().await == CameraState::Exposing
    }

    pub async fn is_image_ready(&self) -> bool {
        self.client.read().await.shared().read().await.image_ready
    }

    pub async fn is_snapshot_in_flight(&self) -> bool {
        self.client.read().await.shared().read().await.snapshot_in_flight
    }

    pub async fn exposure_record(&self) -> ExposureRecord {
        self.client
            .read()
            .await
            .shared()
            .read()
            .await
            .camera
            .record()
            .clone()
    }

    /// Raw bytes of the last exposure-driven download
    pub async fn last_image_data(&self) -> Option<Arc<Vec<u8>>> {
        self.exposure_record().await.data
    }

    pub async fn last_image_format(&self) -> Option<ImageFormat> {
        self.exposure_record().await.format
    }

    pub async fn last_exposure_duration(&self) -> f64 {
        self.exposure_record().await.duration_secs
    }

    pub async fn last_exposure_start(&self) -> Option<DateTime<Utc>> {
        self.exposure_record().await.start_time
    }

    pub async fn current_gain(&self) -> i32 {
        self.exposure_record().await.gain
    }

    /// Last decoded live-view frame
    pub async fn last_image(&self) -> Option<DynamicImage> {
        self.client
            .read()
            .await
            .shared()
            .read()
            .await
            .last_live_image
            .clone()
    }

    pub async fn capture_settings(&self) -> CaptureSettings {
        self.client.read().await.shared().read().await.capture
    }

    pub async fn last_notification(&self) -> Option<ImageNotification> {
        self.client
            .read()
            .await
            .shared()
            .read()
            .await
            .last_notification
            .clone()
    }
}

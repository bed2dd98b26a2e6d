//! Inbound message routing
//!
//! Every text frame read from the socket passes through [`MessageRouter`],
//! one frame at a time and in receipt order.

use crate::camera::CameraState;
use crate::client::BackendState;
use crate::dispatcher::Dispatcher;
use crate::error::OriginError;
use crate::event::OriginEvent;
use crate::image::{DownloadRequest, ImageNotification, ImagePipeline};
use crate::protocol::{commands, InboundMessage};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct MessageRouter {
    dispatcher: Arc<Dispatcher>,
    state: Arc<RwLock<BackendState>>,
    event_tx: broadcast::Sender<OriginEvent>,
    pipeline: ImagePipeline,
}

impl MessageRouter {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        state: Arc<RwLock<BackendState>>,
        event_tx: broadcast::Sender<OriginEvent>,
        pipeline: ImagePipeline,
    ) -> Self {
        Self {
            dispatcher,
            state,
            event_tx,
            pipeline,
        }
    }

    /// Handle one inbound text frame
    pub async fn handle_text(&self, text: &str) {
        let Some(msg) = InboundMessage::parse(text) else {
            debug!("Discarding non-object frame");
            return;
        };

        if msg.is_response() {
            if let Some(id) = msg.sequence_id {
                if self.dispatcher.resolve(id).await.is_none() {
                    debug!("Response {} ({}) matches no pending command", id, msg.command);
                }
            }

            if msg.error_code != 0 {
                warn!(
                    "Command error: {} {} {}",
                    msg.command,
                    msg.error_code,
                    msg.error_message.as_deref().unwrap_or_default()
                );
                return;
            }
        }

        self.update_telemetry(&msg).await;

        if msg.is_response() {
            self.handle_response(&msg).await;
        }

        if msg.is_notification() && msg.command == commands::NEW_IMAGE_READY {
            if let Some(request) = self.on_new_image_ready(&msg).await {
                self.start_download(request).await;
            }
        }
    }

    async fn update_telemetry(&self, msg: &InboundMessage) {
        let mut state = self.state.write().await;
        let Some(category) = state.telemetry.process(msg) else {
            return;
        };
        if !category.affects_status() {
            return;
        }

        let BackendState {
            telemetry, status, ..
        } = &mut *state;
        telemetry.apply_to_status(status);
        let snapshot = status.clone();
        drop(state);

        self.emit(OriginEvent::StatusUpdated(snapshot));
    }

    async fn handle_response(&self, msg: &InboundMessage) {
        match msg.command.as_str() {
            commands::RUN_SAMPLE_CAPTURE => {
                debug!("Exposure command acknowledged");
            }
            commands::GET_CAPTURE_PARAMETERS => {
                let exposure = msg.f64_field("Exposure");
                let iso = msg.i64_field("ISO") as i32;
                {
                    let mut state = self.state.write().await;
                    state.capture.exposure_secs = exposure;
                    state.capture.iso = iso;
                }
                self.emit(OriginEvent::CaptureParametersChanged { exposure, iso });
            }
            commands::GET_ENABLE_MANUAL | commands::SET_ENABLE_MANUAL | commands::SET_ENABLE_AUTO => {
                if let Some(is_manual) = msg.bool_field("IsManual") {
                    self.state.write().await.capture.manual_mode = is_manual;
                    info!("Camera mode: {}", if is_manual { "Manual" } else { "Auto" });
                    self.emit(OriginEvent::CameraModeChanged { is_manual });
                }
            }
            commands::GET_CAMERA_INFO => {
                let camera_id = msg.str_field("CameraID").to_string();
                let model = msg.str_field("CameraModel").to_string();
                info!("Camera info: ID = {} Model = {}", camera_id, model);
                self.emit(OriginEvent::CameraInfoReceived { camera_id, model });
            }
            _ => {}
        }
    }

    /// Apply a `NewImageReady` notification and decide whether to download
    pub(crate) async fn on_new_image_ready(&self, msg: &InboundMessage) -> Option<DownloadRequest> {
        let remote_path = msg.str_field("FileLocation");
        if remote_path.is_empty() {
            return None;
        }

        let notification = ImageNotification {
            remote_path: remote_path.to_string(),
            ra: msg.f64_field("Ra"),
            dec: msg.f64_field("Dec"),
            exposure: msg.f64_field("ExposureTime"),
        };

        let mut state = self.state.write().await;
        state.last_notification = Some(notification.clone());

        let request = DownloadRequest::new(notification, false);
        // An exposure takes whatever file arrives next
        let exposing = state.camera.state() == CameraState::Exposing;
        if !exposing && !request.format.is_snapshot() && state.snapshot_in_flight {
            debug!("Skipping live frame {} while a snapshot is in flight", remote_path);
            return None;
        }

        let exposure_driven = state.camera.image_arrived();
        drop(state);

        if exposure_driven {
            info!("Exposure complete, downloading {}", remote_path);
            self.emit(OriginEvent::ExposureComplete);
            self.emit(OriginEvent::CameraStateChanged(CameraState::Reading));
        }

        Some(DownloadRequest {
            exposure_driven,
            ..request
        })
    }

    async fn start_download(&self, request: DownloadRequest) {
        let host = self.state.read().await.host.clone();
        match host {
            Some(host) => {
                self.pipeline.spawn_download(host, request);
            }
            None => {
                self.pipeline
                    .complete(request, Err(OriginError::NoHost))
                    .await;
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
    use crate::error::OriginResult;
    use crate::image::{ImageFormat, ImageSource};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value;
    use tokio::sync::mpsc;

    /// Records requested paths and answers with fixed bytes
    struct RecordingSource {
        requested: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl ImageSource for RecordingSource {
        async fn fetch(&self, _host: &str, remote_path: &str) -> OriginResult<Vec<u8>> {
            let _ = self.requested.send(remote_path.to_string());
            Ok(vec![1, 2, 3, 4])
        }
    }

    struct Harness {
        router: MessageRouter,
        dispatcher: Arc<Dispatcher>,
        state: Arc<RwLock<BackendState>>,
        events: broadcast::Receiver<OriginEvent>,
        requested: mpsc::UnboundedReceiver<String>,
    }

    fn harness() -> Harness {
        let (req_tx, requested) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(16));
        let state = Arc::new(RwLock::new(BackendState {
            host: Some("127.0.0.1".to_string()),
            ..Default::default()
        }));
        let (event_tx, events) = broadcast::channel(64);
        let pipeline = ImagePipeline::new(
            Arc::new(RecordingSource { requested: req_tx }),
            state.clone(),
            event_tx.clone(),
        );
        Harness {
            router: MessageRouter::new(dispatcher.clone(), state.clone(), event_tx, pipeline),
            dispatcher,
            state,
            events,
            requested,
        }
    }

    fn image_ready(path: &str) -> String {
        format!(
            r#"{{"Type":"Notification","Source":"ImageServer","Command":"NewImageReady",
                "FileLocation":"{}","Ra":1.5,"Dec":-0.25,"ExposureTime":3.0}}"#,
            path
        )
    }

    #[tokio::test]
    async fn test_capture_parameters_response() {
        let mut h = harness();
        h.router
            .handle_text(
                r#"{"Type":"Response","Command":"GetCaptureParameters","Source":"Camera",
                    "ErrorCode":0,"Exposure":0.5,"ISO":400}"#,
            )
            .await;

        match h.events.recv().await.unwrap() {
            OriginEvent::CaptureParametersChanged { exposure, iso } => {
                assert_eq!(exposure, 0.5);
                assert_eq!(iso, 400);
            }
            other => panic!("unexpected event {:?}", other),
        }
        let capture = h.state.read().await.capture;
        assert_eq!(capture.exposure_secs, 0.5);
        assert_eq!(capture.iso, 400);
    }

    #[tokio::test]
    async fn test_error_response_has_no_side_effects() {
        let mut h = harness();
        let (tx, _rx) = mpsc::channel(4);
        h.dispatcher.attach(tx).await;
        let id = h
            .dispatcher
            .send_command("GetCaptureParameters", "Camera", Value::Null)
            .await
            .unwrap();

        h.router
            .handle_text(&format!(
                r#"{{"Type":"Response","Command":"GetCaptureParameters","Source":"Camera",
                    "SequenceID":{},"ErrorCode":5,"ErrorMessage":"busy","Exposure":9.0,"ISO":9}}"#,
                id
            ))
            .await;

        assert!(h.events.try_recv().is_err());
        assert_eq!(h.state.read().await.capture.iso, 200);
        assert!(h.state.read().await.telemetry.data().camera_last_update.is_none());
        // The pending entry is still pruned
        assert_eq!(h.dispatcher.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_mode_and_camera_info() {
        let mut h = harness();
        h.router
            .handle_text(r#"{"Type":"Response","Command":"SetEnableManual","IsManual":true}"#)
            .await;
        h.router
            .handle_text(r#"{"Type":"Response","Command":"SetEnableAuto"}"#)
            .await;
        h.router
            .handle_text(
                r#"{"Type":"Response","Command":"GetCameraInfo","CameraID":"C1","CameraModel":"IMX"}"#,
            )
            .await;

        assert!(matches!(
            h.events.recv().await.unwrap(),
            OriginEvent::CameraModeChanged { is_manual: true }
        ));
        match h.events.recv().await.unwrap() {
            OriginEvent::CameraInfoReceived { camera_id, model } => {
                assert_eq!(camera_id, "C1");
                assert_eq!(model, "IMX");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(h.state.read().await.capture.manual_mode);
    }

    #[tokio::test]
    async fn test_mount_telemetry_updates_status() {
        let mut h = harness();
        h.router
            .handle_text(
                r#"{"Type":"Notification","Source":"Mount","Command":"GetStatus",
                    "IsTracking":true,"IsGotoOver":true,"Enc0":0.0,"Enc1":0.0}"#,
            )
            .await;

        match h.events.recv().await.unwrap() {
            OriginEvent::StatusUpdated(status) => {
                assert!(status.tracking);
                assert_eq!(status.current_operation, "Tracking");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(h.state.read().await.status.tracking);
    }

    #[tokio::test]
    async fn test_garbage_is_ignored() {
        let mut h = harness();
        h.router.handle_text("not json at all").await;
        h.router.handle_text("[1,2]").await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_file_location_ignored() {
        let h = harness();
        let msg = InboundMessage::parse(&image_ready("")).unwrap();
        assert!(h.router.on_new_image_ready(&msg).await.is_none());
        assert!(h.state.read().await.last_notification.is_none());
    }

    #[tokio::test]
    async fn test_live_frame_suppressed_during_snapshot() {
        let mut h = harness();
        h.state.write().await.snapshot_in_flight = true;

        h.router.handle_text(&image_ready("Images/Temp/0.jpg")).await;

        let state = h.state.read().await;
        assert!(state.snapshot_in_flight);
        assert_eq!(
            state.last_notification.as_ref().map(|n| n.remote_path.as_str()),
            Some("Images/Temp/0.jpg")
        );
        drop(state);
        assert!(h.requested.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exposure_notification_moves_to_reading_and_downloads() {
        let mut h = harness();
        {
            let mut state = h.state.write().await;
            state.camera.begin_exposure(3.0, 200, Utc::now()).unwrap();
            state.snapshot_in_flight = true;
        }

        let msg = InboundMessage::parse(&image_ready("Images/Astro/shot.tiff")).unwrap();
        let request = h.router.on_new_image_ready(&msg).await.unwrap();
        assert!(request.exposure_driven);
        assert_eq!(request.format, ImageFormat::Tiff);
        assert_eq!(request.notification.ra, 1.5);
        assert_eq!(request.notification.dec, -0.25);
        assert_eq!(h.state.read().await.camera.state(), CameraState::Reading);
        assert!(matches!(h.events.recv().await.unwrap(), OriginEvent::ExposureComplete));

        h.router.start_download(request).await;
        assert_eq!(h.requested.recv().await.as_deref(), Some("Images/Astro/shot.tiff"));
    }

    #[tokio::test]
    async fn test_exposure_takes_non_tiff_result() {
        let mut h = harness();
        {
            let mut state = h.state.write().await;
            state.camera.begin_exposure(3.0, 200, Utc::now()).unwrap();
            // A separately requested snapshot must not hold back the exposure
            state.snapshot_in_flight = true;
        }

        h.router.handle_text(&image_ready("Images/Astro/shot.jpg")).await;
        assert_eq!(h.requested.recv().await.as_deref(), Some("Images/Astro/shot.jpg"));

        while !matches!(
            h.events.recv().await.unwrap(),
            OriginEvent::CameraStateChanged(CameraState::Idle)
        ) {}
        let state = h.state.read().await;
        assert_eq!(state.camera.state(), CameraState::Idle);
        assert!(state.image_ready);
        assert_eq!(state.camera.record().format, Some(ImageFormat::Jpeg));
        assert_eq!(state.camera.record().format.map(|f| f.tag()), Some("JPEG"));
        assert!(state.snapshot_in_flight);
    }

    #[tokio::test]
    async fn test_notification_without_exposure_keeps_camera_idle() {
        let h = harness();
        let msg = InboundMessage::parse(&image_ready("Images/Temp/1.jpg")).unwrap();
        let request = h.router.on_new_image_ready(&msg).await.unwrap();
        assert!(!request.exposure_driven);
        assert_eq!(h.state.read().await.camera.state(), CameraState::Idle);
    }
}

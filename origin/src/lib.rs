//! Origin Protocol Client
//!
//! Drives a Celestron Origin class telescope over its WebSocket JSON command
//! channel, and retrieves images from the device's HTTP image server when
//! the protocol announces them.
//!
//! ## Features
//!
//! - Physical (transport) and logical (driver) connection tracking
//! - Command envelopes with monotonic correlation ids
//! - Round-robin status polling and structured telemetry
//! - Camera acquisition state machine
//! - Image download pipeline with snapshot / live-view separation

mod client;
mod error;
mod protocol;
mod dispatcher;
mod router;
mod camera;
mod mount;
mod event;
pub mod poller;
pub mod telemetry;
pub mod image;
pub mod units;

pub use client::OriginClient;
pub use error::{OriginError, OriginResult};
pub use protocol::{
    commands, destinations, sources, CommandEnvelope, InboundMessage, MessageKind, MoveDirection,
    CLIENT_SOURCE, FIRST_SEQUENCE_ID, MOUNT_CONTROL_PATH,
};
pub use dispatcher::{Dispatcher, PendingCommands};
pub use router::MessageRouter;
pub use camera::{CameraState, CameraStateMachine, CaptureSettings, ExposureRecord, OriginCamera};
pub use mount::OriginMount;
pub use event::{DownloadedImage, OriginEvent};
pub use crate::image::{HttpImageSource, ImageFormat, ImageNotification, ImageSource};
pub use telemetry::{TelemetryCategory, TelescopeData};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default Origin port for both WebSocket and image HTTP traffic
pub const ORIGIN_DEFAULT_PORT: u16 = 80;

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// WebSocket handshake timeout (default: 10 seconds)
    pub connect_timeout_secs: u64,
    /// Ping interval (default: 15 seconds)
    pub keepalive_interval_secs: u64,
    /// Status poll interval (default: 5 seconds)
    pub status_poll_interval_secs: u64,
    /// Whole-request timeout for image downloads (default: 120 seconds)
    pub image_download_timeout_secs: u64,
    /// Port of the image HTTP server (default: 80)
    pub image_http_port: u16,
    /// Pending commands remembered before the oldest is evicted
    pub pending_command_capacity: usize,
    /// Broadcast buffer for events
    pub event_buffer_size: usize,
    /// Site latitude sent by `initialize`, degrees
    pub site_latitude_deg: f64,
    /// Site longitude sent by `initialize`, degrees
    pub site_longitude_deg: f64,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            keepalive_interval_secs: 15,
            status_poll_interval_secs: 5,
            image_download_timeout_secs: 120,
            image_http_port: ORIGIN_DEFAULT_PORT,
            pending_command_capacity: 256,
            event_buffer_size: 256,
            site_latitude_deg: 52.2,
            site_longitude_deg: 0.0,
        }
    }
}

impl OriginConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_interval_secs)
    }

    pub fn image_download_timeout(&self) -> Duration {
        Duration::from_secs(self.image_download_timeout_secs)
    }
}

/// Aggregated telescope status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelescopeStatus {
    /// Degrees
    pub altitude: f64,
    /// Degrees
    pub azimuth: f64,
    pub ra_hours: f64,
    pub dec_deg: f64,
    pub is_connected: bool,
    pub is_logically_connected: bool,
    pub is_camera_logically_connected: bool,
    pub slewing: bool,
    pub tracking: bool,
    pub parked: bool,
    pub aligned: bool,
    pub current_operation: String,
    /// Ambient temperature, Celsius
    pub temperature: f64,
}

impl Default for TelescopeStatus {
    fn default() -> Self {
        Self {
            altitude: 0.0,
            azimuth: 0.0,
            ra_hours: 0.0,
            dec_deg: 0.0,
            is_connected: false,
            is_logically_connected: false,
            is_camera_logically_connected: false,
            slewing: false,
            tracking: false,
            parked: false,
            aligned: false,
            current_operation: "Idle".to_string(),
            temperature: 20.0,
        }
    }
}

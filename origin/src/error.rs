//! Origin error types
//!
//! Provides structured error types for Origin protocol operations.

use crate::camera::CameraState;
use std::time::Duration;
use thiserror::Error;

/// Origin client errors
#[derive(Debug, Clone, Error)]
pub enum OriginError {
    /// The WebSocket transport is not connected
    #[error("Not connected to Origin telescope")]
    NotConnected,

    /// Transport is up but the device has not been marked logically connected
    #[error("Origin telescope is not logically connected")]
    NotLogicallyConnected,

    /// WebSocket handshake failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket handshake did not finish in time
    #[error("Connection timeout: no handshake from {url} after {duration:?}")]
    ConnectionTimeout { url: String, duration: Duration },

    /// The writer task has gone away
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Command parameters were not a JSON object
    #[error("Invalid command parameters for {command}: {message}")]
    InvalidParams { command: String, message: String },

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An exposure is requested while the camera is not idle
    #[error("Camera busy: state is {0}")]
    CameraBusy(CameraState),

    /// A camera transition was requested from the wrong state
    #[error("Invalid camera state: expected {expected}, found {actual}")]
    InvalidCameraState {
        expected: CameraState,
        actual: CameraState,
    },

    /// Image transfer failed at the transport level
    #[error("Image download failed for {path}: {message}")]
    Download { path: String, message: String },

    /// Image server answered with a non-success status
    #[error("HTTP error {status} fetching {url}")]
    HttpStatus { status: u16, url: String },

    /// Downloaded live frame could not be decoded
    #[error("Image decode error: {0}")]
    ImageDecode(String),

    /// No host is known for image retrieval
    #[error("No connected host for image retrieval")]
    NoHost,
}

impl From<serde_json::Error> for OriginError {
    fn from(err: serde_json::Error) -> Self {
        OriginError::Serialization(err.to_string())
    }
}

impl From<::image::ImageError> for OriginError {
    fn from(err: ::image::ImageError) -> Self {
        OriginError::ImageDecode(err.to_string())
    }
}

impl From<OriginError> for String {
    fn from(err: OriginError) -> String {
        err.to_string()
    }
}

/// Result type for Origin operations
pub type OriginResult<T> = Result<T, OriginError>;

//! Origin WebSocket JSON protocol definitions

use crate::error::{OriginError, OriginResult};
use serde::Serialize;
use serde_json::{Map, Value};

/// Path of the mount control WebSocket endpoint
pub const MOUNT_CONTROL_PATH: &str = "/SmartScope-1.0/mountControlEndpoint";

/// Path prefix served by the image HTTP server
pub const IMAGE_PATH_PREFIX: &str = "/SmartScope-1.0/dev2/";

/// Value of `Source` on every command we send
pub const CLIENT_SOURCE: &str = "AlpacaServer";

/// First correlation id handed out by a client
pub const FIRST_SEQUENCE_ID: u32 = 2000;

/// Command names
pub mod commands {
    pub const GOTO_RA_DEC: &str = "GotoRaDec";
    pub const SYNC_TO_RA_DEC: &str = "SyncToRaDec";
    pub const ABORT_AXIS_MOVEMENT: &str = "AbortAxisMovement";
    pub const PARK: &str = "Park";
    pub const UNPARK: &str = "Unpark";
    pub const RUN_INITIALIZE: &str = "RunInitialize";
    pub const MOVE_AXIS: &str = "MoveAxis";
    pub const START_TRACKING: &str = "StartTracking";
    pub const STOP_TRACKING: &str = "StopTracking";
    pub const GET_STATUS: &str = "GetStatus";

    // Camera / imaging
    pub const RUN_SAMPLE_CAPTURE: &str = "RunSampleCapture";
    pub const RUN_IMAGING: &str = "RunImaging";
    pub const CANCEL_IMAGING: &str = "CancelImaging";
    pub const ABORT_EXPOSURE: &str = "AbortExposure";
    pub const SET_CAPTURE_PARAMETERS: &str = "SetCaptureParameters";
    pub const GET_CAPTURE_PARAMETERS: &str = "GetCaptureParameters";
    pub const SET_ENABLE_MANUAL: &str = "SetEnableManual";
    pub const SET_ENABLE_AUTO: &str = "SetEnableAuto";
    pub const GET_ENABLE_MANUAL: &str = "GetEnableManual";
    pub const GET_CAMERA_INFO: &str = "GetCameraInfo";

    // Notifications
    pub const NEW_IMAGE_READY: &str = "NewImageReady";
}

/// Destination subsystems
pub mod destinations {
    pub const MOUNT: &str = "Mount";
    pub const ENVIRONMENT: &str = "Environment";
    pub const CAMERA: &str = "Camera";
    pub const TASK_CONTROLLER: &str = "TaskController";
    pub const LIVE_STREAM: &str = "LiveStream";
}

/// `Source` values seen on inbound messages
pub mod sources {
    pub const MOUNT: &str = "Mount";
    pub const CAMERA: &str = "Camera";
    pub const FOCUSER: &str = "Focuser";
    pub const ENVIRONMENT: &str = "Environment";
    pub const IMAGE_SERVER: &str = "ImageServer";
    pub const DISK: &str = "Disk";
    pub const DEW_HEATER: &str = "DewHeater";
    pub const ORIENTATION_SENSOR: &str = "OrientationSensor";
}

/// Envelope keys owned by the dispatcher
const RESERVED_KEYS: &[&str] = &["Command", "Destination", "SequenceID", "Source", "Type"];

/// Outgoing command envelope
#[derive(Debug, Clone, Serialize)]
pub struct CommandEnvelope {
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "Destination")]
    pub destination: String,
    #[serde(rename = "SequenceID")]
    pub sequence_id: u32,
    #[serde(rename = "Source")]
    pub source: &'static str,
    #[serde(rename = "Type")]
    pub message_type: &'static str,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl CommandEnvelope {
    /// Build an envelope. `params` must be a JSON object or `null`; keys that
    /// collide with envelope fields are dropped.
    pub fn new(
        command: &str,
        destination: &str,
        sequence_id: u32,
        params: Value,
    ) -> OriginResult<Self> {
        let mut params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(OriginError::InvalidParams {
                    command: command.to_string(),
                    message: format!("expected a JSON object, got {}", other),
                })
            }
        };
        for key in RESERVED_KEYS {
            if params.remove(*key).is_some() {
                tracing::warn!("Ignoring reserved key '{}' in {} params", key, command);
            }
        }

        Ok(Self {
            command: command.to_string(),
            destination: destination.to_string(),
            sequence_id,
            source: CLIENT_SOURCE,
            message_type: "Command",
            params,
        })
    }

    /// Compact JSON text frame
    pub fn to_json(&self) -> OriginResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inbound message classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Response,
    Notification,
    Other(String),
}

impl MessageKind {
    fn from_type(s: &str) -> Self {
        match s {
            "Response" => MessageKind::Response,
            "Notification" => MessageKind::Notification,
            other => MessageKind::Other(other.to_string()),
        }
    }
}

/// A parsed inbound frame
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub command: String,
    pub kind: MessageKind,
    pub source: String,
    pub sequence_id: Option<u32>,
    /// Always 0 for anything that is not a Response
    pub error_code: i64,
    pub error_message: Option<String>,
    pub body: Map<String, Value>,
}

impl InboundMessage {
    /// Parse a text frame. Returns `None` if it is not a JSON object.
    pub fn parse(text: &str) -> Option<Self> {
        let body = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            _ => return None,
        };

        let str_of = |key: &str| {
            body.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let command = str_of("Command");
        let source = str_of("Source");
        let kind = MessageKind::from_type(&str_of("Type"));
        let sequence_id = body
            .get("SequenceID")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok());

        let (error_code, error_message) = if kind == MessageKind::Response {
            (
                body.get("ErrorCode").and_then(Value::as_i64).unwrap_or(0),
                body.get("ErrorMessage")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            )
        } else {
            (0, None)
        };

        Some(Self {
            command,
            kind,
            source,
            sequence_id,
            error_code,
            error_message,
            body,
        })
    }

    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }

    pub fn is_notification(&self) -> bool {
        self.kind == MessageKind::Notification
    }

    /// Numeric field, 0.0 when absent
    pub fn f64_field(&self, key: &str) -> f64 {
        self.body.get(key).and_then(Value::as_f64).unwrap_or(0.0)
    }

    /// Integer field, 0 when absent. Accepts floats the device sometimes sends.
    pub fn i64_field(&self, key: &str) -> i64 {
        match self.body.get(key) {
            Some(v) => v
                .as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            None => 0,
        }
    }

    pub fn str_field(&self, key: &str) -> &str {
        self.body.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(Value::as_bool)
    }
}

/// Manual slew direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    North,
    South,
    East,
    West,
}

impl MoveDirection {
    /// `(Axis, Direction)` pair for `MoveAxis`
    pub fn axis_and_sign(&self) -> (&'static str, &'static str) {
        match self {
            MoveDirection::North => ("Dec", "Positive"),
            MoveDirection::South => ("Dec", "Negative"),
            MoveDirection::East => ("Ra", "Positive"),
            MoveDirection::West => ("Ra", "Negative"),
        }
    }

    /// Legacy numeric direction codes: 0=N, 1=S, 2=E, 3=W
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(MoveDirection::North),
            1 => Some(MoveDirection::South),
            2 => Some(MoveDirection::East),
            3 => Some(MoveDirection::West),
            _ => None,
        }
    }
}

//! Structured telemetry feed
//!
//! Responses and notifications are routed by their `Source` into typed
//! sections. Mount and environment sections also drive the aggregated
//! [`TelescopeStatus`].

use crate::protocol::{commands, sources, InboundMessage, MessageKind};
use crate::units::{radians_to_degrees, radians_to_hours};
use crate::TelescopeStatus;
use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed altitude reported until the device exposes a real one
pub const PLACEHOLDER_ALTITUDE_DEG: f64 = 45.0;
/// Fixed azimuth reported until the device exposes a real one
pub const PLACEHOLDER_AZIMUTH_DEG: f64 = 180.0;

/// Integers sometimes arrive as floats or not at all
fn lenient_int<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64> + Default,
{
    let value = Value::deserialize(deserializer)?;
    let n = value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .unwrap_or(0);
    Ok(T::try_from(n).unwrap_or_default())
}

/// A null or mistyped field falls back to its default without failing the section
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MountTelemetry {
    #[serde(deserialize_with = "lenient")]
    pub battery_level: String,
    #[serde(deserialize_with = "lenient")]
    pub battery_voltage: f64,
    #[serde(deserialize_with = "lenient")]
    pub battery_current: f64,
    #[serde(deserialize_with = "lenient")]
    pub charger_status: String,
    #[serde(deserialize_with = "lenient")]
    pub date: String,
    #[serde(deserialize_with = "lenient")]
    pub time: String,
    #[serde(deserialize_with = "lenient")]
    pub time_zone: String,
    #[serde(deserialize_with = "lenient")]
    pub latitude: f64,
    #[serde(deserialize_with = "lenient")]
    pub longitude: f64,
    #[serde(deserialize_with = "lenient")]
    pub is_aligned: bool,
    #[serde(deserialize_with = "lenient")]
    pub is_goto_over: bool,
    #[serde(deserialize_with = "lenient")]
    pub is_tracking: bool,
    #[serde(deserialize_with = "lenient_int")]
    pub num_align_refs: i32,
    #[serde(rename = "Alt", deserialize_with = "lenient")]
    pub altitude: f64,
    #[serde(rename = "Azm", deserialize_with = "lenient")]
    pub azimuth: f64,
    #[serde(deserialize_with = "lenient")]
    pub altitude_error: f64,
    #[serde(deserialize_with = "lenient")]
    pub azimuth_error: f64,
    /// RA axis encoder, radians
    #[serde(deserialize_with = "lenient")]
    pub enc0: f64,
    /// Dec axis encoder, radians
    #[serde(deserialize_with = "lenient")]
    pub enc1: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CameraTelemetry {
    #[serde(deserialize_with = "lenient_int")]
    pub binning: i32,
    #[serde(deserialize_with = "lenient_int")]
    pub bit_depth: i32,
    #[serde(deserialize_with = "lenient")]
    pub color_b_balance: f64,
    #[serde(deserialize_with = "lenient")]
    pub color_g_balance: f64,
    #[serde(deserialize_with = "lenient")]
    pub color_r_balance: f64,
    #[serde(deserialize_with = "lenient")]
    pub exposure: f64,
    #[serde(rename = "ISO", deserialize_with = "lenient_int")]
    pub iso: i32,
    #[serde(deserialize_with = "lenient_int")]
    pub offset: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FocuserTelemetry {
    #[serde(deserialize_with = "lenient_int")]
    pub backlash: i32,
    #[serde(deserialize_with = "lenient_int")]
    pub calibration_lower_limit: i32,
    #[serde(deserialize_with = "lenient_int")]
    pub calibration_upper_limit: i32,
    #[serde(deserialize_with = "lenient")]
    pub is_calibration_complete: bool,
    #[serde(deserialize_with = "lenient")]
    pub is_move_to_over: bool,
    #[serde(deserialize_with = "lenient")]
    pub need_auto_focus: bool,
    #[serde(deserialize_with = "lenient_int")]
    pub percentage_calibration_complete: i32,
    #[serde(deserialize_with = "lenient_int")]
    pub position: i32,
    #[serde(deserialize_with = "lenient")]
    pub requires_calibration: bool,
    #[serde(deserialize_with = "lenient")]
    pub velocity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EnvironmentTelemetry {
    #[serde(deserialize_with = "lenient")]
    pub ambient_temperature: f64,
    #[serde(deserialize_with = "lenient")]
    pub camera_temperature: f64,
    #[serde(deserialize_with = "lenient")]
    pub cpu_fan_on: bool,
    #[serde(deserialize_with = "lenient")]
    pub cpu_temperature: f64,
    #[serde(deserialize_with = "lenient")]
    pub dew_point: f64,
    #[serde(deserialize_with = "lenient")]
    pub front_cell_temperature: f64,
    #[serde(deserialize_with = "lenient")]
    pub humidity: f64,
    #[serde(deserialize_with = "lenient")]
    pub ota_fan_on: bool,
    #[serde(deserialize_with = "lenient")]
    pub recalibrating: bool,
}

/// Metadata of the last `NewImageReady` from the image server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageTelemetry {
    #[serde(deserialize_with = "lenient")]
    pub file_location: String,
    #[serde(deserialize_with = "lenient")]
    pub image_type: String,
    #[serde(deserialize_with = "lenient")]
    pub dec: f64,
    #[serde(deserialize_with = "lenient")]
    pub ra: f64,
    #[serde(deserialize_with = "lenient")]
    pub orientation: f64,
    #[serde(deserialize_with = "lenient")]
    pub fov_x: f64,
    #[serde(deserialize_with = "lenient")]
    pub fov_y: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DiskTelemetry {
    #[serde(deserialize_with = "lenient_int")]
    pub capacity: i64,
    #[serde(deserialize_with = "lenient_int")]
    pub free_bytes: i64,
    #[serde(deserialize_with = "lenient")]
    pub level: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DewHeaterTelemetry {
    #[serde(deserialize_with = "lenient_int")]
    pub aggression: i32,
    #[serde(deserialize_with = "lenient")]
    pub heater_level: f64,
    #[serde(deserialize_with = "lenient")]
    pub manual_power_level: f64,
    #[serde(deserialize_with = "lenient")]
    pub mode: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct OrientationTelemetry {
    #[serde(deserialize_with = "lenient_int")]
    pub altitude: i32,
}

/// Telemetry section touched by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryCategory {
    Mount,
    Camera,
    Focuser,
    Environment,
    Image,
    Disk,
    DewHeater,
    Orientation,
}

impl TelemetryCategory {
    /// Whether a change in this section affects the aggregated status
    pub fn affects_status(&self) -> bool {
        matches!(self, TelemetryCategory::Mount | TelemetryCategory::Environment)
    }
}

/// Every telemetry section with its last update time
#[derive(Debug, Clone, Default)]
pub struct TelescopeData {
    pub mount: MountTelemetry,
    pub camera: CameraTelemetry,
    pub focuser: FocuserTelemetry,
    pub environment: EnvironmentTelemetry,
    pub last_image: ImageTelemetry,
    pub disk: DiskTelemetry,
    pub dew_heater: DewHeaterTelemetry,
    pub orientation: OrientationTelemetry,

    pub mount_last_update: Option<DateTime<Utc>>,
    pub camera_last_update: Option<DateTime<Utc>>,
    pub focuser_last_update: Option<DateTime<Utc>>,
    pub environment_last_update: Option<DateTime<Utc>>,
    pub image_last_update: Option<DateTime<Utc>>,
    pub disk_last_update: Option<DateTime<Utc>>,
    pub dew_heater_last_update: Option<DateTime<Utc>>,
    pub orientation_last_update: Option<DateTime<Utc>>,
}

/// Parse a section, keeping the previous value if the body does not fit
fn update_section<T: DeserializeOwned>(
    target: &mut T,
    stamp: &mut Option<DateTime<Utc>>,
    msg: &InboundMessage,
) -> bool {
    match serde_json::from_value::<T>(Value::Object(msg.body.clone())) {
        Ok(section) => {
            *target = section;
            *stamp = Some(Utc::now());
            true
        }
        Err(e) => {
            tracing::warn!("Malformed {} telemetry from {}: {}", msg.command, msg.source, e);
            false
        }
    }
}

/// Routes messages into [`TelescopeData`]
#[derive(Debug, Clone, Default)]
pub struct TelemetryProcessor {
    data: TelescopeData,
}

impl TelemetryProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &TelescopeData {
        &self.data
    }

    /// Feed one message. Returns the section it updated, if any.
    pub fn process(&mut self, msg: &InboundMessage) -> Option<TelemetryCategory> {
        if !matches!(msg.kind, MessageKind::Response | MessageKind::Notification) {
            return None;
        }

        let d = &mut self.data;
        let (category, updated) = match msg.source.as_str() {
            sources::MOUNT => (
                TelemetryCategory::Mount,
                update_section(&mut d.mount, &mut d.mount_last_update, msg),
            ),
            sources::CAMERA if msg.command == commands::GET_CAPTURE_PARAMETERS => (
                TelemetryCategory::Camera,
                update_section(&mut d.camera, &mut d.camera_last_update, msg),
            ),
            sources::FOCUSER => (
                TelemetryCategory::Focuser,
                update_section(&mut d.focuser, &mut d.focuser_last_update, msg),
            ),
            sources::ENVIRONMENT => (
                TelemetryCategory::Environment,
                update_section(&mut d.environment, &mut d.environment_last_update, msg),
            ),
            sources::IMAGE_SERVER if msg.command == commands::NEW_IMAGE_READY => (
                TelemetryCategory::Image,
                update_section(&mut d.last_image, &mut d.image_last_update, msg),
            ),
            sources::DISK => (
                TelemetryCategory::Disk,
                update_section(&mut d.disk, &mut d.disk_last_update, msg),
            ),
            sources::DEW_HEATER => (
                TelemetryCategory::DewHeater,
                update_section(&mut d.dew_heater, &mut d.dew_heater_last_update, msg),
            ),
            sources::ORIENTATION_SENSOR => (
                TelemetryCategory::Orientation,
                update_section(&mut d.orientation, &mut d.orientation_last_update, msg),
            ),
            _ => return None,
        };

        updated.then_some(category)
    }

    /// Fold mount and environment telemetry into `status`.
    ///
    /// Connection flags and fields set by commands are left alone until the
    /// corresponding section has been received at least once.
    pub fn apply_to_status(&self, status: &mut TelescopeStatus) {
        let d = &self.data;

        if d.mount_last_update.is_some() {
            status.tracking = d.mount.is_tracking;
            status.slewing = !d.mount.is_goto_over;
            status.aligned = d.mount.is_aligned;
            status.ra_hours = radians_to_hours(d.mount.enc0);
            status.dec_deg = radians_to_degrees(d.mount.enc1);
            status.altitude = PLACEHOLDER_ALTITUDE_DEG;
            status.azimuth = PLACEHOLDER_AZIMUTH_DEG;

            status.current_operation = if status.slewing {
                "Slewing"
            } else if status.tracking {
                "Tracking"
            } else {
                "Idle"
            }
            .to_string();
        }

        if d.environment_last_update.is_some() {
            status.temperature = d.environment.ambient_temperature;
        }
    }
}

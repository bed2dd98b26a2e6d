//! Origin Mount wrapper
//!
//! Provides mount control over the Origin command channel. Every operation
//! returns as soon as the command is sent; progress shows up in telemetry.

use crate::client::OriginClient;
use crate::error::OriginResult;
use crate::protocol::{commands, destinations, MoveDirection};
use crate::units::{degrees_to_radians, hours_to_radians};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Origin Mount device wrapper
pub struct OriginMount {
    client: Arc<RwLock<OriginClient>>,
}

impl OriginMount {
    /// Create a new Origin mount wrapper
    pub fn new(client: Arc<RwLock<OriginClient>>) -> Self {
        Self { client }
    }

    /// Slew to RA (hours) / Dec (degrees)
    pub async fn goto_position(&self, ra_hours: f64, dec_deg: f64) -> OriginResult<()> {
        let client = self.client.read().await;
        client
            .send_command(
                commands::GOTO_RA_DEC,
                destinations::MOUNT,
                json!({
                    "Ra": hours_to_radians(ra_hours),
                    "Dec": degrees_to_radians(dec_deg),
                }),
            )
            .await?;

        let mut state = client.shared().write().await;
        state.status.slewing = true;
        state.status.current_operation = "Slewing".to_string();
        tracing::info!("Slewing to RA {:.4}h Dec {:.4}°", ra_hours, dec_deg);
        Ok(())
    }

    /// Sync the mount model to RA (hours) / Dec (degrees)
    pub async fn sync_position(&self, ra_hours: f64, dec_deg: f64) -> OriginResult<()> {
        let client = self.client.read().await;
        client
            .send_command(
                commands::SYNC_TO_RA_DEC,
                destinations::MOUNT,
                json!({
                    "Ra": hours_to_radians(ra_hours),
                    "Dec": degrees_to_radians(dec_deg),
                }),
            )
            .await?;
        Ok(())
    }

    /// Stop any slew or manual motion
    pub async fn abort_motion(&self) -> OriginResult<()> {
        let client = self.client.read().await;
        client
            .send_command(commands::ABORT_AXIS_MOVEMENT, destinations::MOUNT, Value::Null)
            .await?;

        let mut state = client.shared().write().await;
        state.status.slewing = false;
        state.status.current_operation = "Idle".to_string();
        Ok(())
    }

    pub async fn park(&self) -> OriginResult<()> {
        let client = self.client.read().await;
        client
            .send_command(commands::PARK, destinations::MOUNT, Value::Null)
            .await?;

        let mut state = client.shared().write().await;
        state.status.parked = true;
        state.status.current_operation = "Parking".to_string();
        Ok(())
    }

    pub async fn unpark(&self) -> OriginResult<()> {
        let client = self.client.read().await;
        client
            .send_command(commands::UNPARK, destinations::MOUNT, Value::Null)
            .await?;

        let mut state = client.shared().write().await;
        state.status.parked = false;
        state.status.current_operation = "Unparking".to_string();
        Ok(())
    }

    /// Initialize the mount with the current UTC time and configured site
    pub async fn initialize(&self) -> OriginResult<()> {
        let client = self.client.read().await;
        let params = initialize_params(
            Utc::now(),
            client.config().site_latitude_deg,
            client.config().site_longitude_deg,
        );
        client
            .send_command(commands::RUN_INITIALIZE, destinations::TASK_CONTROLLER, params)
            .await?;

        client.shared().write().await.status.current_operation = "Initializing".to_string();
        Ok(())
    }

    /// Start manual motion. Speed is clamped to 0..=100.
    pub async fn move_direction(&self, direction: MoveDirection, speed: i32) -> OriginResult<()> {
        let (axis, sign) = direction.axis_and_sign();
        let client = self.client.read().await;
        client
            .send_command(
                commands::MOVE_AXIS,
                destinations::MOUNT,
                json!({
                    "Axis": axis,
                    "Direction": sign,
                    "Speed": speed.clamp(0, 100),
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn set_tracking(&self, enabled: bool) -> OriginResult<()> {
        let command = if enabled {
            commands::START_TRACKING
        } else {
            commands::STOP_TRACKING
        };
        let client = self.client.read().await;
        client
            .send_command(command, destinations::MOUNT, Value::Null)
            .await?;

        client.shared().write().await.status.tracking = enabled;
        Ok(())
    }

    /// Last known tracking flag, from commands or telemetry
    pub async fn is_tracking(&self) -> bool {
        self.client.read().await.shared().read().await.status.tracking
    }

    pub async fn is_slewing(&self) -> bool {
        self.client.read().await.shared().read().await.status.slewing
    }

    pub async fn is_parked(&self) -> bool {
        self.client.read().await.shared().read().await.status.parked
    }

    /// Current coordinates (RA in hours, Dec in degrees)
    pub async fn get_coordinates(&self) -> (f64, f64) {
        let client = self.client.read().await;
        let state = client.shared().read().await;
        (state.status.ra_hours, state.status.dec_deg)
    }
}

fn initialize_params(now: DateTime<Utc>, latitude_deg: f64, longitude_deg: f64) -> Value {
    json!({
        "Date": now.format("%d %m %Y").to_string(),
        "Time": now.format("%H:%M:%S").to_string(),
        "TimeZone": "UTC",
        "Latitude": degrees_to_radians(latitude_deg),
        "Longitude": degrees_to_radians(longitude_deg),
        "FakeInitialize": false,
    })
}

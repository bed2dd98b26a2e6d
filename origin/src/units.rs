//! Angle conversions between the wire format and caller-facing units
//!
//! The Origin protocol carries RA and Dec in radians. Callers see RA in hours
//! and Dec in degrees.

use std::f64::consts::PI;

/// Convert hours of right ascension to radians
pub fn hours_to_radians(hours: f64) -> f64 {
    hours * PI / 12.0
}

/// Convert radians to hours of right ascension
pub fn radians_to_hours(radians: f64) -> f64 {
    radians * 12.0 / PI
}

/// Convert degrees to radians
pub fn degrees_to_radians(degrees: f64) -> f64 {
    degrees * PI / 180.0
}

/// Convert radians to degrees
pub fn radians_to_degrees(radians: f64) -> f64 {
    radians * 180.0 / PI
}

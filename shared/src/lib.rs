//! AirSense Shared Types
//!
//! This crate provides the reading model and the wire codec shared by the
//! ingestion server and the sensor nodes that report to it.

pub mod codec;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Get the current wall-clock time used to stamp readings
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Wire protocol parameters
pub mod protocol {
    /// Marker byte the server sends right after accepting a connection
    pub const GREETING: u8 = b'a';

    /// Status byte written after a committed reading (when outcome reporting is on)
    pub const STATUS_ACCEPTED: u8 = b'+';

    /// Status byte written after a rejected payload (when outcome reporting is on)
    pub const STATUS_REJECTED: u8 = b'-';

    /// Payloads of this many bytes or fewer are heartbeats/noise, not readings
    pub const NOISE_THRESHOLD: usize = 4;

    /// Largest payload accepted in a single exchange
    pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

    /// Default TCP port sensors report to
    pub const DEFAULT_PORT: u16 = 8889;
}

/// The five environmental measurements carried by every reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    /// Luminosity (lux)
    pub lux: f64,
    /// Ammonia (ppm)
    pub nh3: f64,
    /// Hydrogen sulfide (ppm)
    pub hs: f64,
    /// Relative humidity (%)
    pub h: f64,
    /// Temperature (°C)
    pub t: f64,
}

/// One decoded sensor observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Identifier of the reporting sensor unit
    pub device: String,
    /// Address the sensor reported for itself
    pub ip: String,
    #[serde(flatten)]
    pub measurements: Measurements,
    /// Assigned by the server when the payload was accepted
    pub received_at: DateTime<Utc>,
}

impl Reading {
    /// Create a reading stamped with the given receive time
    pub fn new(
        device: impl Into<String>,
        ip: impl Into<String>,
        measurements: Measurements,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            device: device.into(),
            ip: ip.into(),
            measurements,
            received_at,
        }
    }

    /// True when both readings carry the same report, ignoring receive time
    pub fn same_report(&self, other: &Reading) -> bool {
        self.device == other.device
            && self.ip == other.ip
            && self.measurements == other.measurements
    }
}

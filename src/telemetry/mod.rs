//! Telemetry records and payload decoding
//!
//! Producers on the factory floor publish position/status updates in more
//! than one JSON shape. Each shape gets its own [`decoder::PayloadDecoder`];
//! all of them produce the same [`DeviceTelemetryRecord`].

pub mod decoder;

use serde::{Deserialize, Serialize};

/// A validated position/status update for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTelemetryRecord {
    pub device_id: String,
    /// Sector the coordinates are local to
    pub sector_id: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Radians
    pub heading: Option<f64>,
    /// Percent, 0-100
    pub battery: Option<u8>,
    pub moving: bool,
    /// Milliseconds since epoch, assigned by the producer
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("stale record from {device_id}: {age_ms} ms old")]
    Stale { device_id: String, age_ms: i64 },
    #[error("device {0} is not in the allow-list")]
    UnknownDevice(String),
}

impl DecodeError {
    /// Short label used for rejection counters and log fields
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "malformed",
            DecodeError::Stale { .. } => "stale",
            DecodeError::UnknownDevice(_) => "unknown_device",
        }
    }
}

//! Wire types for the Twinzo v3 API

use crate::telemetry::DeviceTelemetryRecord;
use serde::{Deserialize, Serialize};

/// Body of `POST /authorization/authenticate`
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest<'a> {
    pub client: &'a str,
    pub login: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthResponse {
    /// Client GUID
    pub client: String,
    /// Branch GUID
    pub branch: String,
    pub token: String,
    /// Milliseconds since epoch
    #[serde(default)]
    pub expiration: Option<i64>,
}

/// One element of the `POST /localization` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocalizationEntry {
    pub timestamp: i64,
    pub sector_id: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub interval: u64,
    pub battery: u8,
    pub is_moving: bool,
    pub localization_areas: Vec<i64>,
    pub no_go_areas: Vec<i64>,
}

impl LocalizationEntry {
    pub fn from_record(record: &DeviceTelemetryRecord, interval: u64, default_battery: u8) -> Self {
        Self {
            timestamp: record.timestamp_ms,
            sector_id: record.sector_id,
            x: record.x,
            y: record.y,
            z: record.z,
            interval,
            battery: record.battery.unwrap_or(default_battery),
            is_moving: record.moving,
            localization_areas: Vec::new(),
            no_go_areas: Vec::new(),
        }
    }
}

//! Payload schemas seen on the fleet topics
//!
//! * `flat`: PascalCase object (`SectorId`, `X`, `Y`, `Z`, ...), field names
//!   taken from a configurable [`FieldMap`]
//! * `nested`: `{device_id, position: {x, y, z}, heading, ...}`
//! * `pose`: fleet-manager status messages, `{sherpa_name, pose: [x, y, z,
//!   roll, pitch, yaw], battery_status}`
//!
//! Decoders only parse. Fallbacks for missing device, sector or timestamp
//! are resolved by ingress.

use super::{DecodeError, DeviceTelemetryRecord};
use crate::config::{FieldMap, PayloadSchema};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields as they appear in a payload, before fallbacks are applied
#[derive(Debug, Clone, PartialEq)]
pub struct RawTelemetry {
    pub device_id: Option<String>,
    pub sector_id: Option<i64>,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub heading: Option<f64>,
    pub battery: Option<u8>,
    pub moving: Option<bool>,
    pub timestamp_ms: Option<i64>,
}

pub trait PayloadDecoder: Send + Sync {
    fn schema(&self) -> PayloadSchema;

    fn decode(&self, payload: &[u8]) -> Result<RawTelemetry, DecodeError>;

    /// Inverse of [`PayloadDecoder::decode`] for a fully resolved record
    fn encode(&self, record: &DeviceTelemetryRecord) -> Value;
}

pub fn decoder_for(schema: PayloadSchema, fields: &FieldMap) -> Box<dyn PayloadDecoder> {
    match schema {
        PayloadSchema::Flat => Box::new(FlatDecoder::new(fields.clone())),
        PayloadSchema::Nested => Box::new(NestedDecoder),
        PayloadSchema::Pose => Box::new(PoseDecoder),
    }
}

fn malformed(msg: impl Into<String>) -> DecodeError {
    DecodeError::Malformed(msg.into())
}

fn battery_percent(value: Option<f64>) -> Result<Option<u8>, DecodeError> {
    match value {
        None => Ok(None),
        Some(v) if (0.0..=100.0).contains(&v) => Ok(Some(v.round() as u8)),
        Some(v) => Err(malformed(format!("battery level {} outside 0-100", v))),
    }
}

/// Epoch milliseconds or an RFC 3339 string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TimestampValue {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

impl TimestampValue {
    fn to_millis(&self) -> Result<i64, DecodeError> {
        match self {
            TimestampValue::Millis(ms) => Ok(*ms),
            TimestampValue::Fractional(ms) => Ok(*ms as i64),
            TimestampValue::Text(text) => DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.timestamp_millis())
                .map_err(|e| malformed(format!("invalid timestamp '{}': {}", text, e))),
        }
    }
}

fn parse_json<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|e| malformed(e.to_string()))
}

// ---------------------------------------------------------------------------
// flat
// ---------------------------------------------------------------------------

pub struct FlatDecoder {
    fields: FieldMap,
}

impl FlatDecoder {
    pub fn new(fields: FieldMap) -> Self {
        Self { fields }
    }

    fn number(obj: &Map<String, Value>, name: &str) -> Result<Option<f64>, DecodeError> {
        match obj.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| malformed(format!("field {} is not a number", name))),
        }
    }

    fn required_number(obj: &Map<String, Value>, name: &str) -> Result<f64, DecodeError> {
        Self::number(obj, name)?.ok_or_else(|| malformed(format!("missing field {}", name)))
    }

    fn integer(obj: &Map<String, Value>, name: &str) -> Result<Option<i64>, DecodeError> {
        match obj.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| malformed(format!("field {} is not an integer", name))),
        }
    }
}

impl PayloadDecoder for FlatDecoder {
    fn schema(&self) -> PayloadSchema {
        PayloadSchema::Flat
    }

    fn decode(&self, payload: &[u8]) -> Result<RawTelemetry, DecodeError> {
        let value: Value = parse_json(payload)?;
        let obj = value
            .as_object()
            .ok_or_else(|| malformed("flat payload must be a JSON object"))?;
        let f = &self.fields;

        let device_id = match obj.get(&f.device) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(_) => return Err(malformed(format!("field {} is not a string", f.device))),
        };

        let moving = match obj.get(&f.moving) {
            None | Some(Value::Null) => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => return Err(malformed(format!("field {} is not a boolean", f.moving))),
        };

        let timestamp_ms = match obj.get(&f.timestamp) {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                TimestampValue::deserialize(v)
                    .map_err(|_| malformed(format!("field {} is not a timestamp", f.timestamp)))?
                    .to_millis()?,
            ),
        };

        Ok(RawTelemetry {
            device_id,
            sector_id: Self::integer(obj, &f.sector)?,
            x: Self::required_number(obj, &f.x)?,
            y: Self::required_number(obj, &f.y)?,
            z: Self::number(obj, &f.z)?.unwrap_or(0.0),
            heading: Self::number(obj, &f.heading)?,
            battery: battery_percent(Self::number(obj, &f.battery)?)?,
            moving,
            timestamp_ms,
        })
    }

    fn encode(&self, record: &DeviceTelemetryRecord) -> Value {
        let f = &self.fields;
        let mut obj = Map::new();
        obj.insert(f.device.clone(), Value::from(record.device_id.clone()));
        obj.insert(f.sector.clone(), Value::from(record.sector_id));
        obj.insert(f.x.clone(), Value::from(record.x));
        obj.insert(f.y.clone(), Value::from(record.y));
        obj.insert(f.z.clone(), Value::from(record.z));
        if let Some(heading) = record.heading {
            obj.insert(f.heading.clone(), Value::from(heading));
        }
        if let Some(battery) = record.battery {
            obj.insert(f.battery.clone(), Value::from(battery));
        }
        obj.insert(f.moving.clone(), Value::from(record.moving));
        obj.insert(f.timestamp.clone(), Value::from(record.timestamp_ms));
        Value::Object(obj)
    }
}

// ---------------------------------------------------------------------------
// nested
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Position {
    x: f64,
    y: f64,
    #[serde(default)]
    z: f64,
}

#[derive(Debug, Deserialize)]
struct NestedPayload {
    #[serde(alias = "deviceId")]
    device_id: Option<String>,
    #[serde(alias = "sectorId")]
    sector_id: Option<i64>,
    position: Position,
    heading: Option<f64>,
    battery: Option<f64>,
    #[serde(alias = "isMoving")]
    is_moving: Option<bool>,
    timestamp: Option<TimestampValue>,
}

#[derive(Debug, Serialize)]
struct NestedOut<'a> {
    device_id: &'a str,
    sector_id: i64,
    position: Position,
    #[serde(skip_serializing_if = "Option::is_none")]
    heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    battery: Option<u8>,
    is_moving: bool,
    timestamp: i64,
}

pub struct NestedDecoder;

impl PayloadDecoder for NestedDecoder {
    fn schema(&self) -> PayloadSchema {
        PayloadSchema::Nested
    }

    fn decode(&self, payload: &[u8]) -> Result<RawTelemetry, DecodeError> {
        let p: NestedPayload = parse_json(payload)?;
        Ok(RawTelemetry {
            device_id: p.device_id,
            sector_id: p.sector_id,
            x: p.position.x,
            y: p.position.y,
            z: p.position.z,
            heading: p.heading,
            battery: battery_percent(p.battery)?,
            moving: p.is_moving,
            timestamp_ms: p.timestamp.map(|t| t.to_millis()).transpose()?,
        })
    }

    fn encode(&self, record: &DeviceTelemetryRecord) -> Value {
        serde_json::to_value(NestedOut {
            device_id: &record.device_id,
            sector_id: record.sector_id,
            position: Position {
                x: record.x,
                y: record.y,
                z: record.z,
            },
            heading: record.heading,
            battery: record.battery,
            is_moving: record.moving,
            timestamp: record.timestamp_ms,
        })
        .unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// pose
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Pose {
    /// `[x, y, z, roll, pitch, yaw]`
    Array(Vec<f64>),
    Dict {
        x: f64,
        y: f64,
        #[serde(default)]
        z: f64,
        theta: Option<f64>,
    },
}

#[derive(Debug, Deserialize)]
struct PosePayload {
    sherpa_name: Option<String>,
    pose: Pose,
    #[serde(alias = "battery")]
    battery_status: Option<f64>,
    sector_id: Option<i64>,
    is_moving: Option<bool>,
    timestamp: Option<TimestampValue>,
}

pub struct PoseDecoder;

impl PayloadDecoder for PoseDecoder {
    fn schema(&self) -> PayloadSchema {
        PayloadSchema::Pose
    }

    fn decode(&self, payload: &[u8]) -> Result<RawTelemetry, DecodeError> {
        let p: PosePayload = parse_json(payload)?;
        let (x, y, z, heading) = match p.pose {
            Pose::Array(values) => {
                if values.len() < 6 {
                    return Err(malformed(format!(
                        "pose array needs 6 elements, got {}",
                        values.len()
                    )));
                }
                (values[0], values[1], values[2], Some(values[5]))
            }
            Pose::Dict { x, y, z, theta } => (x, y, z, theta),
        };

        Ok(RawTelemetry {
            device_id: p.sherpa_name,
            sector_id: p.sector_id,
            x,
            y,
            z,
            heading,
            battery: battery_percent(p.battery_status)?,
            moving: p.is_moving,
            timestamp_ms: p.timestamp.map(|t| t.to_millis()).transpose()?,
        })
    }

    fn encode(&self, record: &DeviceTelemetryRecord) -> Value {
        let pose = match record.heading {
            Some(yaw) => serde_json::json!([record.x, record.y, record.z, 0.0, 0.0, yaw]),
            None => serde_json::json!({ "x": record.x, "y": record.y, "z": record.z }),
        };
        let mut obj = serde_json::json!({
            "sherpa_name": record.device_id,
            "pose": pose,
            "sector_id": record.sector_id,
            "is_moving": record.moving,
            "timestamp": record.timestamp_ms,
        });
        if let (Some(battery), Some(map)) = (record.battery, obj.as_object_mut()) {
            map.insert("battery_status".to_string(), Value::from(battery));
        }
        obj
    }
}

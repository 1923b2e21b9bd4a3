//! Telemetry ingress
//!
//! Runs inside the MQTT delivery path: decode, validate, enqueue, return.
//! Nothing here awaits or retries; a record either lands in the intake
//! queue or is dropped with a counter increment.

pub mod movement;
pub mod queue;

use crate::config::IngressConfig;
use crate::health::Liveness;
use crate::telemetry::decoder::{decoder_for, PayloadDecoder, RawTelemetry};
use crate::telemetry::{DecodeError, DeviceTelemetryRecord};
use movement::MovementTracker;
use queue::{IntakeQueue, QueueError};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Counters read by the health monitor
#[derive(Debug, Default)]
pub struct IngressStats {
    pub received: AtomicU64,
    pub accepted: AtomicU64,
    pub malformed: AtomicU64,
    pub stale: AtomicU64,
    pub unknown_device: AtomicU64,
    pub queue_rejected: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngressStatsSnapshot {
    pub received: u64,
    pub accepted: u64,
    pub malformed: u64,
    pub stale: u64,
    pub unknown_device: u64,
    pub queue_rejected: u64,
}

impl IngressStats {
    pub fn snapshot(&self) -> IngressStatsSnapshot {
        IngressStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            unknown_device: self.unknown_device.load(Ordering::Relaxed),
            queue_rejected: self.queue_rejected.load(Ordering::Relaxed),
        }
    }

    fn record_rejection(&self, err: &DecodeError) {
        let counter = match err {
            DecodeError::Malformed(_) => &self.malformed,
            DecodeError::Stale { .. } => &self.stale,
            DecodeError::UnknownDevice(_) => &self.unknown_device,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Ingress {
    decoder: Box<dyn PayloadDecoder>,
    config: IngressConfig,
    /// Topic level that carries the device id (first `+` of the filter)
    device_level: Option<usize>,
    allowed: HashSet<String>,
    movement: Mutex<MovementTracker>,
    queue: Arc<IntakeQueue>,
    liveness: Arc<Liveness>,
    stats: Arc<IngressStats>,
}

impl Ingress {
    pub fn new(
        config: &IngressConfig,
        topic_filter: &str,
        queue: Arc<IntakeQueue>,
        liveness: Arc<Liveness>,
    ) -> Self {
        Self {
            decoder: decoder_for(config.schema, &config.fields),
            config: config.clone(),
            device_level: topic_filter.split('/').position(|level| level == "+"),
            allowed: config.allowed_devices.iter().cloned().collect(),
            movement: Mutex::new(MovementTracker::new(config.movement_threshold)),
            queue,
            liveness,
            stats: Arc::new(IngressStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngressStats> {
        self.stats.clone()
    }

    pub fn schema(&self) -> crate::config::PayloadSchema {
        self.decoder.schema()
    }

    /// Decode one MQTT message and hand it to the relay queue
    pub fn on_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<DeviceTelemetryRecord, IngressError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.on_message_at(topic, payload, now_ms)
    }

    pub fn on_message_at(
        &self,
        topic: &str,
        payload: &[u8],
        now_ms: i64,
    ) -> Result<DeviceTelemetryRecord, IngressError> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let record = match self.decode(topic, payload, now_ms) {
            Ok(record) => record,
            Err(e) => {
                self.stats.record_rejection(&e);
                debug!(topic = %topic, reason = e.reason(), "Dropping telemetry: {}", e);
                return Err(e.into());
            }
        };

        match self.queue.push(record.clone()) {
            Ok(evicted) => {
                if let Some(old) = evicted {
                    warn!(
                        device_id = %old.device_id,
                        "Intake queue full, evicted oldest record"
                    );
                }
            }
            Err(e) => {
                self.stats.queue_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(device_id = %record.device_id, "Rejecting telemetry: {}", e);
                return Err(e.into());
            }
        }

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        self.liveness.record_expected(now_ms);
        Ok(record)
    }

    /// Decode and validate without enqueueing
    pub fn decode(
        &self,
        topic: &str,
        payload: &[u8],
        now_ms: i64,
    ) -> Result<DeviceTelemetryRecord, DecodeError> {
        let raw = self.decoder.decode(payload)?;

        let device_id = raw
            .device_id
            .clone()
            .or_else(|| self.device_from_topic(topic))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DecodeError::Malformed("no device id in payload or topic".into()))?;

        if !self.allowed.is_empty() && !self.allowed.contains(&device_id) {
            return Err(DecodeError::UnknownDevice(device_id));
        }

        let timestamp_ms = raw.timestamp_ms.unwrap_or(now_ms);
        let age_ms = now_ms.saturating_sub(timestamp_ms);
        if age_ms > self.config.stale_threshold_ms as i64 {
            return Err(DecodeError::Stale { device_id, age_ms });
        }

        let sector_id = raw
            .sector_id
            .or_else(|| self.config.device_sectors.get(&device_id).copied())
            .or(self.config.default_sector)
            .ok_or_else(|| DecodeError::Malformed(format!("no sector id for {}", device_id)))?;

        Ok(self.resolve(raw, device_id, sector_id, timestamp_ms, now_ms))
    }

    fn resolve(
        &self,
        raw: RawTelemetry,
        device_id: String,
        sector_id: i64,
        timestamp_ms: i64,
        now_ms: i64,
    ) -> DeviceTelemetryRecord {
        let (x, y) = self.config.transform.apply(raw.x, raw.y);
        let moving = match raw.moving {
            Some(moving) => moving,
            None => self
                .movement
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .observe(&device_id, x, y, now_ms),
        };

        DeviceTelemetryRecord {
            device_id,
            sector_id,
            x,
            y,
            z: raw.z,
            heading: raw.heading,
            battery: raw.battery,
            moving,
            timestamp_ms,
        }
    }

    fn device_from_topic(&self, topic: &str) -> Option<String> {
        let level = self.device_level?;
        topic.split('/').nth(level).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AffineTransform, OverflowPolicy, PayloadSchema};

    const NOW: i64 = 1_722_594_900_000;

    fn ingress_with(config: IngressConfig, capacity: usize) -> (Ingress, Arc<IntakeQueue>) {
        let queue = Arc::new(IntakeQueue::new(capacity, capacity, OverflowPolicy::RejectNew));
        let ingress = Ingress::new(
            &config,
            "ati_fm/+/status",
            queue.clone(),
            Arc::new(Liveness::default()),
        );
        (ingress, queue)
    }

    fn pose_payload(name: &str, ts: i64) -> Vec<u8> {
        format!(
            r#"{{"sherpa_name":"{}","pose":[10.0,20.0,0.0,0.0,0.0,1.5],"battery_status":77,"timestamp":{}}}"#,
            name, ts
        )
        .into_bytes()
    }

    #[test]
    fn test_valid_message_is_enqueued() {
        let (ingress, queue) = ingress_with(IngressConfig::default(), 8);
        let record = ingress
            .on_message_at("ati_fm/sherpa/status", &pose_payload("tugger-01", NOW), NOW)
            .unwrap();
        assert_eq!(record.device_id, "tugger-01");
        assert_eq!(record.sector_id, 1);
        assert_eq!(record.heading, Some(1.5));
        assert!(record.moving);
        assert_eq!(queue.len(), 1);
        assert_eq!(ingress.stats().snapshot().accepted, 1);
    }

    #[test]
    fn test_stale_record_is_dropped() {
        let (ingress, queue) = ingress_with(IngressConfig::default(), 8);
        let err = ingress
            .on_message_at("ati_fm/sherpa/status", &pose_payload("tugger-01", NOW - 30_001), NOW)
            .unwrap_err();
        assert!(matches!(err, IngressError::Decode(DecodeError::Stale { age_ms: 30_001, .. })));
        assert!(queue.is_empty());
        assert_eq!(ingress.stats().snapshot().stale, 1);
    }

    #[test]
    fn test_ancient_timestamps_are_stale() {
        let config = IngressConfig {
            schema: PayloadSchema::Flat,
            ..IngressConfig::default()
        };
        let (ingress, queue) = ingress_with(config, 8);
        let min = br#"{"X":1,"Y":2,"SectorId":1,"Timestamp":-9223372036854775808}"#;
        let huge_float = br#"{"X":1,"Y":2,"SectorId":1,"Timestamp":-1.0e30}"#;
        for payload in [&min[..], &huge_float[..]] {
            let err = ingress.on_message_at("ati_fm/t/status", payload, NOW).unwrap_err();
            assert!(matches!(
                err,
                IngressError::Decode(DecodeError::Stale { age_ms: i64::MAX, .. })
            ));
        }
        assert!(queue.is_empty());
        assert_eq!(ingress.stats().snapshot().stale, 2);
    }

    #[test]
    fn test_record_at_threshold_is_accepted() {
        let (ingress, _) = ingress_with(IngressConfig::default(), 8);
        assert!(ingress
            .on_message_at("ati_fm/sherpa/status", &pose_payload("tugger-01", NOW - 30_000), NOW)
            .is_ok());
    }

    #[test]
    fn test_allow_list() {
        let config = IngressConfig {
            allowed_devices: vec!["tugger-01".to_string()],
            ..IngressConfig::default()
        };
        let (ingress, queue) = ingress_with(config, 8);
        let err = ingress
            .on_message_at("ati_fm/sherpa/status", &pose_payload("intruder", NOW), NOW)
            .unwrap_err();
        assert!(matches!(err, IngressError::Decode(DecodeError::UnknownDevice(id)) if id == "intruder"));
        assert!(ingress
            .on_message_at("ati_fm/sherpa/status", &pose_payload("tugger-01", NOW), NOW)
            .is_ok());
        assert_eq!(queue.len(), 1);
        assert_eq!(ingress.stats().snapshot().unknown_device, 1);
    }

    #[test]
    fn test_malformed_payload_is_counted() {
        let (ingress, queue) = ingress_with(IngressConfig::default(), 8);
        assert!(ingress.on_message_at("ati_fm/x/status", b"{oops", NOW).is_err());
        assert!(queue.is_empty());
        assert_eq!(ingress.stats().snapshot().malformed, 1);
        assert_eq!(ingress.stats().snapshot().received, 1);
    }

    #[test]
    fn test_device_falls_back_to_topic_level() {
        let config = IngressConfig {
            schema: PayloadSchema::Flat,
            ..IngressConfig::default()
        };
        let (ingress, _) = ingress_with(config, 8);
        let record = ingress
            .on_message_at("ati_fm/tugger-07/status", br#"{"X":1,"Y":2,"SectorId":4}"#, NOW)
            .unwrap();
        assert_eq!(record.device_id, "tugger-07");
        assert_eq!(record.sector_id, 4);
        assert_eq!(record.timestamp_ms, NOW);
    }

    #[test]
    fn test_missing_sector_without_default_is_malformed() {
        let config = IngressConfig {
            schema: PayloadSchema::Flat,
            default_sector: None,
            ..IngressConfig::default()
        };
        let (ingress, _) = ingress_with(config, 8);
        let err = ingress
            .decode("ati_fm/tugger-07/status", br#"{"X":1,"Y":2}"#, NOW)
            .unwrap_err();
        assert_eq!(err.reason(), "malformed");
    }

    #[test]
    fn test_device_sector_map() {
        let mut config = IngressConfig {
            schema: PayloadSchema::Flat,
            ..IngressConfig::default()
        };
        config.device_sectors.insert("tugger-07".to_string(), 2);
        let (ingress, _) = ingress_with(config, 8);
        let record = ingress
            .decode("ati_fm/tugger-07/status", br#"{"X":1,"Y":2}"#, NOW)
            .unwrap();
        assert_eq!(record.sector_id, 2);
    }

    #[test]
    fn test_transform_applied() {
        let config = IngressConfig {
            transform: AffineTransform {
                tx: 100.0,
                ty: -5.0,
                ..AffineTransform::default()
            },
            ..IngressConfig::default()
        };
        let (ingress, _) = ingress_with(config, 8);
        let record = ingress
            .decode("ati_fm/sherpa/status", &pose_payload("tugger-01", NOW), NOW)
            .unwrap();
        assert_eq!((record.x, record.y), (110.0, 15.0));
    }

    #[test]
    fn test_full_queue_rejects_and_counts() {
        let (ingress, queue) = ingress_with(IngressConfig::default(), 1);
        ingress
            .on_message_at("ati_fm/sherpa/status", &pose_payload("tugger-01", NOW), NOW)
            .unwrap();
        let err = ingress
            .on_message_at("ati_fm/sherpa/status", &pose_payload("tugger-02", NOW), NOW)
            .unwrap_err();
        assert!(matches!(err, IngressError::Queue(QueueError::Full { capacity: 1 })));
        assert_eq!(queue.len(), 1);
        assert_eq!(ingress.stats().snapshot().queue_rejected, 1);
    }
}

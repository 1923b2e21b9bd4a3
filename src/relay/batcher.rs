//! Per-sector batch formation
//!
//! Records are grouped by sector and by the cloud login that posts them.
//! A group's pending batch is flushed when it reaches `max_records`, when
//! its oldest record has waited `window`, or when the caller flushes
//! everything because the intake queue ran dry. Sectors are never mixed and
//! records keep arrival order.

use crate::cloud::types::LocalizationEntry;
use crate::telemetry::DeviceTelemetryRecord;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct RelayBatch {
    pub sector_id: i64,
    /// Cloud login whose session posts this batch
    pub login: String,
    pub records: Vec<DeviceTelemetryRecord>,
}

impl RelayBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Request body for the localization endpoint
    pub fn entries(&self, interval_ms: u64, default_battery: u8) -> Vec<LocalizationEntry> {
        self.records
            .iter()
            .map(|r| LocalizationEntry::from_record(r, interval_ms, default_battery))
            .collect()
    }
}

struct Pending {
    records: Vec<DeviceTelemetryRecord>,
    opened_at: Instant,
}

pub struct Batcher {
    max_records: usize,
    window: Duration,
    pending: BTreeMap<(i64, String), Pending>,
}

impl Batcher {
    pub fn new(max_records: usize, window: Duration) -> Self {
        Self {
            max_records: max_records.max(1),
            window,
            pending: BTreeMap::new(),
        }
    }

    /// Add a record posted as `login`; returns its batch once it is full
    pub fn push(
        &mut self,
        login: &str,
        record: DeviceTelemetryRecord,
        now: Instant,
    ) -> Option<RelayBatch> {
        let key = (record.sector_id, login.to_string());
        let pending = self.pending.entry(key.clone()).or_insert_with(|| Pending {
            records: Vec::new(),
            opened_at: now,
        });
        pending.records.push(record);

        if pending.records.len() >= self.max_records {
            return self.take(&key);
        }
        None
    }

    /// Batches whose oldest record has waited at least the window
    pub fn flush_due(&mut self, now: Instant) -> Vec<RelayBatch> {
        let due: Vec<(i64, String)> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.opened_at) >= self.window)
            .map(|(key, _)| key.clone())
            .collect();
        due.iter().filter_map(|key| self.take(key)).collect()
    }

    pub fn flush_all(&mut self) -> Vec<RelayBatch> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|((sector_id, login), p)| RelayBatch {
                sector_id,
                login,
                records: p.records,
            })
            .collect()
    }

    /// Earliest instant at which a pending batch becomes due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.opened_at + self.window)
            .min()
    }

    #[cfg(test)]
    fn pending_records(&self) -> usize {
        self.pending.values().map(|p| p.records.len()).sum()
    }

    fn take(&mut self, key: &(i64, String)) -> Option<RelayBatch> {
        self.pending.remove(key).map(|p| RelayBatch {
            sector_id: key.0,
            login: key.1.clone(),
            records: p.records,
        })
    }
}

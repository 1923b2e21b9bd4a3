//! Bounded intake queue between the MQTT delivery path and the relay task
//!
//! `push` never blocks. When the queue is full the overflow policy decides
//! between rejecting the new record and evicting the oldest one. While the
//! relay is backing off, occupancy above the high-water mark rejects new
//! records regardless of policy.

use crate::config::OverflowPolicy;
use crate::telemetry::DeviceTelemetryRecord;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("intake queue full ({capacity} records)")]
    Full { capacity: usize },
    #[error("relay backing off with {occupancy} queued records (high-water mark {high_water})")]
    Backpressure { occupancy: usize, high_water: usize },
}

pub struct IntakeQueue {
    records: Mutex<VecDeque<DeviceTelemetryRecord>>,
    capacity: usize,
    high_water: usize,
    policy: OverflowPolicy,
    relay_backoff: AtomicBool,
    evicted: AtomicU64,
    notify: Notify,
}

impl IntakeQueue {
    pub fn new(capacity: usize, high_water: usize, policy: OverflowPolicy) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            high_water,
            policy,
            relay_backoff: AtomicBool::new(false),
            evicted: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueue without blocking; returns the evicted record under drop-oldest
    pub fn push(
        &self,
        record: DeviceTelemetryRecord,
    ) -> Result<Option<DeviceTelemetryRecord>, QueueError> {
        let evicted = {
            let mut records = self.lock();
            let occupancy = records.len();

            if self.relay_backoff.load(Ordering::Acquire) && occupancy >= self.high_water {
                return Err(QueueError::Backpressure {
                    occupancy,
                    high_water: self.high_water,
                });
            }

            let evicted = if occupancy >= self.capacity {
                match self.policy {
                    OverflowPolicy::RejectNew => {
                        return Err(QueueError::Full {
                            capacity: self.capacity,
                        })
                    }
                    OverflowPolicy::DropOldest => records.pop_front(),
                }
            } else {
                None
            };
            records.push_back(record);
            evicted
        };

        if evicted.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        Ok(evicted)
    }

    /// Take everything currently queued, in arrival order
    pub fn drain(&self) -> Vec<DeviceTelemetryRecord> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Set by the relay while it sleeps between retries
    pub fn set_relay_backoff(&self, active: bool) {
        self.relay_backoff.store(active, Ordering::Release);
    }

    pub fn relay_backoff(&self) -> bool {
        self.relay_backoff.load(Ordering::Acquire)
    }

    /// Resolves once a push happened since the last call
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<DeviceTelemetryRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//! Moving-flag inference for producers that do not report one

use std::collections::HashMap;

/// Stored position is refreshed at least this often even when stationary
const REFRESH_INTERVAL_MS: i64 = 1_000;

/// Devices silent for longer than this are forgotten
const IDLE_EVICT_MS: i64 = 60_000;

struct LastPosition {
    x: f64,
    y: f64,
    at_ms: i64,
}

pub struct MovementTracker {
    threshold: f64,
    last: HashMap<String, LastPosition>,
    last_sweep_ms: i64,
}

impl MovementTracker {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            last: HashMap::new(),
            last_sweep_ms: i64::MIN,
        }
    }

    /// A device is moving when it travelled more than the threshold since
    /// the stored position. First sighting counts as moving.
    pub fn observe(&mut self, device_id: &str, x: f64, y: f64, now_ms: i64) -> bool {
        self.evict_idle(now_ms);

        let Some(last) = self.last.get_mut(device_id) else {
            self.last
                .insert(device_id.to_string(), LastPosition { x, y, at_ms: now_ms });
            return true;
        };

        let distance = (x - last.x).hypot(y - last.y);
        let moving = distance > self.threshold;
        if moving || now_ms - last.at_ms > REFRESH_INTERVAL_MS {
            *last = LastPosition { x, y, at_ms: now_ms };
        }
        moving
    }

    /// Sweeps at most once per idle interval
    fn evict_idle(&mut self, now_ms: i64) {
        if now_ms.saturating_sub(self.last_sweep_ms) < IDLE_EVICT_MS {
            return;
        }
        self.last_sweep_ms = now_ms;
        self.last
            .retain(|_, p| now_ms.saturating_sub(p.at_ms) <= IDLE_EVICT_MS);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.last.len()
    }
}

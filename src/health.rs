//! Liveness/readiness
//!
//! Healthy means the MQTT session is connected and the relay is keeping up:
//! either nothing has been waiting for delivery since the last successful
//! relay, or the wait is still shorter than the staleness threshold.

use crate::ingress::queue::IntakeQueue;
use crate::ingress::{IngressStats, IngressStatsSnapshot};
use crate::relay::{RelayStats, RelayStatsSnapshot};
use crate::session::mqtt::ConnectionState;
use crate::session::{AuthState, SessionManager};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Delivery timestamps shared by ingress and relay; zero means unset
#[derive(Debug, Default)]
pub struct Liveness {
    awaiting_since_ms: AtomicI64,
    last_success_ms: AtomicI64,
}

impl Liveness {
    /// Ingress accepted a record; starts the clock if nothing was pending
    pub fn record_expected(&self, now_ms: i64) {
        let _ = self.awaiting_since_ms.compare_exchange(
            0,
            now_ms.max(1),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn record_success(&self, now_ms: i64) {
        self.last_success_ms.store(now_ms, Ordering::Release);
        self.awaiting_since_ms.store(0, Ordering::Release);
    }

    pub fn awaiting_since_ms(&self) -> Option<i64> {
        let v = self.awaiting_since_ms.load(Ordering::Acquire);
        (v != 0).then_some(v)
    }

    pub fn last_success_ms(&self) -> Option<i64> {
        let v = self.last_success_ms.load(Ordering::Acquire);
        (v != 0).then_some(v)
    }

    pub fn is_fresh(&self, now_ms: i64, stale_threshold_ms: i64) -> bool {
        let Some(awaiting_since) = self.awaiting_since_ms() else {
            return true;
        };
        let since = self.last_success_ms().unwrap_or(0).max(awaiting_since);
        now_ms - since < stale_threshold_ms
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthDetail {
    pub connection: ConnectionState,
    pub auth: AuthState,
    pub cloud_sessions: usize,
    pub relay_fresh: bool,
    pub awaiting_since_ms: Option<i64>,
    pub last_success_ms: Option<i64>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub queue_evicted: u64,
    pub relay_backoff: bool,
    pub ingress: IngressStatsSnapshot,
    pub relay: RelayStatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub detail: HealthDetail,
}

pub struct HealthMonitor {
    connection: watch::Receiver<ConnectionState>,
    liveness: Arc<Liveness>,
    queue: Arc<IntakeQueue>,
    ingress: Arc<IngressStats>,
    relay: Arc<RelayStats>,
    sessions: Arc<SessionManager>,
    stale_threshold_ms: i64,
}

impl HealthMonitor {
    pub fn new(
        connection: watch::Receiver<ConnectionState>,
        liveness: Arc<Liveness>,
        queue: Arc<IntakeQueue>,
        ingress: Arc<IngressStats>,
        relay: Arc<RelayStats>,
        sessions: Arc<SessionManager>,
        stale_threshold_ms: u64,
    ) -> Self {
        Self {
            connection,
            liveness,
            queue,
            ingress,
            relay,
            sessions,
            stale_threshold_ms: stale_threshold_ms as i64,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status_at(chrono::Utc::now().timestamp_millis())
    }

    pub fn status_at(&self, now_ms: i64) -> HealthStatus {
        let connection = self.connection.borrow().clone();
        let relay_fresh = self.liveness.is_fresh(now_ms, self.stale_threshold_ms);
        HealthStatus {
            ok: connection.is_connected() && relay_fresh,
            detail: HealthDetail {
                connection,
                auth: self.sessions.state(),
                cloud_sessions: self.sessions.active_sessions(),
                relay_fresh,
                awaiting_since_ms: self.liveness.awaiting_since_ms(),
                last_success_ms: self.liveness.last_success_ms(),
                queue_depth: self.queue.len(),
                queue_capacity: self.queue.capacity(),
                queue_evicted: self.queue.evicted(),
                relay_backoff: self.queue.relay_backoff(),
                ingress: self.ingress.snapshot(),
                relay: self.relay.snapshot(),
            },
        }
    }

    pub fn request_auth_retry(&self) -> bool {
        self.sessions.request_retry()
    }
}

pub fn router(monitor: Arc<HealthMonitor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/retry", post(auth_retry))
        .with_state(monitor)
}

async fn health(State(monitor): State<Arc<HealthMonitor>>) -> (StatusCode, Json<serde_json::Value>) {
    let status = monitor.status();
    let (code, label) = if status.ok {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };
    (
        code,
        Json(serde_json::json!({ "status": label, "detail": status.detail })),
    )
}

async fn auth_retry(State(monitor): State<Arc<HealthMonitor>>) -> (StatusCode, Json<serde_json::Value>) {
    if monitor.request_auth_retry() {
        (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "retry_requested" })),
        )
    } else {
        (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "status": "not_halted" })),
        )
    }
}

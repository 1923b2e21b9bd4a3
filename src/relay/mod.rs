//! Relay pipeline: intake queue -> per-sector batches -> localization API
//!
//! A single task owns batching and delivery. Each batch gets one POST per
//! attempt:
//! - 2xx completes the batch
//! - 401 forces one re-auth and one immediate retry; a second 401 drops it
//! - 429, 5xx and transport errors back off (full jitter) up to
//!   `max_attempts` tries
//! - any other status drops the batch without retry
//!
//! A credential rejection from the authenticate endpoint halts the
//! pipeline with the batch held until a retry is requested.
//!
//! Once shutdown starts no new batch is started. The batch in flight gets
//! the shutdown deadline; everything else goes to the spill file, which the
//! next start relays first.

pub mod batcher;
pub mod loss;

use crate::backoff::{Backoff, Jitter};
use crate::cloud::types::LocalizationEntry;
use crate::cloud::{AuthError, CloudClient};
use crate::config::Config;
use crate::health::Liveness;
use crate::ingress::queue::IntakeQueue;
use crate::session::SessionManager;
use crate::telemetry::DeviceTelemetryRecord;
use batcher::{Batcher, RelayBatch};
use loss::LossRecorder;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("session rejected after re-authentication (status {status}): {body}")]
    AuthRejected { status: u16, body: String },
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("batch rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("relay halted: {0}")]
    AuthHalted(AuthError),
    #[error("relay cancelled by shutdown")]
    Cancelled,
}

impl RelayError {
    pub fn reason(&self) -> &'static str {
        match self {
            RelayError::AuthRejected { .. } => "auth_rejected",
            RelayError::Exhausted { .. } => "exhausted",
            RelayError::Rejected { .. } => "rejected",
            RelayError::AuthHalted(_) => "auth_halted",
            RelayError::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Default)]
pub struct RelayStats {
    pub batches_sent: AtomicU64,
    pub batches_failed: AtomicU64,
    pub records_sent: AtomicU64,
    pub records_lost: AtomicU64,
    pub records_spilled: AtomicU64,
    /// Taken back from the spill file at startup
    pub records_restored: AtomicU64,
    pub last_latency_ms: AtomicU64,
    /// Zero until the first successful relay
    pub last_success_ms: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatsSnapshot {
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub records_sent: u64,
    pub records_lost: u64,
    pub records_spilled: u64,
    pub records_restored: u64,
    pub last_latency_ms: u64,
    pub last_success_ms: Option<i64>,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        let last_success_ms = self.last_success_ms.load(Ordering::Relaxed);
        RelayStatsSnapshot {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            records_lost: self.records_lost.load(Ordering::Relaxed),
            records_spilled: self.records_spilled.load(Ordering::Relaxed),
            records_restored: self.records_restored.load(Ordering::Relaxed),
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
            last_success_ms: (last_success_ms != 0).then_some(last_success_ms),
        }
    }
}

/// Delivers one batch with the retry policy described in the module docs
pub struct Relay {
    cloud: Arc<CloudClient>,
    sessions: Arc<SessionManager>,
    queue: Arc<IntakeQueue>,
    liveness: Arc<Liveness>,
    stats: Arc<RelayStats>,
    backoff: Backoff,
    max_attempts: u32,
    interval_ms: u64,
    default_battery: u8,
    dry_run: bool,
}

impl Relay {
    pub fn new(
        config: &Config,
        cloud: Arc<CloudClient>,
        sessions: Arc<SessionManager>,
        queue: Arc<IntakeQueue>,
        liveness: Arc<Liveness>,
    ) -> Self {
        Self {
            cloud,
            sessions,
            queue,
            liveness,
            stats: Arc::new(RelayStats::default()),
            backoff: Backoff::new(
                Duration::from_millis(config.relay.backoff_base_ms),
                Duration::from_millis(config.relay.backoff_cap_ms),
                Jitter::Full,
            ),
            max_attempts: config.relay.max_attempts,
            interval_ms: config.cloud.interval_ms,
            default_battery: config.cloud.default_battery,
            dry_run: config.cloud.dry_run,
        }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    pub fn entries(&self, batch: &RelayBatch) -> Vec<LocalizationEntry> {
        batch.entries(self.interval_ms, self.default_battery)
    }

    pub async fn relay(
        &self,
        batch: &RelayBatch,
        shutdown: &CancellationToken,
    ) -> Result<(), RelayError> {
        let entries = self.entries(batch);

        if self.dry_run {
            let body = serde_json::to_string(&entries).unwrap_or_default();
            info!(
                sector_id = batch.sector_id,
                login = %batch.login,
                records = batch.len(),
                body = %body,
                "Dry run: would POST {} localization entries",
                entries.len()
            );
            self.record_success(batch, Duration::ZERO);
            return Ok(());
        }

        let mut attempt = 0u32;
        let mut reauthed = false;
        let mut next_session = None;

        loop {
            attempt += 1;
            let session = match next_session.take() {
                Some(session) => session,
                None => match self.sessions.session(&batch.login).await {
                    Ok(session) => session,
                    Err(e @ AuthError::Rejected { .. }) => return Err(RelayError::AuthHalted(e)),
                    Err(e) => {
                        self.back_off(batch, attempt, e.to_string(), shutdown).await?;
                        continue;
                    }
                },
            };

            let started = Instant::now();
            let failure = match self.cloud.post_localization(&session, &entries).await {
                Ok(outcome) if outcome.is_success() => {
                    self.record_success(batch, started.elapsed());
                    return Ok(());
                }
                Ok(outcome) if outcome.status == 401 => {
                    if reauthed {
                        return Err(RelayError::AuthRejected {
                            status: outcome.status,
                            body: outcome.body,
                        });
                    }
                    reauthed = true;
                    warn!(
                        sector_id = batch.sector_id,
                        login = %batch.login,
                        "Session refused by localization endpoint, re-authenticating"
                    );
                    match self.sessions.force_reauth(&session).await {
                        Ok(fresh) => {
                            next_session = Some(fresh);
                            continue;
                        }
                        Err(e @ AuthError::Rejected { .. }) => {
                            return Err(RelayError::AuthHalted(e))
                        }
                        Err(e) => e.to_string(),
                    }
                }
                Ok(outcome) if outcome.status == 429 || outcome.status >= 500 => {
                    format!("status {}: {}", outcome.status, outcome.body)
                }
                Ok(outcome) => {
                    return Err(RelayError::Rejected {
                        status: outcome.status,
                        body: outcome.body,
                    })
                }
                Err(e) => e.to_string(),
            };

            self.back_off(batch, attempt, failure, shutdown).await?;
        }
    }

    /// Sleep before the next attempt, or give up once attempts are spent
    async fn back_off(
        &self,
        batch: &RelayBatch,
        attempt: u32,
        failure: String,
        shutdown: &CancellationToken,
    ) -> Result<(), RelayError> {
        if attempt >= self.max_attempts {
            return Err(RelayError::Exhausted {
                attempts: attempt,
                last_error: failure,
            });
        }
        if shutdown.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let delay = self.backoff.delay(attempt);
        warn!(
            sector_id = batch.sector_id,
            "Relay attempt {}/{} failed: {}. Retrying in {:?}",
            attempt,
            self.max_attempts,
            failure,
            delay
        );

        self.queue.set_relay_backoff(true);
        let cancelled = tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        self.queue.set_relay_backoff(false);

        if cancelled {
            Err(RelayError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn record_success(&self, batch: &RelayBatch, latency: Duration) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let latency_ms = latency.as_millis() as u64;
        self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_sent
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.stats.last_latency_ms.store(latency_ms, Ordering::Relaxed);
        self.stats.last_success_ms.store(now_ms, Ordering::Relaxed);
        self.liveness.record_success(now_ms);
        debug!(
            sector_id = batch.sector_id,
            records = batch.len(),
            latency_ms,
            "Relayed batch"
        );
    }

    fn record_failure(&self, batch: &RelayBatch) {
        self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_lost
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
    }
}

pub struct RelayPipeline {
    relay: Relay,
    sessions: Arc<SessionManager>,
    queue: Arc<IntakeQueue>,
    batcher: Batcher,
    loss: LossRecorder,
    spill_path: Option<PathBuf>,
    shutdown_deadline: Duration,
}

impl RelayPipeline {
    pub fn new(
        config: &Config,
        cloud: Arc<CloudClient>,
        sessions: Arc<SessionManager>,
        queue: Arc<IntakeQueue>,
        liveness: Arc<Liveness>,
    ) -> Self {
        Self {
            relay: Relay::new(config, cloud, sessions.clone(), queue.clone(), liveness),
            sessions,
            queue,
            batcher: Batcher::new(
                config.relay.batch_size,
                Duration::from_millis(config.relay.batch_window_ms),
            ),
            loss: LossRecorder::new(config.relay.loss_log.clone()),
            spill_path: config.relay.spill_path.clone(),
            shutdown_deadline: Duration::from_millis(config.relay.shutdown_deadline_ms),
        }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.relay.stats()
    }

    /// Run until shutdown, then spill whatever was not delivered
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Relay pipeline started");
        let mut ready: VecDeque<RelayBatch> = VecDeque::new();
        self.restore_spill(&mut ready).await;

        'pipeline: loop {
            let now = Instant::now();
            for record in self.queue.drain() {
                self.batch_record(record, now, &mut ready);
            }
            ready.extend(self.batcher.flush_due(now));
            if self.queue.is_empty() {
                ready.extend(self.batcher.flush_all());
            }

            while let Some(batch) = ready.pop_front() {
                if shutdown.is_cancelled() {
                    ready.push_front(batch);
                    break 'pipeline;
                }
                match self.deliver(&batch, &shutdown).await {
                    Ok(()) => {}
                    Err(RelayError::Cancelled) => {
                        ready.push_front(batch);
                        break 'pipeline;
                    }
                    Err(RelayError::AuthHalted(e)) => {
                        error!(
                            sector_id = batch.sector_id,
                            "Relay halted: {}. POST /auth/retry to resume", e
                        );
                        ready.push_front(batch);
                        tokio::select! {
                            _ = self.sessions.wait_for_retry() => {
                                info!("Resuming relay after authentication retry");
                            }
                            _ = shutdown.cancelled() => break 'pipeline,
                        }
                    }
                    Err(e) => {
                        self.relay.record_failure(&batch);
                        let entries = self.relay.entries(&batch);
                        self.loss.record(&batch, &entries, &e).await;
                    }
                }
            }

            if shutdown.is_cancelled() {
                break;
            }

            let deadline = self.batcher.next_deadline();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue.notified() => {}
                _ = sleep_until(deadline) => {}
            }
        }

        self.finish(ready).await;
    }

    fn batch_record(
        &mut self,
        record: DeviceTelemetryRecord,
        now: Instant,
        ready: &mut VecDeque<RelayBatch>,
    ) {
        let login = self
            .sessions
            .credentials()
            .login_for(&record.device_id)
            .to_string();
        ready.extend(self.batcher.push(&login, record, now));
    }

    /// Queue what the previous run spilled ahead of new telemetry
    async fn restore_spill(&mut self, ready: &mut VecDeque<RelayBatch>) {
        let Some(path) = self.spill_path.clone() else {
            return;
        };
        let records = match loss::take_spill(&path).await {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to read spill file {:?}: {}", path, e);
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        info!("Relaying {} record(s) spilled by the previous run", records.len());
        self.relay
            .stats()
            .records_restored
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        let now = Instant::now();
        for record in records {
            self.batch_record(record, now, ready);
        }
        ready.extend(self.batcher.flush_all());
    }

    /// One batch; once shutdown starts it gets at most the shutdown deadline
    async fn deliver(&self, batch: &RelayBatch, shutdown: &CancellationToken) -> Result<(), RelayError> {
        let relay = self.relay.relay(batch, shutdown);
        tokio::pin!(relay);
        tokio::select! {
            result = &mut relay => result,
            _ = shutdown.cancelled() => {
                let deadline = Instant::now() + self.shutdown_deadline;
                tokio::time::timeout_at(deadline, &mut relay)
                    .await
                    .unwrap_or(Err(RelayError::Cancelled))
            }
        }
    }

    async fn finish(mut self, ready: VecDeque<RelayBatch>) {
        let mut leftover: Vec<DeviceTelemetryRecord> =
            ready.into_iter().flat_map(|b| b.records).collect();
        leftover.extend(self.batcher.flush_all().into_iter().flat_map(|b| b.records));
        leftover.extend(self.queue.drain());

        if leftover.is_empty() {
            info!("Relay pipeline stopped, nothing left to spill");
            return;
        }

        let stats = self.relay.stats();
        match loss::spill(self.spill_path.as_deref(), &leftover).await {
            Ok(written) => {
                let dropped = (leftover.len() - written) as u64;
                stats
                    .records_spilled
                    .fetch_add(written as u64, Ordering::Relaxed);
                stats.records_lost.fetch_add(dropped, Ordering::Relaxed);
                info!(
                    "Relay pipeline stopped: {} record(s) spilled, {} dropped",
                    written, dropped
                );
            }
            Err(e) => {
                stats
                    .records_lost
                    .fetch_add(leftover.len() as u64, Ordering::Relaxed);
                error!(
                    "Failed to spill {} record(s) to {:?}: {}",
                    leftover.len(),
                    self.spill_path,
                    e
                );
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

//! Recording of dropped batches and the shutdown spill file
//!
//! Loss lines carry the exact localization body that could not be
//! delivered. Spill lines carry validated records as they sat in the relay,
//! one JSON object per line. The pipeline takes the spill back on its next
//! start and relays it without decoding it again.

use super::batcher::RelayBatch;
use super::RelayError;
use crate::cloud::types::LocalizationEntry;
use crate::telemetry::DeviceTelemetryRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

#[derive(Debug, Serialize)]
pub struct LossRecord<'a> {
    pub recorded_at: DateTime<Utc>,
    pub reason: &'static str,
    pub sector_id: i64,
    pub login: &'a str,
    pub error: String,
    pub records: &'a [LocalizationEntry],
}

pub struct LossRecorder {
    path: Option<PathBuf>,
}

impl LossRecorder {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Log the dropped batch in full and append it to the loss log
    pub async fn record(&self, batch: &RelayBatch, entries: &[LocalizationEntry], err: &RelayError) {
        let line = LossRecord {
            recorded_at: Utc::now(),
            reason: err.reason(),
            sector_id: batch.sector_id,
            login: &batch.login,
            error: err.to_string(),
            records: entries,
        };
        let json = match serde_json::to_string(&line) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize loss record: {}", e);
                return;
            }
        };

        error!(
            sector_id = batch.sector_id,
            records = batch.len(),
            reason = err.reason(),
            body = %json,
            "Dropping batch: {}",
            err
        );

        if let Some(path) = &self.path {
            if let Err(e) = append_lines(path, std::iter::once(json)).await {
                error!("Failed to append to loss log {:?}: {}", path, e);
            }
        }
    }
}

/// Write undelivered records to the spill file; returns how many were written
pub async fn spill(
    path: Option<&Path>,
    records: &[DeviceTelemetryRecord],
) -> std::io::Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }
    let Some(path) = path else {
        warn!("Dropping {} undelivered record(s): no spill path configured", records.len());
        return Ok(0);
    };

    let lines = records
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    append_lines(path, lines).await?;
    Ok(records.len())
}

/// Read back a spill file and remove it
///
/// A missing file is an empty spill. Lines that do not parse are logged
/// and skipped.
pub async fn take_spill(path: &Path) -> std::io::Result<Vec<DeviceTelemetryRecord>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DeviceTelemetryRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping spill line {} of {:?}: {}", index + 1, path, e),
        }
    }

    tokio::fs::remove_file(path).await?;
    Ok(records)
}

async fn append_lines(path: &Path, lines: impl IntoIterator<Item = String>) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let mut buf = String::new();
    for line in lines {
        buf.push_str(&line);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes()).await?;
    file.flush().await
}

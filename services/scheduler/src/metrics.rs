//! Parsing of the metrics file written by the batch script.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tesbatch_model::NodeMetrics;
use tracing::debug;

const BYTES_PER_GB: f64 = 1_000_000_000.0;

/// Metrics plus the executor time window they imply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMetrics {
    pub metrics: NodeMetrics,

    /// When the node started working on the task (transfer image pull).
    pub executor_start: Option<DateTime<Utc>>,

    /// When outputs finished uploading.
    pub executor_end: Option<DateTime<Utc>>,
}

/// Parses `Key=Value` lines. Blank lines, unknown keys and unparsable
/// values are skipped.
pub fn parse_metrics(text: &str) -> ParsedMetrics {
    let values: HashMap<&str, &str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    let time = |key: &str| -> Option<DateTime<Utc>> {
        let value = values.get(key)?;
        match DateTime::parse_from_rfc3339(value) {
            Ok(t) => Some(t.with_timezone(&Utc)),
            Err(e) => {
                debug!(key, value, error = %e, "Ignoring unparsable timestamp");
                None
            }
        }
    };
    let number = |key: &str| -> Option<f64> { values.get(key)?.parse::<f64>().ok() };
    let duration = |start: &str, end: &str| -> Option<f64> {
        let (start, end) = (time(start)?, time(end)?);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    };

    let disk_size_kib = number("DiskSizeInKiB");
    let disk_used_kib = number("DiskUsedInKiB");

    let metrics = NodeMetrics {
        blobxfer_image_pull_duration_secs: duration("BlobXferPullStart", "BlobXferPullEnd"),
        executor_image_pull_duration_secs: duration("ExecutorPullStart", "ExecutorPullEnd"),
        executor_image_size_gb: number("ExecutorImageSizeInBytes").map(|b| b / BYTES_PER_GB),
        file_download_duration_secs: duration("DownloadStart", "DownloadEnd"),
        executor_duration_secs: duration("ExecutorStart", "ExecutorEnd"),
        file_upload_duration_secs: duration("UploadStart", "UploadEnd"),
        disk_used_gb: disk_used_kib.map(|kib| kib * 1024.0 / BYTES_PER_GB),
        disk_used_percent: match (disk_used_kib, disk_size_kib) {
            (Some(used), Some(size)) if size > 0.0 => Some(used / size * 100.0),
            _ => None,
        },
        file_download_size_gb: number("FileDownloadSizeInBytes").map(|b| b / BYTES_PER_GB),
        file_upload_size_gb: number("FileUploadSizeInBytes").map(|b| b / BYTES_PER_GB),
    };

    ParsedMetrics {
        metrics,
        executor_start: time("BlobXferPullStart"),
        executor_end: time("UploadEnd"),
    }
}

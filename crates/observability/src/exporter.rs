//! Snapshot encoders for file export

use crate::{ObservabilityError, Result, StatsSnapshot};
use serde::Serialize;
use std::path::Path;

/// Output format for exported snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// One JSON object per line
    JsonLines,
    /// Flat CSV rows; the active config is embedded as a JSON string column
    Csv,
}

impl ExportFormat {
    /// Pick a format from a file extension: `.csv` is CSV, anything else JSON lines
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Self::Csv,
            _ => Self::JsonLines,
        }
    }

    /// Encode one snapshot as a newline-terminated record
    ///
    /// For CSV, `first` controls whether the header row is emitted.
    pub fn encode<C: Serialize>(&self, snapshot: &StatsSnapshot<C>, first: bool) -> Result<String> {
        match self {
            Self::JsonLines => {
                let mut line = snapshot.to_json_line()?;
                line.push('\n');
                Ok(line)
            }
            Self::Csv => encode_csv(snapshot, first),
        }
    }
}

#[derive(Serialize)]
struct CsvRow {
    timestamp: String,
    uptime_ms: u64,
    submitted: u64,
    delivered: u64,
    reordered: u64,
    dropped: u64,
    forced_drops: u64,
    cancelled: u64,
    bytes_delivered: u64,
    pending: u64,
    active_flows: u64,
    throughput_bytes_per_sec: f64,
    active_config: String,
}

fn encode_csv<C: Serialize>(snapshot: &StatsSnapshot<C>, header: bool) -> Result<String> {
    let row = CsvRow {
        timestamp: snapshot.timestamp.to_rfc3339(),
        uptime_ms: snapshot.uptime_ms,
        submitted: snapshot.submitted,
        delivered: snapshot.delivered,
        reordered: snapshot.reordered,
        dropped: snapshot.dropped,
        forced_drops: snapshot.forced_drops,
        cancelled: snapshot.cancelled,
        bytes_delivered: snapshot.bytes_delivered,
        pending: snapshot.pending,
        active_flows: snapshot.active_flows,
        throughput_bytes_per_sec: snapshot.throughput_bytes_per_sec,
        active_config: serde_json::to_string(&snapshot.active_config)?,
    };

    let mut writer = csv::WriterBuilder::new()
        .has_headers(header)
        .from_writer(Vec::new());
    writer.serialize(&row)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| ObservabilityError::Export(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ObservabilityError::Export(e.to_string()))
}

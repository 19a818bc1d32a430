use anyhow::{anyhow, Context, Result};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::SweepConfig;
use crate::ensure_dir;
use crate::metrics::{AggregatedMetrics, METRIC_REGISTRY};
use crate::point::ConfigurationPoint;

pub const RESULT_HEADER: [&str; 12] = [
    "Timestamp",
    "Payload",
    "Validators",
    "Threshold",
    "Load Time",
    "Bytes Sent",
    "Bytes Received",
    "Tx Sent",
    "Tx Received",
    "Signatures Received",
    "Signatures Sent",
    "Total Tx In Consensus",
];

/// One CSV file per configuration point under a shared export directory.
/// A file's presence marks its point as done.
#[derive(Debug, Clone)]
pub struct ResultStore {
    export_dir: PathBuf,
}

impl ResultStore {
    pub fn new(export_dir: impl Into<PathBuf>) -> Self {
        Self {
            export_dir: export_dir.into(),
        }
    }

    pub fn from_config(config: &SweepConfig) -> Self {
        Self::new(config.export_dir())
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    pub fn path_for(&self, point: &ConfigurationPoint) -> PathBuf {
        self.export_dir.join(format!(
            "metrics_payload{}_validators{}_threshold{}_loadtime{}.csv",
            point.payload_size,
            point.validator_count,
            point.threshold_percent,
            point.load_duration_seconds
        ))
    }

    pub fn has_completed_result(&self, point: &ConfigurationPoint) -> bool {
        self.path_for(point).is_file()
    }

    /// Appends one row per timestamp, writing the header first when the file
    /// is new. Returns the number of data rows written.
    pub fn append_result(
        &self,
        point: &ConfigurationPoint,
        metrics: &AggregatedMetrics,
    ) -> Result<usize> {
        ensure_dir(&self.export_dir).with_context(|| {
            format!("failed to create export dir {}", self.export_dir.display())
        })?;
        let path = self.path_for(point);
        let write_header = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open result file {}", path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if write_header {
            writer.write_record(RESULT_HEADER)?;
        }

        let mut rows = 0usize;
        for ts in metrics.timestamps() {
            let mut record = Vec::with_capacity(RESULT_HEADER.len());
            record.push(ts.clone());
            record.push(point.payload_size.to_string());
            record.push(point.validator_count.to_string());
            record.push(point.threshold_percent.to_string());
            record.push(point.load_duration_seconds.to_string());
            for metric in METRIC_REGISTRY.iter() {
                let observed = metrics.series(metric.key).and_then(|s| s.get(ts));
                record.push(observed.map_or_else(|| "0".to_string(), format_cell));
            }
            writer.write_record(&record)?;
            rows += 1;
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| anyhow!("failed to flush {}: {}", path.display(), e.error()))?;
        file.sync_all()?;
        info!(path = %path.display(), rows, header = write_header, "results written");
        Ok(rows)
    }

    /// Points of `points` that already have a result file.
    pub fn completed<'a>(
        &self,
        points: impl IntoIterator<Item = &'a ConfigurationPoint>,
    ) -> Vec<ConfigurationPoint> {
        points
            .into_iter()
            .filter(|p| self.has_completed_result(p))
            .copied()
            .collect()
    }

    pub fn read_rows(&self, point: &ConfigurationPoint) -> Result<Vec<Vec<String>>> {
        let path = self.path_for(point);
        let data = fs::read(&path)
            .with_context(|| format!("failed to read result file {}", path.display()))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(data.as_slice());
        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(record?.iter().map(|s| s.to_string()).collect());
        }
        Ok(rows)
    }
}

/// Formats an observed value the way earlier result files did: shortest
/// round-trip digits, always with a fraction or exponent (`200.0`, `4.5`,
/// `1e+20`, `1e-05`).
fn format_cell(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let sci = format!("{:e}", value);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    if (-4..16).contains(&exp) {
        let plain = value.to_string();
        if plain.contains('.') {
            plain
        } else {
            format!("{}.0", plain)
        }
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    }
}

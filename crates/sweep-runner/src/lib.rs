//! Benchmark sweep orchestration: drives an external network harness through a
//! grid of configurations, pulls a metrics snapshot for each run and appends it
//! to a per-configuration CSV file.

use anyhow::Result;
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::Path;

pub mod config;
pub mod harness;
pub mod metrics;
pub mod point;
pub mod results;
pub mod sweep;

pub use config::{ConfigError, SweepConfig, SweepDimensions};
pub use harness::{
    CommandRunner, ExitPolicy, HarnessCommand, HarnessController, HarnessError, Lifecycle,
    MonitorState, ProcessRunner, Step, StepOutcome,
};
pub use metrics::{
    AggregatedMetrics, FetchStatus, MetricSeries, MetricsSource, PrometheusClient, RunWindow,
    METRIC_REGISTRY,
};
pub use point::ConfigurationPoint;
pub use results::{ResultStore, RESULT_HEADER};
pub use sweep::{
    describe_sweep, expand_points, run_sweep, PointOutcome, PointReport, Sweep, SweepPlan,
    SweepReport,
};

/// Node name used by the harness for validator `index` (`validator00`, `validator01`, ...).
pub fn validator_name(index: u32) -> String {
    format!("validator{:02}", index)
}

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "sweep_{}_test_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    ensure_dir(&dir).expect("temp dir");
    dir
}

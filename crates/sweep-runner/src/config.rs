//! Sweep configuration, loaded from `sweep.yaml`.
//!
//! Every section is optional; omitted keys fall back to the values the
//! mempool benchmark has always been run with. Relative paths resolve against
//! `harness.repo_root`, which itself resolves against the directory holding the
//! YAML file.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "sweep.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read sweep config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse sweep config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("dimension '{0}' must list at least one value")]
    EmptyDimension(&'static str),
    #[error("dimension '{0}' must not contain 0")]
    ZeroInDimension(&'static str),
    #[error("invalid metrics step '{0}': expected a duration such as 1s, 500ms or 1m")]
    InvalidStep(String),
    #[error("timing.{0} must be a finite, non-negative number of seconds")]
    InvalidDelay(&'static str),
    #[error("{0} must not be empty")]
    MissingValue(&'static str),
    #[error("metrics.timeout_seconds must be greater than 0")]
    ZeroTimeout,
    #[error(
        "timing.pre_roll_seconds ({pre_roll}) must be shorter than the shortest load \
         ({shortest_load}s) plus timing.post_roll_seconds ({post_roll})"
    )]
    WindowNeverOpens {
        pre_roll: f64,
        post_roll: f64,
        shortest_load: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub dimensions: SweepDimensions,
    pub metrics: MetricsConfig,
    pub results: ResultsConfig,
    pub harness: HarnessConfig,
    pub timing: TimingConfig,
}

/// The four axes of the sweep grid, expanded payload-outermost.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepDimensions {
    pub payloads: Vec<u64>,
    pub validators: Vec<u32>,
    pub thresholds: Vec<u32>,
    pub load_durations: Vec<u64>,
}

impl Default for SweepDimensions {
    fn default() -> Self {
        Self {
            payloads: vec![120],
            validators: vec![16],
            thresholds: vec![100],
            load_durations: vec![10],
        }
    }
}

impl SweepDimensions {
    pub fn point_count(&self) -> usize {
        self.payloads.len() * self.validators.len() * self.thresholds.len() * self.load_durations.len()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Range-query endpoint of the metrics backend.
    pub url: String,
    pub step: String,
    pub timeout_seconds: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090/api/v1/query_range".to_string(),
            step: "1s".to_string(),
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResultsConfig {
    pub export_dir: PathBuf,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from("test/e2e/monitoring/exported_data2"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub repo_root: PathBuf,
    /// Directory the runner executable is invoked from.
    pub workdir: PathBuf,
    /// Runner executable, relative to `workdir` when path-like.
    pub runner: String,
    /// Network file passed to the runner with `-f`, relative to `workdir`.
    pub network_file: PathBuf,
    pub log_level: String,
    pub load_tx_batch_size: u32,
    /// Environment variable carrying the mempool threshold percentage.
    pub threshold_env: String,
    /// Extra environment applied to every harness command.
    pub env: BTreeMap<String, String>,
    pub build: Vec<BuildStep>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            workdir: PathBuf::from("test/e2e"),
            runner: "./build/runner".to_string(),
            network_file: PathBuf::from("networks/simple.toml"),
            log_level: "info".to_string(),
            load_tx_batch_size: 5,
            threshold_env: "MEMPOOL_THRESHOLD_PERCENT".to_string(),
            env: BTreeMap::new(),
            build: vec![
                BuildStep {
                    program: "make".to_string(),
                    args: vec!["build".to_string()],
                    cwd: PathBuf::from("."),
                },
                BuildStep {
                    program: "make".to_string(),
                    args: vec!["fast".to_string()],
                    cwd: PathBuf::from("test/e2e"),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildStep {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, relative to `repo_root`.
    #[serde(default = "default_build_cwd")]
    pub cwd: PathBuf,
}

fn default_build_cwd() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    /// Added to the wall clock right before load to open the metrics window.
    pub pre_roll_seconds: f64,
    /// Added to the wall clock once load returns to close the metrics window.
    pub post_roll_seconds: f64,
    /// Wait between load completion and the metrics query.
    pub settle_seconds: f64,
    /// Wait after the post-run cleanup.
    pub cleanup_pause_seconds: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pre_roll_seconds: 5.0,
            post_roll_seconds: 2.0,
            settle_seconds: 4.0,
            cleanup_pause_seconds: 2.0,
        }
    }
}

impl SweepConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        if config.harness.repo_root.is_relative() {
            config.harness.repo_root = base.join(&config.harness.repo_root);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    /// Resolves `path` against the repository root unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.harness.repo_root.join(path)
        }
    }

    pub fn export_dir(&self) -> PathBuf {
        self.resolve(&self.results.export_dir)
    }

    pub fn harness_workdir(&self) -> PathBuf {
        self.resolve(&self.harness.workdir)
    }

    pub fn network_file_path(&self) -> PathBuf {
        let file = &self.harness.network_file;
        if file.is_absolute() {
            file.clone()
        } else {
            self.harness_workdir().join(file)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let dims = &self.dimensions;
        if dims.payloads.is_empty() {
            return Err(ConfigError::EmptyDimension("payloads"));
        }
        if dims.validators.is_empty() {
            return Err(ConfigError::EmptyDimension("validators"));
        }
        if dims.thresholds.is_empty() {
            return Err(ConfigError::EmptyDimension("thresholds"));
        }
        if dims.load_durations.is_empty() {
            return Err(ConfigError::EmptyDimension("load_durations"));
        }
        if dims.validators.contains(&0) {
            return Err(ConfigError::ZeroInDimension("validators"));
        }
        if dims.load_durations.contains(&0) {
            return Err(ConfigError::ZeroInDimension("load_durations"));
        }

        if self.metrics.url.trim().is_empty() {
            return Err(ConfigError::MissingValue("metrics.url"));
        }
        if !is_valid_step(&self.metrics.step) {
            return Err(ConfigError::InvalidStep(self.metrics.step.clone()));
        }
        if self.metrics.timeout_seconds == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        if self.harness.runner.trim().is_empty() {
            return Err(ConfigError::MissingValue("harness.runner"));
        }
        if self.harness.threshold_env.trim().is_empty() {
            return Err(ConfigError::MissingValue("harness.threshold_env"));
        }
        if self.harness.build.iter().any(|b| b.program.trim().is_empty()) {
            return Err(ConfigError::MissingValue("harness.build[].program"));
        }

        let timing = &self.timing;
        for (name, value) in [
            ("pre_roll_seconds", timing.pre_roll_seconds),
            ("post_roll_seconds", timing.post_roll_seconds),
            ("settle_seconds", timing.settle_seconds),
            ("cleanup_pause_seconds", timing.cleanup_pause_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidDelay(name));
            }
        }
        // The metrics window opens pre_roll after load starts and closes
        // post_roll after it ends.
        if let Some(&shortest_load) = dims.load_durations.iter().min() {
            if timing.pre_roll_seconds >= timing.post_roll_seconds + shortest_load as f64 {
                return Err(ConfigError::WindowNeverOpens {
                    pre_roll: timing.pre_roll_seconds,
                    post_roll: timing.post_roll_seconds,
                    shortest_load,
                });
            }
        }
        Ok(())
    }
}

/// Accepts a float number of seconds or a Prometheus duration made of
/// `<int><unit>` groups (`1s`, `500ms`, `1m30s`).
fn is_valid_step(step: &str) -> bool {
    let step = step.trim();
    if step.is_empty() {
        return false;
    }
    if let Ok(secs) = step.parse::<f64>() {
        return secs.is_finite() && secs > 0.0;
    }
    let mut rest = step;
    let mut total_digits = 0usize;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return false;
        }
        if rest[..digits].chars().any(|c| c != '0') {
            total_digits += digits;
        }
        rest = &rest[digits..];
        let unit = ["ms", "s", "m", "h", "d", "w", "y"]
            .iter()
            .find(|u| rest.starts_with(*u));
        match unit {
            Some(u) => rest = &rest[u.len()..],
            None => return false,
        }
    }
    total_digits > 0
}

/// Written by `sweep init`.
pub const SWEEP_TEMPLATE: &str = "\
# Benchmark sweep definition. Every key is optional.
dimensions:
  payloads: [120]                 # load_tx_size_bytes
  validators: [16]                # validator nodes per network
  thresholds: [100]               # mempool threshold percent
  load_durations: [10]            # seconds of generated load
metrics:
  url: http://localhost:9090/api/v1/query_range
  step: 1s
  timeout_seconds: 30
results:
  export_dir: test/e2e/monitoring/exported_data2
harness:
  repo_root: .                    # relative to this file
  workdir: test/e2e               # relative to repo_root
  runner: ./build/runner          # relative to workdir
  network_file: networks/simple.toml
  log_level: info
  load_tx_batch_size: 5
  threshold_env: MEMPOOL_THRESHOLD_PERCENT
  env: {}
  build:
    - program: make
      args: [build]
      cwd: .
    - program: make
      args: [fast]
      cwd: test/e2e
timing:
  pre_roll_seconds: 5
  post_roll_seconds: 2
  settle_seconds: 4
  cleanup_pause_seconds: 2
";

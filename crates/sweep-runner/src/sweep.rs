//! The sweep loop: expand the grid, skip finished points, run the rest one
//! at a time.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{SweepConfig, SweepDimensions};
use crate::harness::{CommandRunner, HarnessController, ProcessRunner, StepOutcome};
use crate::metrics::{MetricsSource, PrometheusClient};
use crate::point::ConfigurationPoint;
use crate::results::ResultStore;

/// Grid points in run order: payload outermost, load duration innermost.
pub fn expand_points(dims: &SweepDimensions) -> Vec<ConfigurationPoint> {
    let mut points = Vec::with_capacity(dims.point_count());
    for &payload in &dims.payloads {
        for &validators in &dims.validators {
            for &threshold in &dims.thresholds {
                for &load_time in &dims.load_durations {
                    points.push(ConfigurationPoint::new(
                        payload, validators, threshold, load_time,
                    ));
                }
            }
        }
    }
    points
}

#[derive(Debug, Clone, PartialEq)]
pub enum PointOutcome {
    /// A result file already existed.
    Skipped { path: PathBuf },
    Completed {
        path: PathBuf,
        rows: usize,
        empty: Vec<&'static str>,
        degraded: Vec<&'static str>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointReport {
    pub point: ConfigurationPoint,
    pub outcome: PointOutcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub points: Vec<PointReport>,
}

impl SweepReport {
    pub fn completed(&self) -> usize {
        self.points
            .iter()
            .filter(|p| matches!(p.outcome, PointOutcome::Completed { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.points
            .iter()
            .filter(|p| matches!(p.outcome, PointOutcome::Skipped { .. }))
            .count()
    }
}

pub struct Sweep<R, M> {
    harness: HarnessController<R>,
    metrics: M,
    store: ResultStore,
    step: String,
    settle_seconds: f64,
    cleanup_pause_seconds: f64,
    monitor_ready: bool,
}

impl<R: CommandRunner, M: MetricsSource> Sweep<R, M> {
    pub fn new(config: &SweepConfig, runner: R, metrics: M) -> Self {
        Self {
            harness: HarnessController::new(config, runner),
            metrics,
            store: ResultStore::from_config(config),
            step: config.metrics.step.clone(),
            settle_seconds: config.timing.settle_seconds,
            cleanup_pause_seconds: config.timing.cleanup_pause_seconds,
            monitor_ready: false,
        }
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn into_parts(self) -> (R, M) {
        (self.harness.into_runner(), self.metrics)
    }

    /// Runs every pending point of the grid. A fatal harness error aborts
    /// the sweep; points finished before it keep their result files.
    pub fn run_sweep(&mut self, dims: &SweepDimensions) -> Result<SweepReport> {
        let points = expand_points(dims);
        info!(points = points.len(), "sweep starting");
        let mut report = SweepReport::default();
        for point in points {
            info!(point = %point, "running test");
            let path = self.store.path_for(&point);
            if self.store.has_completed_result(&point) {
                info!(point = %point, path = %path.display(), "test already completed, skipping");
                report.points.push(PointReport {
                    point,
                    outcome: PointOutcome::Skipped { path },
                });
                continue;
            }
            let outcome = self
                .run_point(point)
                .with_context(|| format!("sweep aborted at {}", point))?;
            report.points.push(PointReport { point, outcome });
        }
        info!(
            completed = report.completed(),
            skipped = report.skipped(),
            "sweep finished"
        );
        Ok(report)
    }

    fn ensure_monitor(&mut self) -> Result<()> {
        if !self.monitor_ready {
            self.harness.reset_monitor()?;
            self.monitor_ready = true;
        }
        Ok(())
    }

    fn run_point(&mut self, point: ConfigurationPoint) -> Result<PointOutcome> {
        self.ensure_monitor()?;

        let (idle, _) = self.harness.begin(point).cleanup();
        let (loaded, window) = idle
            .configure()
            .and_then(|c| c.build())
            .and_then(|b| b.start())
            .and_then(|s| s.load())?;

        pause(self.settle_seconds);

        let sources: BTreeSet<u32> = point.validator_indices().collect();
        let metrics = self.metrics.fetch_aggregated(&window, &self.step, &sources);
        let empty = metrics.empty_metrics();
        let degraded = metrics.degraded_metrics();
        if !degraded.is_empty() {
            warn!(point = %point, metrics = ?degraded, "some metrics could not be fetched and were recorded as zero");
        }

        info!(point = %point, "saving data");
        let rows = self.store.append_result(&point, &metrics)?;

        let (_, post) = loaded.stop()?.cleanup();
        if post == StepOutcome::Succeeded {
            pause(self.cleanup_pause_seconds);
        }

        Ok(PointOutcome::Completed {
            path: self.store.path_for(&point),
            rows,
            empty,
            degraded,
        })
    }
}

/// Runs the configured sweep against the real harness and metrics backend.
pub fn run_sweep(config: &SweepConfig) -> Result<SweepReport> {
    config.validate()?;
    let client = PrometheusClient::from_config(&config.metrics)?;
    let mut sweep = Sweep::new(config, ProcessRunner, client);
    sweep.run_sweep(&config.dimensions)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub points: Vec<ConfigurationPoint>,
    pub completed: Vec<ConfigurationPoint>,
    pub export_dir: PathBuf,
    pub harness_workdir: PathBuf,
    pub network_file: PathBuf,
    pub metrics_url: String,
}

impl SweepPlan {
    pub fn pending(&self) -> Vec<ConfigurationPoint> {
        self.points
            .iter()
            .filter(|p| !self.completed.contains(p))
            .copied()
            .collect()
    }
}

/// What `run_sweep` would do, without touching the harness.
pub fn describe_sweep(config: &SweepConfig) -> Result<SweepPlan> {
    config.validate()?;
    let store = ResultStore::from_config(config);
    let points = expand_points(&config.dimensions);
    let completed = store.completed(&points);
    Ok(SweepPlan {
        points,
        completed,
        export_dir: store.export_dir().to_path_buf(),
        harness_workdir: config.harness_workdir(),
        network_file: config.network_file_path(),
        metrics_url: config.metrics.url.clone(),
    })
}

fn pause(seconds: f64) {
    let d = Duration::try_from_secs_f64(seconds).unwrap_or_default();
    if !d.is_zero() {
        std::thread::sleep(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::tests::{test_config, RecordingRunner};
    use crate::harness::{HarnessError, Step};
    use crate::metrics::{AggregatedMetrics, Aggregator, FetchStatus, RunWindow};
    use std::cell::RefCell;
    use std::fs;

    #[derive(Default)]
    struct StubMetrics {
        calls: RefCell<Vec<(RunWindow, String, BTreeSet<u32>)>>,
        degrade: Option<&'static str>,
    }

    impl MetricsSource for StubMetrics {
        fn fetch_aggregated(
            &self,
            window: &RunWindow,
            step: &str,
            sources: &BTreeSet<u32>,
        ) -> AggregatedMetrics {
            self.calls
                .borrow_mut()
                .push((*window, step.to_string(), sources.clone()));
            let mut agg = Aggregator::default();
            for metric in crate::metrics::METRIC_REGISTRY.iter() {
                if Some(metric.key) == self.degrade {
                    agg.set_status(metric.key, FetchStatus::Degraded { reason: "HTTP 500".into() });
                    continue;
                }
                agg.record(metric.key, 1_700_000_000.0, 1.0);
                agg.set_status(metric.key, FetchStatus::Fetched { samples: 1 });
            }
            agg.finish()
        }
    }

    fn dims(payloads: &[u64], validators: &[u32], thresholds: &[u32], loads: &[u64]) -> SweepDimensions {
        SweepDimensions {
            payloads: payloads.to_vec(),
            validators: validators.to_vec(),
            thresholds: thresholds.to_vec(),
            load_durations: loads.to_vec(),
        }
    }

    #[test]
    fn expansion_is_payload_outermost() {
        let points = expand_points(&dims(&[1, 2], &[4], &[50, 100], &[10]));
        assert_eq!(
            points,
            vec![
                ConfigurationPoint::new(1, 4, 50, 10),
                ConfigurationPoint::new(1, 4, 100, 10),
                ConfigurationPoint::new(2, 4, 50, 10),
                ConfigurationPoint::new(2, 4, 100, 10),
            ]
        );
    }

    #[test]
    fn completed_point_is_never_touched() {
        let root = crate::test_dir("sweep_skip");
        let cfg = test_config(&root);
        let store = ResultStore::from_config(&cfg);
        let point = ConfigurationPoint::new(100, 4, 100, 10);
        fs::create_dir_all(store.export_dir()).expect("export dir");
        fs::write(store.path_for(&point), "partial").expect("seed result");

        let mut sweep = Sweep::new(&cfg, RecordingRunner::new(cfg.network_file_path()), StubMetrics::default());
        let report = sweep.run_sweep(&dims(&[100], &[4], &[100], &[10])).expect("sweep");
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.completed(), 0);

        let (runner, metrics) = sweep.into_parts();
        assert!(runner.calls.is_empty(), "harness was invoked: {:?}", runner.labels());
        assert!(metrics.calls.borrow().is_empty());
        assert_eq!(fs::read_to_string(store.path_for(&point)).expect("read"), "partial");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn pending_point_runs_full_lifecycle_once() {
        let root = crate::test_dir("sweep_run");
        let cfg = test_config(&root);
        let mut sweep = Sweep::new(&cfg, RecordingRunner::new(cfg.network_file_path()), StubMetrics::default());
        let report = sweep.run_sweep(&dims(&[100], &[4], &[100], &[10])).expect("sweep");
        assert_eq!(report.completed(), 1);
        match &report.points[0].outcome {
            PointOutcome::Completed { rows, empty, degraded, .. } => {
                assert_eq!(*rows, 1);
                assert!(empty.is_empty());
                assert!(degraded.is_empty());
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let (runner, metrics) = sweep.into_parts();
        assert_eq!(
            runner.labels(),
            vec![
                "monitor:stop", "monitor:start", "cleanup", "build:build", "build:fast", "start",
                "load", "stop", "cleanup"
            ]
        );
        let calls = metrics.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "1s");
        assert_eq!(calls[0].2, [0, 1, 2, 3].into_iter().collect::<BTreeSet<u32>>());
        assert!(calls[0].0.end() > calls[0].0.start());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn second_sweep_skips_what_the_first_finished() {
        let root = crate::test_dir("sweep_resume");
        let cfg = test_config(&root);
        let grid = dims(&[100, 200], &[2], &[100], &[10]);

        let mut first = Sweep::new(&cfg, RecordingRunner::new(cfg.network_file_path()), StubMetrics::default());
        assert_eq!(first.run_sweep(&grid).expect("first").completed(), 2);

        let mut second = Sweep::new(&cfg, RecordingRunner::new(cfg.network_file_path()), StubMetrics::default());
        let report = second.run_sweep(&grid).expect("second");
        assert_eq!(report.skipped(), 2);
        let (runner, _) = second.into_parts();
        assert!(runner.calls.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn monitor_resets_once_per_sweep() {
        let root = crate::test_dir("sweep_monitor");
        let cfg = test_config(&root);
        let mut sweep = Sweep::new(&cfg, RecordingRunner::new(cfg.network_file_path()), StubMetrics::default());
        sweep.run_sweep(&dims(&[1], &[1], &[10, 20, 30], &[5])).expect("sweep");
        let (runner, _) = sweep.into_parts();
        let monitors = runner.labels().iter().filter(|l| l.starts_with("monitor:")).count();
        assert_eq!(monitors, 2);
        let starts = runner.labels().iter().filter(|l| *l == "start").count();
        assert_eq!(starts, 3);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn degraded_metric_is_reported_not_fatal() {
        let root = crate::test_dir("sweep_degraded");
        let cfg = test_config(&root);
        let metrics = StubMetrics {
            degrade: Some("bytes_sent"),
            ..Default::default()
        };
        let mut sweep = Sweep::new(&cfg, RecordingRunner::new(cfg.network_file_path()), metrics);
        let report = sweep.run_sweep(&dims(&[1], &[1], &[1], &[1])).expect("sweep");
        match &report.points[0].outcome {
            PointOutcome::Completed { degraded, .. } => assert_eq!(degraded, &vec!["bytes_sent"]),
            other => panic!("unexpected outcome {:?}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn start_failure_aborts_before_metrics_and_results() {
        let root = crate::test_dir("sweep_fatal");
        let cfg = test_config(&root);
        let mut runner = RecordingRunner::new(cfg.network_file_path());
        runner.fail_on("start", Ok(Some(1)));
        let mut sweep = Sweep::new(&cfg, runner, StubMetrics::default());
        let point = ConfigurationPoint::new(1, 1, 1, 1);
        let err = sweep
            .run_sweep(&dims(&[1, 2], &[1], &[1], &[1]))
            .expect_err("start failure is fatal");
        let harness_err = err
            .downcast_ref::<HarnessError>()
            .expect("harness error at the root");
        assert_eq!(harness_err.step(), Some(Step::Start));
        assert!(!sweep.store().has_completed_result(&point));

        let (runner, metrics) = sweep.into_parts();
        assert_eq!(runner.labels().last().map(String::as_str), Some("start"));
        assert!(metrics.calls.borrow().is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn window_that_cannot_open_fails_before_any_harness_call() {
        let root = crate::test_dir("sweep_window");
        let mut cfg = SweepConfig::default();
        cfg.harness.repo_root = root.clone();
        cfg.dimensions = dims(&[120], &[16], &[100], &[1]);

        let err = run_sweep(&cfg).expect_err("pre-roll longer than load plus post-roll");
        assert!(matches!(
            err.downcast_ref::<crate::config::ConfigError>(),
            Some(crate::config::ConfigError::WindowNeverOpens { shortest_load: 1, .. })
        ));
        assert!(!cfg.network_file_path().exists());
        assert!(!cfg.export_dir().exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn describe_lists_pending_points() {
        let root = crate::test_dir("sweep_describe");
        let mut cfg = test_config(&root);
        cfg.dimensions = dims(&[1, 2], &[1], &[1], &[1]);
        let store = ResultStore::from_config(&cfg);
        fs::create_dir_all(store.export_dir()).expect("export dir");
        fs::write(store.path_for(&ConfigurationPoint::new(2, 1, 1, 1)), "").expect("seed");

        let plan = describe_sweep(&cfg).expect("plan");
        assert_eq!(plan.points.len(), 2);
        assert_eq!(plan.completed, vec![ConfigurationPoint::new(2, 1, 1, 1)]);
        assert_eq!(plan.pending(), vec![ConfigurationPoint::new(1, 1, 1, 1)]);
        assert_eq!(plan.export_dir, root.join("test/e2e/monitoring/exported_data2"));
        let _ = fs::remove_dir_all(root);
    }
}

//! Control of the external benchmark network.
//!
//! Every runner invocation is described by a [`HarnessCommand`] and executed
//! through a [`CommandRunner`], so the controller can be driven without
//! spawning processes. A run walks the type states
//! `Idle -> Configured -> Built -> Started -> Loaded -> Stopped -> CleanedUp`;
//! each transition consumes the previous state.

use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SweepConfig;
use crate::metrics::RunWindow;
use crate::point::ConfigurationPoint;
use crate::{atomic_write_bytes, validator_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Cleanup,
    Build,
    Start,
    Load,
    Stop,
    Monitor,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Cleanup => "cleanup",
            Step::Build => "build",
            Step::Start => "start",
            Step::Load => "load",
            Step::Stop => "stop",
            Step::Monitor => "monitor",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a failing command aborts the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPolicy {
    Required,
    Tolerated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessCommand {
    pub step: Step,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub policy: ExitPolicy,
}

impl HarnessCommand {
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    /// The command failed but its policy allows that.
    Tolerated { reason: String },
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("harness {step} failed: `{command}` exited with status {status}")]
    ExitStatus {
        step: Step,
        command: String,
        status: String,
    },
    #[error("harness {step} failed: could not run `{command}`: {source}")]
    Spawn {
        step: Step,
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to render network file {}: {message}", .path.display())]
    Render { path: PathBuf, message: String },
    #[error("load finished before the metrics window opened (start {start:.3}, end {end:.3})")]
    EmptyWindow { start: f64, end: f64 },
}

impl HarnessError {
    pub fn step(&self) -> Option<Step> {
        match self {
            HarnessError::ExitStatus { step, .. } | HarnessError::Spawn { step, .. } => {
                Some(*step)
            }
            HarnessError::Render { .. } | HarnessError::EmptyWindow { .. } => None,
        }
    }
}

/// Executes harness commands to completion.
pub trait CommandRunner {
    /// Returns the exit code, or `None` when the process was killed by a signal.
    fn run(&mut self, command: &HarnessCommand) -> std::io::Result<Option<i32>>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &mut R {
    fn run(&mut self, command: &HarnessCommand) -> std::io::Result<Option<i32>> {
        (**self).run(command)
    }
}

/// Spawns real processes with inherited stdout/stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&mut self, command: &HarnessCommand) -> std::io::Result<Option<i32>> {
        let status = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.cwd)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()?;
        Ok(status.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Start,
    Stop,
}

impl MonitorState {
    fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Start => "start",
            MonitorState::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone)]
struct ResolvedBuildStep {
    program: String,
    args: Vec<String>,
    cwd: PathBuf,
}

pub struct HarnessController<R> {
    runner: R,
    workdir: PathBuf,
    runner_program: String,
    network_file_arg: String,
    network_file_path: PathBuf,
    log_level: String,
    load_tx_batch_size: u32,
    threshold_env: String,
    env: BTreeMap<String, String>,
    build_steps: Vec<ResolvedBuildStep>,
    pre_roll: f64,
    post_roll: f64,
}

impl<R: CommandRunner> HarnessController<R> {
    pub fn new(config: &SweepConfig, runner: R) -> Self {
        let workdir = config.harness_workdir();
        let build_steps = config
            .harness
            .build
            .iter()
            .map(|b| {
                let cwd = config.resolve(&b.cwd);
                ResolvedBuildStep {
                    program: resolve_program(&b.program, &cwd),
                    args: b.args.clone(),
                    cwd,
                }
            })
            .collect();
        Self {
            runner,
            runner_program: resolve_program(&config.harness.runner, &workdir),
            network_file_arg: config.harness.network_file.to_string_lossy().to_string(),
            network_file_path: config.network_file_path(),
            workdir,
            log_level: config.harness.log_level.clone(),
            load_tx_batch_size: config.harness.load_tx_batch_size,
            threshold_env: config.harness.threshold_env.clone(),
            env: config.harness.env.clone(),
            build_steps,
            pre_roll: config.timing.pre_roll_seconds,
            post_roll: config.timing.post_roll_seconds,
        }
    }

    pub fn into_runner(self) -> R {
        self.runner
    }

    /// Starts the lifecycle of one run.
    pub fn begin(&mut self, point: ConfigurationPoint) -> Lifecycle<'_, R, Idle> {
        Lifecycle {
            harness: self,
            point,
            _state: PhantomData,
        }
    }

    pub fn monitor(&mut self, state: MonitorState) -> Result<StepOutcome, HarnessError> {
        let command = self.runner_command(
            Step::Monitor,
            &["monitor", state.as_str()],
            ExitPolicy::Required,
            None,
        );
        self.execute(command)
    }

    /// Stops then starts the metrics scraper so every sweep begins from a
    /// known state.
    pub fn reset_monitor(&mut self) -> Result<(), HarnessError> {
        self.monitor(MonitorState::Stop)?;
        self.monitor(MonitorState::Start)?;
        Ok(())
    }

    fn runner_command(
        &self,
        step: Step,
        args: &[&str],
        policy: ExitPolicy,
        threshold: Option<u32>,
    ) -> HarnessCommand {
        let mut full_args = vec!["-f".to_string(), self.network_file_arg.clone()];
        full_args.extend(args.iter().map(|a| a.to_string()));
        HarnessCommand {
            step,
            program: self.runner_program.clone(),
            args: full_args,
            cwd: self.workdir.clone(),
            env: self.env_with_threshold(threshold),
            policy,
        }
    }

    fn env_with_threshold(&self, threshold: Option<u32>) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        if let Some(t) = threshold {
            env.insert(self.threshold_env.clone(), t.to_string());
        }
        env
    }

    fn execute(&mut self, command: HarnessCommand) -> Result<StepOutcome, HarnessError> {
        let rendered = command.display();
        debug!(step = %command.step, command = %rendered, cwd = %command.cwd.display(), "running harness command");
        let result = self.runner.run(&command);
        match (result, command.policy) {
            (Ok(Some(0)), _) => Ok(StepOutcome::Succeeded),
            (Ok(code), ExitPolicy::Required) => Err(HarnessError::ExitStatus {
                step: command.step,
                command: rendered,
                status: exit_label(code),
            }),
            (Err(source), ExitPolicy::Required) => Err(HarnessError::Spawn {
                step: command.step,
                command: rendered,
                source,
            }),
            (Ok(code), ExitPolicy::Tolerated) => {
                let reason = format!("exited with status {}", exit_label(code));
                warn!(step = %command.step, reason = %reason, "harness command failed; continuing");
                Ok(StepOutcome::Tolerated { reason })
            }
            (Err(err), ExitPolicy::Tolerated) => {
                let reason = format!("could not run: {}", err);
                warn!(step = %command.step, reason = %reason, "harness command failed; continuing");
                Ok(StepOutcome::Tolerated { reason })
            }
        }
    }

    fn render_configuration(
        &self,
        payload_size: u64,
        validator_count: u32,
    ) -> Result<(), HarnessError> {
        info!(payload_size, validator_count, path = %self.network_file_path.display(), "writing network file");
        let contents = network_file_contents(
            &self.log_level,
            payload_size,
            self.load_tx_batch_size,
            validator_count,
        );
        atomic_write_bytes(&self.network_file_path, contents.as_bytes()).map_err(|e| {
            HarnessError::Render {
                path: self.network_file_path.clone(),
                message: format!("{:#}", e),
            }
        })
    }

    fn build(&mut self, threshold: u32) -> Result<(), HarnessError> {
        info!(threshold, "building harness");
        let steps = self.build_steps.clone();
        for step in steps {
            let command = HarnessCommand {
                step: Step::Build,
                program: step.program,
                args: step.args,
                cwd: step.cwd,
                env: self.env_with_threshold(Some(threshold)),
                policy: ExitPolicy::Required,
            };
            self.execute(command)?;
        }
        Ok(())
    }

    fn start(&mut self, threshold: u32) -> Result<(), HarnessError> {
        let command =
            self.runner_command(Step::Start, &["start"], ExitPolicy::Required, Some(threshold));
        self.execute(command).map(|_| ())
    }

    fn load(&mut self, duration_seconds: u64) -> Result<(), HarnessError> {
        let secs = duration_seconds.to_string();
        let command = self.runner_command(
            Step::Load,
            &["load", "--time", secs.as_str()],
            ExitPolicy::Required,
            None,
        );
        self.execute(command).map(|_| ())
    }

    fn stop(&mut self) -> Result<(), HarnessError> {
        let command = self.runner_command(Step::Stop, &["stop"], ExitPolicy::Required, None);
        self.execute(command).map(|_| ())
    }

    fn cleanup(&mut self) -> StepOutcome {
        let command = self.runner_command(Step::Cleanup, &["cleanup"], ExitPolicy::Tolerated, None);
        match self.execute(command) {
            Ok(outcome) => outcome,
            Err(err) => StepOutcome::Tolerated {
                reason: err.to_string(),
            },
        }
    }
}

fn exit_label(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn command_part_looks_like_path(part: &str) -> bool {
    part.starts_with("./") || part.starts_with("../") || part.contains('/')
}

/// Path-like relative programs are anchored to `cwd`; bare names are left for
/// `PATH` lookup.
fn resolve_program(program: &str, cwd: &Path) -> String {
    let p = Path::new(program);
    if p.is_relative() && command_part_looks_like_path(program) {
        cwd.join(p).to_string_lossy().to_string()
    } else {
        program.to_string()
    }
}

/// Network definition understood by the harness runner.
pub fn network_file_contents(
    log_level: &str,
    payload_size: u64,
    batch_size: u32,
    validator_count: u32,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("log_level = \"{}\"\n", log_level));
    out.push_str(&format!("load_tx_size_bytes = {}\n", payload_size));
    out.push_str(&format!("load_tx_batch_size = {}\n", batch_size));
    out.push_str("prometheus = true\n");
    for i in 0..validator_count {
        out.push_str(&format!("[node.{}]\n", validator_name(i)));
    }
    out
}

fn now_epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub struct Idle;
pub struct Configured;
pub struct Built;
pub struct Started;
pub struct Loaded;
pub struct Stopped;
pub struct CleanedUp;

/// One run of the harness in state `S`.
pub struct Lifecycle<'h, R, S> {
    harness: &'h mut HarnessController<R>,
    point: ConfigurationPoint,
    _state: PhantomData<S>,
}

impl<'h, R: CommandRunner, S> Lifecycle<'h, R, S> {
    fn advance<T>(self) -> Lifecycle<'h, R, T> {
        Lifecycle {
            harness: self.harness,
            point: self.point,
            _state: PhantomData,
        }
    }
}

impl<'h, R: CommandRunner> Lifecycle<'h, R, Idle> {
    /// Tears down whatever a previous run left behind; never fatal.
    pub fn cleanup(self) -> (Self, StepOutcome) {
        let outcome = self.harness.cleanup();
        if outcome == StepOutcome::Succeeded {
            debug!(point = %self.point, "pre-run cleanup done");
        } else {
            info!(point = %self.point, "nothing to clean before run");
        }
        (self, outcome)
    }

    pub fn configure(self) -> Result<Lifecycle<'h, R, Configured>, HarnessError> {
        self.harness
            .render_configuration(self.point.payload_size, self.point.validator_count)?;
        Ok(self.advance())
    }
}

impl<'h, R: CommandRunner> Lifecycle<'h, R, Configured> {
    pub fn build(self) -> Result<Lifecycle<'h, R, Built>, HarnessError> {
        self.harness.build(self.point.threshold_percent)?;
        Ok(self.advance())
    }
}

impl<'h, R: CommandRunner> Lifecycle<'h, R, Built> {
    pub fn start(self) -> Result<Lifecycle<'h, R, Started>, HarnessError> {
        info!(point = %self.point, "starting network");
        self.harness.start(self.point.threshold_percent)?;
        Ok(self.advance())
    }
}

impl<'h, R: CommandRunner> Lifecycle<'h, R, Started> {
    /// Runs the load phase and returns the window its metrics fall into.
    pub fn load(self) -> Result<(Lifecycle<'h, R, Loaded>, RunWindow), HarnessError> {
        let start = now_epoch_seconds() + self.harness.pre_roll;
        info!(point = %self.point, seconds = self.point.load_duration_seconds, "applying load");
        self.harness.load(self.point.load_duration_seconds)?;
        let end = now_epoch_seconds() + self.harness.post_roll;
        let window =
            RunWindow::new(start, end).map_err(|_| HarnessError::EmptyWindow { start, end })?;
        Ok((self.advance(), window))
    }
}

impl<'h, R: CommandRunner> Lifecycle<'h, R, Loaded> {
    pub fn stop(self) -> Result<Lifecycle<'h, R, Stopped>, HarnessError> {
        info!(point = %self.point, "stopping network");
        self.harness.stop()?;
        Ok(self.advance())
    }
}

impl<'h, R: CommandRunner> Lifecycle<'h, R, Stopped> {
    pub fn cleanup(self) -> (Lifecycle<'h, R, CleanedUp>, StepOutcome) {
        let outcome = self.harness.cleanup();
        (self.advance(), outcome)
    }
}

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use sweep_runner::config::{DEFAULT_CONFIG_FILE, SWEEP_TEMPLATE};
use sweep_runner::{ConfigurationPoint, PointOutcome, SweepConfig, SweepDimensions};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sweep", version, about = "Mempool benchmark sweep runner")]
struct Cli {
    /// Fallback log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    log_format: LogFormatArg,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    #[value(name = "text")]
    Text,
    #[value(name = "json")]
    Json,
}

/// Comma-separated replacements for the configured dimension lists.
#[derive(Args, Debug, Default, Clone)]
struct DimensionArgs {
    #[arg(long, value_delimiter = ',')]
    payloads: Vec<u64>,
    #[arg(long, value_delimiter = ',')]
    validators: Vec<u32>,
    #[arg(long, value_delimiter = ',')]
    thresholds: Vec<u32>,
    #[arg(long = "load-durations", value_delimiter = ',')]
    load_durations: Vec<u64>,
}

impl DimensionArgs {
    fn apply(self, dims: &mut SweepDimensions) {
        if !self.payloads.is_empty() {
            dims.payloads = self.payloads;
        }
        if !self.validators.is_empty() {
            dims.validators = self.validators;
        }
        if !self.thresholds.is_empty() {
            dims.thresholds = self.thresholds;
        }
        if !self.load_durations.is_empty() {
            dims.load_durations = self.load_durations;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configuration point that has no result file yet.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        dimensions: DimensionArgs,
        #[arg(long)]
        json: bool,
    },
    /// Show the expanded grid and which points are already done.
    Describe {
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        dimensions: DimensionArgs,
        #[arg(long)]
        json: bool,
    },
    /// Write a config file with the default settings.
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format)?;
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(level: &str, format: LogFormatArg) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let init_result = match format {
        LogFormatArg::Json => builder.json().try_init(),
        LogFormatArg::Text => builder.with_target(false).try_init(),
    };
    init_result.map_err(|e| anyhow!("failed to initialise logging: {}", e))
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            dimensions,
            json,
        } => {
            let cfg = load_config(config.as_deref(), dimensions)?;
            let report = sweep_runner::run_sweep(&cfg)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "export_dir": cfg.export_dir().display().to_string(),
                    "completed": report.completed(),
                    "skipped": report.skipped(),
                    "points": report.points.iter().map(|p| point_report_to_json(&p.point, &p.outcome)).collect::<Vec<_>>()
                })));
            }
            for p in &report.points {
                match &p.outcome {
                    PointOutcome::Skipped { path } => {
                        println!("skipped   {}  ({})", p.point, path.display());
                    }
                    PointOutcome::Completed {
                        path,
                        rows,
                        empty,
                        degraded,
                    } => {
                        println!("completed {}  rows={}  ({})", p.point, rows, path.display());
                        if !empty.is_empty() {
                            println!("  no data: {}", empty.join(", "));
                        }
                        if !degraded.is_empty() {
                            println!("  query failed: {}", degraded.join(", "));
                        }
                    }
                }
            }
            println!(
                "points: {} completed, {} skipped",
                report.completed(),
                report.skipped()
            );
        }
        Commands::Describe {
            config,
            dimensions,
            json,
        } => {
            let cfg = load_config(config.as_deref(), dimensions)?;
            let plan = sweep_runner::describe_sweep(&cfg)?;
            let pending = plan.pending();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "export_dir": plan.export_dir.display().to_string(),
                    "harness_workdir": plan.harness_workdir.display().to_string(),
                    "network_file": plan.network_file.display().to_string(),
                    "metrics_url": plan.metrics_url,
                    "points": plan.points.iter().map(point_to_json).collect::<Vec<_>>(),
                    "completed": plan.completed.iter().map(point_to_json).collect::<Vec<_>>(),
                    "pending": pending.iter().map(point_to_json).collect::<Vec<_>>()
                })));
            }
            println!("export_dir: {}", plan.export_dir.display());
            println!("harness_workdir: {}", plan.harness_workdir.display());
            println!("network_file: {}", plan.network_file.display());
            println!("metrics_url: {}", plan.metrics_url);
            println!(
                "points: {} total, {} done, {} pending",
                plan.points.len(),
                plan.completed.len(),
                pending.len()
            );
            for point in &plan.points {
                let mark = if plan.completed.contains(point) { "done" } else { "todo" };
                println!("  [{}] {}", mark, point);
            }
        }
        Commands::Init { path, force } => {
            if path.exists() && !force {
                return Err(anyhow!(
                    "{} already exists; pass --force to overwrite",
                    path.display()
                ));
            }
            std::fs::write(&path, SWEEP_TEMPLATE)?;
            println!("wrote: {}", path.display());
        }
    }
    Ok(None)
}

/// Explicit `--config`, else `./sweep.yaml` when present, else built-in defaults.
fn load_config(path: Option<&Path>, dimensions: DimensionArgs) -> Result<SweepConfig> {
    let mut cfg = match path {
        Some(p) => SweepConfig::load(p)?,
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_FILE);
            if default_path.is_file() {
                SweepConfig::load(default_path)?
            } else {
                info!("no {} found; using built-in defaults", DEFAULT_CONFIG_FILE);
                SweepConfig::default()
            }
        }
    };
    dimensions.apply(&mut cfg.dimensions);
    cfg.validate()?;
    info!(
        points = cfg.dimensions.point_count(),
        export_dir = %cfg.export_dir().display(),
        "configuration loaded"
    );
    Ok(cfg)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn point_to_json(point: &ConfigurationPoint) -> Value {
    json!({
        "payload": point.payload_size,
        "validators": point.validator_count,
        "threshold": point.threshold_percent,
        "load_time": point.load_duration_seconds
    })
}

fn point_report_to_json(point: &ConfigurationPoint, outcome: &PointOutcome) -> Value {
    match outcome {
        PointOutcome::Skipped { path } => json!({
            "point": point_to_json(point),
            "status": "skipped",
            "path": path.display().to_string()
        }),
        PointOutcome::Completed {
            path,
            rows,
            empty,
            degraded,
        } => json!({
            "point": point_to_json(point),
            "status": "completed",
            "path": path.display().to_string(),
            "rows": rows,
            "empty_metrics": empty,
            "degraded_metrics": degraded
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_flags_replace_only_given_lists() {
        let cli = Cli::try_parse_from([
            "sweep",
            "run",
            "--payloads",
            "120,500",
            "--validators",
            "4",
        ])
        .expect("parse");
        let Commands::Run { dimensions, .. } = cli.command else {
            panic!("expected run");
        };
        let mut dims = SweepDimensions::default();
        dimensions.apply(&mut dims);
        assert_eq!(dims.payloads, vec![120, 500]);
        assert_eq!(dims.validators, vec![4]);
        assert_eq!(dims.thresholds, SweepDimensions::default().thresholds);
        assert_eq!(dims.load_durations, SweepDimensions::default().load_durations);
    }

    #[test]
    fn json_flag_selects_json_errors() {
        let cli = Cli::try_parse_from(["sweep", "describe", "--json"]).expect("parse");
        assert!(command_json_mode(&cli.command));
        let cli = Cli::try_parse_from(["sweep", "init", "--force"]).expect("parse");
        assert!(!command_json_mode(&cli.command));
    }
}

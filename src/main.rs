use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loadstage::config::PlanFile;
use loadstage::duration::Human;
use loadstage::error::{ConfigError, EngineError};
use loadstage::scheduler::Schedule;
use loadstage::summary::{EXIT_INVALID_CONFIG, EXIT_OK};
use loadstage::telemetry::{init_tracing, shutdown_signal};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "loadstage")]
#[command(about = "Run staged virtual-user load tests with checks and thresholds", long_about = None)]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "LOADSTAGE_LOG_JSON")]
    log_json: bool,

    /// Only log warnings and errors
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a test plan and print the end-of-test summary
    Run {
        /// Plan file (TOML)
        plan: PathBuf,

        /// Override the base URL of every script in the plan
        #[arg(long, env = "LOADSTAGE_BASE_URL")]
        base_url: Option<String>,

        /// Write the summary as JSON to this file
        #[arg(long)]
        summary_export: Option<PathBuf>,
    },

    /// Load and validate a plan without sending any traffic
    Validate {
        /// Plan file (TOML)
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json, cli.quiet);

    match dispatch(cli.command).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            let code = exit_code_for(&err);
            error!("loadstage failed: {err:#}");
            ExitCode::from(code)
        }
    }
}

async fn dispatch(command: Commands) -> Result<u8> {
    match command {
        Commands::Run {
            plan,
            base_url,
            summary_export,
        } => run(plan, base_url, summary_export).await,
        Commands::Validate { plan } => validate(plan),
    }
}

async fn run(path: PathBuf, base_url: Option<String>, summary_export: Option<PathBuf>) -> Result<u8> {
    let engine = PlanFile::load(&path)?.into_engine(base_url.as_deref())?;
    engine.validate()?;

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });

    info!(plan = %path.display(), "running plan");
    let report = engine.run().await?;
    println!("{report}");

    if let Some(export) = summary_export {
        report
            .export_json(&export)
            .await
            .with_context(|| format!("writing summary to {}", export.display()))?;
        info!(path = %export.display(), "summary exported");
    }
    Ok(report.exit_code())
}

fn validate(path: PathBuf) -> Result<u8> {
    let engine = PlanFile::load(&path)?.into_engine(None)?;
    engine.validate()?;

    let plan = engine.plan();
    println!("plan {} is valid", path.display());
    for scenario in &plan.scenarios {
        let schedule = Schedule::for_executor(&scenario.executor);
        println!("  scenario {scenario}");
        println!("    exec {:?}, max {} VUs", scenario.exec, schedule.max_vus());
        for (offset, target) in schedule.checkpoints() {
            println!("    {:>8} -> {target} VUs", Human(offset).to_string());
        }
    }
    for threshold in plan.thresholds.iter() {
        let abort = if threshold.abort_on_fail { " (abortOnFail)" } else { "" };
        println!("  threshold {} {}{abort}", threshold.selector, threshold.source);
    }
    Ok(EXIT_OK)
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    let config_error = err.downcast_ref::<ConfigError>().is_some()
        || matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Config(_) | EngineError::MissingExec { .. })
        );
    if config_error {
        EXIT_INVALID_CONFIG
    } else {
        1
    }
}

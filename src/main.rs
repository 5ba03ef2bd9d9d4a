use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod error;
mod patch;
mod paths;
mod pipeline;
mod run_log;
mod runner;
mod staging;
mod status;
mod timestep;

use cli::RootArgs;
use pipeline::{Pipeline, PipelineOutcome};
use runner::CancelToken;

/// Environment variable holding the tracing filter directives.
const LOG_ENV: &str = "GDAXS_LOG";

fn main() -> Result<()> {
    init_tracing();
    let args = RootArgs::parse();

    let config_path = args.config_path();
    if args.write_config {
        config::write_config(&config_path, &config::default_config())?;
        println!("Wrote default config to {}", config_path.display());
        return Ok(());
    }

    let mut case_config = config::load_config_or_default(&config_path)?;
    if let Some(cores) = args.cores {
        case_config.cores = cores;
    }
    if let Some(script) = &args.env_script {
        case_config.environment_script = Some(script.clone());
    }
    config::validate_config(&case_config)
        .with_context(|| format!("invalid config {}", config_path.display()))?;

    if args.info {
        return cmd_info(&args, &case_config);
    }
    if args.wants_clean() {
        cmd_clean(&args, &case_config)?;
    }
    let selection = args.selection();
    if selection.is_empty() {
        if args.wants_clean() {
            return Ok(());
        }
        return Err(anyhow!(
            "nothing to do; select stages with -m, -d, -x or -a (see --help)"
        ));
    }

    let cancel = CancelToken::new();
    cancel.install_interrupt_handler()?;
    let pipeline = Pipeline::new(case_config, args.case_dir.clone(), cancel)?;
    let started = Instant::now();
    match pipeline.run(selection)? {
        PipelineOutcome::Completed { stages } => {
            tracing::info!(
                stages = stages.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "pipeline complete"
            );
        }
        PipelineOutcome::Cancelled { stage, command } => {
            tracing::info!(stage = %stage, command = %command, "pipeline cancelled");
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn cmd_clean(args: &RootArgs, case_config: &config::CaseConfig) -> Result<()> {
    let report = pipeline::clean_case(case_config, &args.case_dir)?;
    println!(
        "Cleaned {}: removed {} files and {} folders",
        args.case_dir.display(),
        report.files_removed,
        report.dirs_removed
    );
    Ok(())
}

fn cmd_info(args: &RootArgs, case_config: &config::CaseConfig) -> Result<()> {
    let interval = args.poll_interval()?;
    let paths = paths::CasePaths::new(args.case_dir.clone(), case_config.layout.clone());
    let mut stdout = io::stdout();
    status::monitor(&paths, interval, &mut stdout)
}

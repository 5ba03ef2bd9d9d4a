//! Stage sequencing: Mesh, then Dispersion, then Combustion.
//!
//! Each enabled stage rebuilds the working case from templates and archived
//! artifacts, runs its command sequence one process at a time, and archives
//! whatever the next stage needs. Any solver failure ends the whole run.
use crate::config::{validate_config, ArchiveMode, ArchiveSource, CaseConfig, StageConfig};
use crate::error::{PipelineError, StagingError};
use crate::paths::CasePaths;
use crate::run_log::{format_elapsed, RunLog};
use crate::runner::{CancelToken, ProcessRunner, RunRequest, RunStatus};
use crate::staging::{self, CleanReport, CleanRules};
use crate::timestep::latest_timestep;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

mod prepare;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Mesh,
    Dispersion,
    Combustion,
}

impl Stage {
    /// Execution order; a stage never runs before one listed earlier.
    pub const ALL: [Stage; 3] = [Stage::Mesh, Stage::Dispersion, Stage::Combustion];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Mesh => "mesh",
            Stage::Dispersion => "dispersion",
            Stage::Combustion => "combustion",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stages the operator asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageSelection {
    pub mesh: bool,
    pub dispersion: bool,
    pub combustion: bool,
}

impl StageSelection {
    pub fn all() -> Self {
        Self {
            mesh: true,
            dispersion: true,
            combustion: true,
        }
    }

    pub fn contains(&self, stage: Stage) -> bool {
        match stage {
            Stage::Mesh => self.mesh,
            Stage::Dispersion => self.dispersion,
            Stage::Combustion => self.combustion,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.mesh || self.dispersion || self.combustion)
    }

    /// Enabled stages in execution order.
    pub fn stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| self.contains(*stage))
            .collect()
    }

    /// Whether some enabled stage runs after `stage`.
    pub fn is_followed(&self, stage: Stage) -> bool {
        Stage::ALL
            .into_iter()
            .any(|later| later > stage && self.contains(later))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed { stages: Vec<Stage> },
    /// Operator interrupt; later stages were skipped.
    Cancelled { stage: Stage, command: String },
}

enum StageOutcome {
    Completed,
    Cancelled { command: String },
}

pub struct Pipeline {
    config: CaseConfig,
    paths: CasePaths,
    runner: ProcessRunner,
    log: RunLog,
}

impl Pipeline {
    /// Validate `config` against the case at `case_root` and wire the runner.
    pub fn new(config: CaseConfig, case_root: PathBuf, cancel: CancelToken) -> Result<Self> {
        validate_config(&config)?;
        let paths = CasePaths::new(case_root, config.layout.clone());
        let environment_script = config
            .environment_script
            .as_ref()
            .map(|script| resolve_environment_script(paths.root(), script))
            .transpose()?;
        let runner = ProcessRunner::new(
            paths.clone(),
            environment_script,
            config.launcher.clone(),
            config.cores,
            config.logging,
            cancel,
        );
        let log = RunLog::new(config.logging.then(|| paths.run_log_path()));
        Ok(Self {
            config,
            paths,
            runner,
            log,
        })
    }

    /// Run every selected stage in order.
    ///
    /// Errors (solver failure, missing artifacts, filesystem trouble) are
    /// logged to the run log before being returned.
    pub fn run(&self, selection: StageSelection) -> Result<PipelineOutcome> {
        let result = self.run_stages(selection);
        if let Err(err) = &result {
            let _ = self.log.line(&format!("Pipeline aborted: {err:#}"));
        }
        result
    }

    fn run_stages(&self, selection: StageSelection) -> Result<PipelineOutcome> {
        self.check_prerequisites(selection)?;
        staging::reset_directory(&self.paths.working_dir(), true)?;
        let stages = selection.stages();
        for stage in &stages {
            let _span = tracing::info_span!("stage", stage = %stage).entered();
            match self.run_stage(*stage, selection)? {
                StageOutcome::Completed => {}
                StageOutcome::Cancelled { command } => {
                    self.log.line(&format!(
                        "Cancelled {command} during {stage} stage; no further stages will run"
                    ))?;
                    return Ok(PipelineOutcome::Cancelled {
                        stage: *stage,
                        command,
                    });
                }
            }
        }
        Ok(PipelineOutcome::Completed { stages })
    }

    /// Refuse to start when an enabled stage would read archive entries or
    /// templates that neither exist nor get produced by an earlier stage.
    pub fn check_prerequisites(&self, selection: StageSelection) -> Result<()> {
        let mut produced: BTreeSet<String> = BTreeSet::new();
        let mut archive_on_disk = true;
        for stage in selection.stages() {
            let stage_config = self.config.stage(stage);
            for seed in &stage_config.seed_dirs {
                let template = self.paths.template_dir(&stage_config.template_dir).join(seed);
                if !template.is_dir() {
                    return Err(StagingError::MissingSource(template))
                        .with_context(|| format!("{stage} stage template is incomplete"));
                }
            }
            if stage_config.reset_archive {
                produced.clear();
                archive_on_disk = false;
            }
            for entry in required_archive_entries(stage_config) {
                let path = self.paths.archive_entry(entry);
                let available =
                    produced.contains(entry) || (archive_on_disk && path.exists());
                if !available {
                    return Err(PipelineError::MissingArtifact {
                        stage: stage.to_string(),
                        artifact: entry.to_string(),
                        path,
                    }
                    .into());
                }
            }
            if let Some(archive) = &stage_config.archive {
                produced.insert(archive.dest.clone());
            }
        }
        Ok(())
    }

    fn run_stage(&self, stage: Stage, selection: StageSelection) -> Result<StageOutcome> {
        let stage_config = self.config.stage(stage);
        self.log.line(&format!("Starting {stage} stage"))?;
        self.prepare_stage(stage, stage_config)
            .with_context(|| format!("prepare {stage} stage"))?;

        let followed = selection.is_followed(stage);
        for step in &stage_config.steps {
            let mut argv = step.argv()?;
            if step.time_selection.selects_latest(followed) {
                argv.push("-latestTime".to_string());
            }
            let request = RunRequest::new(argv, step.parallel);
            if let Some(command) = self.execute(&request)? {
                return Ok(StageOutcome::Cancelled { command });
            }
        }

        self.archive_outputs(stage_config)
            .with_context(|| format!("archive {stage} stage outputs"))?;
        Ok(StageOutcome::Completed)
    }

    /// Run one command; `Some(name)` means it was cancelled.
    fn execute(&self, request: &RunRequest) -> Result<Option<String>> {
        let command = request.command_name();
        if self.runner.cancel_token().is_cancelled() {
            return Ok(Some(command));
        }
        self.log.progress(&format!("Running  {command}"));
        let record = self.runner.run(request)?;
        tracing::debug!(
            command = %record.command,
            argv = ?record.argv,
            started_at_epoch_ms = record.started_at_epoch_ms as u64,
            finished_at_epoch_ms = record.finished_at_epoch_ms as u64,
            "run record"
        );
        let elapsed = format_elapsed(record.elapsed);
        match record.status {
            RunStatus::Succeeded => {
                self.log
                    .line(&format!("Finished {command:22}: {elapsed}"))?;
                Ok(None)
            }
            RunStatus::Cancelled => Ok(Some(command)),
            RunStatus::Failed { .. } => {
                let status = record.status_text();
                let where_to_look = record
                    .log_path
                    .as_deref()
                    .map(|path| format!(", check {}", path.display()))
                    .unwrap_or_default();
                self.log.line(&format!(
                    "Error while executing {command} ({status}) after {elapsed}{where_to_look}"
                ))?;
                Err(PipelineError::SolverFailed {
                    command,
                    status,
                    elapsed,
                }
                .into())
            }
        }
    }

    fn archive_outputs(&self, stage_config: &StageConfig) -> Result<()> {
        let Some(archive) = &stage_config.archive else {
            return Ok(());
        };
        let source = match &archive.source {
            ArchiveSource::Path(rel) => self.paths.working_entry(rel),
            ArchiveSource::LatestTimestep => {
                let latest = latest_timestep(&self.paths.working_dir())?;
                self.paths.working_entry(latest.label())
            }
        };
        let dest = self.paths.archive_entry(&archive.dest);
        if staging::remove_if_exists(&dest)? {
            tracing::debug!(dest = %dest.display(), "replacing archived artifact");
        }
        match archive.mode {
            ArchiveMode::Copy => staging::copy_tree(&source, &dest)?,
            ArchiveMode::Move => staging::move_tree(&source, &dest)?,
        }
        self.log.line(&format!(
            "Archived {} to {}",
            display_rel(self.paths.root(), &source),
            display_rel(self.paths.root(), &dest)
        ))?;
        Ok(())
    }
}

fn required_archive_entries(stage_config: &StageConfig) -> Vec<&str> {
    let mut entries: Vec<&str> = stage_config
        .archive_inputs
        .iter()
        .map(|input| input.from.as_str())
        .collect();
    if let Some(transfer) = &stage_config.field_transfer {
        entries.push(transfer.snapshot.as_str());
    }
    entries
}

/// Resolve against the case root and make absolute; commands run from the
/// working directory, so a relative path would no longer point at the script.
fn resolve_environment_script(case_root: &Path, script: &Path) -> Result<PathBuf> {
    let joined = case_root.join(script);
    let resolved = std::path::absolute(&joined)
        .with_context(|| format!("resolve {}", joined.display()))?;
    if !resolved.is_file() {
        return Err(PipelineError::EnvironmentScriptMissing(resolved).into());
    }
    Ok(resolved)
}

fn display_rel(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

/// Remove the working case, the archive, logs, markers, and every generated
/// mesh or timestep folder below the case root.
pub fn clean_case(config: &CaseConfig, case_root: &Path) -> Result<CleanReport> {
    let paths = CasePaths::new(case_root.to_path_buf(), config.layout.clone());
    staging::reset_directory(&paths.working_dir(), false)?;
    staging::reset_directory(&paths.archive_dir(), false)?;
    let layout = paths.layout();
    let rules = CleanRules {
        file_prefixes: vec![
            layout.log_prefix.as_str(),
            layout.marker_prefix.as_str(),
            layout.run_log.as_str(),
        ],
        ..CleanRules::default()
    };
    staging::clean_case(case_root, &rules)
}

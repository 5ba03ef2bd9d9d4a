//! Case configuration helpers.
//!
//! This module loads, validates, and normalizes the case-owned config so the
//! pipeline never reads physical parameters or solver paths from ambient state.
use crate::pipeline::Stage;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_CONFIG_FILE: &str = "gdaxs.json";
pub const DEFAULT_ENVIRONMENT_SCRIPT: &str = "/opt/OpenFOAM/OpenFOAM-5.0/etc/bashrc";

const DECOMPOSE_DICT_REL: &str = "system/decomposeParDict";
const CONTROL_DICT_REL: &str = "system/controlDict";
const MESH_ARCHIVE_NAME: &str = "polyMesh";
const DISPERSION_ARCHIVE_NAME: &str = "dispersion";

/// Everything the pipeline needs to know about one case directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CaseConfig {
    pub schema_version: u32,
    /// Shell-sourceable toolkit environment, sourced before every command.
    pub environment_script: Option<PathBuf>,
    pub cores: u32,
    pub ignition_location: [f64; 3],
    /// Simulated seconds of gas dispersion.
    pub dispersion_time: f64,
    /// Simulated seconds of combustion.
    pub combustion_time: f64,
    pub write_format: Option<WriteFormat>,
    /// Capture solver output and the run log on disk.
    pub logging: bool,
    pub layout: CaseLayout,
    pub launcher: LauncherConfig,
    pub mesh: StageConfig,
    pub dispersion: StageConfig,
    pub combustion: StageConfig,
}

impl Default for CaseConfig {
    fn default() -> Self {
        default_config()
    }
}

impl CaseConfig {
    pub fn stage(&self, stage: Stage) -> &StageConfig {
        match stage {
            Stage::Mesh => &self.mesh,
            Stage::Dispersion => &self.dispersion,
            Stage::Combustion => &self.combustion,
        }
    }

    /// Render the ignition point in the toolkit's `(x y z)` vector syntax.
    pub fn ignition_vector(&self) -> String {
        let [x, y, z] = self.ignition_location;
        format!("({x} {y} {z})")
    }

    /// Resolve a typed patch source to the literal text written into a case file.
    ///
    /// Returns `None` for sources with nothing configured (an unset write format).
    pub fn patch_value(&self, value: &PatchValue) -> Option<String> {
        match value {
            PatchValue::Cores => Some(self.cores.to_string()),
            PatchValue::IgnitionLocation => Some(self.ignition_vector()),
            PatchValue::DispersionTime => Some(self.dispersion_time.to_string()),
            PatchValue::CombustionTime => Some(self.combustion_time.to_string()),
            PatchValue::WriteFormat => self.write_format.map(|format| format.to_string()),
            PatchValue::Literal(text) => Some(text.clone()),
        }
    }
}

/// On-disk names inside the case directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CaseLayout {
    pub working_dir: String,
    pub archive_dir: String,
    pub run_log: String,
    pub log_prefix: String,
    pub marker_prefix: String,
}

impl Default for CaseLayout {
    fn default() -> Self {
        Self {
            working_dir: "timeData".to_string(),
            archive_dir: "save".to_string(),
            run_log: "log.gdaxs".to_string(),
            log_prefix: "log.".to_string(),
            marker_prefix: ".running.".to_string(),
        }
    }
}

/// Multi-process launch wrapper used for steps marked `parallel`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LauncherConfig {
    pub program: String,
    /// Binding options placed before the process-count flag.
    pub args: Vec<String>,
    pub process_count_flag: String,
    /// Flag appended to the solver so it runs decomposed.
    pub parallel_flag: String,
    /// How long a cancelled command may take to exit before it is killed.
    pub interrupt_grace_ms: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: "mpirun".to_string(),
            args: Vec::new(),
            process_count_flag: "-np".to_string(),
            parallel_flag: "-parallel".to_string(),
            interrupt_grace_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteFormat {
    Ascii,
    Binary,
}

impl fmt::Display for WriteFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteFormat::Ascii => "ascii",
            WriteFormat::Binary => "binary",
        })
    }
}

/// Per-stage data: what to seed, what to patch, what to run, what to keep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Read-only template tree, relative to the case directory.
    pub template_dir: String,
    /// Template subdirectories copied into the working case, in order.
    pub seed_dirs: Vec<String>,
    #[serde(default)]
    pub archive_inputs: Vec<ArchiveInput>,
    #[serde(default)]
    pub field_transfer: Option<FieldTransfer>,
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub archive: Option<ArchiveSpec>,
    /// Clear the archive before this stage runs.
    #[serde(default)]
    pub reset_archive: bool,
}

/// Archive entry copied into the working case before a stage runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ArchiveInput {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FieldTransfer {
    /// Archive entry holding the previous stage's field snapshot.
    pub snapshot: String,
    #[serde(default)]
    pub target: FieldTarget,
    #[serde(default)]
    pub renames: Vec<FieldRename>,
    #[serde(default)]
    pub common: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldTarget {
    /// The working case's `0` folder.
    #[default]
    Initial,
    /// A new folder one whole step past the latest seeded timestep.
    NextTimestep,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FieldRename {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PatchSpec {
    /// Target file relative to the working case.
    pub file: String,
    pub key: String,
    pub value: PatchValue,
    /// Fail the stage when no line contains `key`.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatchValue {
    Cores,
    IgnitionLocation,
    DispersionTime,
    CombustionTime,
    WriteFormat,
    Literal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    /// Program and arguments, split with shell-words rules (no shell evaluation).
    pub command: String,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub time_selection: TimeSelection,
}

impl StepSpec {
    pub fn argv(&self) -> Result<Vec<String>> {
        let argv = shell_words::split(&self.command)
            .with_context(|| format!("parse step command {:?}", self.command))?;
        if argv.is_empty() {
            return Err(anyhow!("step command is empty"));
        }
        Ok(argv)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeSelection {
    #[default]
    All,
    Latest,
    /// Latest only when a later stage consumes the result.
    LatestIfFollowed,
}

impl TimeSelection {
    /// Whether the step should be restricted to the latest time folder.
    pub fn selects_latest(self, followed: bool) -> bool {
        match self {
            TimeSelection::All => false,
            TimeSelection::Latest => true,
            TimeSelection::LatestIfFollowed => followed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ArchiveSpec {
    pub source: ArchiveSource,
    /// Entry name inside the archive directory.
    pub dest: String,
    #[serde(default)]
    pub mode: ArchiveMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveSource {
    /// A fixed path inside the working case.
    Path(String),
    /// Whatever timestep folder the solver wrote last.
    LatestTimestep,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveMode {
    #[default]
    Copy,
    Move,
}

fn step(command: &str) -> StepSpec {
    StepSpec {
        command: command.to_string(),
        parallel: false,
        time_selection: TimeSelection::All,
    }
}

fn parallel_step(command: &str) -> StepSpec {
    StepSpec {
        parallel: true,
        ..step(command)
    }
}

fn patch(file: &str, key: &str, value: PatchValue) -> PatchSpec {
    PatchSpec {
        file: file.to_string(),
        key: key.to_string(),
        value,
        strict: false,
    }
}

fn mesh_input() -> ArchiveInput {
    ArchiveInput {
        from: MESH_ARCHIVE_NAME.to_string(),
        to: "constant/polyMesh".to_string(),
    }
}

fn default_mesh_stage() -> StageConfig {
    StageConfig {
        template_dir: "snappyHexMesh".to_string(),
        seed_dirs: vec!["system".to_string(), "constant".to_string()],
        archive_inputs: Vec::new(),
        field_transfer: None,
        patches: vec![
            patch(DECOMPOSE_DICT_REL, "numberOfSubdomains", PatchValue::Cores),
            patch(
                "system/snappyHexMeshDict",
                "locationInMesh",
                PatchValue::IgnitionLocation,
            ),
        ],
        steps: vec![
            step("surfaceFeatureExtract"),
            step("blockMesh"),
            step("decomposePar"),
            parallel_step("snappyHexMesh -overwrite"),
            step("reconstructParMesh -constant"),
            step("checkMesh"),
        ],
        archive: Some(ArchiveSpec {
            source: ArchiveSource::Path("constant/polyMesh".to_string()),
            dest: MESH_ARCHIVE_NAME.to_string(),
            mode: ArchiveMode::Copy,
        }),
        reset_archive: true,
    }
}

fn default_dispersion_stage() -> StageConfig {
    StageConfig {
        template_dir: "rhoReactingBuoyantFoam".to_string(),
        seed_dirs: vec![
            "constant".to_string(),
            "system".to_string(),
            "0".to_string(),
        ],
        archive_inputs: vec![mesh_input()],
        field_transfer: None,
        patches: vec![
            patch(DECOMPOSE_DICT_REL, "numberOfSubdomains", PatchValue::Cores),
            patch(CONTROL_DICT_REL, "endTime  ", PatchValue::DispersionTime),
            patch(CONTROL_DICT_REL, "writeFormat", PatchValue::WriteFormat),
        ],
        steps: vec![
            step("decomposePar"),
            parallel_step("rhoReactingBuoyantFoam"),
            StepSpec {
                time_selection: TimeSelection::LatestIfFollowed,
                ..step("reconstructPar")
            },
            StepSpec {
                time_selection: TimeSelection::LatestIfFollowed,
                ..step("foamFormatConvert")
            },
        ],
        archive: Some(ArchiveSpec {
            source: ArchiveSource::LatestTimestep,
            dest: DISPERSION_ARCHIVE_NAME.to_string(),
            mode: ArchiveMode::Copy,
        }),
        reset_archive: false,
    }
}

fn default_combustion_stage() -> StageConfig {
    let renames = [("T", "Tu"), ("H2", "ft"), ("p_rgh", "p")]
        .into_iter()
        .map(|(from, to)| FieldRename {
            from: from.to_string(),
            to: to.to_string(),
        })
        .collect();
    StageConfig {
        template_dir: "XiFoam".to_string(),
        seed_dirs: vec![
            "0".to_string(),
            "system".to_string(),
            "constant".to_string(),
        ],
        archive_inputs: vec![mesh_input()],
        field_transfer: Some(FieldTransfer {
            snapshot: DISPERSION_ARCHIVE_NAME.to_string(),
            target: FieldTarget::Initial,
            renames,
            common: ["alphat", "epsilon", "k", "nut", "T", "U"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }),
        patches: vec![
            patch(DECOMPOSE_DICT_REL, "numberOfSubdomains", PatchValue::Cores),
            patch(
                "constant/combustionProperties",
                "    location",
                PatchValue::IgnitionLocation,
            ),
            patch(CONTROL_DICT_REL, "endTime  ", PatchValue::CombustionTime),
            patch(CONTROL_DICT_REL, "writeFormat", PatchValue::WriteFormat),
        ],
        steps: vec![
            step("decomposePar"),
            parallel_step("XiFoam"),
            step("reconstructPar"),
        ],
        archive: None,
        reset_archive: false,
    }
}

/// Build the config used when a case has no config file.
pub fn default_config() -> CaseConfig {
    CaseConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        environment_script: Some(PathBuf::from(DEFAULT_ENVIRONMENT_SCRIPT)),
        cores: 2,
        ignition_location: [0.7, 1.8, 1.0],
        dispersion_time: 10.0,
        combustion_time: 1.0,
        write_format: None,
        logging: true,
        layout: CaseLayout::default(),
        launcher: LauncherConfig::default(),
        mesh: default_mesh_stage(),
        dispersion: default_dispersion_stage(),
        combustion: default_combustion_stage(),
    }
}

/// Load a config from disk.
pub fn load_config(path: &Path) -> Result<CaseConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: CaseConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config JSON {}", path.display()))?;
    Ok(config)
}

/// Load `path` when it exists, otherwise fall back to the defaults.
pub fn load_config_or_default(path: &Path) -> Result<CaseConfig> {
    if path.is_file() {
        load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        Ok(default_config())
    }
}

/// Persist a config to disk in a stable JSON format.
pub fn write_config(path: &Path, config: &CaseConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut text = serde_json::to_string_pretty(config).context("serialize config")?;
    text.push('\n');
    fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Validate numeric ranges, names, and every stage's data.
pub fn validate_config(config: &CaseConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {}",
            config.schema_version
        ));
    }
    if config.cores == 0 {
        return Err(anyhow!("cores must be at least 1"));
    }
    for (label, value) in [
        ("dispersion_time", config.dispersion_time),
        ("combustion_time", config.combustion_time),
    ] {
        if !value.is_finite() || value <= 0.0 {
            return Err(anyhow!("{label} must be a positive number (got {value})"));
        }
    }
    if config.ignition_location.iter().any(|coord| !coord.is_finite()) {
        return Err(anyhow!(
            "ignition_location must contain finite coordinates (got {:?})",
            config.ignition_location
        ));
    }
    validate_layout(&config.layout)?;
    if config.launcher.program.trim().is_empty() {
        return Err(anyhow!("launcher.program must be non-empty"));
    }
    for stage in Stage::ALL {
        validate_stage(stage, config.stage(stage))
            .with_context(|| format!("invalid {stage} stage config"))?;
    }
    Ok(())
}

fn validate_layout(layout: &CaseLayout) -> Result<()> {
    for (label, value) in [
        ("layout.working_dir", &layout.working_dir),
        ("layout.archive_dir", &layout.archive_dir),
        ("layout.run_log", &layout.run_log),
        ("layout.log_prefix", &layout.log_prefix),
        ("layout.marker_prefix", &layout.marker_prefix),
    ] {
        if value.trim().is_empty() {
            return Err(anyhow!("{label} must be non-empty"));
        }
    }
    validate_relative_path(&layout.working_dir, "layout.working_dir")?;
    validate_relative_path(&layout.archive_dir, "layout.archive_dir")?;
    if layout.working_dir == layout.archive_dir {
        return Err(anyhow!(
            "layout.working_dir and layout.archive_dir must differ"
        ));
    }
    Ok(())
}

fn validate_stage(stage: Stage, config: &StageConfig) -> Result<()> {
    validate_relative_path(&config.template_dir, "template_dir")?;
    for rel in &config.seed_dirs {
        validate_relative_path(rel, "seed_dirs")?;
    }
    for input in &config.archive_inputs {
        validate_relative_path(&input.from, "archive_inputs.from")?;
        validate_relative_path(&input.to, "archive_inputs.to")?;
    }
    if let Some(transfer) = &config.field_transfer {
        validate_relative_path(&transfer.snapshot, "field_transfer.snapshot")?;
        let names = transfer
            .renames
            .iter()
            .flat_map(|rename| [&rename.from, &rename.to])
            .chain(transfer.common.iter());
        for name in names {
            validate_field_name(name)?;
        }
    }
    for patch in &config.patches {
        validate_relative_path(&patch.file, "patches.file")?;
        if patch.key.is_empty() {
            return Err(anyhow!("patch key for {} must be non-empty", patch.file));
        }
    }
    if config.steps.is_empty() {
        return Err(anyhow!("{stage} stage has no steps"));
    }
    for step in &config.steps {
        step.argv()?;
    }
    if let Some(archive) = &config.archive {
        validate_relative_path(&archive.dest, "archive.dest")?;
        if let ArchiveSource::Path(rel) = &archive.source {
            validate_relative_path(rel, "archive.source")?;
        }
    }
    Ok(())
}

fn validate_field_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(anyhow!("field names must be plain file names (got {name:?})"));
    }
    Ok(())
}

fn validate_relative_path(rel: &str, label: &str) -> Result<()> {
    let path = Path::new(rel);
    if rel.trim().is_empty() || path.is_absolute() || has_parent_components(path) {
        return Err(anyhow!(
            "{label} entries must be non-empty relative paths without '..' (got {rel:?})"
        ));
    }
    Ok(())
}

fn has_parent_components(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, std::path::Component::ParentDir))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

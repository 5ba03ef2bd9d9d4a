//! CLI argument parsing for the pipeline driver.
//!
//! Stage flags combine freely; the selected stages always run in
//! mesh, dispersion, combustion order regardless of flag order.
use crate::pipeline::StageSelection;
use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "gdaxs",
    version,
    about = "Gas dispersion and explosion pipeline driver for OpenFOAM cases",
    after_help = "Stages:\n  -m  mesh        snappyHexMesh template, archives save/polyMesh\n  -d  dispersion  rhoReactingBuoyantFoam template, archives save/dispersion\n  -x  combustion  XiFoam template, seeded from save/dispersion\n\nExamples:\n  gdaxs -a --case-dir ./tank-farm\n  gdaxs -md --cores 8\n  gdaxs -x\n  gdaxs -i",
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Clean the case, then run every stage
    #[arg(short = 'a', long = "all")]
    pub all: bool,

    /// Run the mesh stage
    #[arg(short = 'm', long)]
    pub mesh: bool,

    /// Run the dispersion stage
    #[arg(short = 'd', long)]
    pub dispersion: bool,

    /// Run the combustion stage
    #[arg(short = 'x', long)]
    pub combustion: bool,

    /// Remove working copies, archives, logs, and generated mesh/time folders
    #[arg(short = 'c', long)]
    pub clean: bool,

    /// Follow the log of whichever solver is currently running
    #[arg(short = 'i', long = "info", conflicts_with_all = ["all", "mesh", "dispersion", "combustion", "clean"])]
    pub info: bool,

    /// Case directory holding the stage templates
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub case_dir: PathBuf,

    /// Config file (defaults to gdaxs.json in the case directory)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the number of parallel processes
    #[arg(long, value_name = "N")]
    pub cores: Option<u32>,

    /// Override the toolkit environment script sourced before each command
    #[arg(long, value_name = "PATH")]
    pub env_script: Option<PathBuf>,

    /// Write the default config to the config path and exit
    #[arg(long)]
    pub write_config: bool,

    /// Seconds between log polls in info mode
    #[arg(long, value_name = "SECS", default_value_t = 1.0)]
    pub interval: f64,
}

impl RootArgs {
    pub fn selection(&self) -> StageSelection {
        if self.all {
            return StageSelection::all();
        }
        StageSelection {
            mesh: self.mesh,
            dispersion: self.dispersion,
            combustion: self.combustion,
        }
    }

    pub fn wants_clean(&self) -> bool {
        self.all || self.clean
    }

    /// `--interval` as a duration; zero, negative, or out-of-range values are errors.
    pub fn poll_interval(&self) -> Result<Duration> {
        if self.interval <= 0.0 {
            return Err(anyhow!("--interval must be a positive number of seconds"));
        }
        Duration::try_from_secs_f64(self.interval)
            .map_err(|err| anyhow!("--interval {} is not usable: {err}", self.interval))
    }

    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.case_dir.join(crate::config::DEFAULT_CONFIG_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_implies_every_stage_and_clean() {
        let args = RootArgs::try_parse_from(["gdaxs", "-a"]).expect("parse");
        assert_eq!(args.selection(), StageSelection::all());
        assert!(args.wants_clean());
    }

    #[test]
    fn bundled_short_flags_select_stages() {
        let args = RootArgs::try_parse_from(["gdaxs", "-xm", "--case-dir", "/cases/a"])
            .expect("parse");
        let selection = args.selection();
        assert!(selection.mesh && selection.combustion && !selection.dispersion);
        assert!(!args.wants_clean());
        assert_eq!(args.config_path(), PathBuf::from("/cases/a/gdaxs.json"));
    }

    #[test]
    fn info_mode_excludes_stage_flags() {
        assert!(RootArgs::try_parse_from(["gdaxs", "-i", "-m"]).is_err());
        let args = RootArgs::try_parse_from(["gdaxs", "-i", "--interval", "0.5"]).expect("parse");
        assert!(args.info);
        assert!(args.selection().is_empty());
        assert_eq!(args.poll_interval().expect("interval"), Duration::from_millis(500));
    }

    #[test]
    fn unusable_intervals_are_errors() {
        for value in ["0", "-1", "1e30", "NaN", "inf"] {
            let flag = format!("--interval={value}");
            let args = RootArgs::try_parse_from(["gdaxs", "-i", flag.as_str()]).expect("parse");
            assert!(args.poll_interval().is_err(), "{value} should be rejected");
        }
    }
}

//! Typed paths into a case directory.
//!
//! Centralizing path construction keeps the controller, runner, and monitor
//! agreeing on where logs, markers, and archives live.
use crate::config::CaseLayout;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct CasePaths {
    root: PathBuf,
    layout: CaseLayout,
}

impl CasePaths {
    pub fn new(root: PathBuf, layout: CaseLayout) -> Self {
        Self { root, layout }
    }

    /// Return the case root every relative config path is resolved against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> &CaseLayout {
        &self.layout
    }

    /// Return the scratch directory the solvers run in.
    pub fn working_dir(&self) -> PathBuf {
        self.root.join(&self.layout.working_dir)
    }

    /// Return the directory holding artifacts that outlive a stage.
    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(&self.layout.archive_dir)
    }

    pub fn archive_entry(&self, name: &str) -> PathBuf {
        self.archive_dir().join(name)
    }

    pub fn working_entry(&self, rel: &str) -> PathBuf {
        self.working_dir().join(rel)
    }

    pub fn template_dir(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Return the cumulative pipeline log path.
    pub fn run_log_path(&self) -> PathBuf {
        self.root.join(&self.layout.run_log)
    }

    /// Return the captured-output log for one program.
    pub fn command_log_path(&self, command: &str) -> PathBuf {
        self.root.join(format!("{}{command}", self.layout.log_prefix))
    }

    /// Return the "currently running" marker for one program.
    pub fn marker_path(&self, command: &str) -> PathBuf {
        self.root.join(format!("{}{command}", self.layout.marker_prefix))
    }
}

//! Cumulative, human-readable pipeline log.
//!
//! Every line goes to stdout; with logging enabled it is also appended to the
//! case's run log so the history of repeated runs accumulates in one place.
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RunLog {
    path: Option<PathBuf>,
}

impl RunLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn line(&self, text: &str) -> Result<()> {
        println!("{text}");
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        writeln!(file, "{text}").with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Transient progress line, overwritten by the next [`RunLog::line`].
    pub fn progress(&self, text: &str) {
        print!("{text}\r");
        let _ = std::io::stdout().flush();
    }
}

/// Render a wall-clock duration as `Xh Ym Zs`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs_f64().round() as u64;
    let (minutes, seconds) = (total / 60, total % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    format!("{hours}h {minutes}m {seconds}s")
}

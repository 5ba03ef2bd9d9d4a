//! Solver output folders named by simulated time.
use anyhow::{Context, Result};
use std::cmp::Ordering;
use std::fs;
use std::path::Path;

/// A directory name that parses as a non-negative, finite time value.
///
/// The original label is kept so the folder can be addressed exactly as the
/// solver wrote it (`0.5`, `1e-05`, `10`).
#[derive(Debug, Clone, PartialEq)]
pub struct Timestep {
    label: String,
    value: f64,
}

impl Timestep {
    pub fn parse(label: &str) -> Option<Self> {
        let value: f64 = label.parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        Some(Self {
            label: label.to_string(),
            value,
        })
    }

    pub fn zero() -> Self {
        Self {
            label: "0".to_string(),
            value: 0.0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Label of the whole-numbered folder after this one.
    pub fn next_label(&self) -> String {
        next_timestep(self.value)
    }

    fn cmp_value(&self, other: &Self) -> Ordering {
        self.value
            .total_cmp(&other.value)
            .then_with(|| self.label.cmp(&other.label))
    }
}

/// Timestep folders directly inside `dir`, ascending by value.
///
/// Non-numeric names (`system`, `constant`, `processor0`) are skipped.
pub fn list_timesteps(dir: &Path) -> Result<Vec<Timestep>> {
    let mut timesteps = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if let Some(timestep) = Timestep::parse(&name) {
            timesteps.push(timestep);
        }
    }
    timesteps.sort_by(Timestep::cmp_value);
    Ok(timesteps)
}

/// The highest timestep folder in `dir`, or `0` when there is none.
pub fn latest_timestep(dir: &Path) -> Result<Timestep> {
    Ok(list_timesteps(dir)?.pop().unwrap_or_else(Timestep::zero))
}

/// `ceil(current) + 1`, as an integer label.
///
/// Saturates at `i64::MAX` for folder names beyond the integer range.
pub fn next_timestep(current: f64) -> String {
    format!("{}", (current.ceil() as i64).saturating_add(1))
}

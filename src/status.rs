//! "Currently running" markers and the observer that follows them.
//!
//! A marker is a small JSON file in the case directory whose existence means
//! one external command is in flight. It is the only channel between a
//! running pipeline and a separate `gdaxs -i` process, so it survives either
//! side restarting.
use crate::paths::CasePaths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// How much of an existing log the monitor shows before following it.
const TAIL_BYTES: u64 = 2048;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunningMarker {
    pub command: String,
    pub argv: Vec<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    pub started_at_epoch_ms: u128,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

/// Write a marker so a concurrent reader never sees a partial file.
pub fn write_marker(path: &Path, marker: &RunningMarker) -> Result<()> {
    let text = serde_json::to_string_pretty(marker).context("serialize running marker")?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("marker");
    let tmp_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{file_name}.tmp"));
    fs::write(&tmp_path, text.as_bytes())
        .with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("publish {}", path.display()))?;
    Ok(())
}

/// Read a marker; a bare (empty) marker file still counts as running.
pub fn read_marker(path: &Path, command: &str) -> Result<RunningMarker> {
    let bytes = fs::read(path).with_context(|| format!("read marker {}", path.display()))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(RunningMarker {
            command: command.to_string(),
            argv: vec![command.to_string()],
            pid: None,
            started_at_epoch_ms: 0,
            log_path: None,
        });
    }
    serde_json::from_slice(&bytes).with_context(|| format!("parse marker {}", path.display()))
}

/// Removes its marker when dropped, whichever way the run ends.
#[derive(Debug)]
pub struct MarkerGuard {
    path: PathBuf,
}

impl MarkerGuard {
    pub fn create(path: PathBuf, marker: &RunningMarker) -> Result<Self> {
        write_marker(&path, marker)?;
        Ok(Self { path })
    }

    pub fn update(&self, marker: &RunningMarker) -> Result<()> {
        write_marker(&self.path, marker)
    }
}

impl Drop for MarkerGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), %err, "failed to remove running marker");
            }
        }
    }
}

/// Markers currently present in the case directory, oldest first.
pub fn running_markers(paths: &CasePaths) -> Result<Vec<(PathBuf, RunningMarker)>> {
    let prefix = paths.layout().marker_prefix.as_str();
    let mut markers = Vec::new();
    for entry in fs::read_dir(paths.root())
        .with_context(|| format!("read {}", paths.root().display()))?
    {
        let entry = entry.with_context(|| format!("read {}", paths.root().display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(command) = name.strip_prefix(prefix) else {
            continue;
        };
        if command.is_empty() || command.ends_with(".tmp") || !entry.path().is_file() {
            continue;
        }
        match read_marker(&entry.path(), command) {
            Ok(marker) => markers.push((entry.path(), marker)),
            // Removed between listing and reading: the command just finished.
            Err(_) if !entry.path().exists() => {}
            Err(err) => return Err(err),
        }
    }
    markers.sort_by(|a, b| {
        a.1.started_at_epoch_ms
            .cmp(&b.1.started_at_epoch_ms)
            .then_with(|| a.0.cmp(&b.0))
    });
    Ok(markers)
}

/// Incremental reader over a log file that may still be growing.
#[derive(Debug)]
pub struct LogFollower {
    path: PathBuf,
    offset: u64,
}

impl LogFollower {
    pub fn from_start(path: PathBuf) -> Self {
        Self { path, offset: 0 }
    }

    /// Start near the end so a long log is not replayed in full.
    pub fn from_tail(path: PathBuf, tail_bytes: u64) -> Self {
        let len = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
        let mut follower = Self::from_start(path);
        follower.offset = len.saturating_sub(tail_bytes);
        follower
    }

    /// Bytes appended since the previous call.
    pub fn read_new(&mut self) -> Result<Vec<u8>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("open {}", self.path.display())),
        };
        let len = file
            .metadata()
            .with_context(|| format!("inspect {}", self.path.display()))?
            .len();
        if len < self.offset {
            self.offset = 0;
        }
        file.seek(SeekFrom::Start(self.offset))
            .with_context(|| format!("seek {}", self.path.display()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .with_context(|| format!("read {}", self.path.display()))?;
        self.offset += buf.len() as u64;
        Ok(buf)
    }
}

/// Follow whichever command is running until nothing is.
///
/// Polls the marker every `interval`; when one command's marker disappears
/// the next running marker (if any) is picked up.
pub fn monitor(paths: &CasePaths, interval: Duration, out: &mut dyn Write) -> Result<()> {
    let mut followed_any = false;
    loop {
        let markers = running_markers(paths)?;
        let Some((marker_path, marker)) = markers.into_iter().next() else {
            if !followed_any {
                writeln!(out, "No solver is currently running.")?;
            }
            return Ok(());
        };
        followed_any = true;
        writeln!(out, "==> {} <==", marker.command)?;
        // Bare markers carry no log path; fall back to the layout's log name.
        let log_path = marker
            .log_path
            .clone()
            .unwrap_or_else(|| paths.command_log_path(&marker.command));
        let mut follower = LogFollower::from_tail(log_path, TAIL_BYTES);
        loop {
            out.write_all(&follower.read_new()?)?;
            out.flush()?;
            if !marker_path.exists() {
                break;
            }
            thread::sleep(interval);
        }
        out.write_all(&follower.read_new()?)?;
        writeln!(out, "==> {} finished <==", marker.command)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaseLayout;

    fn case_paths(root: &Path) -> CasePaths {
        CasePaths::new(root.to_path_buf(), CaseLayout::default())
    }

    fn marker(command: &str, started: u128, log_path: Option<PathBuf>) -> RunningMarker {
        RunningMarker {
            command: command.to_string(),
            argv: vec![command.to_string()],
            pid: Some(42),
            started_at_epoch_ms: started,
            log_path,
        }
    }

    #[test]
    fn guard_removes_marker_on_drop() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let paths = case_paths(temp.path());
        let path = paths.marker_path("blockMesh");
        {
            let guard =
                MarkerGuard::create(path.clone(), &marker("blockMesh", 1, None)).expect("create");
            assert!(path.is_file());
            guard.update(&marker("blockMesh", 2, None)).expect("update");
            let found = running_markers(&paths).expect("scan");
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].1.command, "blockMesh");
        }
        assert!(!path.exists());
        assert!(running_markers(&paths).expect("scan").is_empty());
    }

    #[test]
    fn markers_sort_oldest_first_and_accept_bare_files() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let paths = case_paths(temp.path());
        write_marker(&paths.marker_path("XiFoam"), &marker("XiFoam", 20, None)).expect("write");
        write_marker(&paths.marker_path("decomposePar"), &marker("decomposePar", 10, None))
            .expect("write");
        fs::write(paths.marker_path("legacy"), "").expect("write bare marker");
        fs::write(temp.path().join("log.XiFoam"), "not a marker").expect("write log");

        let commands: Vec<String> = running_markers(&paths)
            .expect("scan")
            .into_iter()
            .map(|(_, marker)| marker.command)
            .collect();
        assert_eq!(commands, vec!["legacy", "decomposePar", "XiFoam"]);
    }

    #[test]
    fn follower_reads_only_new_bytes() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let log = temp.path().join("log.XiFoam");
        let mut follower = LogFollower::from_start(log.clone());
        assert!(follower.read_new().expect("missing log").is_empty());

        fs::write(&log, "Time = 0.1\n").expect("write log");
        assert_eq!(follower.read_new().expect("read"), b"Time = 0.1\n");
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&log)
            .expect("open log");
        file.write_all(b"Time = 0.2\n").expect("append");
        assert_eq!(follower.read_new().expect("read"), b"Time = 0.2\n");
        assert!(follower.read_new().expect("read").is_empty());

        let mut tail = LogFollower::from_tail(log, 11);
        assert_eq!(tail.read_new().expect("read"), b"Time = 0.2\n");
    }

    #[test]
    fn monitor_reports_idle_case() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let mut out = Vec::new();
        monitor(&case_paths(temp.path()), Duration::from_millis(10), &mut out).expect("monitor");
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "No solver is currently running.\n"
        );
    }

    #[test]
    fn monitor_follows_log_until_marker_disappears() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let paths = case_paths(temp.path());
        let log = paths.command_log_path("XiFoam");
        fs::write(&log, "Starting time loop\n").expect("write log");
        let marker_path = paths.marker_path("XiFoam");
        write_marker(&marker_path, &marker("XiFoam", 1, Some(log.clone()))).expect("write");

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(&log)
                .expect("open log");
            file.write_all(b"End\n").expect("append");
            fs::remove_file(&marker_path).expect("remove marker");
        });

        let mut out = Vec::new();
        monitor(&paths, Duration::from_millis(10), &mut out).expect("monitor");
        writer.join().expect("join writer");

        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(
            text,
            "==> XiFoam <==\nStarting time loop\nEnd\n==> XiFoam finished <==\n"
        );
    }

    #[test]
    fn monitor_follows_default_log_for_bare_marker() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let paths = case_paths(temp.path());
        let log = paths.command_log_path("blockMesh");
        fs::write(&log, "Creating block mesh
").expect("write log");
        let marker_path = paths.marker_path("blockMesh");
        fs::write(&marker_path, "").expect("write bare marker");

        let remover = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            fs::remove_file(&marker_path).expect("remove marker");
        });

        let mut out = Vec::new();
        monitor(&paths, Duration::from_millis(10), &mut out).expect("monitor");
        remover.join().expect("join remover");

        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "==> blockMesh <==\nCreating block mesh\n==> blockMesh finished <==\n"
        );
    }
}

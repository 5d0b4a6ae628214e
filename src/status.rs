/// Status file: writes the daemon's state as JSON on every state transition.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::retention::SweepReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Daemon states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Starting,
    Locating,
    Sampling,
    Uploading,
    Sweeping,
    Sleeping,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepCounts {
    pub deleted: usize,
    pub remaining: usize,
}

impl From<SweepReport> for SweepCounts {
    fn from(r: SweepReport) -> Self {
        Self {
            deleted: r.deleted,
            remaining: r.remaining,
        }
    }
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: DaemonState,
    pub cycle: u64,
    pub target_pid: Option<u32>,
    pub last_trace: Option<String>,
    pub last_sweep: Option<SweepCounts>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".flamewatch.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Mutable state tracker that builds StatusData for each update.
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    cycle: u64,
    target_pid: Option<u32>,
    last_trace: Option<String>,
    last_sweep: Option<SweepCounts>,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf) -> Self {
        Self {
            file: StatusFile::new(status_path),
            pid: std::process::id(),
            cycle: 0,
            target_pid: None,
            last_trace: None,
            last_sweep: None,
        }
    }

    /// Write the status file with the given state. Failures are logged only.
    pub fn update(&self, state: DaemonState) {
        let data = StatusData {
            pid: self.pid,
            state,
            cycle: self.cycle,
            target_pid: self.target_pid,
            last_trace: self.last_trace.clone(),
            last_sweep: self.last_sweep,
            last_update: Utc::now(),
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    pub fn set_cycle(&mut self, cycle: u64) {
        self.cycle = cycle;
    }

    pub fn set_target_pid(&mut self, pid: Option<u32>) {
        self.target_pid = pid;
    }

    pub fn set_last_trace(&mut self, path: &Path) {
        self.last_trace = Some(path.display().to_string());
    }

    pub fn set_last_sweep(&mut self, report: SweepReport) {
        self.last_sweep = Some(report.into());
    }

    pub fn remove(&self) {
        self.file.remove();
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}
